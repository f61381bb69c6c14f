//! HTTP connector for the regulator's open-data portal.
//!
//! Fetches one monthly file per call from `{base_url}/{remote_path}`. Handles
//! retries with exponential backoff, 404 as "not published", and the shared
//! circuit breaker for endpoints that start refusing us.

use super::circuit_breaker::CircuitBreaker;
use super::connector::{ConnectorError, RawPayload, SourceConnector};
use super::retry::RetryPolicy;
use crate::domain::{DatasetKind, YearMonth};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://dados.cvm.gov.br/dados";

pub struct HttpConnector {
    name: String,
    kind: DatasetKind,
    base_url: String,
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl HttpConnector {
    pub fn new(
        kind: DatasetKind,
        base_url: &str,
        timeout: Duration,
        retry: RetryPolicy,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ConnectorError> {
        if kind.remote_path(YearMonth::from_parts(2000, 1)).is_none() {
            return Err(ConnectorError::Unsupported {
                connector: "http".into(),
                kind,
            });
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fundlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        Ok(Self {
            name: format!("http:{kind}"),
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            circuit_breaker,
            retry,
        })
    }

    pub fn url_for(&self, month: YearMonth) -> Option<String> {
        self.kind
            .remote_path(month)
            .map(|path| format!("{}/{}", self.base_url, path))
    }

    /// One request, no retry. Status codes are classified here so the retry
    /// policy can tell transient failures from permanent ones.
    fn fetch_once(&self, url: &str, month: YearMonth) -> Result<Vec<u8>, ConnectorError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(ConnectorError::CircuitBreakerTripped);
        }

        let resp = self.client.get(url).send().map_err(classify_transport)?;
        let status = resp.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ConnectorError::NotPublished {
                kind: self.kind,
                month,
            });
        }

        if status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(ConnectorError::CircuitBreakerTripped);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(ConnectorError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            return Err(ConnectorError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = resp.bytes().map_err(classify_transport)?;
        Ok(bytes.to_vec())
    }
}

fn classify_transport(e: reqwest::Error) -> ConnectorError {
    if e.is_connect() || e.is_timeout() {
        ConnectorError::NetworkUnreachable(e.to_string())
    } else {
        ConnectorError::Transport(e.to_string())
    }
}

impl SourceConnector for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DatasetKind {
        self.kind
    }

    fn fetch(&self, month: YearMonth) -> Result<RawPayload, ConnectorError> {
        let url = self.url_for(month).ok_or_else(|| ConnectorError::Unsupported {
            connector: self.name.clone(),
            kind: self.kind,
        })?;
        if !self.circuit_breaker.is_allowed() {
            return Err(ConnectorError::CircuitBreakerTripped);
        }

        debug!(%url, "fetching");
        let result = self.retry.run(&url, |_| self.fetch_once(&url, month));
        match &result {
            Ok(bytes) => {
                self.circuit_breaker.record_success();
                info!(kind = %self.kind, %month, bytes = bytes.len(), "downloaded");
            }
            Err(e) if e.is_transient() => self.circuit_breaker.record_failure(),
            Err(_) => {}
        }

        result.map(|bytes| RawPayload {
            kind: self.kind,
            month,
            origin: url,
            format: self.kind.format(),
            bytes,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned HTTP response per incoming connection, in order.
    fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn connector(base: &str, breaker: Arc<CircuitBreaker>) -> HttpConnector {
        HttpConnector::new(
            DatasetKind::DailyReport,
            base,
            Duration::from_secs(5),
            RetryPolicy::immediate(3),
            breaker,
        )
        .unwrap()
    }

    fn june() -> YearMonth {
        YearMonth::new(2024, 6).unwrap()
    }

    #[test]
    fn builds_regulator_urls() {
        let c = connector(DEFAULT_BASE_URL, Arc::new(CircuitBreaker::for_regulator()));
        assert_eq!(
            c.url_for(june()).unwrap(),
            "https://dados.cvm.gov.br/dados/FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_202406.zip"
        );
    }

    #[test]
    fn rejects_kinds_without_remote_layout() {
        let result = HttpConnector::new(
            DatasetKind::WebPortal,
            DEFAULT_BASE_URL,
            Duration::from_secs(5),
            RetryPolicy::default(),
            Arc::new(CircuitBreaker::for_regulator()),
        );
        assert!(matches!(result, Err(ConnectorError::Unsupported { .. })));
    }

    #[test]
    fn retries_server_errors_then_succeeds() {
        let base = serve(vec![
            response("503 Service Unavailable", ""),
            response("200 OK", "payload"),
        ]);
        let c = connector(&base, Arc::new(CircuitBreaker::for_regulator()));
        let payload = c.fetch(june()).unwrap();
        assert_eq!(payload.bytes, b"payload");
        assert_eq!(payload.kind, DatasetKind::DailyReport);
        assert!(payload.origin.ends_with("inf_diario_fi_202406.zip"));
    }

    #[test]
    fn not_found_means_not_published() {
        let base = serve(vec![response("404 Not Found", "")]);
        let c = connector(&base, Arc::new(CircuitBreaker::for_regulator()));
        let err = c.fetch(june()).unwrap_err();
        assert!(err.is_not_published());
    }

    #[test]
    fn forbidden_trips_shared_breaker() {
        let base = serve(vec![response("403 Forbidden", "")]);
        let breaker = Arc::new(CircuitBreaker::for_regulator());
        let c = connector(&base, breaker.clone());
        assert!(matches!(
            c.fetch(june()),
            Err(ConnectorError::CircuitBreakerTripped)
        ));
        assert!(!breaker.is_allowed());
        assert!(!c.is_available());
    }

    #[test]
    fn refused_connection_is_transient_and_exhausts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let c = connector(&format!("http://{addr}"), Arc::new(CircuitBreaker::for_regulator()));
        let err = c.fetch(june()).unwrap_err();
        assert!(err.is_transient());
    }
}
