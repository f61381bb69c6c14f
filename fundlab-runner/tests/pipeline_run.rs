//! End-to-end runs over an offline regulator mirror: publishing, reruns,
//! partial failures and the warehouse sink.

use chrono::NaiveDate;
use fundlab_core::data::DirectoryConnector;
use fundlab_core::domain::{DatasetKind, YearMonth};
use fundlab_runner::pipeline::{published_tables, PipelineError};
use fundlab_runner::publish::{Publisher, MANIFEST_FILE, PENDING_DIR};
use fundlab_runner::{
    build_connectors, plan_sink, read_index, run_pipeline, upload_published, ParquetDropSink,
    PipelineConfig, SinkError, SinkOutcome, Table, WarehouseSink,
};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

// ── Fixtures ─────────────────────────────────────────────────────────

const FUND: &str = "12.345.678/0001-90";
const FUND_ID: &str = "12345678000190";

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 7, 15).unwrap()
}

/// Window for `today()` with 3 months of history ignoring the current one.
fn window() -> Vec<YearMonth> {
    (4..=6).map(|m| YearMonth::new(2023, m).unwrap()).collect()
}

fn write_zip(path: &Path, files: &[(&str, String)]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    std::fs::write(path, writer.finish().unwrap().into_inner()).unwrap();
}

fn daily_csv(month: YearMonth) -> String {
    let mut csv = String::from(
        "TP_FUNDO;CNPJ_FUNDO;DT_COMPTC;VL_TOTAL;VL_QUOTA;VL_PATRIM_LIQ;CAPTC_DIA;RESG_DIA;NR_COTST\n",
    );
    for d in 1..=3 {
        csv.push_str(&format!(
            "FI;{FUND};{}-{:02}-{d:02};1000,00;1,{:02}{d:04};990,00;0;0;150\n",
            month.year(),
            month.month(),
            month.month()
        ));
    }
    csv
}

fn monthly_files(month: YearMonth) -> Vec<(&'static str, String)> {
    let date = month.last_day().to_string();
    vec![
        (
            "inf_mensal_fi_carteira.csv",
            format!(
                "CNPJ_FUNDO;DT_COMPTC;TP_APLIC;TP_ATIVO;EMISSOR;COD_ISIN;VL_MERC_POS_FINAL\n\
                 {FUND};{date};Titulos Publicos;;Tesouro Nacional;BRSTNCLTN7D3;750000\n\
                 {FUND};{date};Caixa;;Banco XYZ;;250000\n"
            ),
        ),
        (
            "inf_mensal_fi_cotistas.csv",
            format!(
                "CNPJ_FUNDO;DT_COMPTC;CLASSE_COTISTAS;QT_COTISTAS;VL_PATRIM_LIQ\n\
                 {FUND};{date};PF;150;1000000\n"
            ),
        ),
    ]
}

struct Workspace {
    _dir: tempfile::TempDir,
    mirror: PathBuf,
    output: PathBuf,
    config: PipelineConfig,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror");
        let output = dir.path().join("output");
        let config = PipelineConfig::from_toml(&format!(
            r#"
            months_of_history = 3
            months_to_ignore = 1
            max_concurrent_fetches = 2

            [sources]
            cvm_mirror_dir = "{}"

            [[funds]]
            id = "{FUND}"
            name = "Fundo Teste"
            category = "Renda Fixa"
            manager = "Gestora X"
            group = "Institucional"
            "#,
            mirror.display()
        ))
        .unwrap();
        Self {
            _dir: dir,
            mirror,
            output,
            config,
        }
    }

    fn path(&self, kind: DatasetKind, month: YearMonth) -> PathBuf {
        DirectoryConnector::mirror(kind, &self.mirror).path_for(month)
    }

    fn publish_month(&self, month: YearMonth) {
        write_zip(
            &self.path(DatasetKind::DailyReport, month),
            &[("inf_diario_fi.csv", daily_csv(month))],
        );
        write_zip(&self.path(DatasetKind::MonthlyReport, month), &monthly_files(month));
    }

    fn run(&self, sink: Result<Box<dyn WarehouseSink>, SinkOutcome>) -> fundlab_runner::RunSummary {
        let connectors = build_connectors(&self.config).unwrap();
        run_pipeline(&self.config, today(), &self.output, &connectors, sink).unwrap()
    }

    fn current(&self) -> PathBuf {
        self.output.join("current")
    }

    fn fund_document(&self) -> serde_json::Value {
        let path = self.current().join(format!("api/funds/{FUND_ID}.json"));
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }
}

fn skipped() -> Result<Box<dyn WarehouseSink>, SinkOutcome> {
    Err(SinkOutcome::Skipped {
        reason: "test".into(),
    })
}

/// Every file under `root`, keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().display().to_string();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

struct FailingSink;

impl WarehouseSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn upload(&self, _staging: &[Table], _curated: &[Table]) -> Result<usize, SinkError> {
        Err(SinkError::Table {
            table: "fact_daily_quota".into(),
            message: "quota exceeded".into(),
        })
    }
}

// ── Publishing ───────────────────────────────────────────────────────

#[test]
fn full_window_publishes_every_layer() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }

    let summary = ws.run(skipped());

    assert_eq!(summary.funds, 1);
    assert_eq!(summary.quota_records, 9);
    assert_eq!(summary.cotistas_records, 3);
    assert_eq!(summary.portfolio_snapshots, 3);
    assert_eq!(summary.gaps, 0);
    assert!(!summary.unchanged);

    let current = ws.current();
    assert!(current.join(MANIFEST_FILE).exists());
    assert!(current.join("staging/fact_daily_quota.csv").exists());
    assert!(current.join("curated/curated_daily_returns.csv").exists());

    let index = read_index(&std::fs::read_to_string(current.join("api/index.json")).unwrap())
        .unwrap();
    assert_eq!(index.generation_id, summary.generation_id);
    assert_eq!(index.funds.len(), 1);
    assert_eq!(index.funds[0].dataset_path, format!("funds/{FUND_ID}.json"));

    let doc = ws.fund_document();
    let daily = doc["series"]["daily"].as_array().unwrap();
    assert_eq!(daily.len(), 9);
    assert!(daily[0]["return_pct"].is_null(), "first point has no return");
    assert_eq!(daily[0]["provenance"], "primary:daily_report");
}

#[test]
fn rerun_with_same_inputs_is_byte_identical() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }

    let first = ws.run(skipped());
    let before = snapshot(&ws.current());
    let second = ws.run(skipped());
    let after = snapshot(&ws.current());

    assert_eq!(first.generation_id, second.generation_id);
    assert!(second.unchanged);
    assert_eq!(before, after);
}

// ── Partial failures ─────────────────────────────────────────────────

#[test]
fn missing_month_is_a_visible_gap() {
    let ws = Workspace::new();
    let months = window();
    for &month in &months {
        ws.publish_month(month);
    }
    std::fs::remove_file(ws.path(DatasetKind::DailyReport, months[1])).unwrap();

    let summary = ws.run(skipped());

    assert_eq!(summary.gaps, 1);
    assert_eq!(summary.quota_records, 6);
    let doc = ws.fund_document();
    let gaps = doc["gaps"].as_array().unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0]["month"], "2023-05");
    assert_eq!(gaps[0]["kind"], "quotas");
    assert_eq!(gaps[0]["reason"], "no_source");

    let index = read_index(&std::fs::read_to_string(ws.current().join("api/index.json")).unwrap())
        .unwrap();
    assert_eq!(index.funds[0].gap_count, 1);
}

#[test]
fn corrupt_archive_is_contained_to_its_month() {
    let ws = Workspace::new();
    let months = window();
    for &month in &months {
        ws.publish_month(month);
    }
    std::fs::write(ws.path(DatasetKind::DailyReport, months[2]), b"not a zip").unwrap();

    let summary = ws.run(skipped());

    assert_eq!(summary.quota_records, 6, "other months still staged");
    assert_eq!(summary.unavailable, 1);
    let doc = ws.fund_document();
    assert_eq!(doc["gaps"][0]["month"], "2023-06");
    assert_eq!(doc["gaps"][0]["reason"], "source_unavailable");

    let report =
        std::fs::read_to_string(ws.current().join("staging/source_report.csv")).unwrap();
    assert!(report.contains("daily_report,2023-06,unreadable"));
}

#[test]
fn unreadable_primary_is_not_replaced_by_exchange_quotas() {
    let mut ws = Workspace::new();
    let months = window();
    for &month in &months {
        ws.publish_month(month);
    }
    let june = months[2];
    std::fs::write(ws.path(DatasetKind::DailyReport, june), b"not a zip").unwrap();

    let exchange = ws.mirror.parent().unwrap().join("b3");
    std::fs::create_dir_all(&exchange).unwrap();
    std::fs::write(
        exchange.join(DatasetKind::ExchangeReference.file_name(june)),
        format!("CNPJ do Fundo;Data;Valor da Cota\n{FUND};2023-06-01;9,999999\n"),
    )
    .unwrap();
    ws.config.sources.exchange_reference_dir = Some(exchange);

    let summary = ws.run(skipped());

    assert_eq!(summary.quota_records, 6, "exchange quotas never staged for june");
    let doc = ws.fund_document();
    let gaps = doc["gaps"].as_array().unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0]["month"], "2023-06");
    assert_eq!(gaps[0]["kind"], "quotas");
    assert_eq!(gaps[0]["reason"], "source_unavailable");

    let quotas =
        std::fs::read_to_string(ws.current().join("staging/fact_daily_quota.csv")).unwrap();
    assert!(!quotas.contains("2023-06-01"));
    assert!(!quotas.contains("exchange_reference"));
}

#[test]
fn failed_run_keeps_previous_generation() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }
    let first = ws.run(skipped());
    let before = snapshot(&ws.current());

    let err = run_pipeline(&ws.config, today(), &ws.output, &[], skipped()).unwrap_err();
    assert!(matches!(err, PipelineError::NoConnectors));

    let publisher = Publisher::new(&ws.output);
    assert_eq!(
        publisher.current_manifest().unwrap().unwrap().generation_id,
        first.generation_id
    );
    assert_eq!(snapshot(&ws.current()), before);
}

#[test]
fn interrupted_publish_is_cleaned_up_by_next_run() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }
    ws.run(skipped());
    let stale = ws.output.join(PENDING_DIR).join("staging");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("fact_daily_quota.csv"), b"partial").unwrap();

    let summary = ws.run(skipped());

    assert_eq!(summary.recovered, vec!["removed_pending".to_string()]);
    assert!(!ws.output.join(PENDING_DIR).exists());
}

// ── Sink ─────────────────────────────────────────────────────────────

#[test]
fn sink_without_credentials_is_skipped() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }

    let summary = ws.run(plan_sink(&ws.config.sink, false));

    assert!(matches!(summary.sink, SinkOutcome::Skipped { .. }));
    assert!(ws.current().join(MANIFEST_FILE).exists());
}

#[test]
fn sink_failure_does_not_touch_local_generation() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }

    let summary = ws.run(Ok(Box::new(FailingSink)));

    match &summary.sink {
        SinkOutcome::Failed { sink, error } => {
            assert_eq!(sink, "failing");
            assert!(error.contains("quota exceeded"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let publisher = Publisher::new(&ws.output);
    assert_eq!(
        publisher.current_manifest().unwrap().unwrap().generation_id,
        summary.generation_id
    );
}

#[test]
fn upload_reads_back_the_published_generation() {
    let ws = Workspace::new();
    for month in window() {
        ws.publish_month(month);
    }
    ws.run(skipped());

    let (staging, curated) = published_tables(&Publisher::new(&ws.output)).unwrap();
    assert_eq!(staging.iter().find(|t| t.name == "fact_daily_quota").unwrap().len(), 9);

    let drop_dir = ws.output.join("drop");
    let sink = ParquetDropSink::new(&drop_dir, "proj", "stg", "cur");
    let outcome = upload_published(&ws.output, Ok(Box::new(sink))).unwrap();

    assert_eq!(
        outcome,
        SinkOutcome::Uploaded {
            sink: "parquet-drop:proj".into(),
            tables: staging.len() + curated.len()
        }
    );
    assert!(drop_dir.join("proj/stg/fact_daily_quota.parquet").exists());
    assert!(drop_dir.join("proj/cur/curated_latest_snapshot.parquet").exists());
}

#[test]
fn upload_without_a_generation_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = upload_published(dir.path(), skipped()).unwrap_err();
    assert!(matches!(err, PipelineError::NothingPublished(_)));
}
