//! Row loop and per-entity record builders.

use super::fields::{parse_count, parse_date, parse_decimal};
use super::schema::{BoundMapping, ColumnMapping, Entity, Field};
use super::{FundFilter, ParseError, ParseOutcome, PayloadError};
use crate::domain::{CotistasRecord, FundId, PortfolioHolding, QuotaRecord};
use chrono::NaiveDate;

/// A parsed record of any entity.
#[derive(Debug, Clone)]
pub(crate) enum Parsed {
    Quota(QuotaRecord),
    Cotistas(CotistasRecord),
    Holding(PortfolioHolding),
}

/// Typed access to one CSV row through a bound mapping.
pub(crate) struct Row<'a> {
    bound: &'a BoundMapping,
    record: &'a csv::StringRecord,
}

impl<'a> Row<'a> {
    fn text(&self, field: Field) -> Option<&'a str> {
        self.bound.get(self.record, field)
    }

    fn required_text(&self, field: Field) -> Result<&'a str, ParseError> {
        self.text(field)
            .ok_or(ParseError::MissingField(field.as_str()))
    }

    fn decimal(&self, field: Field) -> Result<Option<f64>, ParseError> {
        match self.text(field) {
            None => Ok(None),
            Some(raw) => parse_decimal(raw).map_err(|_| ParseError::InvalidNumber {
                field: field.as_str(),
                value: raw.to_string(),
            }),
        }
    }

    fn positive(&self, field: Field) -> Result<f64, ParseError> {
        let value = self
            .decimal(field)?
            .ok_or(ParseError::MissingField(field.as_str()))?;
        if value <= 0.0 {
            return Err(ParseError::NonPositive {
                field: field.as_str(),
                value,
            });
        }
        Ok(value)
    }

    fn count(&self, field: Field) -> Result<Option<u64>, ParseError> {
        match self.text(field) {
            None => Ok(None),
            Some(raw) => parse_count(raw).map_err(|_| ParseError::InvalidNumber {
                field: field.as_str(),
                value: raw.to_string(),
            }),
        }
    }

    fn date(&self) -> Result<NaiveDate, ParseError> {
        let raw = self.required_text(Field::Date)?;
        parse_date(raw).ok_or_else(|| ParseError::InvalidDate(raw.to_string()))
    }

    /// Sum of the mapping's prefixed columns; blanks count as zero.
    fn summed_count(&self) -> Result<Option<u64>, ParseError> {
        let mut total = 0.0;
        let mut seen = false;
        for raw in self.bound.summed(self.record) {
            let value = parse_decimal(raw).map_err(|_| ParseError::InvalidNumber {
                field: Field::HolderCount.as_str(),
                value: raw.to_string(),
            })?;
            if let Some(v) = value {
                if v < 0.0 {
                    return Err(ParseError::InvalidNumber {
                        field: Field::HolderCount.as_str(),
                        value: raw.to_string(),
                    });
                }
                total += v;
                seen = true;
            }
        }
        Ok(seen.then(|| total.round() as u64))
    }
}

/// Parse one delimited table against `mapping`.
///
/// Header problems fail the whole table; row problems skip the row and are
/// recorded in the outcome. Rows for funds outside `filter` are counted as
/// filtered, not skipped.
pub(crate) fn parse_table(
    source: &str,
    text: &str,
    delimiter: u8,
    mapping: &'static ColumnMapping,
    filter: &FundFilter,
) -> Result<ParseOutcome<Parsed>, PayloadError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PayloadError::Csv(format!("{source}: {e}")))?
        .clone();
    let bound = mapping.bind(headers.iter())?;

    let mut outcome = ParseOutcome::default();
    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                let fatal = e.is_io_error();
                outcome.skip(source, line, ParseError::Malformed(e.to_string()));
                if fatal {
                    break;
                }
                continue;
            }
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let fund_id = match bound.get(&record, Field::FundId) {
            None => {
                outcome.skip(source, line, ParseError::MissingField(Field::FundId.as_str()));
                continue;
            }
            Some(raw) => match FundId::parse(raw) {
                Ok(id) => id,
                Err(_) => {
                    outcome.skip(source, line, ParseError::InvalidIdentifier(raw.to_string()));
                    continue;
                }
            },
        };
        if !filter.admits(&fund_id) {
            outcome.filtered += 1;
            continue;
        }

        let row = Row {
            bound: &bound,
            record: &record,
        };
        match build(mapping.entity, fund_id, &row) {
            Ok(Some(parsed)) => outcome.records.push(parsed),
            Ok(None) => {}
            Err(e) => outcome.skip(source, line, e),
        }
    }

    Ok(outcome)
}

/// `Ok(None)` for rows that are valid but carry nothing to stage.
fn build(entity: Entity, fund_id: FundId, row: &Row<'_>) -> Result<Option<Parsed>, ParseError> {
    match entity {
        Entity::DailyQuotas | Entity::ExchangeQuotas | Entity::PortalQuotas => {
            quota(fund_id, row).map(|q| Some(Parsed::Quota(q)))
        }
        Entity::MonthlyCotistas => monthly_cotistas(fund_id, row).map(|c| Some(Parsed::Cotistas(c))),
        Entity::CompositionNetAssets => net_assets(fund_id, row).map(|c| Some(Parsed::Cotistas(c))),
        Entity::HolderProfile => holder_profile(fund_id, row).map(|c| Some(Parsed::Cotistas(c))),
        Entity::MonthlyHoldings | Entity::CompositionHoldings => {
            holding(fund_id, row).map(|h| h.map(Parsed::Holding))
        }
    }
}

fn quota(fund_id: FundId, row: &Row<'_>) -> Result<QuotaRecord, ParseError> {
    let date = row.date()?;
    let quota_value = row.positive(Field::QuotaValue)?;
    Ok(QuotaRecord {
        fund_id,
        date,
        quota_value,
        net_asset_value: row.decimal(Field::NetAssetValue)?,
        total_value: row.decimal(Field::TotalValue)?,
        inflows: row.decimal(Field::Inflows)?,
        outflows: row.decimal(Field::Outflows)?,
        holder_count: row.count(Field::HolderCount)?,
    })
}

fn monthly_cotistas(fund_id: FundId, row: &Row<'_>) -> Result<CotistasRecord, ParseError> {
    let date = row.date()?;
    let holder_count = row.count(Field::HolderCount)?;
    let net_asset_value = row.decimal(Field::NetAssetValue)?;
    if holder_count.is_none() && net_asset_value.is_none() {
        return Err(ParseError::MissingField(Field::HolderCount.as_str()));
    }
    Ok(CotistasRecord {
        fund_id,
        date,
        holder_count,
        net_asset_value,
    })
}

fn net_assets(fund_id: FundId, row: &Row<'_>) -> Result<CotistasRecord, ParseError> {
    let date = row.date()?;
    let net_asset_value = row
        .decimal(Field::NetAssetValue)?
        .ok_or(ParseError::MissingField(Field::NetAssetValue.as_str()))?;
    Ok(CotistasRecord {
        fund_id,
        date,
        holder_count: None,
        net_asset_value: Some(net_asset_value),
    })
}

fn holder_profile(fund_id: FundId, row: &Row<'_>) -> Result<CotistasRecord, ParseError> {
    let date = row.date()?;
    let holder_count = row
        .summed_count()?
        .ok_or(ParseError::MissingField(Field::HolderCount.as_str()))?;
    Ok(CotistasRecord {
        fund_id,
        date,
        holder_count: Some(holder_count),
        net_asset_value: None,
    })
}

/// Closed or short positions (market value at or below zero) are dropped.
fn holding(fund_id: FundId, row: &Row<'_>) -> Result<Option<PortfolioHolding>, ParseError> {
    let date = row.date()?;
    let asset_type = row.required_text(Field::AssetType)?.to_string();
    let market_value = row
        .decimal(Field::MarketValue)?
        .ok_or(ParseError::MissingField(Field::MarketValue.as_str()))?;
    if market_value <= 0.0 {
        return Ok(None);
    }
    Ok(Some(PortfolioHolding {
        fund_id,
        date,
        asset_type,
        issuer: row.text(Field::Issuer).map(str::to_string),
        instrument_id: row.text(Field::InstrumentId).map(str::to_string),
        market_value,
        percentage: 0.0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::YearMonth;
    use crate::normalize::schema::mapping_for;

    fn june() -> YearMonth {
        YearMonth::new(2024, 6).unwrap()
    }

    #[test]
    fn daily_rows_become_quotas() {
        let text = "TP_FUNDO;CNPJ_FUNDO;DT_COMPTC;VL_TOTAL;VL_QUOTA;VL_PATRIM_LIQ;CAPTC_DIA;RESG_DIA;NR_COTST\n\
                    FI;12.345.678/0001-90;2024-06-28;1000,5;1,234567;990,25;10;5;150\n";
        let mapping = mapping_for(Entity::DailyQuotas, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        assert_eq!(out.skipped, 0);
        match &out.records[0] {
            Parsed::Quota(q) => {
                assert_eq!(q.fund_id.as_str(), "12345678000190");
                assert_eq!(q.quota_value, 1.234567);
                assert_eq!(q.net_asset_value, Some(990.25));
                assert_eq!(q.total_value, Some(1000.5));
                assert_eq!(q.holder_count, Some(150));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_rows_are_skipped_with_reasons() {
        let text = "CNPJ_FUNDO;DT_COMPTC;VL_QUOTA\n\
                    12.345.678/0001-90;2024-06-27;1,5\n\
                    12.345.678/0001-9X;2024-06-27;1,5\n\
                    12.345.678/0001-90;not-a-date;1,5\n\
                    12.345.678/0001-90;2024-06-28;abc\n\
                    12.345.678/0001-90;2024-06-28;0\n\
                    12.345.678/0001-90;2024-06-28;\n";
        let mapping = mapping_for(Entity::DailyQuotas, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.skipped, 5);
        assert!(matches!(out.errors[0].error, ParseError::InvalidIdentifier(_)));
        assert!(matches!(out.errors[1].error, ParseError::InvalidDate(_)));
        assert!(matches!(out.errors[2].error, ParseError::InvalidNumber { .. }));
        assert!(matches!(out.errors[3].error, ParseError::NonPositive { .. }));
        assert!(matches!(out.errors[4].error, ParseError::MissingField(_)));
        assert_eq!(out.errors[1].line, 4);
    }

    #[test]
    fn unmonitored_funds_are_filtered_not_skipped() {
        let text = "CNPJ_FUNDO;DT_COMPTC;VL_QUOTA\n\
                    12.345.678/0001-90;2024-06-27;1,5\n\
                    98.765.432/0001-10;2024-06-27;2,5\n";
        let wanted = FundId::parse("12345678000190").unwrap();
        let filter = FundFilter::only([wanted]);
        let mapping = mapping_for(Entity::DailyQuotas, june());
        let out = parse_table("t", text, b';', mapping, &filter).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.filtered, 1);
        assert_eq!(out.skipped, 0);
    }

    #[test]
    fn holder_profile_sums_breakdown() {
        let text = "TP_FUNDO_CLASSE;CNPJ_FUNDO_CLASSE;DT_COMPTC;NR_COTST_PF_PB;NR_COTST_PJ;NR_COTST_INVNR\n\
                    FI;12.345.678/0001-90;2024-06-30;100;20;\n";
        let mapping = mapping_for(Entity::HolderProfile, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        match &out.records[0] {
            Parsed::Cotistas(c) => {
                assert_eq!(c.holder_count, Some(120));
                assert_eq!(c.net_asset_value, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn composition_holdings_use_alias_chain() {
        let text = "TP_FUNDO;CNPJ_FUNDO;DT_COMPTC;TP_APLIC;TP_ATIVO;EMISSOR;DS_ATIVO;CD_ISIN;CD_ATIVO;VL_MERC_POS_FINAL\n\
                    FI;12.345.678/0001-90;2024-06-30;Titulos Publicos;;;LTN 2026;;LTN;1.500,00\n";
        let mapping = mapping_for(Entity::CompositionHoldings, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        match &out.records[0] {
            Parsed::Holding(h) => {
                assert_eq!(h.asset_type, "Titulos Publicos");
                assert_eq!(h.issuer.as_deref(), Some("LTN 2026"));
                assert_eq!(h.instrument_id.as_deref(), Some("LTN"));
                assert_eq!(h.market_value, 1500.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_positive_holdings_are_dropped_without_counting_as_errors() {
        let text = "CNPJ_FUNDO;DT_COMPTC;TP_APLIC;EMISSOR;VL_MERC_POS_FINAL\n\
                    12.345.678/0001-90;2024-06-30;Acoes;Empresa A;600,00\n\
                    12.345.678/0001-90;2024-06-30;Acoes;Empresa B;0\n\
                    12.345.678/0001-90;2024-06-30;Compromissada;Banco C;-50,00\n\
                    12.345.678/0001-90;2024-06-30;Acoes;Empresa D;\n";
        let mapping = mapping_for(Entity::CompositionHoldings, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.skipped, 1);
        assert!(matches!(out.errors[0].error, ParseError::MissingField(_)));
        assert_eq!(out.errors[0].line, 5);
    }

    #[test]
    fn mixed_decimal_separators_skip_the_row() {
        let text = "CNPJ_FUNDO;DT_COMPTC;VL_QUOTA\n\
                    12.345.678/0001-90;2024-06-27;1,234.56\n";
        let mapping = mapping_for(Entity::DailyQuotas, june());
        let out = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap();
        assert!(out.records.is_empty());
        assert!(matches!(
            out.errors[0].error,
            ParseError::InvalidNumber { field: "quota_value", .. }
        ));
    }

    #[test]
    fn missing_required_header_fails_table() {
        let text = "CNPJ_FUNDO;DT_COMPTC\n12.345.678/0001-90;2024-06-27\n";
        let mapping = mapping_for(Entity::DailyQuotas, june());
        let err = parse_table("t", text, b';', mapping, &FundFilter::All).unwrap_err();
        assert!(matches!(err, PayloadError::MissingColumn { .. }));
    }
}
