//! Versioned column mappings.
//!
//! The regulator changes file layouts over time (most visibly the CVM
//! Resolution 175 switch from `CNPJ_FUNDO` to `CNPJ_FUNDO_CLASSE`). Each
//! entity carries a list of `ColumnMapping` eras, each valid for a range of
//! months; the era is chosen by the payload's month, never by sniffing.
//!
//! A mapping names, per canonical field, the header aliases that may carry
//! it. When several aliases are present the first non-empty one wins per row.

use super::PayloadError;
use crate::domain::YearMonth;

/// A file layout the normalizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    /// INF_DIARIO daily quotas.
    DailyQuotas,
    /// INF_MENSAL `carteira` entry.
    MonthlyHoldings,
    /// INF_MENSAL `cotistas` entry.
    MonthlyCotistas,
    /// CDA `blc_*` entries.
    CompositionHoldings,
    /// CDA `*_pl_*` entry.
    CompositionNetAssets,
    /// PERFIL_MENSAL holder breakdown.
    HolderProfile,
    /// Exchange reference export.
    ExchangeQuotas,
    /// Web-portal manual export.
    PortalQuotas,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::DailyQuotas => "daily_quotas",
            Entity::MonthlyHoldings => "monthly_holdings",
            Entity::MonthlyCotistas => "monthly_cotistas",
            Entity::CompositionHoldings => "composition_holdings",
            Entity::CompositionNetAssets => "composition_net_assets",
            Entity::HolderProfile => "holder_profile",
            Entity::ExchangeQuotas => "exchange_quotas",
            Entity::PortalQuotas => "portal_quotas",
        }
    }
}

/// Canonical fields extracted from rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    FundId,
    Date,
    QuotaValue,
    NetAssetValue,
    TotalValue,
    Inflows,
    Outflows,
    HolderCount,
    AssetType,
    Issuer,
    InstrumentId,
    MarketValue,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::FundId => "fund_id",
            Field::Date => "date",
            Field::QuotaValue => "quota_value",
            Field::NetAssetValue => "net_asset_value",
            Field::TotalValue => "total_value",
            Field::Inflows => "inflows",
            Field::Outflows => "outflows",
            Field::HolderCount => "holder_count",
            Field::AssetType => "asset_type",
            Field::Issuer => "issuer",
            Field::InstrumentId => "instrument_id",
            Field::MarketValue => "market_value",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub field: Field,
    /// Header aliases in priority order; matched case-insensitively.
    pub headers: &'static [&'static str],
    pub required: bool,
}

const fn req(field: Field, headers: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        field,
        headers,
        required: true,
    }
}

const fn opt(field: Field, headers: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        field,
        headers,
        required: false,
    }
}

/// One era of one entity's layout.
#[derive(Debug)]
pub struct ColumnMapping {
    pub entity: Entity,
    pub era: &'static str,
    /// First month this era applies to (inclusive).
    pub valid_from: Option<YearMonth>,
    /// Last month this era applies to (inclusive).
    pub valid_until: Option<YearMonth>,
    pub fields: &'static [FieldSpec],
    /// Every header starting with this prefix is summed into `HolderCount`.
    pub sum_prefix: Option<&'static str>,
}

impl ColumnMapping {
    pub fn applies_to(&self, month: YearMonth) -> bool {
        self.valid_from.map_or(true, |from| month >= from)
            && self.valid_until.map_or(true, |until| month <= until)
    }

    /// Resolve header positions against an actual header row.
    pub fn bind<'h, I>(&'static self, headers: I) -> Result<BoundMapping, PayloadError>
    where
        I: IntoIterator<Item = &'h str>,
    {
        let headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        let mut columns = Vec::with_capacity(self.fields.len());
        for spec in self.fields {
            let positions: Vec<usize> = spec
                .headers
                .iter()
                .filter_map(|alias| {
                    let alias = alias.to_lowercase();
                    headers.iter().position(|h| *h == alias)
                })
                .collect();
            if positions.is_empty() && spec.required {
                return Err(PayloadError::MissingColumn {
                    entity: self.entity.as_str(),
                    column: spec.headers.first().copied().unwrap_or("?").to_string(),
                });
            }
            columns.push((spec.field, positions));
        }

        let sum_columns = match self.sum_prefix {
            Some(prefix) => {
                let prefix = prefix.to_lowercase();
                let found: Vec<usize> = headers
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.starts_with(&prefix))
                    .map(|(i, _)| i)
                    .collect();
                if found.is_empty() {
                    return Err(PayloadError::MissingColumn {
                        entity: self.entity.as_str(),
                        column: format!("{}*", prefix.to_uppercase()),
                    });
                }
                found
            }
            None => Vec::new(),
        };

        Ok(BoundMapping {
            mapping: self,
            columns,
            sum_columns,
        })
    }
}

/// A mapping resolved against one file's header row.
#[derive(Debug)]
pub struct BoundMapping {
    pub mapping: &'static ColumnMapping,
    columns: Vec<(Field, Vec<usize>)>,
    sum_columns: Vec<usize>,
}

impl BoundMapping {
    /// First non-empty value among the field's aliases.
    pub fn get<'r>(&self, record: &'r csv::StringRecord, field: Field) -> Option<&'r str> {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .and_then(|(_, positions)| {
                positions
                    .iter()
                    .filter_map(|&i| record.get(i))
                    .map(str::trim)
                    .find(|v| !v.is_empty())
            })
    }

    /// Raw values of the summed columns.
    pub fn summed<'r>(&self, record: &'r csv::StringRecord) -> Vec<&'r str> {
        self.sum_columns.iter().filter_map(|&i| record.get(i)).collect()
    }
}

// ── Eras ─────────────────────────────────────────────────────────────

/// First month published in the CVM Resolution 175 layout.
pub const RCVM175_FROM: YearMonth = YearMonth::from_parts(2024, 10);
const LEGACY_UNTIL: YearMonth = YearMonth::from_parts(2024, 9);

const LEGACY_FUND_ID: &[&str] = &["CNPJ_FUNDO", "CNPJ_FUNDO_CLASSE"];
const RCVM175_FUND_ID: &[&str] = &["CNPJ_FUNDO_CLASSE", "CNPJ_FUNDO"];

macro_rules! daily_fields {
    ($fund_id:expr) => {
        &[
            req(Field::FundId, $fund_id),
            req(Field::Date, &["DT_COMPTC"]),
            req(Field::QuotaValue, &["VL_QUOTA"]),
            opt(Field::NetAssetValue, &["VL_PATRIM_LIQ"]),
            opt(Field::TotalValue, &["VL_TOTAL"]),
            opt(Field::Inflows, &["CAPTC_DIA"]),
            opt(Field::Outflows, &["RESG_DIA"]),
            opt(Field::HolderCount, &["NR_COTST"]),
        ]
    };
}

macro_rules! monthly_holdings_fields {
    ($fund_id:expr) => {
        &[
            req(Field::FundId, $fund_id),
            req(Field::Date, &["DT_COMPTC"]),
            req(Field::AssetType, &["TP_ATIVO", "TP_APLIC"]),
            opt(Field::Issuer, &["EMISSOR", "DS_ATIVO", "EMISSOR_LIGADO"]),
            opt(Field::InstrumentId, &["CD_ISIN", "COD_ISIN", "CD_ATIVO"]),
            req(Field::MarketValue, &["VL_MERC_POS_FINAL"]),
        ]
    };
}

macro_rules! monthly_cotistas_fields {
    ($fund_id:expr) => {
        &[
            req(Field::FundId, $fund_id),
            req(Field::Date, &["DT_COMPTC"]),
            opt(Field::HolderCount, &["QT_COTISTAS", "NR_COTST"]),
            opt(Field::NetAssetValue, &["VL_PATRIM_LIQ"]),
        ]
    };
}

macro_rules! composition_holdings_fields {
    ($fund_id:expr) => {
        &[
            req(Field::FundId, $fund_id),
            req(Field::Date, &["DT_COMPTC"]),
            req(Field::AssetType, &["TP_ATIVO", "TP_APLIC"]),
            opt(
                Field::Issuer,
                &[
                    "EMISSOR",
                    "DS_ATIVO",
                    "DS_ATIVO_EXTERIOR",
                    "NM_FUNDO_CLASSE_SUBCLASSE_COTA",
                    "NM_FUNDO_COTA",
                    "EMISSOR_LIGADO",
                ],
            ),
            opt(Field::InstrumentId, &["CD_ISIN", "CD_ATIVO", "CD_ATIVO_BV_MERC"]),
            req(Field::MarketValue, &["VL_MERC_POS_FINAL"]),
        ]
    };
}

macro_rules! net_assets_fields {
    ($fund_id:expr) => {
        &[
            req(Field::FundId, $fund_id),
            req(Field::Date, &["DT_COMPTC"]),
            req(Field::NetAssetValue, &["VL_PATRIM_LIQ"]),
        ]
    };
}

macro_rules! eras {
    ($entity:expr, $fields:ident) => {
        &[
            ColumnMapping {
                entity: $entity,
                era: "legacy",
                valid_from: None,
                valid_until: Some(LEGACY_UNTIL),
                fields: $fields!(LEGACY_FUND_ID),
                sum_prefix: None,
            },
            ColumnMapping {
                entity: $entity,
                era: "rcvm175",
                valid_from: Some(RCVM175_FROM),
                valid_until: None,
                fields: $fields!(RCVM175_FUND_ID),
                sum_prefix: None,
            },
        ]
    };
}

static DAILY_QUOTAS: &[ColumnMapping] = eras!(Entity::DailyQuotas, daily_fields);
static MONTHLY_HOLDINGS: &[ColumnMapping] = eras!(Entity::MonthlyHoldings, monthly_holdings_fields);
static MONTHLY_COTISTAS: &[ColumnMapping] = eras!(Entity::MonthlyCotistas, monthly_cotistas_fields);
static COMPOSITION_HOLDINGS: &[ColumnMapping] =
    eras!(Entity::CompositionHoldings, composition_holdings_fields);
static COMPOSITION_NET_ASSETS: &[ColumnMapping] =
    eras!(Entity::CompositionNetAssets, net_assets_fields);

static HOLDER_PROFILE: &[ColumnMapping] = &[ColumnMapping {
    entity: Entity::HolderProfile,
    era: "profile",
    valid_from: None,
    valid_until: None,
    fields: &[
        req(Field::FundId, RCVM175_FUND_ID),
        req(Field::Date, &["DT_COMPTC"]),
    ],
    sum_prefix: Some("NR_COTST_"),
}];

static EXCHANGE_QUOTAS: &[ColumnMapping] = &[ColumnMapping {
    entity: Entity::ExchangeQuotas,
    era: "export",
    valid_from: None,
    valid_until: None,
    fields: &[
        req(Field::FundId, &["cnpj do fundo", "cnpj"]),
        req(Field::Date, &["data", "data de referência", "data de referencia"]),
        req(Field::QuotaValue, &["valor da cota"]),
        opt(Field::NetAssetValue, &["patrimônio líquido", "patrimonio liquido"]),
    ],
    sum_prefix: None,
}];

static PORTAL_QUOTAS: &[ColumnMapping] = &[ColumnMapping {
    entity: Entity::PortalQuotas,
    era: "export",
    valid_from: None,
    valid_until: None,
    fields: &[
        req(Field::FundId, &["cnpj", "cnpj do fundo"]),
        req(Field::Date, &["data", "date"]),
        req(Field::QuotaValue, &["cota", "valor da cota", "quota"]),
        opt(Field::NetAssetValue, &["patrimonio", "patrimônio líquido", "pl"]),
        opt(Field::HolderCount, &["cotistas", "numero de cotistas"]),
    ],
    sum_prefix: None,
}];

fn eras_of(entity: Entity) -> &'static [ColumnMapping] {
    match entity {
        Entity::DailyQuotas => DAILY_QUOTAS,
        Entity::MonthlyHoldings => MONTHLY_HOLDINGS,
        Entity::MonthlyCotistas => MONTHLY_COTISTAS,
        Entity::CompositionHoldings => COMPOSITION_HOLDINGS,
        Entity::CompositionNetAssets => COMPOSITION_NET_ASSETS,
        Entity::HolderProfile => HOLDER_PROFILE,
        Entity::ExchangeQuotas => EXCHANGE_QUOTAS,
        Entity::PortalQuotas => PORTAL_QUOTAS,
    }
}

/// The mapping valid for `month`. Eras cover every month, so the last era
/// is only a backstop for a gap in the table.
pub fn mapping_for(entity: Entity, month: YearMonth) -> &'static ColumnMapping {
    let eras = eras_of(entity);
    eras.iter()
        .find(|m| m.applies_to(month))
        .unwrap_or(&eras[eras.len() - 1])
}
