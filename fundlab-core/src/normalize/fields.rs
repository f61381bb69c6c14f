//! Field-level decoding: text encoding, Brazilian decimals, dates.

use chrono::NaiveDate;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// Decode a regulator file. UTF-8 is tried first (with or without BOM);
/// anything else is read as latin-1, which maps every byte to a char.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Parse a number in either `1234.56` or `1.234,56` form.
///
/// `Ok(None)` for blank input; `Err` for anything unparseable or non-finite.
/// With a decimal comma, `.` may only group thousands before it, so mixed
/// forms such as `1,234.56` are rejected rather than misread.
pub fn parse_decimal(raw: &str) -> Result<Option<f64>, ()> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let cleaned = match trimmed.rfind(',') {
        Some(comma) => {
            if trimmed.matches(',').count() > 1 || trimmed[comma..].contains('.') {
                return Err(());
            }
            trimmed.replace('.', "").replace(',', ".")
        }
        None => trimmed.to_string(),
    };
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(()),
    }
}

/// Parse a non-negative count; fractional counts are rounded.
pub fn parse_count(raw: &str) -> Result<Option<u64>, ()> {
    match parse_decimal(raw)? {
        None => Ok(None),
        Some(v) if v < 0.0 => Err(()),
        Some(v) => Ok(Some(v.round() as u64)),
    }
}

/// Parse `YYYY-MM-DD` or `DD/MM/YYYY`; a trailing time component is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
}

/// Pick the delimiter from a header line: `;` unless only `,` appears.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    if !header.contains(';') && header.contains(',') {
        b','
    } else {
        b';'
    }
}
