//! Tabular artifacts shared by the staging and curated layers.
//!
//! A [`Table`] is a named, typed, in-memory grid of text cells. It renders to
//! CSV for the published generation and to typed Parquet columns for the
//! warehouse drop. Empty cells are missing values.

use chrono::NaiveDate;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableReadError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("{table}: expected columns {expected:?}, found {found:?}")]
    Header {
        table: &'static str,
        expected: Vec<&'static str>,
        found: Vec<String>,
    },
}

/// Declared type of a column; cells are parsed into it by typed writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Number,
    Date,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<(&'static str, ColumnType)>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(name: &'static str, columns: &[(&'static str, ColumnType)]) -> Self {
        Self {
            name,
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.columns.len(), "{}: row width", self.name);
        self.rows.push(row);
    }

    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(c, _)| *c == name)
    }

    /// Cells of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| r[idx].as_str()))
    }

    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(self.columns.iter().map(|(c, _)| *c))?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
    }

    /// Parse CSV written by [`Table::to_csv`] into a copy of this table's
    /// layout. The header must match the columns exactly.
    pub fn read_csv(&self, bytes: &[u8]) -> Result<Table, TableReadError> {
        let mut rdr = csv::Reader::from_reader(bytes);
        let expected: Vec<&'static str> = self.columns.iter().map(|(c, _)| *c).collect();
        let found: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
        if found != expected {
            return Err(TableReadError::Header {
                table: self.name,
                expected,
                found,
            });
        }
        let mut table = Table::new(self.name, &self.columns);
        for record in rdr.records() {
            table.push(record?.iter().map(String::from).collect());
        }
        Ok(table)
    }
}

// ── Cell formatting ──────────────────────────────────────────────────

pub fn cell<T: Display>(value: T) -> String {
    value.to_string()
}

pub fn opt_cell<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn opt_str(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

pub fn date_cell(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
