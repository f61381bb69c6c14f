//! Reporting window: which months a run covers.

use chrono::NaiveDate;
use fundlab_core::domain::YearMonth;
use serde::Serialize;

/// Months covered by a run, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportingWindow {
    months: Vec<YearMonth>,
}

impl ReportingWindow {
    /// Walk back from `today`'s month, skip the `months_to_ignore` most recent
    /// months (the current one included), then take `months_of_history`.
    pub fn compute(today: NaiveDate, months_of_history: u32, months_to_ignore: u32) -> Self {
        let mut month = YearMonth::from_date(today);
        for _ in 0..months_to_ignore {
            month = month.pred();
        }
        let mut months = Vec::with_capacity(months_of_history as usize);
        for _ in 0..months_of_history {
            months.push(month);
            month = month.pred();
        }
        months.reverse();
        Self { months }
    }

    pub fn months(&self) -> &[YearMonth] {
        &self.months
    }

    pub fn start(&self) -> Option<YearMonth> {
        self.months.first().copied()
    }

    pub fn end(&self) -> Option<YearMonth> {
        self.months.last().copied()
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    pub fn contains(&self, month: YearMonth) -> bool {
        self.months.binary_search(&month).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    #[test]
    fn window_ends_at_current_month_without_guard() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let w = ReportingWindow::compute(today, 3, 0);
        assert_eq!(w.months(), &[ym(2024, 1), ym(2024, 2), ym(2024, 3)]);
    }

    #[test]
    fn recency_guard_skips_latest_months_across_year_boundary() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let w = ReportingWindow::compute(today, 4, 2);
        assert_eq!(w.start(), Some(ym(2023, 9)));
        assert_eq!(w.end(), Some(ym(2023, 12)));
        assert_eq!(w.len(), 4);
        assert!(w.contains(ym(2023, 10)));
        assert!(!w.contains(ym(2024, 1)));
    }

    #[test]
    fn months_are_strictly_increasing() {
        let today = NaiveDate::from_ymd_opt(2025, 7, 31).unwrap();
        let w = ReportingWindow::compute(today, 24, 1);
        assert_eq!(w.len(), 24);
        assert!(w.months().windows(2).all(|p| p[0].succ() == p[1]));
    }
}
