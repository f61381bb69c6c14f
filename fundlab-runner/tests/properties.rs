//! Property tests for the reporting window and the curated return series.

use chrono::NaiveDate;
use fundlab_core::domain::YearMonth;
use fundlab_runner::curated::daily_returns;
use fundlab_runner::ReportingWindow;
use proptest::prelude::*;

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (1995i32..2040, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

proptest! {
    #[test]
    fn window_is_contiguous_and_sized(
        today in arb_date(),
        history in 1u32..60,
        ignore in 0u32..24,
    ) {
        let window = ReportingWindow::compute(today, history, ignore);
        prop_assert_eq!(window.len(), history as usize);

        let months = window.months();
        for pair in months.windows(2) {
            prop_assert_eq!(pair[0].succ(), pair[1]);
        }

        let mut expected_end = YearMonth::from_date(today);
        for _ in 0..ignore {
            expected_end = expected_end.pred();
        }
        prop_assert_eq!(window.end(), Some(expected_end));
    }

    #[test]
    fn ignored_months_never_enter_the_window(
        today in arb_date(),
        history in 1u32..36,
        ignore in 1u32..12,
    ) {
        let window = ReportingWindow::compute(today, history, ignore);
        prop_assert!(!window.contains(YearMonth::from_date(today)));
    }

    #[test]
    fn returns_follow_the_previous_available_quota(
        quotas in prop::collection::vec(0.5f64..5.0, 1..50),
    ) {
        let returns = daily_returns(&quotas);
        prop_assert_eq!(returns.len(), quotas.len());
        prop_assert!(returns[0].is_none());
        for i in 1..quotas.len() {
            let expected = (quotas[i] / quotas[i - 1] - 1.0) * 100.0;
            let got = returns[i].unwrap();
            prop_assert!((got - expected).abs() < 1e-9);
        }
    }
}
