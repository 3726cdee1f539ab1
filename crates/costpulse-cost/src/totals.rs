//! Spend and token totals over the usage history.
//!
//! Day and month boundaries are taken in local time.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Utc};
use costpulse_core::types::UsageRecord;
use rust_decimal::Decimal;
use serde::Serialize;

/// Cost of one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCost {
    pub date: NaiveDate,
    pub cost: Decimal,
}

/// Today's spend against the daily budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub spent_today: Decimal,
    pub daily_budget: Decimal,
    /// Share of the budget used, in percent; zero when the budget is zero
    pub percent_used: Decimal,
    pub over_budget: bool,
}

/// Summary of the usage history at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalsSummary {
    pub session_cost: Decimal,
    pub today_cost: Decimal,
    pub month_cost: Decimal,
    pub tokens_today: u64,
    pub tokens_month: u64,
}

/// Computes totals relative to a session start.
#[derive(Debug, Clone)]
pub struct TotalsCalculator {
    session_start: DateTime<Utc>,
}

impl Default for TotalsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl TotalsCalculator {
    /// A calculator whose session starts now.
    pub fn new() -> Self {
        Self {
            session_start: Utc::now(),
        }
    }

    pub fn with_session_start(mut self, start: DateTime<Utc>) -> Self {
        self.session_start = start;
        self
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Cost of records ingested since the session started.
    pub fn session_cost(&self, entries: &[UsageRecord]) -> Decimal {
        entries
            .iter()
            .filter(|e| e.timestamp >= self.session_start)
            .map(|e| e.cost)
            .sum()
    }

    pub fn today_cost(&self, entries: &[UsageRecord], now: DateTime<Local>) -> Decimal {
        let today = now.date_naive();
        entries
            .iter()
            .filter(|e| local_date(e) == today)
            .map(|e| e.cost)
            .sum()
    }

    pub fn month_cost(&self, entries: &[UsageRecord], now: DateTime<Local>) -> Decimal {
        entries
            .iter()
            .filter(|e| same_month(local_date(e), now.date_naive()))
            .map(|e| e.cost)
            .sum()
    }

    pub fn tokens_today(&self, entries: &[UsageRecord], now: DateTime<Local>) -> u64 {
        let today = now.date_naive();
        entries
            .iter()
            .filter(|e| local_date(e) == today)
            .map(UsageRecord::total_tokens)
            .fold(0, u64::saturating_add)
    }

    pub fn tokens_month(&self, entries: &[UsageRecord], now: DateTime<Local>) -> u64 {
        entries
            .iter()
            .filter(|e| same_month(local_date(e), now.date_naive()))
            .map(UsageRecord::total_tokens)
            .fold(0, u64::saturating_add)
    }

    /// Cost per day for the last `days` days ending today, oldest first.
    ///
    /// Days without usage are present with a zero cost.
    pub fn daily_totals(
        &self,
        entries: &[UsageRecord],
        days: u32,
        now: DateTime<Local>,
    ) -> Vec<DailyCost> {
        let today = now.date_naive();
        (0..days)
            .rev()
            .map(|back| {
                let date = today - Duration::days(i64::from(back));
                let cost = entries
                    .iter()
                    .filter(|e| local_date(e) == date)
                    .map(|e| e.cost)
                    .sum();
                DailyCost { date, cost }
            })
            .collect()
    }

    pub fn budget_status(
        &self,
        entries: &[UsageRecord],
        daily_budget: Decimal,
        now: DateTime<Local>,
    ) -> BudgetStatus {
        let spent_today = self.today_cost(entries, now);
        let percent_used = if daily_budget > Decimal::ZERO {
            (spent_today / daily_budget * Decimal::ONE_HUNDRED).round_dp(2)
        } else {
            Decimal::ZERO
        };
        BudgetStatus {
            spent_today,
            daily_budget,
            percent_used,
            over_budget: daily_budget > Decimal::ZERO && spent_today > daily_budget,
        }
    }

    pub fn summary(&self, entries: &[UsageRecord], now: DateTime<Local>) -> TotalsSummary {
        TotalsSummary {
            session_cost: self.session_cost(entries),
            today_cost: self.today_cost(entries, now),
            month_cost: self.month_cost(entries, now),
            tokens_today: self.tokens_today(entries, now),
            tokens_month: self.tokens_month(entries, now),
        }
    }
}

fn local_date(record: &UsageRecord) -> NaiveDate {
    record.timestamp.with_timezone(&Local).date_naive()
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(local: DateTime<Local>, cost: i64, tokens: u64) -> UsageRecord {
        let mut r = UsageRecord::new("OpenAI", "gpt-4", tokens, 0)
            .with_timestamp(local.with_timezone(&Utc));
        r.cost = Decimal::new(cost, 2);
        r
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_today_and_month() {
        let now = noon(2025, 3, 15);
        let entries = vec![
            at(noon(2025, 3, 15), 150, 10),
            at(noon(2025, 3, 15), 50, 5),
            at(noon(2025, 3, 2), 100, 20),
            at(noon(2025, 2, 28), 999, 1000),
        ];
        let calc = TotalsCalculator::new();

        assert_eq!(calc.today_cost(&entries, now), Decimal::new(200, 2));
        assert_eq!(calc.month_cost(&entries, now), Decimal::new(300, 2));
        assert_eq!(calc.tokens_today(&entries, now), 15);
        assert_eq!(calc.tokens_month(&entries, now), 35);
    }

    #[test]
    fn test_session_cost_uses_start() {
        let start = noon(2025, 3, 15).with_timezone(&Utc);
        let calc = TotalsCalculator::new().with_session_start(start);
        let entries = vec![
            at(noon(2025, 3, 14), 100, 1),
            at(noon(2025, 3, 16), 25, 1),
        ];
        assert_eq!(calc.session_cost(&entries), Decimal::new(25, 2));
    }

    #[test]
    fn test_daily_totals_fill_gaps() {
        let now = noon(2025, 3, 15);
        let entries = vec![at(noon(2025, 3, 13), 100, 1), at(noon(2025, 3, 15), 10, 1)];

        let days = TotalsCalculator::new().daily_totals(&entries, 3, now);

        assert_eq!(days.len(), 3);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2025, 3, 13).unwrap());
        assert_eq!(days[0].cost, Decimal::new(100, 2));
        assert_eq!(days[1].cost, Decimal::ZERO);
        assert_eq!(days[2].cost, Decimal::new(10, 2));
    }

    #[test]
    fn test_budget_status() {
        let now = noon(2025, 3, 15);
        let entries = vec![at(now, 1250, 1)];
        let calc = TotalsCalculator::new();

        let status = calc.budget_status(&entries, Decimal::new(10, 0), now);
        assert!(status.over_budget);
        assert_eq!(status.percent_used, Decimal::new(125, 0));

        let unlimited = calc.budget_status(&entries, Decimal::ZERO, now);
        assert!(!unlimited.over_budget);
        assert_eq!(unlimited.percent_used, Decimal::ZERO);
    }
}
