//! Per-customer usage accounting. Only deliveries that reached `Sent` count.
//!
//! [`UsageRecorder`] is the seam for an external quota service. The bundled
//! [`InMemoryUsageLedger`] keeps process-local counts and exports them as the
//! `delivery_usage_sent_total{customer,period}` counter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage backend unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_sent(&self, customer_id: &str, at: DateTime<Utc>) -> Result<(), UsageError>;
}

/// Counts per customer per calendar month (`YYYY-MM`).
#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    counts: Mutex<HashMap<(String, String), u64>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<(String, String), u64>> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn period(at: DateTime<Utc>) -> String {
        at.format("%Y-%m").to_string()
    }

    pub fn count(&self, customer_id: &str, period: &str) -> u64 {
        self.counts()
            .get(&(customer_id.to_string(), period.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageLedger {
    async fn record_sent(&self, customer_id: &str, at: DateTime<Utc>) -> Result<(), UsageError> {
        let period = Self::period(at);
        *self
            .counts()
            .entry((customer_id.to_string(), period.clone()))
            .or_insert(0) += 1;

        counter!(
            "delivery_usage_sent_total",
            "customer" => customer_id.to_string(),
            "period" => period
        )
        .increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_counts_by_calendar_month() {
        let ledger = InMemoryUsageLedger::new();
        let jan = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        ledger.record_sent("cust-1", jan).await.unwrap();
        ledger.record_sent("cust-1", jan).await.unwrap();
        ledger.record_sent("cust-1", feb).await.unwrap();
        ledger.record_sent("cust-2", feb).await.unwrap();

        assert_eq!(ledger.count("cust-1", "2024-01"), 2);
        assert_eq!(ledger.count("cust-1", "2024-02"), 1);
        assert_eq!(ledger.count("cust-2", "2024-02"), 1);
        assert_eq!(ledger.count("cust-3", "2024-02"), 0);
    }

    #[tokio::test]
    async fn test_sends_are_exported_as_metrics() {
        reconcile_worker::init_metrics();
        let ledger = InMemoryUsageLedger::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        ledger.record_sent("cust-metrics", at).await.unwrap();

        let rendered = reconcile_worker::metrics::render_metrics();
        assert!(rendered.contains("delivery_usage_sent_total"));
        assert!(rendered.contains("customer=\"cust-metrics\""));
        assert!(rendered.contains("period=\"2024-03\""));
    }
}
