//! Usage log models.
//!
//! Every pass through the request gateway ends in exactly one usage entry. Entries are
//! append-only: this service never updates or deletes them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of a gateway pass, stored in `usage_logs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    Error,
    InsufficientCredits,
    RateLimited,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Error => "error",
            UsageStatus::InsufficientCredits => "insufficient_credits",
            UsageStatus::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage entry as written by the recorder.
///
/// `credits_used` is negative when the request granted reward credits.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUsageLog {
    pub user_id: Uuid,

    /// `None` for session-authenticated requests
    pub api_key_id: Option<Uuid>,

    pub endpoint: String,
    pub credits_used: i64,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub processing_time_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
}

/// Represents a usage log row from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub endpoint: String,
    pub credits_used: i64,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub processing_time_ms: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Usage entry as returned by `GET /api/usage`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogResponse {
    pub id: Uuid,
    pub endpoint: String,
    pub credits_used: i64,
    pub status: String,
    pub processing_time: i64,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl From<UsageLog> for UsageLogResponse {
    fn from(log: UsageLog) -> Self {
        Self {
            id: log.id,
            endpoint: log.endpoint,
            credits_used: log.credits_used,
            status: log.status,
            processing_time: log.processing_time_ms,
            created_at: log.created_at,
            error_message: log.error_message,
        }
    }
}

/// Query string of `GET /api/usage`.
#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<i64>,
    pub days: Option<i64>,
    pub stats: Option<String>,
}

impl UsageQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;
    pub const DEFAULT_DAYS: i64 = 30;
    pub const MAX_DAYS: i64 = 365;

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn days(&self) -> i64 {
        self.days
            .unwrap_or(Self::DEFAULT_DAYS)
            .clamp(1, Self::MAX_DAYS)
    }

    pub fn include_stats(&self) -> bool {
        self.stats.as_deref() == Some("true")
    }
}

/// Aggregate over a list of usage entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_requests: usize,
    pub total_credits_used: i64,
    pub successful_requests: usize,
    pub success_rate: f64,
}

impl UsageSummary {
    pub fn from_logs(logs: &[UsageLog]) -> Self {
        let total_requests = logs.len();
        let total_credits_used = logs.iter().map(|log| log.credits_used).sum();
        let successful_requests = logs
            .iter()
            .filter(|log| log.status == UsageStatus::Success.as_str())
            .count();
        let success_rate = if total_requests > 0 {
            successful_requests as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };

        Self {
            total_requests,
            total_credits_used,
            successful_requests,
            success_rate,
        }
    }
}

/// Per-day aggregate for the usage analytics view.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: chrono::NaiveDate,
    pub requests: i64,
    pub credits_used: i64,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(status: UsageStatus, credits_used: i64) -> UsageLog {
        UsageLog {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            api_key_id: None,
            endpoint: "/api/datasets".to_string(),
            credits_used,
            request_data: None,
            response_data: None,
            processing_time_ms: 3,
            status: status.as_str().to_string(),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_counts_rewards_as_negative_usage() {
        let logs = vec![
            log(UsageStatus::Success, 2),
            log(UsageStatus::Success, -5),
            log(UsageStatus::InsufficientCredits, 0),
            log(UsageStatus::RateLimited, 0),
        ];
        let summary = UsageSummary::from_logs(&logs);

        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.total_credits_used, -3);
        assert_eq!(summary.successful_requests, 2);
        assert_eq!(summary.success_rate, 50.0);
    }

    #[test]
    fn empty_summary_has_zero_rate() {
        let summary = UsageSummary::from_logs(&[]);
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn usage_query_defaults_and_clamps() {
        let query = UsageQuery::default();
        assert_eq!(query.limit(), 100);
        assert_eq!(query.days(), 30);
        assert!(!query.include_stats());

        let query = UsageQuery {
            limit: Some(50_000),
            days: Some(0),
            stats: Some("true".to_string()),
        };
        assert_eq!(query.limit(), 1000);
        assert_eq!(query.days(), 1);
        assert!(query.include_stats());
    }

    #[test]
    fn status_serializes_in_snake_case() {
        let json = serde_json::to_string(&UsageStatus::InsufficientCredits).unwrap();
        assert_eq!(json, "\"insufficient_credits\"");
        assert_eq!(UsageStatus::RateLimited.to_string(), "rate_limited");
    }
}
