use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::task::RecoveryStrategy;
use crate::retry::RetryPolicy;

// Type aliases
pub type ChainId = String;

/// Dispatch priority. Higher priorities leave the worker queue first.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Chain lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Pending,
    Running,
    Retrying,
    Paused,
    Success,
    Failed,
    Cancelled,
}

impl ChainStatus {
    /// SUCCESS, FAILED and CANCELLED accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainStatus::Success | ChainStatus::Failed | ChainStatus::Cancelled
        )
    }

    /// Statuses subject to the monitor's timeout sweep
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ChainStatus::Running | ChainStatus::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "PENDING",
            ChainStatus::Running => "RUNNING",
            ChainStatus::Retrying => "RETRYING",
            ChainStatus::Paused => "PAUSED",
            ChainStatus::Success => "SUCCESS",
            ChainStatus::Failed => "FAILED",
            ChainStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a unit of work, provided by the caller
#[derive(Clone)]
pub struct ChainDefinition {
    /// Caller-chosen id; generated at registration when absent
    pub id: Option<ChainId>,
    pub name: String,
    pub description: String,
    /// Business identifier of the work this chain performs
    pub task_id: Option<String>,
    pub dependencies: Vec<ChainId>,
    pub priority: Priority,
    /// Falls back to the engine default when unset
    pub max_retries: Option<u32>,
    /// Falls back to the engine's default backoff table when unset
    pub retry: Option<RetryPolicy>,
    pub recovery: Option<Arc<dyn RecoveryStrategy>>,
}

impl ChainDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            task_id: None,
            dependencies: Vec::new(),
            priority: Priority::Normal,
            max_retries: None,
            retry: None,
            recovery: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<ChainId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Add a dependency; duplicates are ignored
    pub fn depends_on(mut self, chain_id: impl Into<ChainId>) -> Self {
        let chain_id = chain_id.into();
        if !self.dependencies.contains(&chain_id) {
            self.dependencies.push(chain_id);
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Use an exponential backoff table for this chain
    pub fn backoff_table(mut self, table: Vec<Duration>) -> Self {
        self.retry = Some(RetryPolicy::exponential(table));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn recovery(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.recovery = Some(strategy);
        self
    }
}

impl fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("retry", &self.retry)
            .field("recovery", &self.recovery.is_some())
            .finish()
    }
}

/// Execution metrics of a chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainMetrics {
    /// Start of the first attempt
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Measured on the monotonic clock when the chain terminates
    pub duration: Option<Duration>,
    pub retry_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl ChainMetrics {
    /// Recorded duration, or wall-clock difference when none was measured
    pub fn duration(&self) -> Option<Duration> {
        if self.duration.is_some() {
            return self.duration;
        }
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Read-only copy of an active chain; also the snapshot entry format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainView {
    pub chain_id: ChainId,
    pub name: String,
    pub task_id: Option<String>,
    pub status: ChainStatus,
    pub priority: Priority,
    pub dependencies: Vec<ChainId>,
    pub progress: u8,
    pub current_step: Option<String>,
    pub max_retries: u32,
    pub metrics: ChainMetrics,
}

impl ChainView {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.metrics.start_time
    }
}

/// Final result delivered through a dispatch handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub chain_id: ChainId,
    pub status: ChainStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl ChainOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ChainStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        for status in [ChainStatus::Success, ChainStatus::Failed, ChainStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.is_in_flight());
        }
        for status in [ChainStatus::Pending, ChainStatus::Paused] {
            assert!(!status.is_terminal());
            assert!(!status.is_in_flight());
        }
        assert!(ChainStatus::Running.is_in_flight());
        assert!(ChainStatus::Retrying.is_in_flight());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ChainStatus::Retrying).unwrap();
        assert_eq!(json, "\"RETRYING\"");
        let parsed: ChainStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(parsed, ChainStatus::Cancelled);
    }

    #[test]
    fn test_definition_builder_dedups_dependencies() {
        let def = ChainDefinition::new("collect")
            .task_id("task-7")
            .depends_on("a")
            .depends_on("b")
            .depends_on("a")
            .priority(Priority::High)
            .max_retries(2);

        assert_eq!(def.dependencies, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(def.priority, Priority::High);
        assert_eq!(def.max_retries, Some(2));
        assert_eq!(def.task_id.as_deref(), Some("task-7"));
        assert!(def.id.is_none());
    }

    #[test]
    fn test_metrics_duration_fallback() {
        let start = Utc::now();
        let metrics = ChainMetrics {
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::seconds(3)),
            ..Default::default()
        };
        assert_eq!(metrics.duration(), Some(Duration::from_secs(3)));

        let measured = ChainMetrics {
            duration: Some(Duration::from_millis(250)),
            ..metrics
        };
        assert_eq!(measured.duration(), Some(Duration::from_millis(250)));
    }
}
