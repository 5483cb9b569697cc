//! Usage recorder.
//!
//! Every write is handed to the task supervisor the moment [`UsageRecorder::record`] is
//! called, so a caller that goes away mid-request cannot cancel a write that was already
//! issued. In [`UsageLogMode::Await`] the returned future resolves once the write has
//! finished; in [`UsageLogMode::Detached`] it resolves immediately and shutdown drains
//! the write instead.
//!
//! Write failures are reported through `tracing` and never reach the API caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::models::usage::NewUsageLog;
use crate::services::tasks::TaskSupervisor;
use crate::store::{StoreError, UsageStore, with_timeout};

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are never persisted.
const SENSITIVE_FIELDS: [&str; 4] = ["password", "token", "apiKey", "secret"];

/// Whether the response waits for its usage entry to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageLogMode {
    #[default]
    Await,
    Detached,
}

/// Redact sensitive fields at any depth of a request payload.
pub fn sanitize_request_data(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if SENSITIVE_FIELDS.contains(&key.as_str()) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, sanitize_request_data(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_request_data).collect()),
        other => other,
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
    tasks: TaskSupervisor,
    mode: UsageLogMode,
    timeout: Duration,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn UsageStore>,
        tasks: TaskSupervisor,
        mode: UsageLogMode,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            tasks,
            mode,
            timeout,
        }
    }

    pub fn mode(&self) -> UsageLogMode {
        self.mode
    }

    /// Sanitize and issue the write. The write is already in flight when this returns.
    pub fn record(&self, mut entry: NewUsageLog) -> impl Future<Output = ()> + Send + 'static {
        entry.request_data = entry.request_data.map(sanitize_request_data);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let store = self.store.clone();
        let limit = self.timeout;

        self.tasks.spawn("usage_log", async move {
            let user_id = entry.user_id;
            let endpoint = entry.endpoint.clone();
            let status = entry.status;

            let result = with_timeout("insert_usage", limit, store.insert_usage(entry)).await;
            if let Err(e) = result {
                tracing::error!(
                    %user_id,
                    endpoint = %endpoint,
                    %status,
                    error = %e,
                    "Failed to write usage log"
                );
            }
            let _ = done_tx.send(());
            Ok::<_, StoreError>(())
        });

        let wait = self.mode == UsageLogMode::Await;
        async move {
            if wait {
                // A dropped sender means the task could not run; it was already logged
                let _ = done_rx.await;
            }
        }
    }
}
