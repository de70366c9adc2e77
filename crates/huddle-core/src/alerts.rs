use crate::errors::{CallError, ErrorClass};

/// What the call screen should offer next to a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-run the join pipeline from the stage that failed.
    Retry,
    /// The call is gone; reload call data instead of retrying blindly.
    Refresh,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub class: ErrorClass,
    pub message: String,
    pub retry: RetryAction,
}

impl Alert {
    pub fn from_error(err: &CallError) -> Self {
        let class = err.class();
        Self {
            class,
            message: err.to_string(),
            retry: class.retry_action(),
        }
    }
}

/// Sink for classified failures. Implemented by the presentation layer.
pub trait AlertSink: Send + Sync {
    fn present(&self, alert: Alert);
}

/// Sink that only logs; used when no presenter is attached.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn present(&self, alert: Alert) {
        tracing::warn!("alert ({:?}): {}", alert.class, alert.message);
    }
}
