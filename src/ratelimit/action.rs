//! Action classes and the limiter registry that gates them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::limiter::RateLimiter;
use crate::config::LimitsConfig;
use crate::error::PoolError;

/// A class of requests bounded independently per origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    /// Submitting a new command
    Submit,
    /// Asking for a random command
    Distribute,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Submit => "submit",
            ActionClass::Distribute => "distribute",
        }
    }

    /// Message a transport layer can show alongside a throttling response.
    pub fn throttle_message(&self, limit: u64, window: Duration) -> String {
        match self {
            ActionClass::Submit => format!(
                "At most {} submissions per {}s from one address, please try again later",
                limit,
                window.as_secs()
            ),
            ActionClass::Distribute => format!(
                "At most {} requests per {}s from one address, please try again later",
                limit,
                window.as_secs()
            ),
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionClass {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submit" | "upload" => Ok(ActionClass::Submit),
            "distribute" | "get" => Ok(ActionClass::Distribute),
            other => Err(PoolError::Config(format!("unknown action class '{}'", other))),
        }
    }
}

/// One limiter instance per action class.
#[derive(Clone)]
pub struct RateLimits {
    submit: Arc<RateLimiter>,
    distribute: Arc<RateLimiter>,
}

impl RateLimits {
    /// Build both limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            submit: Arc::new(
                RateLimiter::new(ActionClass::Submit, config.submit)
                    .with_reclaim_after(config.reclaim_after_windows),
            ),
            distribute: Arc::new(
                RateLimiter::new(ActionClass::Distribute, config.distribute)
                    .with_reclaim_after(config.reclaim_after_windows),
            ),
        }
    }

    /// Admit or reject one request of class `action` from `origin`.
    pub fn allow(&self, origin: &str, action: ActionClass) -> bool {
        self.limiter(action).allow(origin)
    }

    /// The limiter bounding `action`.
    pub fn limiter(&self, action: ActionClass) -> &Arc<RateLimiter> {
        match action {
            ActionClass::Submit => &self.submit,
            ActionClass::Distribute => &self.distribute,
        }
    }

    /// Start one reclaimer per limiter.
    pub fn spawn_reclaimers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.submit.spawn_reclaimer(cancel.clone()),
            self.distribute.spawn_reclaimer(cancel),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_class_parsing() {
        assert_eq!("submit".parse::<ActionClass>().unwrap(), ActionClass::Submit);
        assert_eq!("upload".parse::<ActionClass>().unwrap(), ActionClass::Submit);
        assert_eq!("get".parse::<ActionClass>().unwrap(), ActionClass::Distribute);
        assert!("delete".parse::<ActionClass>().is_err());
    }

    #[test]
    fn test_throttle_message_mentions_limit() {
        let message = ActionClass::Submit.throttle_message(5, Duration::from_secs(60));
        assert!(message.contains('5'));
        assert!(message.contains("60s"));
    }

    #[tokio::test]
    async fn test_action_classes_are_independent() {
        let limits = RateLimits::new(&LimitsConfig::default());

        for _ in 0..5 {
            assert!(limits.allow("10.0.0.1", ActionClass::Submit));
        }
        assert!(!limits.allow("10.0.0.1", ActionClass::Submit));

        for _ in 0..10 {
            assert!(limits.allow("10.0.0.1", ActionClass::Distribute));
        }
        assert!(!limits.allow("10.0.0.1", ActionClass::Distribute));
    }
}
