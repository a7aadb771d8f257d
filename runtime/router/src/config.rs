use std::time::Duration;

/// Router timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Bound on delivering one published message to one subscriber
    pub publish_timeout: Duration,
    /// Bound on a service sending its response back to the caller
    pub reply_timeout: Duration,
    /// Deadline applied by `Router::call`
    pub default_call_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_millis(250),
            reply_timeout: Duration::from_millis(500),
            default_call_timeout: Duration::from_secs(5),
        }
    }
}
