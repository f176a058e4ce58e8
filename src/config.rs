use std::time::Duration;

/// Tunables for batch execution and connection pooling.
///
/// All setters follow the builder style and can be chained:
///
/// ```rust
/// use std::time::Duration;
/// let params = kvbatch::ClientParams::new()
///     .set_retry_attempts(5)
///     .set_response_timeout(Duration::from_secs(1));
/// assert_eq!(params.retry_attempts, 5);
/// ```
#[derive(Clone, Debug)]
pub struct ClientParams {
    /// How many times a slot pipeline is re-attempted after its first try.
    /// Redirects do not count against this budget; timeouts do.
    pub retry_attempts: u32,
    /// Base interval for the per-attempt progress window.
    pub retry_interval: Duration,
    /// The progress window gating connection acquisition plus write is
    /// `retry_interval * retry_window_multiplier`.
    pub retry_window_multiplier: u32,
    /// How long to wait for server replies after a pipeline was flushed.
    pub response_timeout: Duration,
    /// Pause between reconnection probes for a quarantined entry.
    pub reconnect_timeout: Duration,
    /// Consecutive connection failures after which an entry is quarantined.
    pub failed_attempts: usize,
    /// Idle connections opened per entry during warm-up.
    pub min_idle: usize,
    /// Connection slots per entry.
    pub max_connections: usize,
    /// Password for `AUTH` during the reconnection probe, if the endpoints
    /// are password protected.
    pub password: Option<String>,
}

impl ClientParams {
    const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
    const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);
    const DEFAULT_RETRY_WINDOW_MULTIPLIER: u32 = 100;
    const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
    const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    const DEFAULT_FAILED_ATTEMPTS: usize = 3;
    const DEFAULT_MIN_IDLE: usize = 1;
    const DEFAULT_MAX_CONNECTIONS: usize = 10;

    /// Creates a new instance of the options with defaults set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many retries each slot pipeline gets.
    pub fn set_retry_attempts(mut self, attempts: u32) -> ClientParams {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base retry interval. The effective per-attempt window is
    /// this multiplied by [`ClientParams::set_retry_window_multiplier`].
    pub fn set_retry_interval(mut self, interval: Duration) -> ClientParams {
        self.retry_interval = interval;
        self
    }

    /// Sets the retry window multiplier.
    pub fn set_retry_window_multiplier(mut self, multiplier: u32) -> ClientParams {
        self.retry_window_multiplier = multiplier;
        self
    }

    /// Sets the server reply timeout.
    pub fn set_response_timeout(mut self, timeout: Duration) -> ClientParams {
        self.response_timeout = timeout;
        self
    }

    /// Sets the pause between reconnection probes.
    pub fn set_reconnect_timeout(mut self, timeout: Duration) -> ClientParams {
        self.reconnect_timeout = timeout;
        self
    }

    /// Sets the quarantine threshold for consecutive connection failures.
    pub fn set_failed_attempts(mut self, attempts: usize) -> ClientParams {
        self.failed_attempts = attempts;
        self
    }

    /// Sets the number of idle connections kept per entry.
    pub fn set_min_idle(mut self, min_idle: usize) -> ClientParams {
        self.min_idle = min_idle;
        self
    }

    /// Sets the number of connection slots per entry.
    pub fn set_max_connections(mut self, max_connections: usize) -> ClientParams {
        self.max_connections = max_connections;
        self
    }

    /// Sets the password used by the reconnection probe.
    pub fn set_password(mut self, password: impl Into<String>) -> ClientParams {
        self.password = Some(password.into());
        self
    }

    /// The deadline gating pre-response progress of one attempt.
    pub fn retry_window(&self) -> Duration {
        self.retry_interval * self.retry_window_multiplier
    }
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            retry_attempts: Self::DEFAULT_RETRY_ATTEMPTS,
            retry_interval: Self::DEFAULT_RETRY_INTERVAL,
            retry_window_multiplier: Self::DEFAULT_RETRY_WINDOW_MULTIPLIER,
            response_timeout: Self::DEFAULT_RESPONSE_TIMEOUT,
            reconnect_timeout: Self::DEFAULT_RECONNECT_TIMEOUT,
            failed_attempts: Self::DEFAULT_FAILED_ATTEMPTS,
            min_idle: Self::DEFAULT_MIN_IDLE,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            password: None,
        }
    }
}
