//! Registry server configuration.

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for the registry server.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Human-readable name used in the server's inbox subjects and logs.
    pub server_name: String,
    /// Dispatch and retry behavior.
    pub dispatch: DispatchConfig,
    /// Client liveness probing.
    pub health: HealthConfig,
    /// Terminal-record retention.
    pub retention: RetentionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server_name: "registry".to_string(),
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Behavior when no matching client is available at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Fail the calculation immediately.
    FailFast,
    /// Hold the dispatch and re-match as availability changes, up to the
    /// given wait budget per attempt.
    Queue { max_wait_ms: u64 },
}

/// Controls how a calculation is offered to clients.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum time to wait for a contacted client to accept or decline
    /// one dispatch, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Total dispatch attempts before the calculation fails.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds. The actual delay grows
    /// linearly with the attempt number plus a random jitter.
    pub backoff_ms: u64,
    /// What to do when no candidate client exists.
    pub match_policy: MatchPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_ms: 250,
            match_policy: MatchPolicy::FailFast,
        }
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

/// Controls periodic client liveness probing.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe rounds in milliseconds.
    pub probe_interval_ms: u64,
    /// Per-probe response deadline in milliseconds.
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a client is declared lost.
    pub max_missed_probes: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1_000,
            probe_timeout_ms: 500,
            max_missed_probes: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

/// Controls how long finished calculations stay queryable.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Minimum time a terminal record remains before it may be swept, in
    /// milliseconds.
    pub terminal_retention_ms: u64,
    /// Interval between sweep passes in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            terminal_retention_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}
