//! Client configuration.

use uuid::Uuid;

/// Configuration for one wrapper client process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identifier this client announces itself under. Defaults to a fresh
    /// random id; embedders set a stable one to keep identity across
    /// restarts.
    pub client_id: String,
    /// Deadline for the registration request at startup, in milliseconds.
    pub registration_timeout_ms: u64,
    /// Cap on captured child stdout/stderr, in bytes per stream. Output
    /// beyond the cap is drained but not retained.
    pub max_captured_output_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: format!("client-{}", Uuid::new_v4().simple()),
            registration_timeout_ms: 10_000,
            max_captured_output_bytes: 1_048_576,
        }
    }
}

impl ClientConfig {
    /// Config with an explicit client id and default everything else.
    #[must_use]
    pub fn named(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}
