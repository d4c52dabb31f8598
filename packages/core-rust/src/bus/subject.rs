//! Subject naming for the bus.
//!
//! One well-known broadcast subject (the registry) plus dynamically named
//! private-inbox subjects. Inbox prefixes are unique per connection; reply
//! and status inboxes hang off a prefix with a purpose-specific label.

use uuid::Uuid;

/// Well-known subject where the registry server listens for registrations,
/// invocation requests, availability announcements, and status reads.
pub const REGISTRY: &str = "xtalhub.registry";

const INBOX_ROOT: &str = "xtalhub.inbox";

/// Builds a unique private inbox prefix for one connection.
///
/// The owner name is informational (it shows up in logs and routing keys);
/// uniqueness comes from the random token.
#[must_use]
pub fn private_inbox_prefix(owner: &str) -> String {
    format!("{INBOX_ROOT}.{owner}.{}", Uuid::new_v4().simple())
}

/// Ephemeral reply subject for one request/response exchange.
#[must_use]
pub fn reply_inbox(prefix: &str, seq: u64) -> String {
    format!("{prefix}.reply.{seq}")
}

/// Status inbox for one calculation, handed to the executing client as its
/// `private_routing_key`.
#[must_use]
pub fn status_inbox(prefix: &str, calculation_id: &str) -> String {
    format!("{prefix}.status.{calculation_id}")
}
