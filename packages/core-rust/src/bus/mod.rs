//! Message-bus transport: subject naming, pub/sub fanout, and
//! request/response over private inboxes.

pub mod subject;
pub mod transport;

pub use subject::{private_inbox_prefix, reply_inbox, status_inbox, REGISTRY};
pub use transport::*;
