//! XtalHub client: the wrapper process around one scientific application.
//!
//! A client registers its [`ApplicationSpec`](xtalhub_core::ApplicationSpec)
//! with the registry server, announces itself as available, and then serves
//! dispatches on its private inbox: accept or reject before any work starts,
//! execute the command (an external process bound from the command's call
//! pattern, or an in-process [`CommandHandler`]), and stream status events
//! back on the routing key the dispatch named.
//!
//! [`RegistryClient`] owns the lifecycle; [`CommandRunner`] serves the inbox.

pub mod client;
pub mod command;
pub mod config;
pub mod runner;

pub use client::{ClientError, RegistryClient};
pub use command::{CallPattern, CommandError, CommandHandler, ExecutableCommand, ExecutionOutcome};
pub use config::ClientConfig;
pub use runner::CommandRunner;
