//! Error taxonomy shared by the registration, invocation, and storage
//! modules.
//!
//! Every variant that reaches a caller is rendered into the `msg` field of a
//! `generic_response`, so the display strings double as wire-visible text.

use xtalhub_core::spec::SpecError;
use xtalhub_core::TransportError;

use crate::storage::StoreError;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("application '{slug}' version '{version}' is not registered")]
    UnknownApplication { slug: String, version: String },
    #[error("application '{slug}' has no command '{command}'")]
    UnknownCommand { slug: String, command: String },
    #[error("no record of calculation '{0}'")]
    UnknownCalculation(String),
    #[error("no calculation with correlation id '{0}'")]
    UnknownCorrelation(String),
    #[error("calculation id '{0}' is already in use")]
    DuplicateCalculation(String),
    #[error("'{slug}' version '{version}' is already registered with a different spec")]
    SpecConflict { slug: String, version: String },
    #[error("invalid application slug '{0}'")]
    InvalidSlug(String),
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    #[error("server is shutting down")]
    Draining,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
