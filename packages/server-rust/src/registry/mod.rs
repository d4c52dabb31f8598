//! Registry-side protocol surface: application registration, the client
//! availability pool, liveness probing, and the server that ties them to
//! the bus.

pub mod availability;
pub mod health;
pub mod registration;
pub mod server;

pub use availability::{
    AvailabilityEvent, AvailabilityState, ClientAvailabilityTracker, ClientHandle,
};
pub use health::{ClientHealthMonitor, HealthTask};
pub use registration::RegistrationService;
pub use server::RegistryServer;
