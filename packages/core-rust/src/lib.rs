//! `XtalHub` Core — message schemas, application specs, calculation state
//! machine, and the in-process message bus.

pub mod bus;
pub mod calculation;
pub mod messages;
pub mod spec;

pub use bus::{BusConfig, BusConnection, Delivery, MessageBus, Subscription, TransportError};
pub use calculation::{CalculationStatus, ExecutionDetails, FailureCause};
pub use messages::{BusMessage, MessageError};
pub use spec::{ApplicationSpec, CommandSpec, ParameterSpec, ParameterType, SpecError};
