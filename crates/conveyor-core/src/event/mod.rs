//! Event distribution for workflow lifecycle events.
//!
//! - `bus` -- Broadcast channel of `WorkflowEvent` plus a listener that feeds it

pub mod bus;

pub use bus::{EventBus, EventBusListener};
