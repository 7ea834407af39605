//! Process wiring: stop signal, startup checks and the service entry point.

pub mod shutdown;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{run_service, validate_startup};
