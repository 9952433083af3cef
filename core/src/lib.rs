pub mod drain;
pub mod reload;
pub mod signal;
pub mod telemetry;
