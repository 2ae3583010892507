pub mod driver;
pub mod telemetry;
