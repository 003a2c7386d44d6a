pub mod cluster;
pub mod constants;
pub mod node;
pub mod pod;
pub mod telemetry;
