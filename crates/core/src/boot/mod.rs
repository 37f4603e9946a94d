pub mod health_gate;

pub use health_gate::{GateRecord, GateStatus, HealthGate, HealthGateError};
