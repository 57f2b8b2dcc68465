//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod telemetry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
