//! Sender-binary configuration: just folds the adapter crate's env-config
//! types together so `main` has one thing to load.

use txo_adapters::config::{ConnectionConfig, OutboxEnvConfig};

#[derive(Debug, Clone)]
pub struct SenderEnvConfig {
    pub connection: ConnectionConfig,
    pub outbox: OutboxEnvConfig,
}

impl SenderEnvConfig {
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            outbox: OutboxEnvConfig::from_env(),
        }
    }
}
