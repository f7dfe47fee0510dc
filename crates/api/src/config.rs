//! Application configuration

use std::env;

use crate::chat::DeliveryPolicy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // Redis (presence flags + offline queues)
    pub redis_url: String,

    // Delivery
    /// Live-vs-queue branching for inbound messages.
    pub delivery_policy: DeliveryPolicy,

    // Presence
    /// Backstop TTL on presence keys so counts leaked by a crashed
    /// instance eventually expire. Refreshed on every connect.
    pub presence_ttl_seconds: u64,

    // HTTP surface
    pub enable_cors: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            // Redis
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            // Delivery
            delivery_policy: match env::var("DELIVERY_POLICY") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidDeliveryPolicy)?,
                Err(_) => DeliveryPolicy::SenderPresence,
            },

            // Presence
            presence_ttl_seconds: env::var("PRESENCE_TTL_SECONDS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .unwrap_or(86400),

            // HTTP surface
            enable_cors: env::var("ENABLE_CORS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("DELIVERY_POLICY must be 'sender' or 'recipient'")]
    InvalidDeliveryPolicy,
}
