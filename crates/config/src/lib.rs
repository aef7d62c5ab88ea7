//! Configuration loading, validation, and env substitution for courier.
//!
//! Config files: `courier.toml`, `courier.yaml`, or `courier.json`
//! Searched in `./` then `~/.config/courier/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        CourierConfig, DispatchConfig, HealthConfig, ProbeKind, QueueConfig, RecoveryConfig,
        ServerConfig, ServiceProbeConfig, TelegramConfig, TransportConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
