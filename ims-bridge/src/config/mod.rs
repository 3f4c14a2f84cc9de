//! Configuration module for ims-bridge
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use ims_bridge::config::{load_config, Config};
//!
//! let config = load_config("/etc/ims-bridge/config.json").unwrap();
//! println!("SIM cards: {}", config.bridge.sim_count);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env,
};
pub use types::{
    BridgeConfig, ChannelConfig, CodecConfig, Config, FlowsConfig, IpcConfig, LogConfig,
    TransportConfig, MAX_POOL_WAIT_MS,
};
