//! Configuration system for the Sheetkeep session state manager.
//!
//! Provides TOML-based configuration with:
//! - `[session]`: idle timeout and preview-session naming
//! - `[checkpoint]`: undo history depth and swap directory
//! - `[cluster]`: multi-node residency cap and flush cadence
//! - `[logging]`: tracing filter and optional JSON log directory
//!
//! Config files are layered: the user config directory first, then a
//! project-local `sheetkeep.toml`.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
