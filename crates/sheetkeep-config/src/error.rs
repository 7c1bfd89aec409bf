//! Errors raised while reading, writing or checking `sheetkeep.toml`.

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot write '{path}': {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode config as TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A setting parsed but is outside what the runtime accepts.
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}
