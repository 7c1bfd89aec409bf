//! Locating and layering `sheetkeep.toml` files.
//!
//! Two layers are read, the second overriding the first section by section:
//! 1. the user file, `$SHEETKEEP_CONFIG_DIR/config.toml` or the platform
//!    config dir's `sheetkeep/config.toml`
//! 2. the project file, `sheetkeep.toml` in the project directory

use std::fs;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, SheetkeepConfig};

const PROJECT_CONFIG_FILE: &str = "sheetkeep.toml";
const USER_CONFIG_FILE: &str = "config.toml";
const APP_NAME: &str = "sheetkeep";

/// Overrides the user config directory when set and non-empty.
const CONFIG_DIR_ENV: &str = "SHEETKEEP_CONFIG_DIR";

/// Which layer a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

/// One candidate config file and whether it contributed.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    pub loaded: bool,
}

/// The merged configuration plus how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SheetkeepConfig,
    /// Candidates in merge order, user layer first.
    pub sources: Vec<ConfigSource>,
    /// Layers that failed to read or parse, and validation complaints.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths that actually contributed to `config`.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter_map(|s| s.loaded.then_some(s.path.as_path()))
            .collect()
    }
}

/// Discover and merge the user and project layers.
///
/// `project_dir` defaults to the working directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// As [`load_config`], reading the user layer from `config_dir` when given
/// instead of the environment or platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let user = config_dir
        .map(|dir| dir.join(USER_CONFIG_FILE))
        .or_else(xdg_config_path);
    let project = project_dir.map_or_else(
        || PathBuf::from(PROJECT_CONFIG_FILE),
        |dir| dir.join(PROJECT_CONFIG_FILE),
    );

    let candidates = user
        .map(|path| (ConfigLayer::User, path))
        .into_iter()
        .chain([(ConfigLayer::Project, project)]);

    let mut loaded = LoadedConfig {
        config: SheetkeepConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };
    for (layer, path) in candidates {
        let source = merge_layer(&mut loaded, layer, path);
        loaded.sources.push(source);
    }

    if let Err(e) = loaded.config.validate() {
        loaded.warnings.push(e.to_string());
    }
    Ok(loaded)
}

/// Read one config file, without discovery or merging.
pub fn load_config_file(path: &Path) -> Result<SheetkeepConfig> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    SheetkeepConfig::from_toml(&contents)
}

/// Write `config` to `path`, creating missing parent directories.
pub fn save_config(config: &SheetkeepConfig, path: &Path) -> Result<()> {
    let write_err = |at: &Path| {
        let at = at.display().to_string();
        move |source| ConfigError::WriteFile { path: at, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err(parent))?;
    }
    fs::write(path, config.to_toml()?).map_err(write_err(path))
}

/// Path of the user config file, if a config directory can be resolved.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `$SHEETKEEP_CONFIG_DIR`, else `<platform config dir>/sheetkeep`.
pub fn xdg_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}

fn merge_layer(loaded: &mut LoadedConfig, layer: ConfigLayer, path: PathBuf) -> ConfigSource {
    let merged = path.is_file()
        && match load_config_file(&path) {
            Ok(file) => {
                loaded.config.merge(file);
                true
            }
            Err(e) => {
                loaded
                    .warnings
                    .push(format!("skipped {:?} config {}: {e}", layer, path.display()));
                false
            }
        };
    ConfigSource {
        layer,
        path,
        loaded: merged,
    }
}
