//! Configuration loader using figment.
//!
//! Sources are layered, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Profile-specific config file (`ibots.{profile}.toml` / `ibots.{profile}.json`)
//! 3. Main config file (`ibots.toml` / `ibots.json`)
//! 4. Environment variables (`IBOTS_*`)
//! 5. Programmatic overrides
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: TOML files (`ibots.toml`, `config.toml`)
//! - `json-config`: JSON files (`ibots.json`, `config.json`)
//!
//! # Environment Variable Mapping
//!
//! Variables use the `IBOTS_` prefix with `__` as the nesting separator:
//!
//! - `IBOTS_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `IBOTS_GLOBAL__ENDPOINT=api.example.org` → `global.endpoint = "api.example.org"`
//! - `IBOTS_BOTS__HELLO__PASSWORD=xxx` → `bots.hello.password = "xxx"`
//!
//! # Example
//!
//! ```rust,ignore
//! use ibots_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .file("./ibots.toml")
//!     .profile("production")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "toml-config", feature = "json-config"))]
use figment::providers::Format;
#[cfg(feature = "json-config")]
use figment::providers::Json;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::IbotsConfig;

const ENV_PREFIX: &str = "IBOTS_";
const PROFILE_VAR: &str = "IBOTS_PROFILE";

/// Selects the `ibots.{profile}.*` file merged under the main one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// `prod` and `dev` are accepted as short forms; anything else is custom.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            _ => Self::Custom(name.to_string()),
        }
    }

    fn from_env() -> Self {
        std::env::var(PROFILE_VAR)
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds an [`IbotsConfig`] from files, environment and overrides.
pub struct ConfigLoader {
    profile: Profile,
    config_file: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    overrides: Figment,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Profile from `IBOTS_PROFILE`, environment enabled, default search paths.
    pub fn new() -> Self {
        Self {
            profile: Profile::from_env(),
            config_file: None,
            search_paths: Vec::new(),
            load_env: true,
            overrides: Figment::new(),
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Loads exactly this file instead of searching. It must exist.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Adds a directory to search. Once any is added, the defaults
    /// (working directory, then the user config dir) are no longer searched.
    pub fn search_path(mut self, dir: impl AsRef<Path>) -> Self {
        self.search_paths.push(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("ibots")),
            None => self,
        }
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a whole configuration on top of every other source.
    pub fn merge(mut self, config: IbotsConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    /// Sets a single dotted key, e.g. `("global.endpoint", "api.example.org")`.
    pub fn set<V: serde::Serialize>(mut self, key: &str, value: V) -> Self {
        self.overrides = self.overrides.merge(Serialized::default(key, value));
        self
    }

    /// Extracts the layered configuration. Validation is left to the caller.
    pub fn load(self) -> ConfigResult<IbotsConfig> {
        let profile = self.profile.clone();
        let config: IbotsConfig = self
            .build_figment()?
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(
            %profile,
            bots = config.bots.len(),
            resources = config.resources.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(IbotsConfig::default()));

        match self.config_file.take() {
            Some(path) if !path.exists() => return Err(ConfigError::FileNotFound(path)),
            Some(path) => figment = self.merge_with_profile(figment, &path)?,
            None => match self.locate() {
                Some(path) => figment = self.merge_with_profile(figment, &path)?,
                None => warn!(
                    paths = ?self.resolve_search_paths(),
                    "No configuration file found, using defaults"
                ),
            },
        }

        if self.load_env {
            trace!("Merging {ENV_PREFIX}* environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        let overrides = std::mem::take(&mut self.overrides);
        Ok(figment.merge(overrides))
    }

    /// Merges `stem.{profile}.ext` (if present) and then `path` itself.
    fn merge_with_profile(&self, mut figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let stem = path.file_stem().and_then(|s| s.to_str());
        let ext = path.extension().and_then(|e| e.to_str());
        if let (Some(stem), Some(ext)) = (stem, ext) {
            let sibling = path.with_file_name(format!("{stem}.{}.{ext}", self.profile));
            if sibling.exists() {
                debug!(path = %sibling.display(), profile = %self.profile, "Merging profile file");
                figment = merge_file(figment, &sibling)?;
            }
        }

        info!(path = %path.display(), "Loading configuration file");
        merge_file(figment, path)
    }

    /// First existing `ibots.*` / `config.*` file, in search path order.
    fn locate(&self) -> Option<PathBuf> {
        let names = file_names();
        self.resolve_search_paths()
            .iter()
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::config_dir().map(|dir| dir.join("ibots")))
            .collect()
    }
}

/// Config file names for the enabled formats, most specific first.
fn file_names() -> Vec<&'static str> {
    let mut names = Vec::new();
    #[cfg(feature = "toml-config")]
    names.extend(["ibots.toml", "config.toml"]);
    #[cfg(feature = "json-config")]
    names.extend(["ibots.json", "config.json"]);
    names
}

/// Merges one file, picking the provider by extension.
fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "json-config")]
        "json" => Ok(figment.merge(Json::file(path))),
        ext => Err(ConfigError::ParseError(format!(
            "'.{ext}' config files are not supported by the enabled features"
        ))),
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<IbotsConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from `path`, with environment overrides.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<IbotsConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================
