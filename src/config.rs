//! Layered configuration lookup.
//!
//! Resolution order for every key:
//! 1. [`Overrides`] (process-wide registry, always wins)
//! 2. The TOML resource, if it defines the key
//! 3. The caller-supplied default
//!
//! Loading never fails. A missing or malformed resource is logged and the
//! file layer is left empty, so lookups fall through to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Well-known configuration keys.
pub mod keys {
    /// Driver identifier (`sqlite` or `postgres`).
    pub const DRIVER: &str = "driver";
    /// Connection URL.
    pub const URL: &str = "url";
    /// Username for server engines.
    pub const USERNAME: &str = "username";
    /// Password for server engines.
    pub const PASSWORD: &str = "password";
    /// Extra driver search path.
    pub const DRIVER_PATH: &str = "driver_path";
}

/// Prefix for environment variable overrides (`CISTERN_URL` overrides `url`).
pub const ENV_PREFIX: &str = "CISTERN_";

/// Process-wide override registry.
///
/// Built once at process start and handed to [`Config`]. Keys are the same
/// names used in the resource file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    values: BTreeMap<String, String>,
}

impl Overrides {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect overrides from `CISTERN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Collect overrides from `(name, value)` pairs shaped like environment
    /// variables. Names without the [`ENV_PREFIX`] are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = vars
            .into_iter()
            .filter_map(|(name, value)| {
                let key = name.as_ref().strip_prefix(ENV_PREFIX)?;
                if key.is_empty() {
                    return None;
                }
                Some((key.to_ascii_lowercase(), value.into()))
            })
            .collect();
        Self { values }
    }

    /// Set a single override.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Layer `other` on top of this registry; `other` wins on conflicts.
    pub fn merge(mut self, other: Overrides) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Look up an override.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Immutable key/value configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    file: BTreeMap<String, String>,
    overrides: Overrides,
}

impl Config {
    /// Build a configuration from overrides alone.
    pub fn with_overrides(overrides: Overrides) -> Self {
        Self {
            file: BTreeMap::new(),
            overrides,
        }
    }

    /// Load the TOML resource at `path` (if any) beneath `overrides`.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Self {
        let Some(path) = path else {
            return Self::with_overrides(overrides);
        };

        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents, overrides, &path.display().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Configuration resource not found, using defaults");
                Self::with_overrides(overrides)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read configuration resource, using defaults");
                Self::with_overrides(overrides)
            }
        }
    }

    /// Build a configuration from an in-memory TOML resource.
    pub fn from_toml_str(contents: &str, overrides: Overrides) -> Self {
        Self::parse(contents, overrides, "<memory>")
    }

    fn parse(contents: &str, overrides: Overrides, source: &str) -> Self {
        let file = match contents.parse::<toml::Table>() {
            Ok(table) => {
                let mut file = BTreeMap::new();
                flatten("", table, &mut file);
                tracing::debug!(source, keys = file.len(), "Loaded configuration resource");
                file
            }
            Err(e) => {
                tracing::warn!(source, error = %e, "Malformed configuration resource, using defaults");
                BTreeMap::new()
            }
        };
        Self { file, overrides }
    }

    /// Resolve `key`, falling back to `default`.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.get_opt(key).unwrap_or_else(|| default.to_string())
    }

    /// Resolve `key` without a default.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .or_else(|| self.file.get(key).map(String::as_str))
            .map(str::to_string)
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }
}

/// Flatten nested tables into dotted keys, stringifying scalars.
fn flatten(prefix: &str, table: toml::Table, out: &mut BTreeMap<String, String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::String(s) => {
                out.insert(key, s);
            }
            toml::Value::Integer(i) => {
                out.insert(key, i.to_string());
            }
            toml::Value::Float(f) => {
                out.insert(key, f.to_string());
            }
            toml::Value::Boolean(b) => {
                out.insert(key, b.to_string());
            }
            toml::Value::Table(nested) => flatten(&key, nested, out),
            other => {
                tracing::debug!(key = %key, kind = other.type_str(), "Skipping non-scalar configuration value");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_override_wins_over_file() {
        let mut overrides = Overrides::new();
        overrides.set(keys::URL, "sqlite::memory:");
        let config = Config::from_toml_str(r#"url = "sqlite:/tmp/file.db""#, overrides);

        assert_eq!(config.get(keys::URL, "fallback"), "sqlite::memory:");
    }

    #[test]
    fn test_file_wins_over_default() {
        let config = Config::from_toml_str(r#"driver = "postgres""#, Overrides::new());
        assert_eq!(config.get(keys::DRIVER, "sqlite"), "postgres");
    }

    #[test]
    fn test_absent_key_returns_default() {
        let config = Config::from_toml_str("", Overrides::new());
        assert_eq!(config.get(keys::USERNAME, "nobody"), "nobody");
        assert_eq!(config.get_opt(keys::USERNAME), None);
    }

    #[test]
    fn test_malformed_resource_falls_back_to_defaults() {
        let config = Config::from_toml_str("driver = = [", Overrides::new());
        assert_eq!(config.get(keys::DRIVER, "sqlite"), "sqlite");
    }

    #[test]
    fn test_missing_resource_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(Some(&temp_dir.path().join("absent.toml")), Overrides::new());
        assert_eq!(config.get(keys::URL, "default"), "default");
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cistern.toml");
        fs::write(&path, "driver = \"sqlite\"\nurl = \"sqlite::memory:\"\n").unwrap();

        let config = Config::load(Some(&path), Overrides::new());
        assert_eq!(config.get(keys::URL, ""), "sqlite::memory:");
    }

    #[test]
    fn test_nested_tables_flatten_to_dotted_keys() {
        let config = Config::from_toml_str(
            "[pool]\ncapacity = 4\nverbose = true\ntags = [\"a\"]\n",
            Overrides::new(),
        );
        assert_eq!(config.get("pool.capacity", ""), "4");
        assert_eq!(config.get("pool.verbose", ""), "true");
        assert_eq!(config.get_opt("pool.tags"), None);
    }

    #[test]
    fn test_overrides_from_env_style_vars() {
        let overrides = Overrides::from_vars([
            ("CISTERN_DRIVER_PATH", "/opt/drivers"),
            ("CISTERN_", "ignored"),
            ("HOME", "/root"),
        ]);
        assert_eq!(overrides.get(keys::DRIVER_PATH), Some("/opt/drivers"));
        assert_eq!(overrides.get("home"), None);
    }

    #[test]
    fn test_merge_prefers_later_layer() {
        let env = Overrides::from_vars([("CISTERN_URL", "from-env")]);
        let mut cli = Overrides::new();
        cli.set(keys::URL, "from-cli");

        let merged = env.merge(cli);
        assert_eq!(merged.get(keys::URL), Some("from-cli"));
    }
}
