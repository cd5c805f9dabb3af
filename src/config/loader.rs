use crate::config::schema::ServiceConfig;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Environment variables with this prefix override file settings, e.g.
/// `GENQUEUE_MAX_RETRIES=5` or `GENQUEUE_AUTOMATION__ENDPOINT=http://...`.
pub const ENV_PREFIX: &str = "GENQUEUE";

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
        let path = path.as_ref();
        let mut visited = HashSet::new();
        let merged = Self::load_with_inheritance(path, &mut visited)?;
        let config = Self::apply_env_overrides(merged)?;
        config.validate().map_err(Error::Validation)?;
        Ok(config)
    }

    fn load_with_inheritance(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Value> {
        let path = fs::canonicalize(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if visited.contains(&path) {
            return Err(Error::Config(format!(
                "Circular inheritance detected involving {}",
                path.display()
            )));
        }
        visited.insert(path.clone());

        let mut config = Self::load_file(&path)?;

        let parent = match config.get("extends") {
            Some(Value::String(parent)) => Some(parent.clone()),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(Error::Config(format!(
                    "`extends` in {} must be a path, found {}",
                    path.display(),
                    other
                )));
            }
        };

        if let Some(parent_path_str) = parent {
            let parent_path = path
                .parent()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "Cannot determine parent directory for {}",
                        path.display()
                    ))
                })?
                .join(parent_path_str);

            let mut parent_config = Self::load_with_inheritance(&parent_path, visited)?;
            merge_values(&mut parent_config, config);
            config = parent_config;
        }

        if let Value::Object(map) = &mut config {
            map.remove("extends");
        }
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let value: Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported file extension: {}",
                    path.display()
                )));
            }
        };

        match value {
            Value::Object(_) => Ok(value),
            // An empty YAML file parses as null.
            Value::Null => Ok(Value::Object(Default::default())),
            _ => Err(Error::Config(format!(
                "{} must contain a mapping at the top level",
                path.display()
            ))),
        }
    }

    fn apply_env_overrides(file: Value) -> Result<ServiceConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                &file.to_string(),
                config::FileFormat::Json,
            ))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Child values win; objects merge key by key, everything else is replaced.
fn merge_values(parent: &mut Value, child: Value) {
    match (parent, child) {
        (Value::Object(parent), Value::Object(child)) => {
            for (key, value) in child {
                match parent.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        parent.insert(key, value);
                    }
                }
            }
        }
        (parent, child) => *parent = child,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_fill_an_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "empty.yaml", "");
        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.providers.len(), 3);
        assert!(!config.providers[1].enabled);
        assert_eq!(config.governor.cooldowns.quota_exceeded_secs, 3600);
        assert_eq!(config.scheduler.delay_sample_size, 50);
    }

    #[test]
    fn child_overrides_parent_and_merges_nested_tables() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "base.toml",
            r#"
database_path = "base.db"
max_retries = 2

[governor]
default_limit = 12
min_limit = 4
"#,
        );
        let child = write(
            &dir,
            "child.json",
            r#"{
                "extends": "base.toml",
                "max_retries": 5,
                "governor": {"default_limit": 20},
                "batch": {"name": "nightly", "prompts": ["a", "b"], "providers": ["ImageFX"]}
            }"#,
        );

        let config = ConfigLoader::load(&child).unwrap();
        assert_eq!(config.database_path, "base.db");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.governor.default_limit, 20);
        assert_eq!(config.governor.min_limit, 4);
        assert_eq!(config.batch.unwrap().prompts.len(), 2);
        assert!(config.extends.is_none());
    }

    #[test]
    fn circular_inheritance_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.yaml", "extends: b.yaml\n");
        let b = write(&dir, "b.yaml", "extends: a.yaml\n");
        let err = ConfigLoader::load(&b).unwrap_err();
        assert!(err.to_string().contains("Circular inheritance"));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.yaml", "max_retries: 50\nautomation:\n  endpoint: not a url\n");
        assert!(matches!(ConfigLoader::load(&path), Err(Error::Validation(_))));
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.ini", "max_retries=1");
        assert!(matches!(ConfigLoader::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "env.yaml", "selector_cache_ttl_secs: 10\n");
        // Only this test reads the ttl, so parallel tests are unaffected.
        unsafe { std::env::set_var("GENQUEUE_SELECTOR_CACHE_TTL_SECS", "42") };
        let config = ConfigLoader::load(&path);
        unsafe { std::env::remove_var("GENQUEUE_SELECTOR_CACHE_TTL_SECS") };
        assert_eq!(config.unwrap().selector_cache_ttl_secs, 42);
    }
}
