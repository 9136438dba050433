//! Configuration loader with multi-source merging

use crate::{CohortConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "COHORT".to_string(),
            include_user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "COHORT")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/cohort/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence, then
    /// validate it
    pub fn load(self) -> Result<CohortConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = CohortConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/cohort/config.toml)
        if self.include_user_config {
            let paths = Paths::new();
            if let Ok(user_config_file) = paths.user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. Project config (cohort.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local config (cohort.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (COHORT_NODE__PORT, COHORT_GROUP__MEMBERS=a,b)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("group.members")
                .try_parsing(true),
        );

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let cohort_config: CohortConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cohort_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(cohort_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        // A prefix no real environment sets keeps these tests hermetic.
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("COHORT_TEST_UNSET")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.node.port, 7400);
        assert!(config.group.members.is_empty());
        assert!(config.transport.nodelay);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[node]
address = "127.0.0.1"
port = 7401
incarnation = 2

[group]
members = ["127.0.0.1:7400:0", "127.0.0.1:7401:2"]

[fifo]
max_buffered_per_source = 128

[causal]
max_outstanding = 16
"#;
        fs::write(project_dir.join("cohort.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.node.port, 7401);
        assert_eq!(config.node.incarnation, 2);
        assert_eq!(config.initial_members().unwrap().len(), 2);
        assert_eq!(config.fifo.max_buffered_per_source, Some(128));
        assert_eq!(config.causal.max_outstanding, 16);
        // Untouched keys keep their defaults.
        assert_eq!(config.causal.early_ack_capacity, 4096);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("cohort.toml"),
            r#"
[runtime]
poll_interval_ms = 250
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("cohort.local.toml"),
            r#"
[runtime]
poll_interval_ms = 5
"#,
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        // Local config should override project config
        assert_eq!(config.runtime.poll_interval_ms, 5);
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("cohort.toml"),
            r#"
[group]
members = ["127.0.0.1:9999:0"]
"#,
        )
        .expect("Failed to write config");

        let err = loader(project_dir).load().unwrap_err();
        assert!(format!("{err:#}").contains("must include the local process"));
    }

    // Environment variables are not exercised here: the config crate reads
    // the process environment, which is shared by parallel tests. In use:
    //
    // COHORT_NODE__PORT=7401
    // COHORT_NODE__INCARNATION=3
    // COHORT_GROUP__MEMBERS=127.0.0.1:7400:0,127.0.0.1:7401:3
}
