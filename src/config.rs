//! Project configuration surface.
//!
//! Configuration lives in an INI file, `.quarry.conf`, read from the
//! project root. Only the `DEFAULT` section is consulted. The file is a
//! flat key→value bag; this module maps the known keys to typed accessors
//! and distinguishes "absent" (`None`) from "present but empty".
//!
//! # Recognised keys
//!
//! | Key | Effect |
//! |-----|--------|
//! | `test_command` | Required worker command template (`$IDOPTION`, `$IDLIST`, `$LISTOPT`, `$PROFILE`) |
//! | `test_id_option` | Substituted into `$IDOPTION` when ids are supplied; may use `$IDFILE` |
//! | `test_id_list_default` | Default `$IDLIST` value when no ids are known |
//! | `test_list_option` | Substituted into `$LISTOPT` during enumeration |
//! | `test_run_concurrency` | Callout printing the worker count |
//! | `instance_provision` | Callout printing whitespace-separated instance ids (`$INSTANCE_COUNT`, `$PROFILE`) |
//! | `instance_execute` | Wrapper template (`$INSTANCE_ID`, `$COMMAND`, `$FILES`, `$PROFILE`) |
//! | `instance_dispose` | Callout accepting `$INSTANCE_IDS` |
//! | `list_profiles` | Callout printing available profile names |
//! | `default_profiles` | Callout printing the profiles used by default runs |
//! | `group_regex` | Anchored regex whose match prefix groups tests onto one worker |
//! | `filter_tags` | Tags excluded from success counts |
//!
//! Unknown keys are ignored.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use configparser::ini::Ini;

/// Name of the configuration file, looked up in the project root.
pub const CONFIG_FILE: &str = ".quarry.conf";

/// Sentinel profile used when no profile list is configured.
pub const DEFAULT_PROFILE: &str = "DEFAULT";

/// Errors loading or querying the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no {CONFIG_FILE} config file in {0}")]
    Missing(PathBuf),

    #[error("could not parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("no {0} option present in {CONFIG_FILE}")]
    MissingKey(&'static str),
}

/// The parsed `DEFAULT` section of `.quarry.conf`.
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    values: HashMap<String, String>,
}

impl TestConfig {
    /// Loads `.quarry.conf` from `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Err(ConfigError::Missing(root.to_path_buf()));
        }
        let mut ini = Ini::new();
        let map = ini.load(&path).map_err(|message| ConfigError::Parse {
            path: path.clone(),
            message,
        })?;
        Ok(Self::from_map(map))
    }

    /// Parses configuration from a string. Used by tests and embedders that
    /// already hold the file contents.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        let map = ini
            .read(text.to_string())
            .map_err(|message| ConfigError::Parse {
                path: PathBuf::from(CONFIG_FILE),
                message,
            })?;
        Ok(Self::from_map(map))
    }

    fn from_map(map: HashMap<String, HashMap<String, Option<String>>>) -> Self {
        // configparser lowercases section names, so `[DEFAULT]` arrives as
        // `default`.
        let values = map
            .get("default")
            .map(|section| {
                section
                    .iter()
                    .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        TestConfig { values }
    }

    /// Raw access to a key in the `DEFAULT` section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The worker command template. The one required key.
    pub fn test_command(&self) -> Result<&str, ConfigError> {
        self.get("test_command")
            .ok_or(ConfigError::MissingKey("test_command"))
    }

    pub fn test_id_option(&self) -> Option<&str> {
        self.get("test_id_option")
    }

    pub fn test_id_list_default(&self) -> Option<&str> {
        self.get("test_id_list_default")
    }

    pub fn test_list_option(&self) -> Option<&str> {
        self.get("test_list_option")
    }

    pub fn test_run_concurrency(&self) -> Option<&str> {
        self.get("test_run_concurrency")
    }

    pub fn instance_provision(&self) -> Option<&str> {
        self.get("instance_provision")
    }

    pub fn instance_execute(&self) -> Option<&str> {
        self.get("instance_execute")
    }

    pub fn instance_dispose(&self) -> Option<&str> {
        self.get("instance_dispose")
    }

    pub fn list_profiles(&self) -> Option<&str> {
        self.get("list_profiles")
    }

    pub fn default_profiles(&self) -> Option<&str> {
        self.get("default_profiles")
    }

    pub fn group_regex(&self) -> Option<&str> {
        self.get("group_regex")
    }

    /// Tags stripped from success counts (still counted for failures).
    pub fn filter_tags(&self) -> BTreeSet<String> {
        self.get("filter_tags")
            .map(|tags| tags.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}
