//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use std::path::Path;

const ENV_VAR_PATTERN: &str = r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}`.
    ///
    /// A variable that is unset and has no default keeps its placeholder.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = regex_lite::Regex::new(ENV_VAR_PATTERN)
            .map_err(|e| ConfigError::ValidationError(format!("env pattern: {}", e)))?;

        let mut result = String::with_capacity(content.len());
        let mut last = 0;

        for cap in re.captures_iter(content) {
            let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            result.push_str(&content[last..full.start()]);

            match std::env::var(name.as_str()) {
                Ok(value) => result.push_str(&value),
                Err(_) => match cap.get(2) {
                    Some(default) => result.push_str(default.as_str()),
                    None => result.push_str(full.as_str()),
                },
            }
            last = full.end();
        }

        result.push_str(&content[last..]);
        Ok(result)
    }
}
