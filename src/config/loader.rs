use std::path::Path;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Load configuration from a TOML file, or defaults when `path` is `None`.
///
/// The result is validated before it is returned.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            parse_config(&text)?
        }
        None => AppConfig::default(),
    };

    config.validate()?;
    Ok(config)
}

/// Parse a TOML document into an [`AppConfig`]. Missing keys take defaults.
pub fn parse_config(text: &str) -> Result<AppConfig> {
    toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid config: {}", e)))
}
