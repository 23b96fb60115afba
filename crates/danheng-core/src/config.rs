//! Loading the rule set from `config.json`.
//!
//! On first run the config file is created by copying the template next to
//! it. The file is read once; there is no reload.

use std::fs;
use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::rules::RuleSet;

/// Default runtime config path.
pub const CONFIG_PATH: &str = "config.json";

/// Default template path.
pub const CONFIG_TEMPLATE_PATH: &str = "config.tmpl.json";

/// Creates `config_path` from `template_path` if it does not exist yet.
///
/// Returns true when the file was created.
pub fn ensure_config(config_path: &Path, template_path: &Path) -> Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }
    if !template_path.exists() {
        return Err(ConfigError::MissingTemplate(template_path.to_path_buf()));
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::copy(template_path, config_path).map_err(|source| ConfigError::Io {
        path: config_path.to_path_buf(),
        source,
    })?;

    tracing::info!("Created config file {:?} from template", config_path);
    Ok(true)
}

/// Parses and validates a rule set from JSON text.
pub fn parse_rules(json: &str, path: &Path) -> Result<RuleSet> {
    let rules: RuleSet = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    rules.validate()?;
    Ok(rules)
}

/// Reads and validates the rule set at `path`.
pub fn load_rules(path: &Path) -> Result<RuleSet> {
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = parse_rules(&json, path)?;

    tracing::debug!(
        "Loaded {} redirect, {} ignore, {} force-redirect and {} block rules from {:?}",
        rules.redirect_domains().len(),
        rules.always_ignore_domains().len(),
        rules.force_redirect_on_url_contains().len(),
        rules.block_urls().len(),
        path
    );

    Ok(rules)
}

/// Ensures the config file exists, then loads it.
pub fn load_or_init(config_path: &Path, template_path: &Path) -> Result<RuleSet> {
    ensure_config(config_path, template_path)?;
    load_rules(config_path)
}
