use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::tools::Tools;

pub const CONFIG_FILE: &str = ".gadget-image.toml";

/// Defaults for `snap`/`tree` builds; the command line wins over these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Size spec text, parsed like `--image-size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Tools>,
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `.gadget-image.toml` from `dir` if there is one.
    pub fn discover(dir: &Path) -> anyhow::Result<Option<(PathBuf, Self)>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let config = Self::load_from_file(&path)?;
        Ok(Some((path, config)))
    }

    pub fn build(&self) -> BuildDefaults {
        self.build.clone().unwrap_or_default()
    }

    /// Configured tools with the environment applied on top.
    pub fn tools(&self) -> Tools {
        self.tools.clone().unwrap_or_default().with_env()
    }

    pub fn generate_config_file(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE);

        if config_path.exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                config_path.display()
            );
        }

        let config_content = Self::generate_full_config()?;
        fs::write(&config_path, config_content)
            .with_context(|| format!("failed to write {}", config_path.display()))?;

        info!("Configuration file generated: {}", config_path.display());
        info!("Please edit this file to customize configuration");
        Ok(config_path)
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            build: Some(BuildDefaults {
                output_dir: Some(PathBuf::from("out")),
                image_size: Some("4G".to_string()),
                channel: Some("stable".to_string()),
            }),
            tools: Some(Tools::default()),
        };
        let toml_content =
            toml::to_string_pretty(&config).context("failed to render configuration")?;
        Ok(format!(
            "# gadget-image configuration file\n\
             # All fields are optional, command line arguments override config file values.\n\
             # {} overrides tools.snap.\n\n{}",
            crate::tools::SNAP_CMD_ENV,
            toml_content
        ))
    }
}
