use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};
use tracing::debug;

use crate::{ArgError, ConfigError, ImageRef, PortMapping};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// The flat JSON configuration file. Every key is optional so that a partial
/// file still loads, the getters report the missing key when it is needed.
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry prefix for base images, e.g. "docker.io/library"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_mapping: Option<String>,
}

impl Config {
    /// Loads the file at `path`. A missing file is `ConfigError::Missing`, it
    /// is never created here.
    pub async fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_owned()))
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        debug!("loaded configuration from {path:?}");
        Ok(config)
    }

    /// Writes `self` as pretty printed JSON, replacing the file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut contents = serde_json::to_string_pretty(self).stack()?;
        contents.push('\n');
        tokio::fs::write(path, contents)
            .await
            .stack_err_with(|| format!("Config::save(path: {path:?})"))?;
        Ok(())
    }

    /// The image from `image_name` and `tag_name` unless overridden
    pub fn image(
        &self,
        name: Option<&str>,
        tag: Option<&str>,
    ) -> std::result::Result<ImageRef, ArgError> {
        let name = name
            .or(self.image_name.as_deref())
            .ok_or(ArgError::Empty("image name"))?;
        let tag = tag.or(self.tag_name.as_deref()).unwrap_or("latest");
        ImageRef::new(name, tag)
    }

    pub fn container(&self, container: Option<&str>) -> std::result::Result<String, ArgError> {
        container
            .or(self.container_name.as_deref())
            .map(str::to_owned)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ArgError::Empty("container name"))
    }

    /// Port mappings are optional for running a container
    pub fn ports(
        &self,
        ports: Option<&str>,
    ) -> std::result::Result<Option<PortMapping>, ArgError> {
        ports
            .or(self.port_mapping.as_deref())
            .map(str::parse)
            .transpose()
    }
}

/// Where to look for the configuration file when none was given
pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}
