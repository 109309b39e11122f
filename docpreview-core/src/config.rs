use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{RenderMode, ViewerProps, ZoomFactor, ZoomFit};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Viewer defaults and logging settings read from `config.toml`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub render_mode: RenderMode,
    #[serde_as(as = "DisplayFromStr")]
    pub zoom: ZoomFactor,
    pub zoom_fit: ZoomFit,
    pub selectable: bool,
    pub log_filter: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            render_mode: RenderMode::default(),
            zoom: ZoomFactor::default(),
            zoom_fit: ZoomFit::default(),
            selectable: true,
            log_filter: "info".to_owned(),
        }
    }
}

impl PreviewConfig {
    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    /// Reads the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Initial declarative inputs before any caller overrides.
    pub fn viewer_props(&self) -> ViewerProps {
        ViewerProps {
            render_mode: self.render_mode,
            zoom: self.zoom.clone(),
            zoom_fit: self.zoom_fit,
            selectable: self.selectable,
            ..ViewerProps::default()
        }
    }
}
