use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Smallest number of correspondences the pose solver accepts
pub const MIN_CORRESPONDENCES: usize = 4;

/// Paths and tuning values consumed by the persistence strategy and the
/// correspondence collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_images_path")]
    pub images_path: PathBuf,
    /// Directory holding segmentation images; the images directory if unset
    #[serde(default)]
    pub segmentation_images_path: Option<PathBuf>,
    #[serde(default = "default_segmentation_suffix")]
    pub segmentation_suffix: String,
    #[serde(default = "default_object_models_path")]
    pub object_models_path: PathBuf,
    #[serde(default = "default_poses_file_path")]
    pub poses_file_path: PathBuf,
    #[serde(default = "default_minimum_points")]
    pub minimum_points: usize,
    /// Used when info.json has no nearPlane for an image
    #[serde(default = "default_near_plane")]
    pub near_plane: f64,
    /// Used when info.json has no farPlane for an image
    #[serde(default = "default_far_plane")]
    pub far_plane: f64,
}

// Default value functions
fn default_images_path() -> PathBuf {
    PathBuf::from("images")
}

fn default_segmentation_suffix() -> String {
    "_seg".to_string()
}

fn default_object_models_path() -> PathBuf {
    PathBuf::from("models")
}

fn default_poses_file_path() -> PathBuf {
    PathBuf::from("poses.json")
}

fn default_minimum_points() -> usize {
    MIN_CORRESPONDENCES
}

fn default_near_plane() -> f64 {
    50.0
}

fn default_far_plane() -> f64 {
    2000.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            images_path: default_images_path(),
            segmentation_images_path: None,
            segmentation_suffix: default_segmentation_suffix(),
            object_models_path: default_object_models_path(),
            poses_file_path: default_poses_file_path(),
            minimum_points: default_minimum_points(),
            near_plane: default_near_plane(),
            far_plane: default_far_plane(),
        }
    }
}

impl Settings {
    /// Settings rooted in one dataset directory using the default layout
    pub fn for_dataset(root: &Path) -> Self {
        let defaults = Self::default();
        Self {
            images_path: root.join(defaults.images_path),
            object_models_path: root.join(defaults.object_models_path),
            poses_file_path: root.join(defaults.poses_file_path),
            ..Self::default()
        }
    }

    /// Get the path where the settings file lives by default
    ///
    /// - Linux: ~/.config/pose-editor/settings.toml
    /// - macOS: ~/Library/Application Support/pose-editor/settings.toml
    /// - Windows: %APPDATA%\pose-editor\settings.toml
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| Error::Config("could not determine the user config directory".into()))?;
        path.push("pose-editor");
        path.push("settings.toml");
        Ok(path)
    }

    /// Load settings from a TOML file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a TOML file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("failed to create {}: {e}", parent.display())))?;
        }

        let toml = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize settings: {e}")))?;
        std::fs::write(path, toml)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.minimum_points < MIN_CORRESPONDENCES {
            return Err(Error::Config(format!(
                "minimum_points must be at least {MIN_CORRESPONDENCES}, got {}",
                self.minimum_points
            )));
        }
        if !(self.near_plane > 0.0 && self.far_plane > self.near_plane) {
            return Err(Error::Config(format!(
                "clipping planes must satisfy 0 < near < far, got {} and {}",
                self.near_plane, self.far_plane
            )));
        }
        if self.segmentation_suffix.is_empty() {
            warn!("empty segmentation suffix, segmentation images will not be detected");
        }
        Ok(())
    }
}
