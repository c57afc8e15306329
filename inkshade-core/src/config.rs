use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::error::ViewerError;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Pages kept materialized on each side of the current page.
    pub buffer_pages: usize,
    /// Vertical gap between pages, in screen pixels.
    pub page_spacing: f32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "settle_delay_ms")]
    pub settle_delay: Duration,
    pub bitmap_cache_capacity: usize,
    /// Pointer snap radius for selection, in screen pixels.
    pub nearest_max_distance: f32,
    pub search_chunk_size: usize,
    pub min_zoom_percent: u32,
    pub max_zoom_percent: u32,
    /// Zoom factor that 100% maps to.
    pub base_zoom: f32,
    pub container_width: f32,
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            buffer_pages: 7,
            page_spacing: 30.0,
            settle_delay: Duration::from_millis(150),
            bitmap_cache_capacity: 3,
            nearest_max_distance: 20.0,
            search_chunk_size: 20,
            min_zoom_percent: 20,
            max_zoom_percent: 300,
            base_zoom: 1.5,
            container_width: 1000.0,
            pdfium_library_path: None,
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse viewer config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config file {:?}", path))
    }

    pub fn validate(&self) -> Result<(), ViewerError> {
        if self.min_zoom_percent == 0 || self.min_zoom_percent > self.max_zoom_percent {
            return Err(ViewerError::Config(format!(
                "zoom range {}..{} is empty",
                self.min_zoom_percent, self.max_zoom_percent
            )));
        }
        if !(self.base_zoom.is_finite() && self.base_zoom > 0.0) {
            return Err(ViewerError::Config(format!(
                "base_zoom must be positive, got {}",
                self.base_zoom
            )));
        }
        if self.search_chunk_size == 0 {
            return Err(ViewerError::Config("search_chunk_size must be at least 1".into()));
        }
        if !(self.nearest_max_distance.is_finite() && self.nearest_max_distance >= 0.0) {
            return Err(ViewerError::Config(format!(
                "nearest_max_distance must be finite and not negative, got {}",
                self.nearest_max_distance
            )));
        }
        if self.page_spacing < 0.0 {
            return Err(ViewerError::Config("page_spacing must not be negative".into()));
        }
        Ok(())
    }

    pub fn clamp_zoom_percent(&self, percent: i64) -> u32 {
        percent.clamp(self.min_zoom_percent as i64, self.max_zoom_percent as i64) as u32
    }

    pub fn zoom_for_percent(&self, percent: u32) -> f32 {
        percent as f32 / 100.0 * self.base_zoom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
        assert_eq!(config.settle_delay, Duration::from_millis(150));
    }

    #[test]
    fn partial_file_overrides_selected_keys() {
        let config = ViewerConfig::from_toml_str(
            "buffer_pages = 3\nsettle_delay_ms = 40\npdfium_library_path = \"/opt/pdfium/libpdfium.so\"\n",
        )
        .unwrap();
        assert_eq!(config.buffer_pages, 3);
        assert_eq!(config.settle_delay, Duration::from_millis(40));
        assert_eq!(config.page_spacing, 30.0);
        assert_eq!(
            config.pdfium_library_path.as_deref(),
            Some(Path::new("/opt/pdfium/libpdfium.so"))
        );
    }

    #[test]
    fn rejects_inverted_zoom_range() {
        let err = ViewerConfig::from_toml_str("min_zoom_percent = 400\n").unwrap_err();
        assert!(format!("{err:#}").contains("zoom range"));
    }

    #[test]
    fn zoom_percent_maps_through_base_zoom() {
        let config = ViewerConfig::default();
        assert_eq!(config.clamp_zoom_percent(1000), 300);
        assert_eq!(config.clamp_zoom_percent(-5), 20);
        assert_eq!(config.zoom_for_percent(200), 3.0);
    }

    #[test]
    fn rejects_unbounded_snap_radius() {
        for raw in ["nearest_max_distance = inf\n", "nearest_max_distance = -1.0\n", "nearest_max_distance = nan\n"] {
            let err = ViewerConfig::from_toml_str(raw).unwrap_err();
            assert!(format!("{err:#}").contains("nearest_max_distance"), "{raw}");
        }
    }
}
