// src/path_tracing/config.rs
// Integrator configuration and device scene readouts
// Loaded from JSON or built in code; validate() runs before any device allocation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{RenderError, RenderResult};

/// How film results reach the display
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayUpdateMode {
    /// Ask the device once whether interop is usable
    #[default]
    Auto,
    /// Convert straight into the mapped display buffer
    Interop,
    /// Convert into a scratch buffer, read back and upload
    #[serde(alias = "readback")]
    Naive,
}

impl FromStr for DisplayUpdateMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = normalize_key(value);
        Ok(match key.as_str() {
            "auto" | "default" => Self::Auto,
            "interop" | "graphicsinterop" => Self::Interop,
            "naive" | "readback" | "copy" => Self::Naive,
            _ => return Err("unknown display update mode"),
        })
    }
}

impl fmt::Display for DisplayUpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Interop => "interop",
            Self::Naive => "naive",
        })
    }
}

fn normalize_key(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.'))
        .collect()
}

/// Knobs of the wavefront integrator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Upper bound on path states, on top of what the device reports
    pub max_num_paths: Option<usize>,
    /// Tile scheduler plans for `capacity / tile_state_divisor` states per tile
    pub tile_state_divisor: usize,
    /// Bucket material shading dispatches by shader
    pub use_shader_sorting: bool,
    pub display_update: DisplayUpdateMode,
    pub adaptive_threshold: f32,
    /// Samples taken before the first convergence check
    pub adaptive_min_samples: u32,
    pub exposure: f32,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_num_paths: None,
            tile_state_divisor: 8,
            use_shader_sorting: true,
            display_update: DisplayUpdateMode::Auto,
            adaptive_threshold: 0.01,
            adaptive_min_samples: 4,
            exposure: 1.0,
        }
    }
}

impl IntegratorConfig {
    pub fn from_json(text: &str) -> RenderResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> RenderResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> RenderResult<()> {
        if self.tile_state_divisor == 0 {
            return Err(RenderError::config(
                "tile_state_divisor must be greater than zero",
            ));
        }
        if self.max_num_paths == Some(0) {
            return Err(RenderError::config(
                "max_num_paths must be greater than zero when set",
            ));
        }
        if !self.adaptive_threshold.is_finite() || self.adaptive_threshold < 0.0 {
            return Err(RenderError::config(format!(
                "adaptive_threshold must be finite and non-negative, got {}",
                self.adaptive_threshold
            )));
        }
        if !self.exposure.is_finite() || self.exposure <= 0.0 {
            return Err(RenderError::config(format!(
                "exposure must be finite and positive, got {}",
                self.exposure
            )));
        }
        Ok(())
    }
}

/// What the integrator needs to know about the loaded scene
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneInfo {
    /// Number of shaders, sizing the shading sort buckets
    pub max_shaders: usize,
    pub has_shadow_catcher: bool,
    /// Paths start from a bake surface instead of the camera
    pub bake_mode: bool,
}

impl Default for SceneInfo {
    fn default() -> Self {
        Self {
            max_shaders: 1,
            has_shadow_catcher: false,
            bake_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mode_parses_variations() {
        assert_eq!("AUTO".parse::<DisplayUpdateMode>(), Ok(DisplayUpdateMode::Auto));
        assert_eq!(
            "graphics-interop".parse::<DisplayUpdateMode>(),
            Ok(DisplayUpdateMode::Interop)
        );
        assert_eq!(" read_back ".parse::<DisplayUpdateMode>(), Ok(DisplayUpdateMode::Naive));
        assert!("gl".parse::<DisplayUpdateMode>().is_err());
    }

    #[test]
    fn json_fills_defaults_and_validates() {
        let config =
            IntegratorConfig::from_json(r#"{"max_num_paths": 4096, "display_update": "naive"}"#)
                .unwrap();
        assert_eq!(config.max_num_paths, Some(4096));
        assert_eq!(config.display_update, DisplayUpdateMode::Naive);
        assert_eq!(config.tile_state_divisor, 8);
        assert!(config.use_shader_sorting);

        let err = IntegratorConfig::from_json(r#"{"tile_state_divisor": 0}"#).unwrap_err();
        assert_eq!(err.category(), "Config");
        assert!(IntegratorConfig::from_json(r#"{"adaptive_threshold": -1.0}"#).is_err());
        assert!(IntegratorConfig::from_json("{not json").is_err());
    }
}
