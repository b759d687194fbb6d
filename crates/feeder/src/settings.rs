use std::path::Path;

use anyhow::Context as _;
use rotoplot_geom::Config;
use serde::{Deserialize, Serialize};

use crate::connection::Timeouts;

/// Everything about the host's setup that can be changed without
/// recompiling, loaded from a JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: Option<String>,
    pub baud: u32,
    pub timeouts: Timeouts,
    /// The default interpolation step, in mm.
    pub step_mm: f64,
    pub geometry: Config,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: None,
            baud: 9600,
            timeouts: Timeouts::default(),
            step_mm: 1.0,
            geometry: Config::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.geometry.calibration.validate()?;
        anyhow::ensure!(
            self.step_mm.is_finite() && self.step_mm > 0.0,
            "step_mm must be positive, not {}",
            self.step_mm
        );
        Ok(())
    }
}
