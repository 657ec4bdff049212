//! Imaging modality tag carried by every sample and batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Imaging modality of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Computed tomography.
    Ct,
    /// Magnetic resonance.
    Mr,
}

impl Modality {
    /// Both modalities, CT first.
    pub const ALL: [Modality; 2] = [Modality::Ct, Modality::Mr];

    /// Position of this modality in a `(ct, mr)` pair.
    pub fn index(self) -> usize {
        match self {
            Modality::Ct => 0,
            Modality::Mr => 1,
        }
    }

    /// Binary domain label used by the adversarial loss: CT is 1, MR is 0.
    pub fn domain_label(self) -> f32 {
        match self {
            Modality::Ct => 1.0,
            Modality::Mr => 0.0,
        }
    }

    /// Lowercase identifier, as used in directory names and config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Ct => "ct",
            Modality::Mr => "mr",
        }
    }

    /// Upper-case suffix used in metric tags (`val/dice:CT`).
    pub fn tag_suffix(self) -> &'static str {
        match self {
            Modality::Ct => "CT",
            Modality::Mr => "MR",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ct" => Ok(Modality::Ct),
            "mr" | "mri" => Ok(Modality::Mr),
            other => Err(ConfigError::invalid_value(
                "modality",
                format!("unknown modality `{other}` (expected ct or mr)"),
            )),
        }
    }
}
