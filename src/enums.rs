use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Sampling used when a volume is moved onto a new voxel grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    /// Trilinear, used for intensities.
    #[default]
    Linear,
    /// Nearest neighbour, used for label maps.
    Nearest,
}

/// Execution device for the segmentation network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Accelerator when one registers, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Numeric type of the tensors handed to the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
}

/// Tissue classes produced by the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Label {
    Background = 0,
    Liver = 1,
    Tumor = 2,
}

impl TryFrom<u8> for Label {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Background),
            1 => Ok(Label::Liver),
            2 => Ok(Label::Tumor),
            other => Err(other),
        }
    }
}
