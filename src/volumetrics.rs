use crate::enums::Label;

use ndarray::ArrayView3;
use serde::Serialize;
use std::path::PathBuf;

/// Physical tissue volumes derived from a class map.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VolumetricResult {
    pub liver_volume_cm3: f64,
    pub tumor_volume_cm3: f64,
    pub tumor_percentage: f64,
    pub mask_path: Option<PathBuf>,
    /// Volume file that was actually segmented, the canonical copy when
    /// normalization succeeded.
    pub processed_path: Option<PathBuf>,
}

impl VolumetricResult {
    /// Count liver and tumor labels and scale them by the voxel volume of a
    /// grid with `spacing` (mm).
    pub fn from_class_map(labels: ArrayView3<'_, u8>, spacing: [f64; 3]) -> Self {
        let (liver, tumor) = labels.fold((0usize, 0usize), |(liver, tumor), &label| {
            match Label::try_from(label) {
                Ok(Label::Liver) => (liver + 1, tumor),
                Ok(Label::Tumor) => (liver, tumor + 1),
                _ => (liver, tumor),
            }
        });
        Self::from_counts(liver, tumor, spacing)
    }

    pub fn from_counts(liver_voxels: usize, tumor_voxels: usize, spacing: [f64; 3]) -> Self {
        let voxel_volume = voxel_volume_cm3(spacing);
        let liver_volume_cm3 = liver_voxels as f64 * voxel_volume;
        let tumor_volume_cm3 = tumor_voxels as f64 * voxel_volume;
        let total = liver_volume_cm3 + tumor_volume_cm3;
        let tumor_percentage = if total > 0.0 {
            100.0 * tumor_volume_cm3 / total
        } else {
            0.0
        };
        Self {
            liver_volume_cm3,
            tumor_volume_cm3,
            tumor_percentage,
            mask_path: None,
            processed_path: None,
        }
    }

    /// All-zero result reported for failed requests.
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// Values rounded to two decimals for external reporting.
    pub fn rounded(&self) -> Self {
        Self {
            liver_volume_cm3: round2(self.liver_volume_cm3),
            tumor_volume_cm3: round2(self.tumor_volume_cm3),
            tumor_percentage: round2(self.tumor_percentage),
            mask_path: self.mask_path.clone(),
            processed_path: self.processed_path.clone(),
        }
    }

    pub fn with_mask_path(mut self, mask_path: Option<PathBuf>) -> Self {
        self.mask_path = mask_path;
        self
    }

    pub fn with_processed_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.processed_path = Some(path.into());
        self
    }
}

/// mm³ to cm³
pub fn voxel_volume_cm3(spacing: [f64; 3]) -> f64 {
    spacing.iter().product::<f64>() / 1000.0
}

/// Two decimals of the stored value: 0.045 is held as 0.04499... and
/// becomes 0.04.
fn round2(value: f64) -> f64 {
    format!("{value:.2}").parse().unwrap_or(value)
}
