//! Per-scan record handed to the host.

use crate::pipeline::InferenceOutcome;

use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    Processed,
    Error,
    #[serde(rename = "No Model")]
    NoModel,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanReport {
    pub patient_id: String,
    pub filename: String,
    pub status: ScanStatus,
    pub liver_volume_cm3: f64,
    pub tumor_volume_cm3: f64,
    pub tumor_percentage: f64,
    pub procedure: String,
    pub source_path: PathBuf,
    pub mask_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanReport {
    /// Build the record for `source` from a finished request. Volumes are
    /// rounded to two decimals. `source_path` is the file that was segmented,
    /// so that it overlays the mask.
    pub fn from_outcome(source: &Path, outcome: &InferenceOutcome) -> Self {
        let result = outcome.result().rounded();
        let (status, procedure) = if outcome.is_success() {
            (
                ScanStatus::Processed,
                recommended_procedure(result.tumor_percentage),
            )
        } else {
            (ScanStatus::Error, "AI Failed")
        };
        Self {
            patient_id: patient_id(source),
            filename: file_name(source),
            status,
            liver_volume_cm3: result.liver_volume_cm3,
            tumor_volume_cm3: result.tumor_volume_cm3,
            tumor_percentage: result.tumor_percentage,
            procedure: procedure.to_string(),
            source_path: result
                .processed_path
                .unwrap_or_else(|| source.to_path_buf()),
            mask_path: result.mask_path,
            error: outcome.reason().map(str::to_string),
        }
    }

    /// Record for a scan received while no model is loaded.
    pub fn no_model(source: &Path) -> Self {
        Self {
            patient_id: patient_id(source),
            filename: file_name(source),
            status: ScanStatus::NoModel,
            liver_volume_cm3: 0.0,
            tumor_volume_cm3: 0.0,
            tumor_percentage: 0.0,
            procedure: "System Offline".to_string(),
            source_path: source.to_path_buf(),
            mask_path: None,
            error: None,
        }
    }
}

/// Care pathway suggested for a tumor burden in percent.
pub fn recommended_procedure(tumor_percentage: f64) -> &'static str {
    match tumor_percentage {
        p if p < 1.0 => "Observation / Routine Checkup",
        p if p < 30.0 => "Surgical Resection",
        p if p < 70.0 => "Chemotherapy / TACE",
        _ => "Transplant Assessment / Palliative",
    }
}

/// File name up to its first dot.
pub fn patient_id(source: &Path) -> String {
    let name = file_name(source);
    match name.split_once('.') {
        Some((id, _)) => id.to_string(),
        None => name,
    }
}

fn file_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
