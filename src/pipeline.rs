//! Single-volume request boundary.
//!
//! [`predict_volume`] runs the whole chain for one file and propagates every
//! failure. [`run_request`] wraps it for serving: geometry and mask problems
//! are logged and skipped, everything else is turned into an
//! [`InferenceOutcome`] so the caller always gets a well-formed answer.

use crate::{
    config::Config,
    inference::{InferenceError, SlidingWindowInferer},
    mask_writer::{self, MaskWriteError},
    model::SegmentationModel,
    orientation,
    preprocess::{PreprocessError, PreprocessedVolume, Preprocessor},
    volume_loader::{VolumeLoader, VolumeLoaderError},
    volumetrics::VolumetricResult,
};

use ndarray::Array3;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use web_time::Instant;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unreadable input: {0}")]
    UnreadableInput(#[from] VolumeLoaderError),

    #[error("preprocessing failed: {0}")]
    Preprocessing(#[from] PreprocessError),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
}

/// Result of one request as seen by the host.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceOutcome {
    Success(VolumetricResult),
    /// Preprocessing or inference failed; volumes are zero.
    Degraded {
        reason: String,
        result: VolumetricResult,
    },
    /// The input has no decodable voxel grid.
    Fatal(String),
}

impl InferenceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InferenceOutcome::Success(_))
    }

    /// Volumes to report; zero unless the request succeeded.
    pub fn result(&self) -> VolumetricResult {
        match self {
            InferenceOutcome::Success(result) => result.clone(),
            InferenceOutcome::Degraded { result, .. } => result.clone(),
            InferenceOutcome::Fatal(_) => VolumetricResult::zeroed(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            InferenceOutcome::Success(_) => None,
            InferenceOutcome::Degraded { reason, .. } | InferenceOutcome::Fatal(reason) => {
                Some(reason)
            }
        }
    }
}

/// Segment the volume at `path` and measure liver and tumor.
///
/// Volumes are counted on the preprocessed grid at the configured spacing.
/// The class map is carried back onto the canonical input grid and written
/// next to `path`; a failed write only leaves `mask_path` empty.
pub fn predict_volume(
    model: &dyn SegmentationModel,
    path: &Path,
    config: &Config,
) -> Result<VolumetricResult, PipelineError> {
    let volume = VolumeLoader::load(path)?;
    let prepared = Preprocessor::new(config).run(volume)?;
    let labels = SlidingWindowInferer::new(config).infer(model, prepared.image.view())?;

    let result = VolumetricResult::from_class_map(labels.view(), config.spacing);
    let mask_path = match persist_mask(&prepared, labels, path, &config.mask_suffix) {
        Ok(mask_path) => Some(mask_path),
        Err(error) => {
            warn!(source = %path.display(), %error, "mask not written");
            None
        }
    };
    Ok(result.with_mask_path(mask_path).with_processed_path(path))
}

#[derive(Debug, Error)]
enum PersistError {
    #[error(transparent)]
    Grid(#[from] PreprocessError),

    #[error(transparent)]
    Write(#[from] MaskWriteError),
}

fn persist_mask(
    prepared: &PreprocessedVolume,
    labels: Array3<u8>,
    source: &Path,
    suffix: &str,
) -> Result<PathBuf, PersistError> {
    let target = mask_writer::mask_path(source, suffix)?;
    let source_labels = prepared.to_source_grid(labels.view())?;
    drop(labels);
    Ok(mask_writer::write_mask(
        &target,
        &source_labels,
        &prepared.record.source_header,
    )?)
}

/// Serve one request for `source`.
///
/// The input is first normalized to a durable canonical copy; if that fails
/// the original file is used as is. The result names the file that was
/// segmented, which is the one the mask overlays.
pub fn run_request(
    model: &dyn SegmentationModel,
    source: &Path,
    config: &Config,
) -> InferenceOutcome {
    let start = Instant::now();
    if let Err(error) = config.validate() {
        warn!(source = %source.display(), %error, "request refused");
        return InferenceOutcome::Degraded {
            reason: error.to_string(),
            result: VolumetricResult::zeroed(),
        };
    }
    let path = match orientation::normalize_file(source, &config.fixed_prefix) {
        Ok(path) => path,
        Err(error) => {
            warn!(
                source = %source.display(),
                %error,
                "normalization failed, using original geometry"
            );
            source.to_path_buf()
        }
    };

    let outcome = match predict_volume(model, &path, config) {
        Ok(result) => InferenceOutcome::Success(result),
        Err(PipelineError::UnreadableInput(error)) => InferenceOutcome::Fatal(error.to_string()),
        Err(error) => InferenceOutcome::Degraded {
            reason: error.to_string(),
            result: VolumetricResult::zeroed().with_processed_path(&path),
        },
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &outcome {
        InferenceOutcome::Success(result) => info!(
            source = %source.display(),
            liver_cm3 = result.liver_volume_cm3,
            tumor_cm3 = result.tumor_volume_cm3,
            tumor_pct = result.tumor_percentage,
            elapsed_ms,
            "request processed"
        ),
        failed => warn!(
            source = %source.display(),
            reason = failed.reason().unwrap_or_default(),
            elapsed_ms,
            "request failed"
        ),
    }
    outcome
}
