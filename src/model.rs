//! Segmentation network behind a small trait so the inference engine can be
//! driven by the ONNX Runtime backend or by any other implementation.

use crate::enums::{Device, Precision};

use half::f16;
use ndarray::{Array5, ArrayView5, Ix5};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{debug, info};

/// Background, liver and tumor.
pub const NUM_CLASSES: usize = 3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file {0} not found")]
    NotFound(PathBuf),

    #[error("cannot create inference session: {0}")]
    Session(String),

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    #[error("model has no {0}")]
    MissingIo(&'static str),

    #[error("model session lock poisoned")]
    Poisoned,

    #[error("model returned a rank-{0} tensor, expected rank 5")]
    OutputRank(usize),

    #[error("input batch is not contiguous")]
    NonContiguous,
}

/// A trained network mapping a batch of single-channel patches
/// `(B, 1, X, Y, Z)` to per-class scores `(B, C, X, Y, Z)`.
///
/// Implementations are shared read-only across requests; `predict` takes
/// `&self` and must not change learned state.
pub trait SegmentationModel: Send + Sync {
    fn num_classes(&self) -> usize;

    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>;
}

/// Process-wide model handle owned by the host.
pub type SharedModel = Arc<dyn SegmentationModel>;

pub struct OnnxModel {
    // ONNX Runtime needs exclusive access for a run.
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    num_classes: usize,
    precision: Precision,
}

impl OnnxModel {
    /// Load an exported network and bind it to `device`.
    ///
    /// `Device::Auto` registers CUDA with CPU fallback; `Device::Cuda` fails
    /// when CUDA cannot be registered.
    pub fn load(
        path: impl AsRef<Path>,
        device: Device,
        precision: Precision,
    ) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }

        let builder = Session::builder()
            .map_err(session_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(session_error)?
            .with_memory_pattern(false)
            .map_err(session_error)?;

        let builder = match device {
            Device::Cpu => builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(session_error)?,
            Device::Auto => builder
                .with_execution_providers([
                    CUDAExecutionProvider::default().build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(session_error)?,
            Device::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(session_error)?,
        };
        let session = builder.commit_from_file(path).map_err(session_error)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or(ModelError::MissingIo("inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or(ModelError::MissingIo("outputs"))?;

        info!(
            path = %path.display(),
            ?device,
            ?precision,
            input = %input_name,
            output = %output_name,
            "loaded segmentation model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            num_classes: NUM_CLASSES,
            precision,
        })
    }
}

impl SegmentationModel for OnnxModel {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let shape: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
        let mut session = self.session.lock().map_err(|_| ModelError::Poisoned)?;
        debug!(?shape, "running network");

        let logits = match self.precision {
            Precision::F32 => {
                let contiguous = batch.as_standard_layout();
                let data = contiguous.as_slice().ok_or(ModelError::NonContiguous)?;
                let input = TensorRef::from_array_view((shape, data))?;
                let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
                outputs[self.output_name.as_str()]
                    .try_extract_array::<f32>()?
                    .to_owned()
            }
            Precision::F16 => {
                let converted = batch.mapv(f16::from_f32);
                let data = converted.as_slice().ok_or(ModelError::NonContiguous)?;
                let input = TensorRef::from_array_view((shape, data))?;
                let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
                outputs[self.output_name.as_str()]
                    .try_extract_array::<f16>()?
                    .mapv(f16::to_f32)
            }
        };

        let rank = logits.ndim();
        logits
            .into_dimensionality::<Ix5>()
            .map_err(|_| ModelError::OutputRank(rank))
    }
}

fn session_error(error: impl std::fmt::Display) -> ModelError {
    ModelError::Session(error.to_string())
}
