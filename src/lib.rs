//! # Liver volumetry library
//!
//! This crate turns a 3D liver CT/MRI volume into a per-voxel tissue
//! classification (background, liver, tumor) and derives the liver and tumor
//! volumes in cubic centimetres plus the tumor burden.
//!
//! Volumes are read from NIfTI files (`.nii`, `.nii.gz`) or from a directory
//! holding a DICOM series. A request runs through these stages:
//!  - Geometry normalization to RAS orientation
//!  - Resampling to a fixed spacing, intensity windowing, foreground crop and
//!    padding up to the network patch size
//!  - Sliding-window inference with averaged overlaps
//!  - Voxel counting and conversion to physical volumes
//!  - Writing the class map as a mask next to the source
//!
//! Resampling and the arg-max are parallelised with rayon. The network runs
//! through ONNX Runtime on CPU or CUDA; anything implementing
//! [`SegmentationModel`] can stand in for it.
//!
//!   Contributions are highly welcome!
//!
//! # Roadmap
//!
//!  - Gaussian weighting of overlapping windows
//!  - Multi-frame DICOM
//!  - Concurrent requests on multiple devices
//!
//! # Examples
//!
//! ## Measuring a single scan
//!
//! Load the network once, then run a volume through the pipeline.
//!
//! ```no_run
//! # use liver_volumetry::{Config, OnnxModel, pipeline::run_request};
//! # use std::path::Path;
//! let config = Config::default();
//! let model = OnnxModel::load(&config.model_path, config.device, config.precision)
//!     .expect("should have loaded the model");
//! let outcome = run_request(&model, Path::new("scans/liver_7.nii.gz"), &config);
//! println!("{:?}", outcome.result());
//! ```

pub mod affine;
pub mod config;
pub mod enums;
pub mod inference;
mod interpolator;
pub mod mask_writer;
pub mod model;
pub mod orientation;
pub mod pipeline;
pub mod preprocess;
pub mod report;
pub mod service;
pub mod volume;
pub mod volume_loader;
pub mod volumetrics;

pub use config::Config;
pub use model::{OnnxModel, SegmentationModel, SharedModel};
pub use pipeline::{InferenceOutcome, predict_volume, run_request};
pub use report::ScanReport;
pub use service::InferenceService;
pub use volumetrics::VolumetricResult;
