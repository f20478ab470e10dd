#![allow(dead_code)]

use liver_volumetry::{
    Config, SegmentationModel,
    affine::Affine,
    model::ModelError,
    volume::Volume,
    volume_loader::VolumeLoader,
};
use ndarray::{Array3, Array5, ArrayView5};
use std::path::{Path, PathBuf};

/// Labels by windowed intensity: tumor above 0.9, liver above 0.5.
pub struct ThresholdModel;

impl SegmentationModel for ThresholdModel {
    fn num_classes(&self) -> usize {
        3
    }

    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let (b, _, x, y, z) = batch.dim();
        let mut out = Array5::zeros((b, 3, x, y, z));
        for ((n, _, i, j, k), &v) in batch.indexed_iter() {
            out[[n, 0, i, j, k]] = 0.5;
            out[[n, 1, i, j, k]] = v;
            out[[n, 2, i, j, k]] = if v > 0.9 { 2.0 } else { 0.0 };
        }
        Ok(out)
    }
}

/// Fails every call, as a device running out of memory would.
pub struct FailingModel;

impl SegmentationModel for FailingModel {
    fn num_classes(&self) -> usize {
        3
    }

    fn predict(&self, _batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        Err(ModelError::Session("out of device memory".to_string()))
    }
}

/// Unit spacing and patches of 16 voxels.
pub fn test_config() -> Config {
    Config {
        spacing: [1.0, 1.0, 1.0],
        roi_size: [16, 16, 16],
        ..Config::default()
    }
}

pub fn ras_affine(spacing: [f64; 3]) -> Affine {
    let mut affine = Affine::from_spacing(spacing);
    affine.set_origin([-12.0, 5.0, 30.0]);
    affine
}

/// Background of -500 HU with a block of `value` HU at `start..end`.
pub fn block_volume(
    shape: [usize; 3],
    start: [usize; 3],
    end: [usize; 3],
    value: f32,
) -> Array3<f32> {
    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let inside = (start[0]..end[0]).contains(&i)
            && (start[1]..end[1]).contains(&j)
            && (start[2]..end[2]).contains(&k);
        if inside { value } else { -500.0 }
    })
}

pub fn write_volume(dir: &Path, name: &str, data: Array3<f32>, affine: Affine) -> PathBuf {
    let path = dir.join(name);
    Volume::new(data, affine)
        .save(&path)
        .expect("should have written the test volume");
    path
}

pub fn read_labels(path: &Path) -> (Array3<u8>, Affine) {
    let volume = VolumeLoader::load_nifti(path).expect("should have read the mask");
    (volume.data.mapv(|v| v as u8), volume.affine)
}
