//! Geometry and intensity preparation of a volume for the network.
//!
//! Steps, in order: canonical orientation, resampling to the configured
//! spacing, intensity windowing, foreground crop, padding up to the patch
//! size, and conversion to a channel-first tensor. Every step is
//! deterministic; the grid changes are recorded so label maps can be carried
//! back onto the input grid.

use crate::{
    affine::{Affine, AffineError},
    config::{Config, IntensityWindow},
    enums::Interpolation,
    interpolator::Interpolator,
    orientation::{self, OrientationError},
    volume::Volume,
};

use ndarray::{Array3, Array4, ArrayView3, Axis, s};
use nifti::NiftiHeader;
use thiserror::Error;
use tracing::debug;

/// Upper bound on voxels in the resampled grid.
pub const MAX_RESAMPLED_VOXELS: usize = 1 << 29;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("orientation failed: {0}")]
    Orientation(#[from] OrientationError),

    #[error("invalid voxel spacing {0:?}")]
    InvalidSpacing([f64; 3]),

    #[error("resampling {source_shape:?} from {spacing:?} mm gives a grid that is too large")]
    GridTooLarge {
        source_shape: [usize; 3],
        spacing: [f64; 3],
    },

    #[error("invalid spatial reference: {0}")]
    Affine(#[from] AffineError),

    #[error("label map shape {actual:?} does not match preprocessed grid {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
}

/// Grid bookkeeping from the canonical input to the network input.
#[derive(Clone, Debug)]
pub struct GridRecord {
    /// Shape of the canonical (re-oriented, not resampled) volume.
    pub source_shape: [usize; 3],
    pub source_affine: Affine,
    /// Header describing the canonical grid, used when writing masks.
    pub source_header: NiftiHeader,
    pub resampled_shape: [usize; 3],
    pub crop_start: [usize; 3],
    pub crop_end: [usize; 3],
    pub pad_before: [usize; 3],
    pub pad_after: [usize; 3],
}

/// Network-ready tensor plus the geometry it lives on.
#[derive(Clone, Debug)]
pub struct PreprocessedVolume {
    /// Channel-first `(1, X, Y, Z)` tensor.
    pub image: Array4<f32>,
    /// Spatial reference of the tensor's grid.
    pub affine: Affine,
    pub record: GridRecord,
}

impl PreprocessedVolume {
    pub fn shape(&self) -> [usize; 3] {
        let shape = self.image.shape();
        [shape[1], shape[2], shape[3]]
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.affine.spacing()
    }

    /// Carry a label map from the preprocessed grid back onto the canonical
    /// input grid: padding is removed, cropped margins become background and
    /// the result is resampled with nearest-neighbour lookup.
    pub fn to_source_grid(
        &self,
        labels: ArrayView3<'_, u8>,
    ) -> Result<Array3<u8>, PreprocessError> {
        let (x, y, z) = labels.dim();
        let expected = self.shape();
        if [x, y, z] != expected {
            return Err(PreprocessError::ShapeMismatch {
                expected,
                actual: [x, y, z],
            });
        }

        let record = &self.record;
        let before = record.pad_before;
        let crop_len = [0, 1, 2].map(|a| record.crop_end[a] - record.crop_start[a]);
        let unpadded = labels.slice(s![
            before[0]..before[0] + crop_len[0],
            before[1]..before[1] + crop_len[1],
            before[2]..before[2] + crop_len[2]
        ]);

        let [rx, ry, rz] = record.resampled_shape;
        let mut uncropped = Array3::<f32>::zeros((rx, ry, rz));
        uncropped
            .slice_mut(s![
                record.crop_start[0]..record.crop_end[0],
                record.crop_start[1]..record.crop_end[1],
                record.crop_start[2]..record.crop_end[2]
            ])
            .assign(&unpadded.mapv(f32::from));

        let source_spacing = record.source_affine.spacing();
        let target_spacing = self.spacing();
        let ratio = [0, 1, 2].map(|a| source_spacing[a] / target_spacing[a]);
        let sampled = Interpolator::sample_grid(
            uncropped.view(),
            record.source_shape,
            ratio,
            [0.0; 3],
            Interpolation::Nearest,
        );
        Ok(sampled.mapv(|v| v as u8))
    }
}

/// Fixed sequence of transforms parameterised by the configuration.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    pub spacing: [f64; 3],
    pub roi_size: [usize; 3],
    pub window: IntensityWindow,
}

impl Preprocessor {
    pub fn new(config: &Config) -> Self {
        Self {
            spacing: config.spacing,
            roi_size: config.roi_size,
            window: config.intensity,
        }
    }

    pub fn run(&self, volume: Volume) -> Result<PreprocessedVolume, PreprocessError> {
        let volume = orientation::to_canonical(volume)?;
        let source_shape = volume.shape();
        let source_affine = volume.affine;
        let source_header = volume.reference_header();

        let volume = self.resample(&volume)?;
        let resampled_shape = volume.shape();
        debug!(shape = ?resampled_shape, spacing = ?self.spacing, "resampled");

        let volume = self.scale_intensity(volume);

        let (crop_start, crop_end) = self.foreground_bounds(volume.data.view());
        let volume = crop(volume, crop_start, crop_end);
        debug!(start = ?crop_start, end = ?crop_end, "cropped to foreground");

        let (volume, pad_before, pad_after) = self.pad(volume);
        debug!(shape = ?volume.shape(), before = ?pad_before, after = ?pad_after, "padded");

        Ok(PreprocessedVolume {
            image: volume.data.insert_axis(Axis(0)).as_standard_layout().into_owned(),
            affine: volume.affine,
            record: GridRecord {
                source_shape,
                source_affine,
                source_header,
                resampled_shape,
                crop_start,
                crop_end,
                pad_before,
                pad_after,
            },
        })
    }

    /// Trilinear resampling onto the configured spacing.
    pub fn resample(&self, volume: &Volume) -> Result<Volume, PreprocessError> {
        volume.affine.validate()?;
        let spacing = volume.spacing();
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PreprocessError::InvalidSpacing(spacing));
        }
        let source_shape = volume.shape();
        let too_large = PreprocessError::GridTooLarge {
            source_shape,
            spacing,
        };
        let Some(new_dim) =
            Interpolator::get_resampled_dimensions(spacing, self.spacing, source_shape)
        else {
            return Err(too_large);
        };
        let voxels = new_dim
            .iter()
            .try_fold(1usize, |total, &d| total.checked_mul(d));
        if !voxels.is_some_and(|n| n <= MAX_RESAMPLED_VOXELS) {
            return Err(too_large);
        }
        let (data, affine) = Interpolator::resample_to_spacing(
            volume.data.view(),
            &volume.affine,
            self.spacing,
            new_dim,
            Interpolation::Linear,
        );
        Ok(Volume {
            data,
            affine,
            header: volume.header.clone(),
        })
    }

    pub fn scale_intensity(&self, mut volume: Volume) -> Volume {
        let window = self.window;
        volume.data.par_mapv_inplace(|v| window.apply(v));
        volume
    }

    /// Tight bounding box `[start, end)` of voxels above the background
    /// level. A volume without foreground keeps its full extent.
    pub fn foreground_bounds(&self, data: ArrayView3<'_, f32>) -> ([usize; 3], [usize; 3]) {
        let threshold = self.window.b_min;
        let (x, y, z) = data.dim();
        let mut start = [usize::MAX; 3];
        let mut end = [0usize; 3];
        for ((i, j, k), &value) in data.indexed_iter() {
            if value > threshold {
                for (axis, index) in [i, j, k].into_iter().enumerate() {
                    start[axis] = start[axis].min(index);
                    end[axis] = end[axis].max(index + 1);
                }
            }
        }
        if start[0] == usize::MAX {
            return ([0; 3], [x, y, z]);
        }
        (start, end)
    }

    /// Grow every axis to at least the patch size, splitting the padding
    /// evenly with the odd voxel after.
    pub fn pad(&self, volume: Volume) -> (Volume, [usize; 3], [usize; 3]) {
        let shape = volume.shape();
        let total = [0, 1, 2].map(|a| self.roi_size[a].saturating_sub(shape[a]));
        let before = total.map(|t| t / 2);
        let after = [0, 1, 2].map(|a| total[a] - before[a]);
        if total == [0; 3] {
            return (volume, before, after);
        }

        let padded_shape = [0, 1, 2].map(|a| shape[a] + total[a]);
        let mut data = Array3::from_elem(
            (padded_shape[0], padded_shape[1], padded_shape[2]),
            self.window.b_min,
        );
        data.slice_mut(s![
            before[0]..before[0] + shape[0],
            before[1]..before[1] + shape[1],
            before[2]..before[2] + shape[2]
        ])
        .assign(&volume.data);

        let mut affine = volume.affine;
        affine.set_origin(affine.transform_point(before.map(|b| -(b as f64))));

        (
            Volume {
                data,
                affine,
                header: volume.header,
            },
            before,
            after,
        )
    }
}

fn crop(volume: Volume, start: [usize; 3], end: [usize; 3]) -> Volume {
    let data = volume
        .data
        .slice(s![start[0]..end[0], start[1]..end[1], start[2]..end[2]])
        .to_owned();
    let mut affine = volume.affine;
    affine.set_origin(affine.transform_point(start.map(|v| v as f64)));
    Volume {
        data,
        affine,
        header: volume.header,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn preprocessor(roi: usize) -> Preprocessor {
        Preprocessor {
            spacing: [1.0, 1.0, 1.0],
            roi_size: [roi; 3],
            window: IntensityWindow::default(),
        }
    }

    #[test]
    fn foreground_bounds_are_tight() {
        let mut data = Array3::<f32>::zeros((10, 10, 10));
        data[[2, 3, 4]] = 0.5;
        data[[6, 3, 7]] = 1.0;
        let (start, end) = preprocessor(4).foreground_bounds(data.view());
        assert_eq!(start, [2, 3, 4]);
        assert_eq!(end, [7, 4, 8]);
    }

    #[test]
    fn empty_foreground_keeps_extent() {
        let data = Array3::<f32>::zeros((5, 6, 7));
        let (start, end) = preprocessor(4).foreground_bounds(data.view());
        assert_eq!(start, [0, 0, 0]);
        assert_eq!(end, [5, 6, 7]);
    }

    #[test]
    fn padding_only_grows() {
        let volume = Volume::new(Array3::ones((3, 8, 10)), Affine::identity());
        let (padded, before, after) = preprocessor(8).pad(volume);
        assert_eq!(padded.shape(), [8, 8, 10]);
        assert_eq!(before, [2, 0, 0]);
        assert_eq!(after, [3, 0, 0]);
        assert_eq!(padded.data[[1, 0, 0]], 0.0);
        assert_eq!(padded.data[[2, 0, 0]], 1.0);
        // the original first voxel keeps its physical position
        let world = padded.affine.transform_point([2.0, 0.0, 0.0]);
        assert_abs_diff_eq!(world[0], 0.0);
    }

    #[test]
    fn crop_moves_origin() {
        let volume = Volume::new(Array3::ones((6, 6, 6)), Affine::from_spacing([2.0, 2.0, 2.0]));
        let cropped = crop(volume, [1, 2, 3], [4, 5, 6]);
        assert_eq!(cropped.shape(), [3, 3, 3]);
        assert_eq!(cropped.affine.origin(), [2.0, 4.0, 6.0]);
    }

    #[test]
    fn pipeline_output_matches_configured_spacing_and_patch() {
        let data = Array3::from_shape_fn((20, 20, 6), |(i, j, _)| {
            if (5..15).contains(&i) && (5..15).contains(&j) { 150.0 } else { -500.0 }
        });
        let volume = Volume::new(data, Affine::from_spacing([0.8, 0.8, 3.0]));
        let preprocessor = Preprocessor {
            spacing: [1.5, 1.5, 2.0],
            roi_size: [16, 16, 16],
            window: IntensityWindow::default(),
        };
        let prepared = preprocessor.run(volume).unwrap();

        let spacing = prepared.spacing();
        assert_abs_diff_eq!(spacing[0], 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(spacing[2], 2.0, epsilon = 1e-9);
        assert!(prepared.shape().iter().all(|&d| d >= 16));
        assert_eq!(prepared.image.shape()[0], 1);
        assert!(prepared.image.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn labels_map_back_to_source_extent() {
        let data =
            Array3::from_shape_fn((6, 6, 6), |(i, _, _)| if i >= 3 { 100.0 } else { -200.0 });
        let volume = Volume::new(data, Affine::identity());
        let prepared = preprocessor(8).run(volume).unwrap();
        assert_eq!(prepared.shape(), [8, 8, 8]);

        let labels = prepared.image.index_axis(Axis(0), 0).mapv(|v| u8::from(v > 0.0));
        let restored = prepared.to_source_grid(labels.view()).unwrap();
        assert_eq!(restored.dim(), (6, 6, 6));
        for ((i, _, _), &label) in restored.indexed_iter() {
            assert_eq!(label, u8::from(i >= 3));
        }
    }

    #[test]
    fn oversized_grid_is_refused() {
        let volume = Volume::new(Array3::zeros((4, 4, 4)), Affine::from_spacing([1e20, 1.0, 1.0]));
        let err = preprocessor(4).resample(&volume).unwrap_err();
        assert!(matches!(err, PreprocessError::GridTooLarge { .. }));

        // fits in usize but exceeds the voxel limit
        let volume = Volume::new(Array3::zeros((2, 2, 2)), Affine::from_spacing([2000.0; 3]));
        let err = preprocessor(4).resample(&volume).unwrap_err();
        assert!(matches!(err, PreprocessError::GridTooLarge { .. }));
    }
}
