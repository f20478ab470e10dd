//! Sliding-window inference over volumes larger than the network input.

use crate::{
    config::Config,
    model::{ModelError, SegmentationModel},
};

use ndarray::{Array3, Array4, Array5, ArrayView4, Axis, Zip, s};
use thiserror::Error;
use tracing::debug;

/// Per-voxel class labels.
pub type ClassMap = Array3<u8>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model failed: {0}")]
    Model(#[from] ModelError),

    #[error("expected a single-channel volume, got {0} channels")]
    Channels(usize),

    #[error("volume {volume:?} is smaller than the patch size {patch:?}")]
    VolumeTooSmall { volume: [usize; 3], patch: [usize; 3] },

    #[error("model returned scores of shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("model reports {0} classes, labels must fit in a byte")]
    TooManyClasses(usize),
}

#[derive(Clone, Debug)]
pub struct SlidingWindowInferer {
    pub roi_size: [usize; 3],
    pub overlap: f64,
    pub batch_size: usize,
}

impl SlidingWindowInferer {
    pub fn new(config: &Config) -> Self {
        Self {
            roi_size: config.roi_size,
            overlap: config.overlap,
            batch_size: config.sw_batch_size.max(1),
        }
    }

    /// Start offsets of the windows along one axis. The last window is
    /// anchored to the end of the axis so the whole extent is covered.
    pub fn patch_starts(&self, extent: usize, roi: usize) -> Vec<usize> {
        if extent <= roi {
            return vec![0];
        }
        let interval = ((roi as f64 * (1.0 - self.overlap)).floor() as usize).max(1);
        let count = (extent - roi).div_ceil(interval) + 1;
        let mut starts: Vec<usize> = (0..count)
            .map(|i| (i * interval).min(extent - roi))
            .collect();
        starts.dedup();
        starts
    }

    /// Window origins over a grid of `shape`, x-major.
    pub fn windows(&self, shape: [usize; 3]) -> Vec<[usize; 3]> {
        let xs = self.patch_starts(shape[0], self.roi_size[0]);
        let ys = self.patch_starts(shape[1], self.roi_size[1]);
        let zs = self.patch_starts(shape[2], self.roi_size[2]);
        let mut windows = Vec::with_capacity(xs.len() * ys.len() * zs.len());
        for &x in &xs {
            for &y in &ys {
                for &z in &zs {
                    windows.push([x, y, z]);
                }
            }
        }
        windows
    }

    /// Label every voxel of a `(1, X, Y, Z)` volume.
    ///
    /// Window scores are summed into one accumulator and averaged by the
    /// number of windows covering each voxel before the arg-max.
    pub fn infer(
        &self,
        model: &dyn SegmentationModel,
        image: ArrayView4<'_, f32>,
    ) -> Result<ClassMap, InferenceError> {
        let (channels, x, y, z) = image.dim();
        if channels != 1 {
            return Err(InferenceError::Channels(channels));
        }
        let shape = [x, y, z];
        let roi = self.roi_size;
        if (0..3).any(|a| shape[a] < roi[a]) {
            return Err(InferenceError::VolumeTooSmall {
                volume: shape,
                patch: roi,
            });
        }
        let classes = model.num_classes();
        if classes > usize::from(u8::MAX) + 1 {
            return Err(InferenceError::TooManyClasses(classes));
        }

        let windows = self.windows(shape);
        debug!(windows = windows.len(), ?shape, ?roi, "sliding window inference");

        let mut scores = Array4::<f32>::zeros((classes, x, y, z));
        let mut counts = Array3::<f32>::zeros((x, y, z));

        for chunk in windows.chunks(self.batch_size) {
            let mut batch = Array5::<f32>::zeros((chunk.len(), 1, roi[0], roi[1], roi[2]));
            for (b, &[ox, oy, oz]) in chunk.iter().enumerate() {
                batch.slice_mut(s![b, .., .., .., ..]).assign(&image.slice(s![
                    ..,
                    ox..ox + roi[0],
                    oy..oy + roi[1],
                    oz..oz + roi[2]
                ]));
            }

            let logits = model.predict(batch.view())?;
            let expected = vec![chunk.len(), classes, roi[0], roi[1], roi[2]];
            if logits.shape() != expected.as_slice() {
                return Err(InferenceError::ShapeMismatch {
                    expected,
                    actual: logits.shape().to_vec(),
                });
            }

            for (b, &[ox, oy, oz]) in chunk.iter().enumerate() {
                let mut target = scores.slice_mut(s![
                    ..,
                    ox..ox + roi[0],
                    oy..oy + roi[1],
                    oz..oz + roi[2]
                ]);
                target += &logits.index_axis(Axis(0), b);
                counts
                    .slice_mut(s![ox..ox + roi[0], oy..oy + roi[1], oz..oz + roi[2]])
                    .mapv_inplace(|c| c + 1.0);
            }
            // batch and logits are released here, before the next chunk
        }

        let mut labels = ClassMap::zeros((x, y, z));
        Zip::from(&mut labels)
            .and(&counts)
            .and(scores.lanes(Axis(0)))
            .par_for_each(|label, &count, lane| {
                let mut best = 0usize;
                let mut best_score = f32::NEG_INFINITY;
                for (class, &score) in lane.iter().enumerate() {
                    let mean = score / count;
                    if mean > best_score {
                        best = class;
                        best_score = mean;
                    }
                }
                *label = best as u8;
            });
        Ok(labels)
    }
}
