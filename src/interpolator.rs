use crate::affine::Affine;
use crate::enums::Interpolation;

use ndarray::{Array3, ArrayView3, Zip};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Grid extent after moving from `spacing` to `target` while keeping the
    /// centre of voxel 0 and the physical field of view.
    ///
    /// `None` when an axis length is not finite or exceeds the `u32` range.
    pub(crate) fn get_resampled_dimensions(
        spacing: [f64; 3],
        target: [f64; 3],
        original_dim: [usize; 3],
    ) -> Option<[usize; 3]> {
        let mut dims = [0usize; 3];
        for axis in 0..3 {
            let steps = original_dim[axis].saturating_sub(1) as f64;
            let extent = (steps * spacing[axis] / target[axis]).round();
            if !extent.is_finite() || extent < 0.0 || extent >= u32::MAX as f64 {
                return None;
            }
            dims[axis] = (extent as usize).checked_add(1)?;
        }
        Some(dims)
    }

    /// Resample `data` (with spatial reference `affine`) onto a grid of
    /// `new_dim` voxels spaced `target` apart. Directions and origin are
    /// kept; the returned affine has the new spacing.
    pub(crate) fn resample_to_spacing(
        data: ArrayView3<'_, f32>,
        affine: &Affine,
        target: [f64; 3],
        new_dim: [usize; 3],
        interpolation: Interpolation,
    ) -> (Array3<f32>, Affine) {
        let spacing = affine.spacing();

        let mut new_affine = *affine;
        for axis in 0..3 {
            let scale = target[axis] / spacing[axis];
            let column = affine.column(axis).map(|v| v * scale);
            new_affine.set_column(axis, column);
        }

        // Output index n maps to source index n * target / spacing.
        let ratio = [0, 1, 2].map(|axis| target[axis] / spacing[axis]);
        let output = Self::sample_grid(data, new_dim, ratio, [0.0; 3], interpolation);
        (output, new_affine)
    }

    /// Fill a grid of `dim` by sampling `data` at `index * ratio + offset`.
    pub(crate) fn sample_grid(
        data: ArrayView3<'_, f32>,
        dim: [usize; 3],
        ratio: [f64; 3],
        offset: [f64; 3],
        interpolation: Interpolation,
    ) -> Array3<f32> {
        let mut output = Array3::<f32>::zeros((dim[0], dim[1], dim[2]));
        Zip::indexed(&mut output).par_for_each(|(x, y, z), value| {
            let src = [
                x as f64 * ratio[0] + offset[0],
                y as f64 * ratio[1] + offset[1],
                z as f64 * ratio[2] + offset[2],
            ];
            *value = match interpolation {
                Interpolation::Linear => Self::trilinear_interpolate(&data, src),
                Interpolation::Nearest => Self::nearest(&data, src),
            };
        });
        output
    }

    /// Trilinear sample with border clamping.
    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &ArrayView3<f32>, position: [f64; 3]) -> f32 {
        let (d0, d1, d2) = volume.dim();
        let dims = [d0, d1, d2];

        let mut lower = [0usize; 3];
        let mut upper = [0usize; 3];
        let mut frac = [0f32; 3];
        for axis in 0..3 {
            let max = (dims[axis] - 1) as f64;
            let p = position[axis].clamp(0.0, max);
            let p0 = p.floor();
            lower[axis] = p0 as usize;
            upper[axis] = (lower[axis] + 1).min(dims[axis] - 1);
            frac[axis] = (p - p0) as f32;
        }

        let [x0, y0, z0] = lower;
        let [x1, y1, z1] = upper;
        let [dx, dy, dz] = frac;

        let c00 = volume[[x0, y0, z0]].mul_add(1.0 - dx, volume[[x1, y0, z0]] * dx);
        let c01 = volume[[x0, y0, z1]].mul_add(1.0 - dx, volume[[x1, y0, z1]] * dx);
        let c10 = volume[[x0, y1, z0]].mul_add(1.0 - dx, volume[[x1, y1, z0]] * dx);
        let c11 = volume[[x0, y1, z1]].mul_add(1.0 - dx, volume[[x1, y1, z1]] * dx);

        let c0 = c00.mul_add(1.0 - dy, c10 * dy);
        let c1 = c01.mul_add(1.0 - dy, c11 * dy);

        c0.mul_add(1.0 - dz, c1 * dz)
    }

    /// Nearest-neighbour sample with border clamping.
    #[inline]
    pub(crate) fn nearest(volume: &ArrayView3<f32>, position: [f64; 3]) -> f32 {
        let (d0, d1, d2) = volume.dim();
        let dims = [d0, d1, d2];
        let index = [0, 1, 2].map(|axis| {
            let max = (dims[axis] - 1) as f64;
            position[axis].round().clamp(0.0, max) as usize
        });
        volume[index]
    }
}
