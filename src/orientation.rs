//! Canonical (RAS) re-indexing of volumes.
//!
//! Normalisation only permutes and flips array axes; intensities are never
//! resampled. The affine is rewritten so every voxel keeps its physical
//! position.

use crate::{
    affine::{AffineError, AxisCode, RAS, codes_to_string},
    volume::Volume,
    volume_loader::{VolumeLoader, VolumeLoaderError},
};

use ndarray::Axis;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OrientationError {
    #[error("cannot read volume: {0}")]
    Load(#[from] VolumeLoaderError),

    #[error("invalid spatial reference: {0}")]
    Affine(#[from] AffineError),

    #[error("cannot write normalized volume: {0}")]
    Write(#[from] nifti::NiftiError),

    #[error("path {0} has no file name")]
    NoFileName(PathBuf),
}

/// Re-index `volume` so its array axes run Right, Anterior, Superior.
///
/// Already canonical volumes are returned untouched.
pub fn to_canonical(volume: Volume) -> Result<Volume, OrientationError> {
    let codes = volume.affine.axis_codes()?;
    if codes == RAS {
        return Ok(volume);
    }
    debug!(from = %codes_to_string(&codes), "reorienting volume to RAS");
    Ok(reorient(volume, &codes))
}

fn reorient(volume: Volume, codes: &[AxisCode; 3]) -> Volume {
    let Volume {
        mut data,
        mut affine,
        header,
    } = volume;
    let shape = data.shape().to_vec();

    for (axis, code) in codes.iter().enumerate() {
        if code.positive {
            continue;
        }
        data.invert_axis(Axis(axis));
        let column = affine.column(axis);
        let last = (shape[axis] - 1) as f64;
        let origin = affine.origin();
        affine.set_origin([0, 1, 2].map(|row| origin[row] + column[row] * last));
        affine.set_column(axis, column.map(|v| -v));
    }

    // output axis `world` is taken from input axis `permutation[world]`
    let mut permutation = [0usize; 3];
    for (axis, code) in codes.iter().enumerate() {
        permutation[code.world_axis] = axis;
    }
    let data = data
        .permuted_axes(permutation)
        .as_standard_layout()
        .into_owned();

    let source = affine;
    for (world, &axis) in permutation.iter().enumerate() {
        affine.set_column(world, source.column(axis));
    }

    Volume {
        data,
        affine,
        header,
    }
}

/// Location of the normalized copy of `source`: `<prefix><name>` in the same
/// directory. Series directories get a `.nii.gz` file.
pub fn fixed_path(source: &Path, prefix: &str) -> Result<PathBuf, OrientationError> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| OrientationError::NoFileName(source.to_path_buf()))?;
    let name = if source.is_dir() {
        format!("{prefix}{name}.nii.gz")
    } else {
        format!("{prefix}{name}")
    };
    Ok(source.with_file_name(name))
}

/// Load `source`, bring it to canonical orientation and persist the result
/// next to it so later steps read an already normalized file.
pub fn normalize_file(source: &Path, prefix: &str) -> Result<PathBuf, OrientationError> {
    let target = fixed_path(source, prefix)?;
    let volume = to_canonical(VolumeLoader::load(source)?)?;
    volume.save(&target)?;
    debug!(target = %target.display(), shape = ?volume.dim(), "wrote normalized volume");
    Ok(target)
}
