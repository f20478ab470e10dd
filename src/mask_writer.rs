//! Persistence of class maps next to their source volume.

use ndarray::Array3;
use nifti::{NiftiHeader, writer::WriterOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MaskWriteError {
    #[error("path {0} has no file name")]
    NoFileName(PathBuf),

    #[error("mask dimension {0} exceeds the NIfTI-1 limit")]
    TooLarge(usize),

    #[error("cannot write mask: {0}")]
    Write(#[from] nifti::NiftiError),
}

/// Deterministic mask location for `source`: the compression and NIfTI
/// extensions are replaced by `<suffix>.nii.gz` in the same directory.
/// Series directories use the directory name.
pub fn mask_path(source: &Path, suffix: &str) -> Result<PathBuf, MaskWriteError> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| MaskWriteError::NoFileName(source.to_path_buf()))?;
    let stem = if source.is_dir() {
        name
    } else {
        let lower = name.to_ascii_lowercase();
        [".nii.gz", ".nii", ".gz"]
            .iter()
            .find(|ext| lower.ends_with(*ext))
            .map_or(name, |ext| &name[..name.len() - ext.len()])
    };
    Ok(source.with_file_name(format!("{stem}{suffix}.nii.gz")))
}

/// Write `labels` as an unsigned 8-bit NIfTI image sharing the grid
/// description of `reference`.
pub fn write_mask(
    path: &Path,
    labels: &Array3<u8>,
    reference: &NiftiHeader,
) -> Result<PathBuf, MaskWriteError> {
    let mut header = reference.clone();
    let (i, j, k) = labels.dim();
    header.dim = [3, 1, 1, 1, 1, 1, 1, 1];
    for (axis, len) in [i, j, k].into_iter().enumerate() {
        header.dim[axis + 1] = u16::try_from(len).map_err(|_| MaskWriteError::TooLarge(len))?;
    }
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header.cal_min = 0.0;
    header.cal_max = f32::from(labels.iter().copied().max().unwrap_or(0));

    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(labels)?;
    debug!(path = %path.display(), shape = ?(i, j, k), "wrote mask");
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{affine::Affine, volume::Volume, volume_loader::VolumeLoader};

    #[test]
    fn mask_name_replaces_extension() {
        let cases = [
            ("/data/fixed_liver_3.nii.gz", "/data/fixed_liver_3_seg.nii.gz"),
            ("/data/liver.nii", "/data/liver_seg.nii.gz"),
            ("/data/LIVER.NII.GZ", "/data/LIVER_seg.nii.gz"),
            ("/data/scan.v2.nii.gz", "/data/scan.v2_seg.nii.gz"),
        ];
        for (source, expected) in cases {
            assert_eq!(
                mask_path(Path::new(source), "_seg").unwrap(),
                PathBuf::from(expected)
            );
        }
    }

    #[test]
    fn series_directory_uses_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let series = dir.path().join("series_01");
        std::fs::create_dir(&series).unwrap();
        assert_eq!(
            mask_path(&series, "_seg").unwrap(),
            dir.path().join("series_01_seg.nii.gz")
        );
    }

    #[test]
    fn written_mask_reads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let affine = Affine([
            [-0.8, 0.0, 0.0, 120.0],
            [0.0, 0.8, 0.0, -40.0],
            [0.0, 0.0, 2.5, 7.5],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let reference = Volume::new(ndarray::Array3::zeros((5, 4, 3)), affine).reference_header();
        let labels = ndarray::Array3::from_shape_fn((5, 4, 3), |(i, j, k)| ((i + j + k) % 3) as u8);

        let path = write_mask(&dir.path().join("mask.nii.gz"), &labels, &reference).unwrap();
        let restored = VolumeLoader::load_nifti(&path).unwrap();

        assert_eq!(restored.data.mapv(|v| v as u8), labels);
        assert!(restored.affine.approx_eq(&affine, 1e-4));
    }

    #[test]
    fn unwritable_location_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("mask.nii.gz");
        let labels = ndarray::Array3::<u8>::zeros((2, 2, 2));
        let header = Volume::new(ndarray::Array3::zeros((2, 2, 2)), Affine::identity())
            .reference_header();
        assert!(matches!(
            write_mask(&path, &labels, &header),
            Err(MaskWriteError::Write(_))
        ));
    }
}
