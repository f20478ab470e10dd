use crate::affine::Affine;

use ndarray::Array3;
use nifti::{NiftiHeader, writer::WriterOptions};
use std::path::Path;

/// Scalar voxel grid and the spatial reference that travels with it.
///
/// Array axes follow the affine columns: `data[[i, j, k]]` sits at
/// `affine * (i, j, k, 1)`.
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Array3<f32>,
    pub affine: Affine,
    /// Header of the file the volume was read from, reused when writing
    /// derived images so they carry the same metadata.
    pub header: Option<NiftiHeader>,
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Affine) -> Self {
        Self {
            data,
            affine,
            header: None,
        }
    }

    pub fn with_header(mut self, header: NiftiHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Get the dimensions of the volume (i, j, k)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn shape(&self) -> [usize; 3] {
        let (i, j, k) = self.data.dim();
        [i, j, k]
    }

    /// Voxel spacing in millimetres, read from the affine.
    pub fn spacing(&self) -> [f64; 3] {
        self.affine.spacing()
    }

    /// Header describing this volume's grid, derived from the source header
    /// when there is one.
    pub fn reference_header(&self) -> NiftiHeader {
        let mut header = self.header.clone().unwrap_or_default();
        let [i, j, k] = self.shape();
        header.dim = [3, i as u16, j as u16, k as u16, 1, 1, 1, 1];
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        self.affine.write_to_header(&mut header);
        header
    }

    /// Write the volume as 32-bit float NIfTI. A `.gz` suffix compresses.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), nifti::NiftiError> {
        WriterOptions::new(path.as_ref())
            .reference_header(&self.reference_header())
            .write_nifti(&self.data)
    }
}
