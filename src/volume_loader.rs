use crate::{affine::Affine, volume::Volume};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use flate2::read::GzDecoder;
use ndarray::{Array2, Array3, ArrayD, Axis, Ix3, s};
use nifti::{InMemNiftiObject, IntoNdArray, NiftiObject};
use rayon::prelude::*;
use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Unsupported image dimensions {0:?}")]
    UnsupportedDimensions(Vec<usize>),

    #[error("Volume has no voxels")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

pub struct VolumeLoader;

/// One decoded slice with its position in patient space.
struct SliceImage {
    position: Option<[f64; 3]>,
    instance: Option<i32>,
    pixels: Array2<f32>,
}

impl VolumeLoader {
    /// Load a volume from a NIfTI file or a directory holding a DICOM series.
    pub fn load(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::load_from_directory(path)
        } else {
            Self::load_nifti(path)
        }
    }

    /// Load a `.nii` or `.nii.gz` file.
    ///
    /// Compression is detected from the gzip magic bytes rather than the file
    /// name, so mislabelled files still load.
    pub fn load_nifti(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let bytes = fs::read(path.as_ref())?;
        let object = if is_gzip(&bytes) {
            InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))?
        } else {
            InMemNiftiObject::from_reader(Cursor::new(bytes))?
        };

        let header = object.header().clone();
        let affine = Affine::from_header(&header);
        // Slope and intercept are applied by the conversion.
        let array: ArrayD<f32> = object.into_volume().into_ndarray::<f32>()?;
        let data = Self::squeeze_to_3d(array)?;

        debug!(
            path = %path.as_ref().display(),
            shape = ?data.dim(),
            spacing = ?affine.spacing(),
            "loaded NIfTI volume"
        );
        Ok(Volume::new(data, affine).with_header(header))
    }

    /// Accept 3D grids and 3D grids with trailing singleton axes (a single
    /// intensity channel).
    fn squeeze_to_3d(mut array: ArrayD<f32>) -> Result<Array3<f32>, VolumeLoaderError> {
        let shape = array.shape().to_vec();
        if shape.len() < 3 || shape[3..].iter().any(|&d| d != 1) {
            return Err(VolumeLoaderError::UnsupportedDimensions(shape));
        }
        while array.ndim() > 3 {
            let last = Axis(array.ndim() - 1);
            array = array.index_axis_move(last, 0);
        }
        if array.is_empty() {
            return Err(VolumeLoaderError::Empty);
        }
        let array = array
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeLoaderError::UnsupportedDimensions(shape))?;
        Ok(array.as_standard_layout().into_owned())
    }

    /// Load a volume from DICOM objects. Slices are decoded in parallel.
    ///
    /// Slices are ordered by their position along the slice normal
    /// (`row × column` direction), so axial, coronal and sagittal series all
    /// stack correctly. Without positions on every slice the instance number
    /// is used, and failing that the given order is kept.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<Volume, VolumeLoaderError> {
        let mut images: Vec<_> = dicom_objects
            .par_iter()
            .filter_map(Self::extract_image)
            .collect();

        if images.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        let (row_dir, col_dir) = Self::get_orientation(dicom_objects);
        Self::sort_images(&mut images, cross(row_dir, col_dir));
        Self::validate_dimensions(&images)?;

        let affine = Self::get_affine(dicom_objects, &images, (row_dir, col_dir))?;
        let volume_array = Self::build_volume_array(&images);

        debug!(
            slices = images.len(),
            shape = ?volume_array.dim(),
            spacing = ?affine.spacing(),
            "loaded DICOM series"
        );
        Ok(Volume::new(volume_array, affine))
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(paths: &[impl AsRef<Path>]) -> Result<Volume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();

        Self::load_from_dicom_objects(&objects?)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        paths.sort();

        Self::load_from_file_paths(&paths)
    }

    fn extract_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<SliceImage> {
        let pixels = Self::decode_image(dicom_object)?;
        Some(SliceImage {
            position: Self::get_position(dicom_object),
            instance: Self::get_instance_number(dicom_object),
            pixels,
        })
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        (pos.len() >= 3).then(|| [pos[0], pos[1], pos[2]])
    }

    fn get_instance_number(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<i32> {
        dicom_object
            .element(tags::INSTANCE_NUMBER)
            .ok()?
            .to_int::<i32>()
            .ok()
    }

    /// Row and column direction cosines, axial when the series has none.
    fn get_orientation(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> ([f64; 3], [f64; 3]) {
        dicom_objects
            .iter()
            .find_map(|dicom_object| {
                let cosines = dicom_object
                    .element(tags::IMAGE_ORIENTATION_PATIENT)
                    .ok()?
                    .to_multi_float64()
                    .ok()?;
                (cosines.len() >= 6).then(|| {
                    (
                        [cosines[0], cosines[1], cosines[2]],
                        [cosines[3], cosines[4], cosines[5]],
                    )
                })
            })
            .unwrap_or(([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]))
    }

    /// Decode the first frame as modality values (Hounsfield units for CT).
    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_images(images: &mut [SliceImage], normal: [f64; 3]) {
        if images.iter().all(|image| image.position.is_some()) {
            let depth = |image: &SliceImage| image.position.map_or(0.0, |p| dot(p, normal));
            images.sort_by(|a, b| depth(a).total_cmp(&depth(b)));
        } else if images.iter().all(|image| image.instance.is_some()) {
            images.sort_by_key(|image| image.instance);
        }
    }

    fn validate_dimensions(images: &[SliceImage]) -> Result<(), VolumeLoaderError> {
        let first_dim = images[0].pixels.dim();
        if images.iter().any(|img| img.pixels.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    /// Stack slices into an `(column, row, slice)` grid so the array axes
    /// line up with the affine columns.
    fn build_volume_array(images: &[SliceImage]) -> Array3<f32> {
        let (rows, columns) = images[0].pixels.dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((columns, rows, depth));

        for (k, image) in images.iter().enumerate() {
            volume
                .slice_mut(s![.., .., k])
                .assign(&image.pixels.t());
        }

        volume
    }

    /// Voxel-to-RAS affine from the patient-space tags of the sorted series.
    fn get_affine(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        images: &[SliceImage],
        (row_dir, col_dir): ([f64; 3], [f64; 3]),
    ) -> Result<Affine, VolumeLoaderError> {
        let (pixel_spacing, slice_thickness) =
            Self::get_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;

        let first = images.first().and_then(|image| image.position);
        let last = images.last().and_then(|image| image.position);
        let slice_step = match (first, last) {
            (Some(first), Some(last)) if images.len() > 1 => {
                let n = (images.len() - 1) as f64;
                [0, 1, 2].map(|axis| (last[axis] - first[axis]) / n)
            }
            _ => {
                let normal = cross(row_dir, col_dir);
                normal.map(|v| v * slice_thickness)
            }
        };

        // Columns advance along the row direction by the column spacing and
        // rows along the column direction by the row spacing.
        let lps_columns = [
            row_dir.map(|v| v * pixel_spacing[1]),
            col_dir.map(|v| v * pixel_spacing[0]),
            slice_step,
        ];
        let origin = first.unwrap_or([0.0; 3]);

        let mut affine = Affine::identity();
        for (axis, column) in lps_columns.into_iter().enumerate() {
            affine.set_column(axis, lps_to_ras(column));
        }
        affine.set_origin(lps_to_ras(origin));
        Ok(affine)
    }

    fn get_spacing(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Option<([f64; 2], f64)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float64()
                .ok()?;

            let slice_thickness = dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float64()
                .ok()?;

            (pixel_spacing.len() >= 2)
                .then(|| ([pixel_spacing[0], pixel_spacing[1]], slice_thickness))
        })
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn lps_to_ras(v: [f64; 3]) -> [f64; 3] {
    [-v[0], -v[1], v[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
