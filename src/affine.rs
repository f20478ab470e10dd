//! Voxel-to-world spatial reference.
//!
//! An [`Affine`] maps array indices `(i, j, k)` to RAS+ millimetre
//! coordinates, the convention used by NIfTI headers. Spacing, axis codes
//! and the NIfTI `sform`/`qform` fields are all derived from it.

use nifti::NiftiHeader;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AffineError {
    #[error("affine column {0} is degenerate")]
    DegenerateAxis(usize),

    #[error("affine contains non-finite values")]
    NonFinite,

    #[error("affine is singular")]
    Singular,
}

/// Anatomical direction a voxel axis increases towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisCode {
    /// World axis (0 = x, 1 = y, 2 = z).
    pub world_axis: usize,
    /// Whether the voxel axis increases along the positive world axis.
    pub positive: bool,
}

impl AxisCode {
    pub fn letter(&self) -> char {
        match (self.world_axis, self.positive) {
            (0, true) => 'R',
            (0, false) => 'L',
            (1, true) => 'A',
            (1, false) => 'P',
            (2, true) => 'S',
            _ => 'I',
        }
    }
}

/// Canonical axis codes: RAS.
pub const RAS: [AxisCode; 3] = [
    AxisCode {
        world_axis: 0,
        positive: true,
    },
    AxisCode {
        world_axis: 1,
        positive: true,
    },
    AxisCode {
        world_axis: 2,
        positive: true,
    },
];

/// Render axis codes as their three-letter name, e.g. `"LPS"`.
pub fn codes_to_string(codes: &[AxisCode; 3]) -> String {
    codes.iter().map(AxisCode::letter).collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    pub fn identity() -> Self {
        Self::from_spacing([1.0, 1.0, 1.0])
    }

    pub fn from_spacing(spacing: [f64; 3]) -> Self {
        let mut m = [[0.0; 4]; 4];
        for (axis, &s) in spacing.iter().enumerate() {
            m[axis][axis] = s;
        }
        m[3][3] = 1.0;
        Self(m)
    }

    /// Direction and length of one voxel step along `axis`.
    pub fn column(&self, axis: usize) -> [f64; 3] {
        [self.0[0][axis], self.0[1][axis], self.0[2][axis]]
    }

    pub fn set_column(&mut self, axis: usize, column: [f64; 3]) {
        for (row, value) in column.into_iter().enumerate() {
            self.0[row][axis] = value;
        }
    }

    pub fn origin(&self) -> [f64; 3] {
        [self.0[0][3], self.0[1][3], self.0[2][3]]
    }

    pub fn set_origin(&mut self, origin: [f64; 3]) {
        for (row, value) in origin.into_iter().enumerate() {
            self.0[row][3] = value;
        }
    }

    /// Physical distance between voxel centres along each array axis (mm).
    pub fn spacing(&self) -> [f64; 3] {
        [0, 1, 2].map(|axis| norm(self.column(axis)))
    }

    pub fn transform_point(&self, ijk: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [0, 1, 2]
            .map(|row| m[row][0] * ijk[0] + m[row][1] * ijk[1] + m[row][2] * ijk[2] + m[row][3])
    }

    fn determinant3(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Reject affines no orientation or resampling step can work with.
    pub fn validate(&self) -> Result<(), AffineError> {
        if self.0.iter().flatten().any(|v| !v.is_finite()) {
            return Err(AffineError::NonFinite);
        }
        for axis in 0..3 {
            if norm(self.column(axis)) <= f64::EPSILON {
                return Err(AffineError::DegenerateAxis(axis));
            }
        }
        if self.determinant3().abs() <= f64::EPSILON {
            return Err(AffineError::Singular);
        }
        Ok(())
    }

    pub fn inverse(&self) -> Result<Affine, AffineError> {
        self.validate()?;
        let m = &self.0;
        let det = self.determinant3();
        let inv_det = 1.0 / det;

        let mut r = [[0.0; 4]; 4];
        r[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        r[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        r[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        r[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        r[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        r[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        r[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        r[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        r[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;

        let t = self.origin();
        for row in 0..3 {
            r[row][3] = -(r[row][0] * t[0] + r[row][1] * t[1] + r[row][2] * t[2]);
        }
        r[3][3] = 1.0;
        Ok(Affine(r))
    }

    /// Closest anatomical direction for each array axis.
    ///
    /// Axes are matched greedily on the largest normalised direction
    /// component, so every array axis gets a distinct world axis even for
    /// oblique acquisitions.
    pub fn axis_codes(&self) -> Result<[AxisCode; 3], AffineError> {
        self.validate()?;

        let mut weights = [[0.0_f64; 3]; 3];
        for axis in 0..3 {
            let column = self.column(axis);
            let length = norm(column);
            for world in 0..3 {
                weights[world][axis] = column[world] / length;
            }
        }

        let mut codes = [None; 3];
        let mut world_taken = [false; 3];
        for _ in 0..3 {
            let mut best: Option<(usize, usize, f64)> = None;
            for world in (0..3).filter(|w| !world_taken[*w]) {
                for axis in (0..3).filter(|a| codes[*a].is_none()) {
                    let weight = weights[world][axis].abs();
                    if best.is_none_or(|(_, _, b)| weight > b) {
                        best = Some((world, axis, weight));
                    }
                }
            }
            let (world, axis, weight) = best.ok_or(AffineError::Singular)?;
            if weight <= f64::EPSILON {
                return Err(AffineError::DegenerateAxis(axis));
            }
            world_taken[world] = true;
            codes[axis] = Some(AxisCode {
                world_axis: world,
                positive: weights[world][axis] > 0.0,
            });
        }

        match codes {
            [Some(a), Some(b), Some(c)] => Ok([a, b, c]),
            _ => Err(AffineError::Singular),
        }
    }

    pub fn approx_eq(&self, other: &Affine, tolerance: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Spatial reference stored in a NIfTI-1 header.
    ///
    /// `sform` wins when present, then the `qform` quaternion, then plain
    /// `pixdim` scaling.
    pub fn from_header(header: &NiftiHeader) -> Self {
        if header.sform_code > 0 {
            let rows = [header.srow_x, header.srow_y, header.srow_z];
            let mut m = [[0.0; 4]; 4];
            for (row, srow) in rows.iter().enumerate() {
                for col in 0..4 {
                    m[row][col] = f64::from(srow[col]);
                }
            }
            m[3][3] = 1.0;
            return Affine(m);
        }

        let spacing = [1, 2, 3].map(|i| f64::from(header.pixdim[i]).abs());
        if header.qform_code > 0 {
            return Self::from_quaternion(header, spacing);
        }
        Self::from_spacing(spacing)
    }

    fn from_quaternion(header: &NiftiHeader, spacing: [f64; 3]) -> Self {
        let b = f64::from(header.quatern_b);
        let c = f64::from(header.quatern_c);
        let d = f64::from(header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };

        let rotation = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - c * c - b * b,
            ],
        ];
        let scale = [spacing[0], spacing[1], spacing[2] * qfac];

        let mut m = [[0.0; 4]; 4];
        for row in 0..3 {
            for col in 0..3 {
                m[row][col] = rotation[row][col] * scale[col];
            }
        }
        m[0][3] = f64::from(header.quatern_x);
        m[1][3] = f64::from(header.quatern_y);
        m[2][3] = f64::from(header.quatern_z);
        m[3][3] = 1.0;
        Affine(m)
    }

    /// Write this affine into `header` as both `sform` and `qform`, and
    /// refresh `pixdim` to match.
    pub fn write_to_header(&self, header: &mut NiftiHeader) {
        let m = &self.0;
        header.srow_x = [0, 1, 2, 3].map(|c| m[0][c] as f32);
        header.srow_y = [0, 1, 2, 3].map(|c| m[1][c] as f32);
        header.srow_z = [0, 1, 2, 3].map(|c| m[2][c] as f32);
        if header.sform_code <= 0 {
            header.sform_code = 1;
        }

        let spacing = self.spacing();
        for axis in 0..3 {
            header.pixdim[axis + 1] = spacing[axis] as f32;
        }

        let (quaternion, qfac) = self.quaternion();
        header.quatern_b = quaternion[0] as f32;
        header.quatern_c = quaternion[1] as f32;
        header.quatern_d = quaternion[2] as f32;
        let origin = self.origin();
        header.quatern_x = origin[0] as f32;
        header.quatern_y = origin[1] as f32;
        header.quatern_z = origin[2] as f32;
        header.pixdim[0] = qfac as f32;
        if header.qform_code <= 0 {
            header.qform_code = 1;
        }
    }

    /// Quaternion `(b, c, d)` of the rotation part and the `qfac` sign.
    fn quaternion(&self) -> ([f64; 3], f64) {
        let mut r = [[0.0; 3]; 3];
        for col in 0..3 {
            let column = self.column(col);
            let length = norm(column).max(f64::EPSILON);
            for row in 0..3 {
                r[row][col] = column[row] / length;
            }
        }

        let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
            - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
            + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
        let qfac = if det < 0.0 {
            for row in r.iter_mut() {
                row[2] = -row[2];
            }
            -1.0
        } else {
            1.0
        };

        let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
        let (a, b, c, d) = if trace > 0.5 {
            let a = 0.5 * trace.sqrt();
            (
                a,
                0.25 * (r[2][1] - r[1][2]) / a,
                0.25 * (r[0][2] - r[2][0]) / a,
                0.25 * (r[1][0] - r[0][1]) / a,
            )
        } else {
            let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
            let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
            let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
            if xd > 1.0 {
                let b = 0.5 * xd.sqrt();
                (
                    0.25 * (r[2][1] - r[1][2]) / b,
                    b,
                    0.25 * (r[0][1] + r[1][0]) / b,
                    0.25 * (r[0][2] + r[2][0]) / b,
                )
            } else if yd > 1.0 {
                let c = 0.5 * yd.sqrt();
                (
                    0.25 * (r[0][2] - r[2][0]) / c,
                    0.25 * (r[0][1] + r[1][0]) / c,
                    c,
                    0.25 * (r[1][2] + r[2][1]) / c,
                )
            } else {
                let d = 0.5 * zd.max(0.0).sqrt().max(f64::EPSILON);
                (
                    0.25 * (r[1][0] - r[0][1]) / d,
                    0.25 * (r[0][2] + r[2][0]) / d,
                    0.25 * (r[1][2] + r[2][1]) / d,
                    d,
                )
            }
        };

        // qform stores a >= 0 implicitly
        let sign = if a < 0.0 { -1.0 } else { 1.0 };
        ([b * sign, c * sign, d * sign], qfac)
    }
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}
