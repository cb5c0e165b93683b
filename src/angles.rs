//! Angle conversions and on-sky separations.
//!
//! Separations are returned in arcseconds. The cross/dot product form is used
//! throughout since `acos` of a dot product loses precision for nearly
//! coincident and nearly antipodal points.

use core::f64::consts::PI;

use crate::{KungpaoError, Result};

const ARCSEC_PER_DEGREE: f64 = 3600.0;

/// convert radians into degrees
pub fn rad2deg(rad: f64) -> f64 {
    rad * 180.0 / PI
}

/// convert degrees into radians
pub fn deg2rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

/// convert degrees into hours
pub fn deg2hr(deg: f64) -> f64 {
    deg * (24.0 / 360.0)
}

/// convert hours into degrees
pub fn hr2deg(hr: f64) -> f64 {
    hr * 15.0
}

/// Normalize `num` into `[lower, upper)`, or with `bounce` set, reflect it
/// into `[lower, upper]`.
///
/// The bounce mode is the one wanted for latitudes: `91` in `[-90, 90]`
/// becomes `89` rather than wrapping around to `-89`.
pub fn normalize_angle(num: f64, lower: f64, upper: f64, bounce: bool) -> Result<f64> {
    if lower >= upper {
        return Err(KungpaoError::InvalidRange { lower, upper });
    }
    let width = upper - lower;
    if bounce {
        let period = 2.0 * width;
        let mut t = (num - lower).rem_euclid(period);
        if t > width {
            t = period - t;
        }
        Ok(lower + t)
    } else {
        let res = lower + (num - lower).rem_euclid(width);
        // rem_euclid can round up to exactly `width` for tiny negative offsets
        if res >= upper {
            Ok(lower)
        } else {
            Ok(res)
        }
    }
}

/// Distance to (x0, y0) in an elliptical coordinate frame with position
/// angle `pa` (degrees) and axis ratio `q`.
pub fn dist_elliptical(x: f64, y: f64, x0: f64, y0: f64, pa: f64, q: f64) -> f64 {
    let theta = deg2rad(pa);
    let (sin_t, cos_t) = theta.sin_cos();
    let dist_a = ((x - x0) * cos_t + (y - y0) * sin_t).powi(2);
    let dist_b = (((y - y0) * cos_t - (x - x0) * sin_t) / q).powi(2);
    (dist_a + dist_b).sqrt()
}

fn unit_vector(ra: f64, dec: f64) -> [f64; 3] {
    let (sin_ra, cos_ra) = deg2rad(ra).sin_cos();
    let (sin_dec, cos_dec) = deg2rad(dec).sin_cos();
    [cos_dec * cos_ra, cos_dec * sin_ra, sin_dec]
}

fn separation(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let cross = [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ];
    let c = (cross[0].powi(2) + cross[1].powi(2) + cross[2].powi(2)).sqrt();
    let d = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    rad2deg(c.atan2(d)) * ARCSEC_PER_DEGREE
}

/// angular distance between two points, in arcsec
pub fn angular_distance_single(ra_1: f64, dec_1: f64, ra_2: f64, dec_2: f64) -> f64 {
    separation(&unit_vector(ra_1, dec_1), &unit_vector(ra_2, dec_2))
}

/// Angular distances from one point to each of `(ra_2[i], dec_2[i])`, in
/// arcsec and in the order of the reference arrays.
///
/// Extra elements of the longer reference slice are ignored.
pub fn angular_distance(ra_1: f64, dec_1: f64, ra_2: &[f64], dec_2: &[f64]) -> Vec<f64> {
    let origin = unit_vector(ra_1, dec_1);
    ra_2.iter()
        .zip(dec_2.iter())
        .map(|(&ra, &dec)| separation(&origin, &unit_vector(ra, dec)))
        .collect()
}

/// Angular distance with the Vincenty formula, in arcsec.
///
/// Agrees with [`angular_distance_single`] to numerical precision, kept as an
/// independent cross-check.
pub fn angular_distance_vincenty(ra_1: f64, dec_1: f64, ra_2: f64, dec_2: f64) -> f64 {
    let (sin_dra, cos_dra) = deg2rad(ra_2 - ra_1).sin_cos();
    let (sin_d1, cos_d1) = deg2rad(dec_1).sin_cos();
    let (sin_d2, cos_d2) = deg2rad(dec_2).sin_cos();

    let num1 = cos_d2 * sin_dra;
    let num2 = cos_d1 * sin_d2 - sin_d1 * cos_d2 * cos_dra;
    let denominator = sin_d1 * sin_d2 + cos_d1 * cos_d2 * cos_dra;
    rad2deg(num1.hypot(num2).atan2(denominator)) * ARCSEC_PER_DEGREE
}
