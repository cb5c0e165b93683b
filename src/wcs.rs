//! Gnomonic (TAN) world coordinate system read from FITS header keywords.
//!
//! Pixel positions are zero-based: the centre of the first pixel is
//! `(0.0, 0.0)`, whereas FITS `CRPIX` values are one-based.

use std::f64::consts::PI;

use ndarray::Array2;

use crate::geom::Vec2D;
use crate::{KungpaoError, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Wcs {
    /// reference sky position `[ra, dec]`, degrees
    crval: [f64; 2],
    /// reference pixel, one-based FITS convention
    crpix: [f64; 2],
    /// linear transform from pixel offsets to intermediate coordinates, degrees
    cd: [[f64; 2]; 2],
    cd_inv: [[f64; 2]; 2],
}

fn invert(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det.abs() < 1e-30 || !det.is_finite() {
        return None;
    }
    Some([
        [cd[1][1] / det, -cd[0][1] / det],
        [-cd[1][0] / det, cd[0][0] / det],
    ])
}

/// standard coordinates (radians) of a sky position about `(ra0, dec0)`,
/// `None` on or behind the tangent plane
fn project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let denom = dec.sin() * dec0.sin() + dec.cos() * dec0.cos() * da.cos();
    if denom <= 1e-12 {
        return None;
    }
    let xi = dec.cos() * da.sin() / denom;
    let eta = (dec.sin() * dec0.cos() - dec.cos() * dec0.sin() * da.cos()) / denom;
    Some((xi, eta))
}

fn deproject(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let rho = xi.hypot(eta);
    if rho < 1e-15 {
        return (ra0, dec0);
    }
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();
    let dec = (cos_c * dec0.sin() + eta * sin_c * dec0.cos() / rho).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * dec0.cos() * cos_c - eta * dec0.sin() * sin_c);
    (ra, dec)
}

impl Wcs {
    pub fn new(crval: [f64; 2], crpix: [f64; 2], cd: [[f64; 2]; 2]) -> Result<Self> {
        let cd_inv = invert(&cd).ok_or_else(|| KungpaoError::Wcs(
            format!("singular CD matrix {:?}", cd)
        ))?;
        Ok(Self { crval, crpix, cd, cd_inv })
    }

    /// Build from header keywords. `lookup` returns the numeric value of a
    /// keyword. The linear part is taken from `CDi_j`, else `CDELTi` with
    /// `PCi_j` or `CROTA2`.
    pub fn from_header<F: Fn(&str) -> Option<f64>>(lookup: F) -> Result<Self> {
        let require = |key: &str| lookup(key).ok_or_else(|| KungpaoError::Wcs(
            format!("missing {} in header", key)
        ));
        let crval = [require("CRVAL1")?, require("CRVAL2")?];
        let crpix = [require("CRPIX1")?, require("CRPIX2")?];

        let cd_keys = [lookup("CD1_1"), lookup("CD1_2"), lookup("CD2_1"), lookup("CD2_2")];
        let cd = if cd_keys.iter().any(|v| v.is_some()) {
            let [c11, c12, c21, c22] = cd_keys.map(|v| v.unwrap_or(0.0));
            [[c11, c12], [c21, c22]]
        } else {
            let cdelt = [require("CDELT1")?, require("CDELT2")?];
            let pc_keys = [lookup("PC1_1"), lookup("PC1_2"), lookup("PC2_1"), lookup("PC2_2")];
            if pc_keys.iter().any(|v| v.is_some()) {
                let pc11 = pc_keys[0].unwrap_or(1.0);
                let pc12 = pc_keys[1].unwrap_or(0.0);
                let pc21 = pc_keys[2].unwrap_or(0.0);
                let pc22 = pc_keys[3].unwrap_or(1.0);
                [
                    [cdelt[0] * pc11, cdelt[0] * pc12],
                    [cdelt[1] * pc21, cdelt[1] * pc22],
                ]
            } else {
                let (sin_r, cos_r) = lookup("CROTA2").unwrap_or(0.0).to_radians().sin_cos();
                [
                    [cdelt[0] * cos_r, -cdelt[1] * sin_r],
                    [cdelt[0] * sin_r, cdelt[1] * cos_r],
                ]
            }
        };
        Self::new(crval, crpix, cd)
    }

    /// `[ra, dec]` of the reference pixel, degrees
    pub fn crval(&self) -> [f64; 2] {
        self.crval
    }

    /// Zero-based reference pixel.
    pub fn reference_pixel(&self) -> Vec2D {
        Vec2D { x: self.crpix[0] - 1.0, y: self.crpix[1] - 1.0 }
    }

    /// Mean pixel scale, arcsec per pixel.
    pub fn pixel_scale(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        det.abs().sqrt() * 3600.0
    }

    /// Sky position `(ra, dec)` in degrees of a zero-based pixel position.
    /// RA is wrapped into `[0, 360)`.
    pub fn pix2world(&self, pixel: Vec2D) -> (f64, f64) {
        let d = pixel - self.reference_pixel();
        let xi = (self.cd[0][0] * d.x + self.cd[0][1] * d.y).to_radians();
        let eta = (self.cd[1][0] * d.x + self.cd[1][1] * d.y).to_radians();
        let (ra, dec) = deproject(xi, eta, self.crval[0].to_radians(), self.crval[1].to_radians());
        (ra.rem_euclid(2.0 * PI).to_degrees(), dec.to_degrees())
    }

    /// Zero-based pixel position of `(ra, dec)` in degrees, `None` for
    /// positions 90 degrees or more from the reference point.
    pub fn world2pix(&self, ra: f64, dec: f64) -> Option<Vec2D> {
        let (xi, eta) = project(
            ra.to_radians(), dec.to_radians(),
            self.crval[0].to_radians(), self.crval[1].to_radians(),
        )?;
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let inv = &self.cd_inv;
        let offset = Vec2D {
            x: inv[0][0] * xi + inv[0][1] * eta,
            y: inv[1][0] * xi + inv[1][1] * eta,
        };
        Some(offset + self.reference_pixel())
    }
}

/// Value of the pixel containing `(ra, dec)`, `None` when it falls outside
/// the image.
pub fn get_pixel_value(image: &Array2<f64>, wcs: &Wcs, ra: f64, dec: f64) -> Option<f64> {
    let pixel = wcs.world2pix(ra, dec)?.pixel_index()?;
    image.get(pixel).copied()
}
