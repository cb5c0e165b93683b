//! Elliptical isophote fitting.
//!
//! The image is sampled along an ellipse at a fixed semi-major axis and the
//! intensities are fitted with first and second harmonics of the eccentric
//! anomaly `E`:
//!
//! ```text
//! I(E) = I0 + A1 sin E + B1 cos E + A2 sin 2E + B2 cos 2E
//! ```
//!
//! The largest harmonic is turned into a correction of the centre (`A1`,
//! `B1`), position angle (`A2`) or ellipticity (`B2`) through the local
//! radial gradient, and the ellipse is sampled again until the harmonics are
//! lost in the residual scatter. [`IsophoteFitter::fit_image`] repeats this
//! outwards and then inwards from a starting semi-major axis.

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView1, ArrayView2};
use ndarray_inverse::Inverse;
use serde::{Deserialize, Serialize};

use crate::geom::Vec2D;
use crate::{KungpaoError, Result};

pub const DEFAULT_SMA: f64 = 10.0;
pub const DEFAULT_EPS: f64 = 0.2;
/// ellipticity used in place of an exact circle
pub const MIN_EPS: f64 = 0.05;
pub const MAX_EPS: f64 = 0.95;
const MIN_SAMPLES: usize = 16;
/// innermost semi-major axis reached when going inwards
const MIN_INWARD_SMA: f64 = 0.5;

/// Centre, semi-major axis, ellipticity `1 - b/a` and position angle of an
/// ellipse. `x0` is a column, `y0` a row and `pa` is in radians,
/// counter-clockwise from +x.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct EllipseGeometry {
    pub x0: f64,
    pub y0: f64,
    pub sma: f64,
    pub eps: f64,
    pub pa: f64,
}

impl EllipseGeometry {
    pub fn new(x0: f64, y0: f64, sma: f64, eps: f64, pa: f64) -> Self {
        Self { x0, y0, sma, eps, pa }
    }

    /// Position at eccentric anomaly `e`.
    pub fn point(&self, e: f64) -> Vec2D {
        let b = self.sma * (1.0 - self.eps);
        let (sin_e, cos_e) = e.sin_cos();
        let (sin_p, cos_p) = self.pa.sin_cos();
        Vec2D {
            x: self.x0 + self.sma * cos_e * cos_p - b * sin_e * sin_p,
            y: self.y0 + self.sma * cos_e * sin_p + b * sin_e * cos_p,
        }
    }

    fn with_sma(&self, sma: f64) -> Self {
        Self { sma, ..*self }
    }
}

/// Fitting parameters, all with defaults.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct IsophoteConfig {
    /// growth of the semi-major axis between isophotes, a fraction of it or
    /// pixels when `linear`
    pub step: f64,
    pub linear: bool,
    /// converged once the largest harmonic is below `conver` times the rms
    /// of the harmonic fit residuals
    pub conver: f64,
    pub minit: usize,
    pub maxit: usize,
    /// minimum fraction of usable samples
    pub fflag: f64,
    /// maximum relative error of the radial gradient
    pub maxgerr: f64,
    pub sclip: f64,
    /// sigma clipping iterations on each sample, 0 disables clipping
    pub nclip: usize,
    /// a central isophote is added when this is 0
    pub minsma: f64,
    pub maxsma: Option<f64>,
    /// geometry is held fixed beyond this semi-major axis
    pub maxrit: Option<f64>,
    pub fixgeom: bool,
}

impl Default for IsophoteConfig {
    fn default() -> Self {
        Self {
            step: 0.1,
            linear: false,
            conver: 0.05,
            minit: 10,
            maxit: 50,
            fflag: 0.7,
            maxgerr: 0.5,
            sclip: 3.0,
            nclip: 0,
            minsma: 0.0,
            maxsma: None,
            maxrit: None,
            fixgeom: false,
        }
    }
}

impl IsophoteConfig {
    pub fn from_yaml(filename: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(filename)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn to_yaml(&self, filename: &str) -> Result<()> {
        std::fs::write(filename, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    fn grow(&self, sma: f64, step: f64) -> f64 {
        if self.linear { sma + step } else { sma * (1.0 + step) }
    }

    /// step that undoes one outward step
    fn inward_step(&self) -> f64 {
        if self.linear { -self.step } else { 1.0 / (1.0 + self.step) - 1.0 }
    }

    /// radial offset used to measure the gradient at `sma`
    fn radial_step(&self, sma: f64) -> f64 {
        if self.linear { self.step } else { sma * self.step }
    }
}

/// Why fitting an isophote stopped. Serialized as the integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
pub enum StopCode {
    Converged,
    /// fewer than `fflag` of the samples were usable
    TooManyFlagged,
    /// `maxit` reached, the iteration with the smallest harmonic is kept
    MaxIterations,
    HarmonicFitFailed,
    /// sampled with the geometry it was given
    FixedEllipse,
    /// diverged and was resampled with a neighbouring isophote's geometry
    FailedFit,
    /// unreliable gradient or centre off the image
    Diverged,
}

impl StopCode {
    pub fn code(self) -> i32 {
        match self {
            StopCode::Converged => 0,
            StopCode::TooManyFlagged => 1,
            StopCode::MaxIterations => 2,
            StopCode::HarmonicFitFailed => 3,
            StopCode::FixedEllipse => 4,
            StopCode::FailedFit => 5,
            StopCode::Diverged => -1,
        }
    }
}

impl From<StopCode> for i32 {
    fn from(value: StopCode) -> Self {
        value.code()
    }
}

/// One fitted isophote.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Isophote {
    #[serde(flatten)]
    pub geometry: EllipseGeometry,
    /// mean intensity along the ellipse
    pub intens: f64,
    pub int_err: f64,
    pub pix_stddev: f64,
    /// radial intensity gradient, per pixel of semi-major axis
    pub grad: f64,
    pub grad_error: Option<f64>,
    pub grad_r_error: Option<f64>,
    pub ndata: usize,
    pub nflag: usize,
    pub niter: usize,
    pub stop_code: StopCode,
    #[serde(skip)]
    pub valid: bool,
}

/// Bilinear interpolation at column `x`, row `y`. `None` off the image or
/// next to a non-finite pixel.
fn bilinear(image: ArrayView2<f64>, x: f64, y: f64) -> Option<f64> {
    let (rows, cols) = image.dim();
    if !(x >= 0.0 && y >= 0.0 && x <= (cols - 1) as f64 && y <= (rows - 1) as f64) {
        return None;
    }
    let ix = (x.floor() as usize).min(cols - 2);
    let iy = (y.floor() as usize).min(rows - 2);
    let (tx, ty) = (x - ix as f64, y - iy as f64);
    let value = image[[iy, ix]] * (1.0 - tx) * (1.0 - ty)
        + image[[iy, ix + 1]] * tx * (1.0 - ty)
        + image[[iy + 1, ix]] * (1.0 - tx) * ty
        + image[[iy + 1, ix + 1]] * tx * ty;
    value.is_finite().then_some(value)
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn harmonic_term(e: f64, k: usize) -> f64 {
    match k {
        0 => 1.0,
        1 => e.sin(),
        2 => e.cos(),
        3 => (2.0 * e).sin(),
        _ => (2.0 * e).cos(),
    }
}

/// `I0 + A1 sin E + B1 cos E + A2 sin 2E + B2 cos 2E`
pub fn harmonic_model(e: f64, coeffs: &[f64; 5]) -> f64 {
    coeffs.iter().enumerate().map(|(k, c)| c * harmonic_term(e, k)).sum()
}

/// Least squares `[I0, A1, B1, A2, B2]` of `values` sampled at eccentric
/// anomalies `angles`.
pub fn fit_harmonics(angles: &[f64], values: &[f64]) -> Result<[f64; 5]> {
    if angles.len() != values.len() {
        return Err(KungpaoError::LengthMismatch { x: angles.len(), y: values.len() });
    }
    if angles.len() < 5 {
        return Err(KungpaoError::LinalgError(format!(
            "{} samples cannot constrain 5 harmonic coefficients", angles.len()
        )));
    }
    let f_matrix = Array2::from_shape_fn((angles.len(), 5), |(i, k)| harmonic_term(angles[i], k));
    let f_t = f_matrix.t();
    let gram: Array2<f64> = f_t.dot(&f_matrix);
    let gram_inv = match gram.inv() {
        Some(inv) => inv,
        None => return Err(KungpaoError::LinalgError(
            "harmonic normal equations are singular".to_string()
        )),
    };
    let c = gram_inv.dot(&f_t.dot(&ArrayView1::from(values)));
    Ok([c[0], c[1], c[2], c[3], c[4]])
}

/// Intensities along one ellipse with the radial gradient there.
#[derive(Clone, Debug)]
struct Sample {
    geometry: EllipseGeometry,
    angles: Vec<f64>,
    values: Vec<f64>,
    total: usize,
    mean: f64,
    stddev: f64,
    gradient: f64,
    gradient_error: Option<f64>,
}

/// `(angles, values, attempted)` along `geometry`, sigma clipped
fn sample_ellipse(image: ArrayView2<f64>, geometry: &EllipseGeometry, config: &IsophoteConfig) -> (Vec<f64>, Vec<f64>, usize) {
    let total = ((2.0 * PI * geometry.sma).round() as usize).max(MIN_SAMPLES);
    let mut points: Vec<(f64, f64)> = (0..total).filter_map(|i| {
        let e = 2.0 * PI * i as f64 / total as f64;
        let p = geometry.point(e);
        bilinear(image, p.x, p.y).map(|v| (e, v))
    }).collect();
    for _ in 0..config.nclip {
        let values: Vec<f64> = points.iter().map(|p| p.1).collect();
        let (mean, std) = mean_std(&values);
        let before = points.len();
        points.retain(|&(_, v)| (v - mean).abs() <= config.sclip * std);
        if points.len() == before {
            break;
        }
    }
    let (angles, values) = points.into_iter().unzip();
    (angles, values, total)
}

impl Sample {
    fn take(
        image: ArrayView2<f64>,
        geometry: EllipseGeometry,
        config: &IsophoteConfig,
        previous_gradient: Option<f64>,
    ) -> Self {
        let (angles, values, total) = sample_ellipse(image, &geometry, config);
        let (mean, stddev) = mean_std(&values);
        let mut sample = Self {
            geometry,
            angles,
            values,
            total,
            mean,
            stddev,
            gradient: f64::NAN,
            gradient_error: None,
        };
        let step = config.radial_step(geometry.sma);
        let (mut gradient, mut error) = sample.gradient_at(image, config, step);
        // a gradient much shallower than the last one is measured again
        // further out, then extrapolated
        if let Some(previous) = previous_gradient {
            if !(gradient < previous / 3.0) {
                (gradient, error) = sample.gradient_at(image, config, 2.0 * step);
            }
            if !(gradient < previous / 3.0) {
                gradient = 0.8 * previous;
                error = None;
            }
        }
        sample.gradient = gradient;
        sample.gradient_error = error;
        sample
    }

    fn gradient_at(&self, image: ArrayView2<f64>, config: &IsophoteConfig, step: f64) -> (f64, Option<f64>) {
        let outer = self.geometry.with_sma(self.geometry.sma + step);
        let (_, values, _) = sample_ellipse(image, &outer, config);
        let (mean, stddev) = mean_std(&values);
        let gradient = (mean - self.mean) / step;
        let error = (stddev.powi(2) / values.len() as f64
            + self.stddev.powi(2) / self.values.len() as f64).sqrt() / step;
        (gradient, error.is_finite().then_some(error))
    }

    fn gradient_relative_error(&self) -> Option<f64> {
        self.gradient_error.map(|e| (e / self.gradient).abs())
    }

    fn too_many_flagged(&self, fflag: f64) -> bool {
        (self.values.len() as f64) < fflag * self.total as f64
    }
}

impl Isophote {
    fn from_sample(sample: &Sample, niter: usize, valid: bool, stop_code: StopCode) -> Self {
        let ndata = sample.values.len();
        Self {
            geometry: sample.geometry,
            intens: sample.mean,
            int_err: sample.stddev / (ndata as f64).sqrt(),
            pix_stddev: sample.stddev,
            grad: sample.gradient,
            grad_error: sample.gradient_error,
            grad_r_error: sample.gradient_relative_error(),
            ndata,
            nflag: sample.total - ndata,
            niter,
            stop_code,
            valid,
        }
    }
}

/// Geometry after correcting the harmonic `index` (0: A1, 1: B1, 2: A2,
/// 3: B2) of amplitude `harmonic`.
fn correct(geometry: &EllipseGeometry, index: usize, harmonic: f64, gradient: f64) -> EllipseGeometry {
    let mut g = *geometry;
    match index {
        0 => {
            // along the minor axis
            let shift = -harmonic * (1.0 - g.eps) / gradient;
            g.x0 -= shift * g.pa.sin();
            g.y0 += shift * g.pa.cos();
        },
        1 => {
            let shift = -harmonic / gradient;
            g.x0 += shift * g.pa.cos();
            g.y0 += shift * g.pa.sin();
        },
        2 => {
            let q = 1.0 - g.eps.max(MIN_EPS);
            g.pa = (g.pa + 2.0 * harmonic * q / (g.sma * gradient * (q * q - 1.0))).rem_euclid(PI);
        },
        _ => {
            g.eps = (g.eps - 2.0 * harmonic * (1.0 - g.eps) / (g.sma * gradient)).min(MAX_EPS);
        },
    }
    // crossing a circle swaps the axes
    if g.eps < 0.0 {
        g.eps = (-g.eps).min(MAX_EPS);
        g.pa = if g.pa < PI / 2.0 { g.pa + PI / 2.0 } else { g.pa - PI / 2.0 };
    }
    if g.eps == 0.0 {
        g.eps = MIN_EPS;
    }
    g
}

/// Fits isophotes on one image.
pub struct IsophoteFitter<'a> {
    image: ArrayView2<'a, f64>,
    geometry: EllipseGeometry,
    config: IsophoteConfig,
}

impl<'a> IsophoteFitter<'a> {
    /// `geometry` is the first guess, by default a `DEFAULT_SMA` ellipse of
    /// ellipticity `DEFAULT_EPS` on the image centre.
    pub fn new(image: ArrayView2<'a, f64>, geometry: Option<EllipseGeometry>, config: IsophoteConfig) -> Result<Self> {
        let (rows, cols) = image.dim();
        if rows < 2 || cols < 2 {
            return Err(KungpaoError::Isophote(format!(
                "cannot sample ellipses on a ({}, {}) image", rows, cols
            )));
        }
        let geometry = geometry.unwrap_or_else(|| {
            EllipseGeometry::new(cols as f64 / 2.0, rows as f64 / 2.0, DEFAULT_SMA, DEFAULT_EPS, 0.0)
        });
        let finite = [geometry.x0, geometry.y0, geometry.pa].iter().all(|v| v.is_finite());
        if !finite || !(geometry.sma > 0.0) || !(0.0..1.0).contains(&geometry.eps) {
            return Err(KungpaoError::Isophote(format!("invalid starting ellipse {:?}", geometry)));
        }
        if !(config.step > 0.0) || config.maxit == 0 || !(0.0..=1.0).contains(&config.fflag) {
            return Err(KungpaoError::Isophote(format!(
                "invalid fitting parameters: step {}, maxit {}, fflag {}",
                config.step, config.maxit, config.fflag
            )));
        }
        Ok(Self { image, geometry, config })
    }

    pub fn geometry(&self) -> &EllipseGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &IsophoteConfig {
        &self.config
    }

    /// Fit a single isophote at `sma` starting from the fitter's geometry.
    pub fn fit_isophote(&self, sma: f64) -> Isophote {
        self.fit_at(sma, self.geometry, self.config.fixgeom, false, self.config.minit)
    }

    fn fit_at(
        &self,
        sma: f64,
        start: EllipseGeometry,
        fixed: bool,
        going_inwards: bool,
        minit: usize,
    ) -> Isophote {
        let geometry = start.with_sma(sma);
        if sma <= 0.0 {
            self.central(&geometry)
        } else if fixed || self.config.maxrit.map_or(false, |maxrit| sma > maxrit) {
            self.sample_fixed(geometry)
        } else {
            self.iterate(geometry, going_inwards, minit)
        }
    }

    fn central(&self, geometry: &EllipseGeometry) -> Isophote {
        let value = bilinear(self.image, geometry.x0, geometry.y0);
        Isophote {
            geometry: geometry.with_sma(0.0),
            intens: value.unwrap_or(f64::NAN),
            int_err: 0.0,
            pix_stddev: 0.0,
            grad: 0.0,
            grad_error: None,
            grad_r_error: None,
            ndata: usize::from(value.is_some()),
            nflag: usize::from(value.is_none()),
            niter: 0,
            stop_code: StopCode::Converged,
            valid: true,
        }
    }

    fn sample_fixed(&self, geometry: EllipseGeometry) -> Isophote {
        let sample = Sample::take(self.image, geometry, &self.config, None);
        let stop_code = if sample.too_many_flagged(self.config.fflag) {
            StopCode::TooManyFlagged
        } else {
            StopCode::FixedEllipse
        };
        Isophote::from_sample(&sample, 0, true, stop_code)
    }

    fn iterate(&self, geometry: EllipseGeometry, going_inwards: bool, minit: usize) -> Isophote {
        let config = &self.config;
        let (rows, cols) = self.image.dim();
        let mut sample = Sample::take(self.image, geometry, config, None);
        let mut best = sample.clone();
        let mut best_amplitude = f64::INFINITY;
        let mut gradient_exceeded = false;

        for i in 0..config.maxit {
            if sample.too_many_flagged(config.fflag) {
                return Isophote::from_sample(&sample, i + 1, true, StopCode::TooManyFlagged);
            }
            let coeffs = match fit_harmonics(&sample.angles, &sample.values) {
                Ok(coeffs) => coeffs,
                Err(e) => {
                    log::debug!("sma {:.2}: {}", sample.geometry.sma, e);
                    return Isophote::from_sample(&sample, i + 1, false, StopCode::HarmonicFitFailed);
                },
            };
            let (index, largest) = coeffs[1..].iter()
                .copied()
                .enumerate()
                .fold((0, 0.0), |best, (k, c)| if c.abs() > f64::abs(best.1) { (k, c) } else { best });
            if largest.abs() < best_amplitude {
                best_amplitude = largest.abs();
                best = sample.clone();
            }

            let residuals: Vec<f64> = sample.angles.iter()
                .zip(&sample.values)
                .map(|(&e, &v)| v - harmonic_model(e, &coeffs))
                .collect();
            let (_, residual_rms) = mean_std(&residuals);
            if config.conver * residual_rms > largest.abs() && i + 1 >= minit {
                return Isophote::from_sample(&sample, i + 1, true, StopCode::Converged);
            }

            let corrected = correct(&sample.geometry, index, largest, sample.gradient);
            sample = Sample::take(self.image, corrected, config, Some(sample.gradient));

            if !going_inwards {
                let unreliable = sample.gradient >= 0.0
                    || sample.gradient_relative_error().map_or(true, |e| e > config.maxgerr);
                if unreliable {
                    if gradient_exceeded {
                        return Isophote::from_sample(&sample, i + 1, true, StopCode::Diverged);
                    }
                    gradient_exceeded = true;
                }
            }
            let g = &sample.geometry;
            if !(1.0..=cols as f64).contains(&g.x0) || !(1.0..=rows as f64).contains(&g.y0) {
                return Isophote::from_sample(&sample, i + 1, true, StopCode::Diverged);
            }
        }
        Isophote::from_sample(&best, config.maxit, true, StopCode::MaxIterations)
    }

    /// Replace the last isophote by a resampling at the same semi-major axis
    /// with the geometry of the first (`from_first`) or the new last one.
    fn fix_last(&self, isophotes: &mut Vec<Isophote>, from_first: bool) {
        if isophotes.len() < 2 {
            return;
        }
        let Some(failed) = isophotes.pop() else { return };
        let reference = if from_first { isophotes.first() } else { isophotes.last() };
        let Some(reference) = reference else { return };
        let sample = Sample::take(self.image, reference.geometry.with_sma(failed.geometry.sma), &self.config, None);
        let stop_code = if failed.stop_code.code() < 0 { StopCode::FailedFit } else { failed.stop_code };
        isophotes.push(Isophote::from_sample(&sample, failed.niter, failed.valid, stop_code));
    }

    /// Isophotes from `sma0` (the starting geometry's by default) out to
    /// `maxsma` or until the fits fail, then in towards `minsma`, sorted by
    /// semi-major axis. Empty when the first isophote cannot be fitted.
    pub fn fit_image(&self, sma0: Option<f64>) -> Vec<Isophote> {
        let config = &self.config;
        let (rows, cols) = self.image.dim();
        let outermost = ((rows * rows + cols * cols) as f64).sqrt();
        let mut isophotes: Vec<Isophote> = vec![];
        let mut sma = sma0.unwrap_or(self.geometry.sma);
        let mut fixed = config.fixgeom;
        let mut first = true;

        loop {
            // the first isophote starts furthest from the truth
            let minit = if first { 2 * config.minit } else { config.minit };
            first = false;
            let start = isophotes.last().map_or(self.geometry, |iso| iso.geometry);
            let isophote = self.fit_at(sma, start, fixed, false, minit);
            log::debug!("sma {:.2}: {:?} after {} iterations", sma, isophote.stop_code, isophote.niter);
            let stop_code = isophote.stop_code;
            if isophote.valid {
                isophotes.push(isophote);
            }
            if stop_code == StopCode::Diverged || stop_code == StopCode::TooManyFlagged {
                if isophotes.len() <= 1 {
                    log::warn!("no meaningful fit was possible at sma {:.2}", sma);
                    return vec![];
                }
                self.fix_last(&mut isophotes, false);
                let n = isophotes.len();
                let last = &isophotes[n - 1];
                let repeated_failure = last.stop_code == StopCode::FailedFit
                    && isophotes[n - 2].stop_code == StopCode::FailedFit;
                if n > 2 && (repeated_failure || last.stop_code == StopCode::TooManyFlagged) {
                    if config.maxsma.map_or(false, |maxsma| maxsma > last.geometry.sma) {
                        fixed = true;
                    } else {
                        break;
                    }
                }
            }
            sma = config.grow(sma, config.step);
            if config.maxsma.map_or(false, |maxsma| sma >= maxsma) || sma > outermost {
                break;
            }
        }

        let Some(start) = isophotes.first().map(|iso| iso.geometry) else {
            return vec![];
        };
        let step = config.inward_step();
        let mut sma = config.grow(start.sma, step);
        while sma > config.minsma.max(MIN_INWARD_SMA) {
            let start = isophotes.last().map_or(self.geometry, |iso| iso.geometry);
            let isophote = self.fit_at(sma, start, fixed, true, config.minit);
            log::debug!("sma {:.2}: {:?} after {} iterations", sma, isophote.stop_code, isophote.niter);
            if isophote.valid {
                let diverged = isophote.stop_code.code() < 0;
                isophotes.push(isophote);
                if diverged {
                    self.fix_last(&mut isophotes, true);
                }
            }
            sma = config.grow(sma, step);
        }
        if config.minsma == 0.0 {
            if let Some(last) = isophotes.last() {
                let central = self.central(&last.geometry);
                isophotes.push(central);
            }
        }

        isophotes.sort_by(|a, b| a.geometry.sma.total_cmp(&b.geometry.sma));
        log::info!(
            "fitted {} isophotes between sma {:.2} and {:.2}",
            isophotes.len(),
            isophotes.first().map_or(0.0, |iso| iso.geometry.sma),
            isophotes.last().map_or(0.0, |iso| iso.geometry.sma),
        );
        isophotes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const TRUE_EPS: f64 = 0.4;
    const TRUE_PA: f64 = PI / 6.0;

    /// exponential disc on (50, 50) with scale length 5 along the major axis
    fn galaxy() -> Array2<f64> {
        let (sin_p, cos_p) = TRUE_PA.sin_cos();
        Array2::from_shape_fn((101, 101), |(y, x)| {
            let (dx, dy) = (x as f64 - 50.0, y as f64 - 50.0);
            let u = dx * cos_p + dy * sin_p;
            let v = (-dx * sin_p + dy * cos_p) / (1.0 - TRUE_EPS);
            1000.0 * (-(u * u + v * v).sqrt() / 5.0).exp()
        })
    }

    fn pa_offset(pa: f64, target: f64) -> f64 {
        let d = (pa - target).rem_euclid(PI);
        d.min(PI - d)
    }

    #[test]
    fn test_bilinear() {
        let plane = Array2::from_shape_fn((4, 5), |(y, x)| 2.0 * x as f64 + 3.0 * y as f64);
        assert_abs_diff_eq!(bilinear(plane.view(), 1.5, 2.25).unwrap(), 9.75, epsilon = 1e-12);
        assert_abs_diff_eq!(bilinear(plane.view(), 4.0, 3.0).unwrap(), 17.0, epsilon = 1e-12);
        assert_eq!(bilinear(plane.view(), -0.1, 1.0), None);
        assert_eq!(bilinear(plane.view(), 1.0, 3.5), None);

        let mut holed = plane.clone();
        holed[[1, 1]] = f64::NAN;
        assert_eq!(bilinear(holed.view(), 1.5, 1.5), None);
        assert!(bilinear(holed.view(), 2.5, 2.5).is_some());
    }

    #[test]
    fn test_fit_harmonics() {
        let truth = [3.0, 0.5, -0.2, 0.1, 0.7];
        let angles: Vec<f64> = (0..40).map(|i| 2.0 * PI * i as f64 / 40.0).collect();
        let values: Vec<f64> = angles.iter().map(|&e| harmonic_model(e, &truth)).collect();
        let coeffs = fit_harmonics(&angles, &values).unwrap();
        for (c, t) in coeffs.iter().zip(truth) {
            assert_abs_diff_eq!(*c, t, epsilon = 1e-10);
        }
        assert!(matches!(fit_harmonics(&angles[..4], &values[..4]), Err(KungpaoError::LinalgError(_))));
        assert!(matches!(fit_harmonics(&angles, &values[..3]), Err(KungpaoError::LengthMismatch { .. })));
    }

    #[test]
    fn test_sma_steps() {
        let geometric = IsophoteConfig::default();
        assert_abs_diff_eq!(geometric.grow(10.0, geometric.step), 11.0, epsilon = 1e-12);
        assert_abs_diff_eq!(geometric.grow(11.0, geometric.inward_step()), 10.0, epsilon = 1e-12);
        let linear = IsophoteConfig { step: 2.0, linear: true, ..Default::default() };
        assert_eq!(linear.grow(10.0, linear.inward_step()), 8.0);
        assert_eq!(linear.radial_step(40.0), 2.0);
    }

    #[test]
    fn test_constant_image_sample() {
        let flat = Array2::from_elem((40, 40), 7.0);
        let config = IsophoteConfig::default();
        let sample = Sample::take(flat.view(), EllipseGeometry::new(20.0, 20.0, 8.0, 0.3, 1.0), &config, None);
        assert_eq!(sample.values.len(), sample.total);
        assert_abs_diff_eq!(sample.mean, 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.stddev, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.gradient, 0.0, epsilon = 1e-12);

        // half of the ellipse falls off the left edge
        let edge = Sample::take(flat.view(), EllipseGeometry::new(0.0, 20.0, 8.0, 0.0, 0.0), &config, None);
        assert!(edge.too_many_flagged(config.fflag));
    }

    #[test]
    fn test_fit_recovers_geometry() {
        let image = galaxy();
        let start = EllipseGeometry::new(50.0, 50.0, 10.0, DEFAULT_EPS, 0.0);
        let fitter = IsophoteFitter::new(image.view(), Some(start), IsophoteConfig::default()).unwrap();
        let iso = fitter.fit_isophote(10.0);
        assert!(iso.valid);
        assert_ne!(iso.stop_code, StopCode::Diverged);
        assert_abs_diff_eq!(iso.geometry.eps, TRUE_EPS, epsilon = 0.03);
        assert!(pa_offset(iso.geometry.pa, TRUE_PA) < 0.05, "pa {}", iso.geometry.pa);
        assert_abs_diff_eq!(iso.geometry.x0, 50.0, epsilon = 0.2);
        assert_abs_diff_eq!(iso.geometry.y0, 50.0, epsilon = 0.2);
        assert_abs_diff_eq!(iso.intens, 1000.0 * (-2.0f64).exp(), epsilon = 5.0);
        assert!(iso.grad < 0.0);
        assert_eq!(iso.ndata + iso.nflag, 63);
    }

    #[test]
    fn test_fit_recovers_centre() {
        let image = galaxy();
        let start = EllipseGeometry::new(51.0, 49.2, 12.0, TRUE_EPS, TRUE_PA);
        let fitter = IsophoteFitter::new(image.view(), Some(start), IsophoteConfig::default()).unwrap();
        let iso = fitter.fit_isophote(12.0);
        assert_abs_diff_eq!(iso.geometry.x0, 50.0, epsilon = 0.15);
        assert_abs_diff_eq!(iso.geometry.y0, 50.0, epsilon = 0.15);
    }

    #[test]
    fn test_fit_image_profile() {
        let image = galaxy();
        let config = IsophoteConfig { maxsma: Some(30.0), ..Default::default() };
        let start = EllipseGeometry::new(50.0, 50.0, 10.0, DEFAULT_EPS, 0.0);
        let fitter = IsophoteFitter::new(image.view(), Some(start), config).unwrap();
        let isophotes = fitter.fit_image(None);

        assert!(isophotes.len() > 20);
        assert!(isophotes.windows(2).all(|w| w[0].geometry.sma < w[1].geometry.sma));
        let central = &isophotes[0];
        assert_eq!(central.geometry.sma, 0.0);
        assert!(central.intens > 700.0);
        let outer = isophotes[isophotes.len() - 1].geometry.sma;
        assert!((25.0..30.0).contains(&outer), "outermost sma {}", outer);

        let disc: Vec<&Isophote> = isophotes.iter()
            .filter(|iso| (5.0..=25.0).contains(&iso.geometry.sma))
            .collect();
        assert!(!disc.is_empty());
        for iso in disc {
            assert_abs_diff_eq!(iso.geometry.eps, TRUE_EPS, epsilon = 0.05);
            assert!(pa_offset(iso.geometry.pa, TRUE_PA) < 0.1, "sma {} pa {}", iso.geometry.sma, iso.geometry.pa);
        }
        let profile: Vec<f64> = isophotes.iter()
            .filter(|iso| iso.geometry.sma >= 2.0)
            .map(|iso| iso.intens)
            .collect();
        assert!(profile.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_fixed_geometry() {
        let image = galaxy();
        let config = IsophoteConfig { maxsma: Some(20.0), fixgeom: true, ..Default::default() };
        let start = EllipseGeometry::new(50.0, 50.0, 10.0, DEFAULT_EPS, 0.0);
        let fitter = IsophoteFitter::new(image.view(), Some(start), config).unwrap();
        let isophotes = fitter.fit_image(None);
        assert!(!isophotes.is_empty());
        for iso in isophotes.iter().filter(|iso| iso.geometry.sma > 0.0) {
            assert_eq!(iso.stop_code, StopCode::FixedEllipse);
            assert_eq!(iso.niter, 0);
            assert_eq!((iso.geometry.x0, iso.geometry.eps, iso.geometry.pa), (50.0, DEFAULT_EPS, 0.0));
        }
    }

    #[test]
    fn test_blank_image_gives_nothing() {
        let blank = Array2::from_elem((50, 50), f64::NAN);
        let fitter = IsophoteFitter::new(blank.view(), None, IsophoteConfig::default()).unwrap();
        assert_eq!(fitter.geometry().x0, 25.0);
        assert!(fitter.fit_image(None).is_empty());
    }

    #[test]
    fn test_invalid_inputs() {
        let image = Array2::<f64>::zeros((1, 10));
        assert!(matches!(
            IsophoteFitter::new(image.view(), None, IsophoteConfig::default()),
            Err(KungpaoError::Isophote(_))
        ));
        let image = Array2::<f64>::zeros((10, 10));
        let flat = EllipseGeometry::new(5.0, 5.0, 3.0, 1.0, 0.0);
        assert!(IsophoteFitter::new(image.view(), Some(flat), IsophoteConfig::default()).is_err());
        let no_step = IsophoteConfig { step: 0.0, ..Default::default() };
        assert!(IsophoteFitter::new(image.view(), None, no_step).is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: IsophoteConfig = serde_yaml::from_str("step: 2.0\nlinear: true\nmaxsma: 40.0\n").unwrap();
        assert_eq!(config.maxsma, Some(40.0));
        assert_eq!(config.maxit, 50);
        assert_eq!(config.maxrit, None);
        assert!(config.linear);
    }

    #[test]
    fn test_stop_code_serializes_as_integer() {
        let iso = IsophoteFitter::new(galaxy().view(), None, IsophoteConfig::default())
            .unwrap()
            .central(&EllipseGeometry::new(50.0, 50.0, 3.0, 0.2, 0.0));
        let json = serde_json::to_value(iso).unwrap();
        assert_eq!(json["stop_code"], 0);
        assert_eq!(json["sma"], 0.0);
        assert_eq!(json["intens"], 1000.0);
        assert!(json.get("valid").is_none());
    }
}
