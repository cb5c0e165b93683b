//! Mesh-based sky background estimation.
//!
//! The image is cut into `bw x bh` cells, each cell gets a sigma-clipped sky
//! level and rms, the cell grid is median filtered over `fw x fh` cells and
//! then interpolated back to full resolution.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{KungpaoError, Result};

const CLIP_KAPPA: f64 = 3.0;
const CLIP_MAX_ITER: usize = 20;
/// beyond this (mean - median) / sigma the cell is too crowded for the mode estimate
const MODE_SKEW_LIMIT: f64 = 0.3;

/// Mesh and filter sizes for [`Background::new`].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct BackgroundParams {
    /// mesh width, pixels
    pub bw: usize,
    /// mesh height, pixels
    pub bh: usize,
    /// filter width, meshes
    pub fw: usize,
    /// filter height, meshes
    pub fh: usize,
}

impl BackgroundParams {
    pub fn new(bw: usize, bh: usize, fw: usize, fh: usize) -> Self {
        Self { bw, bh, fw, fh }
    }
}

/// Sky level and rms over an image, plus their global summaries.
#[derive(Clone, Debug)]
pub struct Background {
    back: Array2<f64>,
    rms: Array2<f64>,
    global_back: f64,
    global_rms: f64,
}

pub(crate) fn check_shape(what: &'static str, expected: &[usize], found: &[usize]) -> Result<()> {
    if expected != found {
        return Err(KungpaoError::ShapeMismatch {
            what,
            expected: [expected[0], expected[1]],
            found: [found[0], found[1]],
        });
    }
    Ok(())
}

/// median of a non-empty slice, reordering it
pub(crate) fn median_in_place(values: &mut [f64]) -> f64 {
    let n = values.len();
    let mid = n / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower = values[..mid].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower + upper)
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Iteratively clip around the median and return the (mode, sigma) estimate.
fn clipped_stats(samples: &mut Vec<f64>) -> (f64, f64) {
    for _ in 0..CLIP_MAX_ITER {
        let (_, sigma) = mean_std(samples);
        if sigma <= 0.0 {
            break;
        }
        let median = median_in_place(samples);
        let before = samples.len();
        samples.retain(|v| (v - median).abs() <= CLIP_KAPPA * sigma);
        if samples.len() == before || samples.len() < 3 {
            break;
        }
    }
    let (mean, sigma) = mean_std(samples);
    let median = median_in_place(samples);
    if sigma > 0.0 && ((mean - median) / sigma).abs() < MODE_SKEW_LIMIT {
        (2.5 * median - 1.5 * mean, sigma)
    } else {
        (median, sigma)
    }
}

/// (lower index, upper index, weight of upper) for interpolating between mesh centres
fn axis_weights(pos: usize, n: usize, step: usize) -> (usize, usize, f64) {
    if n < 2 {
        return (0, 0, 0.0);
    }
    let f = (pos as f64 + 0.5) / step as f64 - 0.5;
    let i0 = (f.floor().max(0.0) as usize).min(n - 2);
    let t = (f - i0 as f64).clamp(0.0, 1.0);
    (i0, i0 + 1, t)
}

fn median_filter(mesh: &Array2<f64>, fw: usize, fh: usize) -> Array2<f64> {
    let (ny, nx) = mesh.dim();
    let (rx, ry) = (fw / 2, fh / 2);
    if rx == 0 && ry == 0 {
        return mesh.clone();
    }
    let mut window = Vec::with_capacity((2 * rx + 1) * (2 * ry + 1));
    Array2::from_shape_fn((ny, nx), |(cy, cx)| {
        window.clear();
        for y in cy.saturating_sub(ry)..(cy + ry + 1).min(ny) {
            for x in cx.saturating_sub(rx)..(cx + rx + 1).min(nx) {
                window.push(mesh[[y, x]]);
            }
        }
        median_in_place(&mut window)
    })
}

fn fill_invalid(mesh: &mut Array2<f64>, valid: &Array2<bool>) {
    let (ny, nx) = mesh.dim();
    let source = mesh.clone();
    for cy in 0..ny {
        for cx in 0..nx {
            if valid[[cy, cx]] {
                continue;
            }
            let mut best: Option<(usize, f64)> = None;
            for sy in 0..ny {
                for sx in 0..nx {
                    if !valid[[sy, sx]] {
                        continue;
                    }
                    let d = cx.abs_diff(sx).pow(2) + cy.abs_diff(sy).pow(2);
                    if best.map_or(true, |(bd, _)| d < bd) {
                        best = Some((d, source[[sy, sx]]));
                    }
                }
            }
            if let Some((_, value)) = best {
                mesh[[cy, cx]] = value;
            }
        }
    }
}

fn interpolate(mesh: &Array2<f64>, shape: (usize, usize), params: &BackgroundParams) -> Result<Array2<f64>> {
    let (rows, cols) = shape;
    let (ny, nx) = mesh.dim();
    let mut out = vec![0.0; rows * cols];
    out.par_chunks_mut(cols.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            let (y0, y1, ty) = axis_weights(y, ny, params.bh);
            for (x, dst) in row.iter_mut().enumerate() {
                let (x0, x1, tx) = axis_weights(x, nx, params.bw);
                *dst = mesh[[y0, x0]] * (1.0 - tx) * (1.0 - ty)
                    + mesh[[y0, x1]] * tx * (1.0 - ty)
                    + mesh[[y1, x0]] * (1.0 - tx) * ty
                    + mesh[[y1, x1]] * tx * ty;
            }
        });
    Array2::from_shape_vec(shape, out)
        .map_err(|e| KungpaoError::Background(e.to_string()))
}

impl Background {
    /// Estimate the background of `image`, ignoring pixels where `mask` is
    /// true and any non-finite pixel.
    pub fn new(
        image: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        params: &BackgroundParams,
    ) -> Result<Self> {
        if let Some(mask) = &mask {
            check_shape("background mask", image.shape(), mask.shape())?;
        }
        if params.bw == 0 || params.bh == 0 {
            return Err(KungpaoError::Background("mesh size must be positive".to_string()));
        }
        let (rows, cols) = image.dim();
        let ny = rows.div_ceil(params.bh);
        let nx = cols.div_ceil(params.bw);

        let mut mesh_back = Array2::<f64>::zeros((ny, nx));
        let mut mesh_rms = Array2::<f64>::zeros((ny, nx));
        let mut valid = Array2::from_elem((ny, nx), false);
        let mut samples = Vec::with_capacity(params.bw * params.bh);

        for cy in 0..ny {
            let (y0, y1) = (cy * params.bh, ((cy + 1) * params.bh).min(rows));
            for cx in 0..nx {
                let (x0, x1) = (cx * params.bw, ((cx + 1) * params.bw).min(cols));
                samples.clear();
                for y in y0..y1 {
                    for x in x0..x1 {
                        let value = image[[y, x]];
                        let masked = mask.as_ref().map_or(false, |m| m[[y, x]]);
                        if !masked && value.is_finite() {
                            samples.push(value);
                        }
                    }
                }
                let cell_pixels = (y1 - y0) * (x1 - x0);
                if samples.is_empty() || samples.len() * 2 < cell_pixels {
                    continue;
                }
                let (mode, sigma) = clipped_stats(&mut samples);
                mesh_back[[cy, cx]] = mode;
                mesh_rms[[cy, cx]] = sigma;
                valid[[cy, cx]] = true;
            }
        }

        let n_valid = valid.iter().filter(|v| **v).count();
        if n_valid == 0 {
            return Err(KungpaoError::Background(
                "no mesh has enough unmasked pixels to estimate the background".to_string(),
            ));
        }
        log::debug!("background mesh {}x{}, {} of {} cells usable", nx, ny, n_valid, nx * ny);
        fill_invalid(&mut mesh_back, &valid);
        fill_invalid(&mut mesh_rms, &valid);

        let mesh_back = median_filter(&mesh_back, params.fw, params.fh);
        let mesh_rms = median_filter(&mesh_rms, params.fw, params.fh);

        let global_back = median_in_place(&mut mesh_back.iter().copied().collect::<Vec<f64>>());
        let global_rms = median_in_place(&mut mesh_rms.iter().copied().collect::<Vec<f64>>());

        Ok(Self {
            back: interpolate(&mesh_back, (rows, cols), params)?,
            rms: interpolate(&mesh_rms, (rows, cols), params)?,
            global_back,
            global_rms,
        })
    }

    /// per-pixel sky level
    pub fn back(&self) -> &Array2<f64> {
        &self.back
    }

    /// per-pixel sky rms
    pub fn rms(&self) -> &Array2<f64> {
        &self.rms
    }

    pub fn global_back(&self) -> f64 {
        self.global_back
    }

    pub fn global_rms(&self) -> f64 {
        self.global_rms
    }

    /// `image - back`
    pub fn subtract_from(&self, image: ArrayView2<f64>) -> Array2<f64> {
        &image - &self.back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn noisy_flat(shape: (usize, usize), level: f64, sigma: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(level, sigma).unwrap();
        Array2::from_shape_fn(shape, |_| normal.sample(&mut rng))
    }

    #[test]
    fn test_median_in_place() {
        assert_eq!(median_in_place(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_in_place(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median_in_place(&mut [7.0]), 7.0);
    }

    #[test]
    fn test_flat_background() {
        let image = noisy_flat((120, 100), 100.0, 1.0, 3);
        let bkg = Background::new(image.view(), None, &BackgroundParams::new(20, 20, 3, 3)).unwrap();
        assert_relative_eq!(bkg.global_back(), 100.0, epsilon = 0.1);
        assert_relative_eq!(bkg.global_rms(), 1.0, epsilon = 0.1);
        assert_eq!(bkg.back().dim(), (120, 100));
        assert_eq!(bkg.rms().dim(), (120, 100));
        assert!(bkg.back().iter().all(|v| (v - 100.0).abs() < 0.5));
    }

    #[test]
    fn test_gradient_follows() {
        let image = Array2::from_shape_fn((64, 256), |(_, x)| 500.0 + 4.0 * x as f64);
        let bkg = Background::new(image.view(), None, &BackgroundParams::new(32, 32, 1, 1)).unwrap();
        let left = bkg.back()[[32, 48]];
        let right = bkg.back()[[32, 208]];
        assert!(left < right);
        assert_relative_eq!(left, 500.0 + 4.0 * 48.0, epsilon = 5.0);
        assert_relative_eq!(right, 500.0 + 4.0 * 208.0, epsilon = 5.0);
    }

    #[test]
    fn test_mask_excludes_source() {
        let mut image = noisy_flat((60, 60), 10.0, 0.5, 9);
        let mut mask = Array2::from_elem((60, 60), false);
        for y in 0..20 {
            for x in 0..20 {
                image[[y, x]] = 1e4;
                mask[[y, x]] = true;
            }
        }
        let bkg = Background::new(image.view(), Some(mask.view()), &BackgroundParams::new(20, 20, 1, 1)).unwrap();
        assert_relative_eq!(bkg.back()[[10, 10]], 10.0, epsilon = 0.3);
    }

    #[test]
    fn test_nan_pixels_ignored() {
        let mut image = noisy_flat((40, 40), 5.0, 0.1, 1);
        image[[3, 3]] = f64::NAN;
        let bkg = Background::new(image.view(), None, &BackgroundParams::new(20, 20, 1, 1)).unwrap();
        assert!(bkg.back().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_fully_masked_fails() {
        let image = Array2::<f64>::zeros((10, 10));
        let mask = Array2::from_elem((10, 10), true);
        assert!(matches!(
            Background::new(image.view(), Some(mask.view()), &BackgroundParams::new(5, 5, 1, 1)),
            Err(KungpaoError::Background(_))
        ));
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let image = Array2::<f64>::zeros((10, 10));
        let mask = Array2::from_elem((10, 11), false);
        assert!(matches!(
            Background::new(image.view(), Some(mask.view()), &BackgroundParams::new(5, 5, 1, 1)),
            Err(KungpaoError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_mesh_larger_than_image() {
        let image = noisy_flat((30, 30), 2.0, 0.1, 5);
        let bkg = Background::new(image.view(), None, &BackgroundParams::new(150, 150, 7, 7)).unwrap();
        assert_relative_eq!(bkg.global_back(), 2.0, epsilon = 0.05);
    }
}
