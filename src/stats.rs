use ndarray::{Array1, Array2};
use ndarray_inverse::Inverse;

use crate::{KungpaoError, Result};

fn check_lengths(x: usize, y: usize) -> Result<()> {
    if x != y {
        return Err(KungpaoError::LengthMismatch { x, y });
    }
    Ok(())
}

/// plain median, `None` for empty data
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

/// Weighted mean of `data`. Without weights this is the arithmetic mean.
pub fn weighted_mean(data: &[f64], weights: Option<&[f64]>) -> Result<f64> {
    match weights {
        None => Ok(data.iter().sum::<f64>() / data.len() as f64),
        Some(weights) => {
            check_lengths(data.len(), weights.len())?;
            let total: f64 = weights.iter().sum();
            Ok(data.iter()
                .zip(weights.iter())
                .map(|(x, w)| x * w / total)
                .sum())
        }
    }
}

/// Weighted median of `data`.
///
/// A point carrying more than half the total weight is returned as is.
/// Otherwise the data are sorted and the cumulative weight is walked up to
/// the midpoint; landing exactly on the midpoint averages the two bracketing
/// values. `None` when there is no data or no positive weight.
pub fn weighted_median(data: &[f64], weights: Option<&[f64]>) -> Result<Option<f64>> {
    let weights = match weights {
        None => return Ok(median(data)),
        Some(weights) => weights,
    };
    check_lengths(data.len(), weights.len())?;
    if !weights.iter().any(|w| *w > 0.0) {
        return Ok(None);
    }

    let midpoint = 0.5 * weights.iter().sum::<f64>();
    let (heaviest, max_weight) = weights.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &w)| if w > best.1 { (i, w) } else { best });
    if max_weight > midpoint {
        return Ok(Some(data[heaviest]));
    }

    let mut pairs: Vec<(f64, f64)> = data.iter().copied().zip(weights.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut cumulative = 0.0;
    let mut below = None;
    for (i, (_, w)) in pairs.iter().enumerate() {
        cumulative += w;
        if cumulative <= midpoint {
            below = Some((i, cumulative));
        } else {
            break;
        }
    }
    match below {
        None => Ok(Some(pairs[0].0)),
        Some((i, cw)) if (cw - midpoint).abs() < f64::EPSILON && i + 1 < pairs.len() => {
            Ok(Some(0.5 * (pairs[i].0 + pairs[i + 1].0)))
        }
        Some((i, _)) => Ok(Some(pairs[(i + 1).min(pairs.len() - 1)].0)),
    }
}

/// Least-squares polynomial fit of order `order`, evaluated back at `x`.
///
/// `x` is rescaled onto [-1, 1] before building the normal equations to keep
/// the Gram matrix well conditioned.
pub fn simple_poly_fit(x: &[f64], y: &[f64], order: usize) -> Result<Vec<f64>> {
    check_lengths(x.len(), y.len())?;
    let n_coeffs = order + 1;
    if x.len() < n_coeffs {
        return Err(KungpaoError::LinalgError(format!(
            "{} points cannot constrain a polynomial of order {}", x.len(), order
        )));
    }

    let (lo, hi) = x.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let center = 0.5 * (lo + hi);
    let half_width = if hi > lo { 0.5 * (hi - lo) } else { 1.0 };

    let f_matrix = Array2::from_shape_fn((x.len(), n_coeffs), |(i, k)| {
        ((x[i] - center) / half_width).powi(k as i32)
    });
    let b = Array1::from(y.to_vec());

    let f_t = f_matrix.t();
    let gram: Array2<f64> = f_t.dot(&f_matrix);
    let gram_inv = match gram.inv() {
        Some(inv) => inv,
        None => return Err(KungpaoError::LinalgError(
            "Gram matrix of polynomial basis is not invertible".to_string()
        )),
    };
    let coeffs = gram_inv.dot(&f_t.dot(&b));
    Ok(f_matrix.dot(&coeffs).to_vec())
}
