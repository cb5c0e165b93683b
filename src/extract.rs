//! Threshold detection with multi-level deblending.
//!
//! Detection runs on a significance image: the (optionally smoothed) data
//! divided by the noise, either a scalar or a per-pixel map. Pixels above
//! `thr` are grouped with 8-connectivity, groups under `minarea` pixels are
//! dropped and the rest are deblended by walking `deb_n` exponentially
//! spaced levels from the detection threshold up to the group's peak.

use std::collections::VecDeque;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::background::check_shape;
use crate::geom::Vec2D;
use crate::{KungpaoError, Result};

const SMOOTHING_KERNEL: [[f64; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];

fn default_filter() -> bool {
    true
}

/// Detection and deblending parameters for [`extract`].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectionParams {
    /// threshold, in units of the noise
    pub thr: f64,
    /// minimum number of connected pixels
    pub minarea: usize,
    /// number of deblending levels
    pub deb_n: usize,
    /// minimum flux fraction for a deblended branch
    pub deb_c: f64,
    /// smooth with a 3x3 kernel before thresholding
    #[serde(default = "default_filter")]
    pub filter: bool,
}

impl DetectionParams {
    pub fn new(thr: f64, minarea: usize, deb_n: usize, deb_c: f64) -> Self {
        Self {
            thr,
            minarea,
            deb_n,
            deb_c,
            filter: true,
        }
    }
}

/// Noise the detection threshold is expressed in.
#[derive(Clone, Copy, Debug)]
pub enum NoiseModel<'a> {
    Global(f64),
    PerPixel(ArrayView2<'a, f64>),
}

/// A detected source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceObject {
    /// value of this source in the segmentation map
    pub label: i32,
    /// flux weighted centroid, x = column, y = row
    pub centroid: Vec2D,
    pub npix: usize,
    pub flux: f64,
    pub peak: f64,
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
    /// semi-major and semi-minor rms extent, pixels
    pub a: f64,
    pub b: f64,
    /// position angle of the major axis, radians counter-clockwise from +x
    pub theta: f64,
}

/// Sources plus their segmentation map (0 = background).
#[derive(Clone, Debug)]
pub struct Extraction {
    pub objects: Vec<SourceObject>,
    pub segmentation: Array2<i32>,
}

fn smooth(data: ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = data.dim();
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let mut sum = 0.0;
        let mut norm = 0.0;
        for (ky, krow) in SMOOTHING_KERNEL.iter().enumerate() {
            let sy = y as isize + ky as isize - 1;
            if sy < 0 || sy >= rows as isize {
                continue;
            }
            for (kx, k) in krow.iter().enumerate() {
                let sx = x as isize + kx as isize - 1;
                if sx < 0 || sx >= cols as isize {
                    continue;
                }
                let value = data[[sy as usize, sx as usize]];
                if value.is_finite() {
                    sum += k * value;
                    norm += k;
                }
            }
        }
        if norm > 0.0 { sum / norm } else { f64::NAN }
    })
}

fn find_root(parent: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parent[current] {
        parent[current] = parent[parent[current]];
        current = parent[current];
    }
    current
}

fn union_labels(parent: &mut [usize], a: usize, b: usize) {
    let ra = find_root(parent, a);
    let rb = find_root(parent, b);
    if ra < rb {
        parent[rb] = ra;
    } else if rb < ra {
        parent[ra] = rb;
    }
}

/// 8-connected components of `detected`, as lists of flat pixel indices in
/// order of their first pixel.
fn connected_components(detected: &Array2<bool>) -> Vec<Vec<usize>> {
    let (rows, cols) = detected.dim();
    let mut labels = vec![0usize; rows * cols];
    let mut parent = vec![0usize];

    for y in 0..rows {
        for x in 0..cols {
            if !detected[[y, x]] {
                continue;
            }
            let idx = y * cols + x;
            let mut neighbours = [0usize; 4];
            if x > 0 {
                neighbours[0] = labels[idx - 1];
            }
            if y > 0 {
                neighbours[1] = labels[idx - cols];
                if x > 0 {
                    neighbours[2] = labels[idx - cols - 1];
                }
                if x + 1 < cols {
                    neighbours[3] = labels[idx - cols + 1];
                }
            }
            match neighbours.iter().copied().filter(|l| *l > 0).min() {
                None => {
                    let label = parent.len();
                    parent.push(label);
                    labels[idx] = label;
                }
                Some(min_label) => {
                    labels[idx] = min_label;
                    for &other in neighbours.iter().filter(|l| **l > 0 && **l != min_label) {
                        union_labels(&mut parent, min_label, other);
                    }
                }
            }
        }
    }

    let mut slot = vec![usize::MAX; parent.len()];
    let mut components: Vec<Vec<usize>> = vec![];
    for (idx, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        let root = find_root(&mut parent, label);
        if slot[root] == usize::MAX {
            slot[root] = components.len();
            components.push(vec![]);
        }
        components[slot[root]].push(idx);
    }
    components
}

/// 8-connected groups within an arbitrary set of flat pixel indices.
fn components_of(pixels: &[usize], cols: usize) -> Vec<Vec<usize>> {
    let (mut x0, mut x1, mut y0, mut y1) = (usize::MAX, 0, usize::MAX, 0);
    for &idx in pixels {
        let (y, x) = (idx / cols, idx % cols);
        x0 = x0.min(x);
        x1 = x1.max(x);
        y0 = y0.min(y);
        y1 = y1.max(y);
    }
    let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
    let mut member = vec![false; w * h];
    for &idx in pixels {
        member[(idx / cols - y0) * w + (idx % cols - x0)] = true;
    }

    let mut groups = vec![];
    let mut queue = VecDeque::new();
    for &start in pixels {
        let local = (start / cols - y0) * w + (start % cols - x0);
        if !member[local] {
            continue;
        }
        member[local] = false;
        queue.push_back(local);
        let mut group = vec![];
        while let Some(p) = queue.pop_front() {
            let (ly, lx) = (p / w, p % w);
            group.push((ly + y0) * cols + lx + x0);
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let ny = ly as isize + dy;
                    let nx = lx as isize + dx;
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if member[n] {
                        member[n] = false;
                        queue.push_back(n);
                    }
                }
            }
        }
        groups.push(group);
    }
    groups
}

struct Deblender<'a> {
    significance: &'a [f64],
    cols: usize,
    levels: Vec<f64>,
    min_flux: f64,
    minarea: usize,
}

impl Deblender<'_> {
    /// flux of `pixels` above `level`
    fn flux_above(&self, pixels: &[usize], level: f64) -> f64 {
        pixels.iter().map(|&p| self.significance[p] - level).sum()
    }

    /// cores found at or above level `start`
    fn cores(&self, pixels: Vec<usize>, start: usize) -> Vec<Vec<usize>> {
        for (offset, &level) in self.levels[start..].iter().enumerate() {
            let above: Vec<usize> = pixels.iter()
                .copied()
                .filter(|&p| self.significance[p] > level)
                .collect();
            if above.is_empty() {
                break;
            }
            let branches: Vec<Vec<usize>> = components_of(&above, self.cols)
                .into_iter()
                .filter(|b| b.len() >= self.minarea && self.flux_above(b, level) > self.min_flux)
                .collect();
            if branches.len() >= 2 {
                let next = start + offset + 1;
                return branches.into_iter()
                    .flat_map(|branch| self.cores(branch, next))
                    .collect();
            }
        }
        vec![pixels]
    }
}

/// Split one connected group into its deblended members.
fn deblend(
    pixels: Vec<usize>,
    significance: &[f64],
    cols: usize,
    params: &DetectionParams,
) -> Vec<Vec<usize>> {
    let peak = pixels.iter().map(|&p| significance[p]).fold(f64::NEG_INFINITY, f64::max);
    if params.deb_n < 2 || pixels.len() < 2 * params.minarea.max(1) || peak <= params.thr {
        return vec![pixels];
    }
    let levels: Vec<f64> = (1..params.deb_n).map(|i| {
        let frac = i as f64 / params.deb_n as f64;
        if params.thr > 0.0 {
            params.thr * (peak / params.thr).powf(frac)
        } else {
            params.thr + (peak - params.thr) * frac
        }
    }).collect();

    let deblender = Deblender {
        significance,
        cols,
        levels,
        min_flux: params.deb_c * pixels.iter().map(|&p| significance[p]).sum::<f64>(),
        minarea: params.minarea.max(1),
    };
    let cores = deblender.cores(pixels.clone(), 0);
    if cores.len() < 2 {
        return vec![pixels];
    }

    // everything outside the cores joins the core with the nearest centroid
    let centres: Vec<(f64, f64)> = cores.iter().map(|core| {
        let (mut sx, mut sy, mut sw) = (0.0, 0.0, 0.0);
        for &p in core {
            let w = significance[p];
            sx += w * (p % cols) as f64;
            sy += w * (p / cols) as f64;
            sw += w;
        }
        (sx / sw, sy / sw)
    }).collect();
    let mut owner = std::collections::HashMap::with_capacity(pixels.len());
    for (k, core) in cores.iter().enumerate() {
        for &p in core {
            owner.insert(p, k);
        }
    }
    let mut members = vec![vec![]; cores.len()];
    for p in pixels {
        let k = match owner.get(&p) {
            Some(k) => *k,
            None => {
                let (x, y) = ((p % cols) as f64, (p / cols) as f64);
                centres.iter()
                    .enumerate()
                    .map(|(k, (cx, cy))| (k, (x - cx).powi(2) + (y - cy).powi(2)))
                    .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
                    .0
            }
        };
        members[k].push(p);
    }
    members
}

fn measure(label: i32, pixels: &[usize], data: ArrayView2<f64>) -> SourceObject {
    let cols = data.ncols();
    let (mut xmin, mut xmax, mut ymin, mut ymax) = (usize::MAX, 0, usize::MAX, 0);
    let (mut flux, mut peak) = (0.0, f64::NEG_INFINITY);
    let (mut sw, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for &p in pixels {
        let (y, x) = (p / cols, p % cols);
        xmin = xmin.min(x);
        xmax = xmax.max(x);
        ymin = ymin.min(y);
        ymax = ymax.max(y);
        let value = data[[y, x]];
        if value.is_finite() {
            flux += value;
            peak = peak.max(value);
            let w = value.max(0.0);
            sw += w;
            sx += w * x as f64;
            sy += w * y as f64;
        }
    }
    // fall back to unweighted moments when nothing is positive
    let weight = |value: f64| if sw > 0.0 { value.max(0.0) } else { 1.0 };
    let total = if sw > 0.0 { sw } else { pixels.len() as f64 };
    let (cx, cy) = if sw > 0.0 {
        (sx / sw, sy / sw)
    } else {
        let n = pixels.len() as f64;
        (
            pixels.iter().map(|p| (p % cols) as f64).sum::<f64>() / n,
            pixels.iter().map(|p| (p / cols) as f64).sum::<f64>() / n,
        )
    };
    let (mut x2, mut y2, mut xy) = (0.0, 0.0, 0.0);
    for &p in pixels {
        let (y, x) = (p / cols, p % cols);
        let value = data[[y, x]];
        let w = if value.is_finite() { weight(value) } else { 0.0 };
        let (dx, dy) = (x as f64 - cx, y as f64 - cy);
        x2 += w * dx * dx;
        y2 += w * dy * dy;
        xy += w * dx * dy;
    }
    x2 /= total;
    y2 /= total;
    xy /= total;
    let mean = 0.5 * (x2 + y2);
    let spread = (0.25 * (x2 - y2).powi(2) + xy * xy).sqrt();

    SourceObject {
        label,
        centroid: Vec2D { x: cx, y: cy },
        npix: pixels.len(),
        flux,
        peak,
        xmin,
        xmax,
        ymin,
        ymax,
        a: (mean + spread).max(0.0).sqrt(),
        b: (mean - spread).max(0.0).sqrt(),
        theta: 0.5 * (2.0 * xy).atan2(x2 - y2),
    }
}

/// Detect and deblend sources in `data`, which should already have its
/// background removed.
pub fn extract(data: ArrayView2<f64>, noise: NoiseModel, params: &DetectionParams) -> Result<Extraction> {
    if let NoiseModel::PerPixel(err) = &noise {
        check_shape("error map", data.shape(), err.shape())?;
    }
    if params.deb_c < 0.0 {
        return Err(KungpaoError::Background(format!(
            "deblending contrast must be >= 0, got {}", params.deb_c
        )));
    }
    let (rows, cols) = data.dim();
    let filtered = if params.filter { smooth(data) } else { data.to_owned() };

    let significance: Vec<f64> = filtered.indexed_iter().map(|((y, x), &value)| {
        let sigma = match &noise {
            NoiseModel::Global(sigma) => *sigma,
            NoiseModel::PerPixel(err) => err[[y, x]],
        };
        // pixels without a usable noise estimate are never detected
        if sigma > 0.0 && value.is_finite() { value / sigma } else { f64::NEG_INFINITY }
    }).collect();
    let detected = Array2::from_shape_fn((rows, cols), |(y, x)| significance[y * cols + x] > params.thr);

    let mut segmentation = Array2::<i32>::zeros((rows, cols));
    let mut objects = vec![];
    let groups: Vec<Vec<usize>> = connected_components(&detected)
        .into_iter()
        .filter(|group| group.len() >= params.minarea)
        .collect();
    let n_groups = groups.len();
    for group in groups {
        for member in deblend(group, &significance, cols, params) {
            let label = objects.len() as i32 + 1;
            for &p in &member {
                segmentation[[p / cols, p % cols]] = label;
            }
            objects.push(measure(label, &member, data));
        }
    }
    log::debug!(
        "extracted {} objects from {} groups above {} sigma",
        objects.len(), n_groups, params.thr
    );
    Ok(Extraction { objects, segmentation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian(shape: (usize, usize), sources: &[(f64, f64, f64, f64)]) -> Array2<f64> {
        Array2::from_shape_fn(shape, |(y, x)| {
            sources.iter().map(|&(cx, cy, amp, sigma)| {
                let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                amp * (-r2 / (2.0 * sigma * sigma)).exp()
            }).sum()
        })
    }

    #[test]
    fn test_single_source() {
        let image = gaussian((50, 60), &[(40.0, 20.0, 100.0, 2.0)]);
        let params = DetectionParams::new(5.0, 5, 32, 0.005);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert_eq!(ext.objects.len(), 1);
        let obj = &ext.objects[0];
        assert_eq!(obj.label, 1);
        assert_relative_eq!(obj.centroid.x, 40.0, epsilon = 1e-6);
        assert_relative_eq!(obj.centroid.y, 20.0, epsilon = 1e-6);
        assert_relative_eq!(obj.a, obj.b, epsilon = 1e-6);
        assert_eq!(ext.segmentation[[20, 40]], 1);
        assert_eq!(ext.segmentation[[0, 0]], 0);
        let flagged = ext.segmentation.iter().filter(|l| **l == 1).count();
        assert_eq!(flagged, obj.npix);
    }

    #[test]
    fn test_minarea_rejects_small_groups() {
        let mut image = Array2::<f64>::zeros((20, 20));
        image[[5, 5]] = 50.0;
        let mut params = DetectionParams::new(3.0, 5, 1, 0.0);
        params.filter = false;
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert!(ext.objects.is_empty());
        assert!(ext.segmentation.iter().all(|l| *l == 0));
    }

    #[test]
    fn test_diagonal_pixels_connect() {
        let mut image = Array2::<f64>::zeros((10, 10));
        for i in 2..7 {
            image[[i, i]] = 10.0;
        }
        let mut params = DetectionParams::new(1.0, 5, 1, 0.0);
        params.filter = false;
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert_eq!(ext.objects.len(), 1);
        assert_eq!(ext.objects[0].npix, 5);
    }

    #[test]
    fn test_deblend_blended_pair() {
        // two sources whose wings overlap above the detection threshold
        let image = gaussian((40, 60), &[(24.0, 20.0, 200.0, 2.5), (36.0, 20.0, 150.0, 2.5)]);
        let blended = DetectionParams::new(2.0, 5, 1, 0.005);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &blended).unwrap();
        assert_eq!(ext.objects.len(), 1);

        let deblended = DetectionParams::new(2.0, 5, 32, 0.005);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &deblended).unwrap();
        assert_eq!(ext.objects.len(), 2);
        let labels: Vec<i32> = ext.objects.iter().map(|o| o.label).collect();
        assert_eq!(labels, vec![1, 2]);
        assert_ne!(ext.segmentation[[20, 24]], ext.segmentation[[20, 36]]);
        assert!(ext.segmentation[[20, 24]] > 0 && ext.segmentation[[20, 36]] > 0);
        // deblending only relabels, the footprint is unchanged
        let total: usize = ext.objects.iter().map(|o| o.npix).sum();
        let flagged = ext.segmentation.iter().filter(|l| **l > 0).count();
        assert_eq!(total, flagged);
    }

    #[test]
    fn test_high_contrast_keeps_blend() {
        let image = gaussian((40, 60), &[(24.0, 20.0, 200.0, 2.5), (36.0, 20.0, 150.0, 2.5)]);
        let params = DetectionParams::new(2.0, 5, 32, 0.9);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert_eq!(ext.objects.len(), 1);
    }

    /// 20x20 plateau at `base` with two 3x3 bumps at `bump`
    fn plateau(base: f64, bump: f64) -> Array2<f64> {
        Array2::from_shape_fn((30, 30), |(y, x)| {
            let on_bump = |lo: usize| (lo..lo + 3).contains(&y) && (lo..lo + 3).contains(&x);
            if on_bump(8) || on_bump(18) {
                bump
            } else if (5..25).contains(&y) && (5..25).contains(&x) {
                base
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_shallow_bumps_stay_blended() {
        // each bump carries 9 * 0.5 above the plateau, well under 0.5% of the total
        let mut params = DetectionParams::new(2.0, 5, 64, 0.005);
        params.filter = false;
        let image = plateau(10.0, 10.5);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert_eq!(ext.objects.len(), 1);
        assert_eq!(ext.objects[0].npix, 400);
    }

    #[test]
    fn test_bright_bumps_split() {
        let mut params = DetectionParams::new(2.0, 5, 64, 0.005);
        params.filter = false;
        let image = plateau(10.0, 30.0);
        let ext = extract(image.view(), NoiseModel::Global(1.0), &params).unwrap();
        assert_eq!(ext.objects.len(), 2);
        assert_ne!(ext.segmentation[[9, 9]], ext.segmentation[[19, 19]]);
        let total: usize = ext.objects.iter().map(|o| o.npix).sum();
        assert_eq!(total, 400);
    }

    #[test]
    fn test_per_pixel_noise() {
        let image = gaussian((30, 30), &[(10.0, 10.0, 20.0, 1.5), (22.0, 22.0, 20.0, 1.5)]);
        // the second source sits in a very noisy region
        let err = Array2::from_shape_fn((30, 30), |(y, _)| if y > 16 { 100.0 } else { 1.0 });
        let params = DetectionParams::new(3.0, 3, 1, 0.0);
        let ext = extract(image.view(), NoiseModel::PerPixel(err.view()), &params).unwrap();
        assert_eq!(ext.objects.len(), 1);
        assert!(ext.segmentation[[10, 10]] > 0);
        assert_eq!(ext.segmentation[[22, 22]], 0);
    }

    #[test]
    fn test_error_map_shape() {
        let image = Array2::<f64>::zeros((10, 10));
        let err = Array2::<f64>::ones((9, 10));
        let params = DetectionParams::new(3.0, 3, 1, 0.0);
        assert!(matches!(
            extract(image.view(), NoiseModel::PerPixel(err.view()), &params),
            Err(KungpaoError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_components_of_groups() {
        let cols = 10;
        let pixels = vec![0, 1, 11, 55, 66, 99];
        let groups = components_of(&pixels, cols);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![3, 2, 1]);
    }
}
