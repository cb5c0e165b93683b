//! Helpers over integer segmentation maps (0 = background).

use ndarray::Array2;

use crate::background::check_shape;
use crate::Result;

/// the pixel used to look up the central object
pub fn center_pixel(seg: &Array2<i32>) -> (usize, usize) {
    let (rows, cols) = seg.dim();
    (rows / 2, cols / 2)
}

/// Boolean footprint of the object covering `(row, col)`, `None` when that
/// pixel is background.
pub fn seg_index_obj(seg: &Array2<i32>, row: usize, col: usize) -> Option<Array2<bool>> {
    match seg.get([row, col]) {
        Some(&label) if label > 0 => Some(seg.mapv(|l| l == label)),
        _ => None,
    }
}

/// Copy of `seg` with the object covering `(row, col)` set to 0.
pub fn seg_remove_obj(seg: &Array2<i32>, row: usize, col: usize) -> Array2<i32> {
    match seg.get([row, col]) {
        Some(&label) if label > 0 => seg.mapv(|l| if l == label { 0 } else { l }),
        _ => seg.clone(),
    }
}

/// footprint of the object at the image centre
pub fn seg_index_cen_obj(seg: &Array2<i32>) -> Option<Array2<bool>> {
    let (row, col) = center_pixel(seg);
    seg_index_obj(seg, row, col)
}

/// `seg` without the object at the image centre
pub fn seg_remove_cen_obj(seg: &Array2<i32>) -> Array2<i32> {
    let (row, col) = center_pixel(seg);
    seg_remove_obj(seg, row, col)
}

/// Union of two maps. Labels of `second` are shifted past the largest label
/// of `first` so the two never collide; `first` wins where both are set.
pub fn combine(first: &Array2<i32>, second: &Array2<i32>) -> Result<Array2<i32>> {
    check_shape("segmentation map", first.shape(), second.shape())?;
    let offset = first.iter().copied().max().unwrap_or(0).max(0);
    let mut combined = first.clone();
    combined.zip_mut_with(second, |c, &s| {
        if *c <= 0 && s > 0 {
            *c = s + offset;
        }
    });
    Ok(combined)
}

/// `seg > 0`
pub fn footprint(seg: &Array2<i32>) -> Array2<bool> {
    seg.mapv(|l| l > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_central_object() {
        let seg = array![[0, 0, 0], [0, 2, 2], [1, 0, 2]];
        let mask = seg_index_cen_obj(&seg).unwrap();
        assert_eq!(mask.iter().filter(|m| **m).count(), 3);
        assert!(mask[[2, 2]] && !mask[[2, 0]]);
        let removed = seg_remove_cen_obj(&seg);
        assert_eq!(removed, array![[0, 0, 0], [0, 0, 0], [1, 0, 0]]);
    }

    #[test]
    fn test_even_shape_center() {
        let seg = Array2::<i32>::zeros((4, 6));
        assert_eq!(center_pixel(&seg), (2, 3));
        assert!(seg_index_cen_obj(&seg).is_none());
        assert_eq!(seg_remove_cen_obj(&seg), seg);
    }

    #[test]
    fn test_object_by_position() {
        let seg = array![[3, 0], [0, 4]];
        assert!(seg_index_obj(&seg, 0, 1).is_none());
        assert!(seg_index_obj(&seg, 5, 5).is_none());
        assert_eq!(seg_remove_obj(&seg, 1, 1), array![[3, 0], [0, 0]]);
    }

    #[test]
    fn test_combine() {
        let a = array![[1, 0, 0], [0, 0, 2]];
        let b = array![[1, 1, 0], [0, 3, 1]];
        let c = combine(&a, &b).unwrap();
        assert_eq!(c, array![[1, 3, 0], [0, 5, 2]]);
        assert_eq!(footprint(&c), array![[true, true, false], [false, true, true]]);
        assert!(combine(&a, &Array2::zeros((3, 3))).is_err());
    }
}
