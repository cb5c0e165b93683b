use std::path::{Path, PathBuf};

use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use ndarray::Array2;

use crate::wcs::Wcs;
use crate::{KungpaoError, Result};

fn primary_hdu(filename: &Path) -> Result<Hdu> {
    let fits = Fits::open(filename)?;
    fits.get(0).ok_or_else(|| KungpaoError::InvalidFITS(
        format!("no primary hdu in {}", filename.display())
    ))
}

/// numeric header value, integers widened to f64
fn header_float(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key)? {
        HeaderValue::IntegerNumber(a) => Some(*a as f64),
        HeaderValue::RealFloatingNumber(a) => Some(*a),
        _ => None,
    }
}

fn image_shape(hdu: &Hdu, filename: &Path) -> Result<[usize; 2]> {
    match hdu.value("NAXIS") {
        Some(HeaderValue::IntegerNumber(2)) => (),
        _ => return Err(KungpaoError::InvalidFITS(
            format!("expected NAXIS==2 in {}", filename.display())
        )),
    };
    let mut shape: [usize; 2] = [0, 0];
    match hdu.value("NAXIS2") {
        Some(HeaderValue::IntegerNumber(x)) if *x > 0 => shape[0] = *x as usize,
        _ => return Err(KungpaoError::InvalidFITS("invalid NAXIS2".to_string())),
    }
    match hdu.value("NAXIS1") {
        Some(HeaderValue::IntegerNumber(x)) if *x > 0 => shape[1] = *x as usize,
        _ => return Err(KungpaoError::InvalidFITS("invalid NAXIS1".to_string())),
    };
    Ok(shape)
}

/// Load the primary image of a fits file as `[row, col]` (NAXIS2, NAXIS1).
/// Blank integer pixels become NaN.
pub fn read_fits_image<P: AsRef<Path>>(filename: P) -> Result<Array2<f64>> {
    let filename = filename.as_ref();
    let hdu = primary_hdu(filename)?;
    let shape = image_shape(&hdu, filename)?;
    let data: Vec<f64> = match hdu.read_data() {
        FitsData::IntegersI32(array) => {
            array.data.iter().map(|x| x.map_or(f64::NAN, |v| v as f64)).collect()
        },
        FitsData::IntegersU32(array) => {
            array.data.iter().map(|x| x.map_or(f64::NAN, |v| v as f64)).collect()
        },
        FitsData::FloatingPoint32(array) => {
            array.data.iter().map(|x| *x as f64).collect()
        },
        FitsData::FloatingPoint64(array) => {
            array.data.iter().copied().collect()
        },
        FitsData::Characters(array) => {
            array.data.iter().map(|x| *x as u8 as f64).collect()
        },
    };
    Array2::from_shape_vec((shape[0], shape[1]), data).map_err(|e| KungpaoError::InvalidFITS(
        format!("{}: {}", filename.display(), e)
    ))
}

/// load a mask image, any non-zero pixel is flagged
pub fn read_fits_mask<P: AsRef<Path>>(filename: P) -> Result<Array2<bool>> {
    Ok(read_fits_image(filename)?.mapv(|v| v != 0.0 && !v.is_nan()))
}

/// read the TAN WCS of the primary header
pub fn read_fits_wcs<P: AsRef<Path>>(filename: P) -> Result<Wcs> {
    let hdu = primary_hdu(filename.as_ref())?;
    Wcs::from_header(|key| header_float(&hdu, key))
}

/// save image to fits file
pub fn write_fits_image<P: AsRef<Path>>(filename: P, image: &Array2<f64>) -> Result<()> {
    let (rows, cols) = image.dim();
    let primary_hdu = Hdu::new(&[cols, rows], image.iter().copied().collect::<Vec<f64>>());
    Fits::create(filename.as_ref(), primary_hdu)?;
    Ok(())
}

/// save segmentation map to fits file
pub fn write_fits_segmentation<P: AsRef<Path>>(filename: P, seg: &Array2<i32>) -> Result<()> {
    let (rows, cols) = seg.dim();
    let primary_hdu = Hdu::new(&[cols, rows], seg.iter().copied().collect::<Vec<i32>>());
    Fits::create(filename.as_ref(), primary_hdu)?;
    Ok(())
}

/// load every fits image matching a glob pattern, in path order
pub fn load_images(pattern: &str) -> Result<Vec<(PathBuf, Array2<f64>)>> {
    glob::glob(pattern)?
    .map(|path| {
        let path = path?;
        let image = read_fits_image(&path)?;
        Ok((path, image))
    })
    .collect::<Result<Vec<(PathBuf, Array2<f64>)>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kungpao-io-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_image_roundtrip() {
        let path = scratch("square.fits");
        let image = Array2::from_shape_fn((8, 8), |(y, x)| (y * 8 + x) as f64 * 0.5);
        write_fits_image(&path, &image).unwrap();
        let back = read_fits_image(&path).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_fits_image(scratch("does-not-exist.fits")),
            Err(KungpaoError::IOError(_))
        ));
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(load_images("[unclosed"), Err(KungpaoError::BadPattern(_))));
    }
}
