use pyo3::prelude::*;

use crate::catalog::{table_pair_match_physical, SelfMatch, SkyObject};
use crate::clean::{CleanUpConfig, ImageCleaner};
use crate::cosmology::Cosmology;
use crate::io::{read_fits_image, read_fits_mask, write_fits_image};
use crate::isophote::{EllipseGeometry, IsophoteConfig, IsophoteFitter};
use crate::random::{check_random_state, SeedSource};
use crate::{angles, Vec2D};

/// A Python module implemented in Rust.
#[pymodule]
fn kungpao(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Vec2D>()?;
    m.add_function(wrap_pyfunction!(angular_distance, m)?)?;
    m.add_function(wrap_pyfunction!(normalize_angle, m)?)?;
    m.add_function(wrap_pyfunction!(kpc_scale, m)?)?;
    m.add_function(wrap_pyfunction!(pair_match_physical, m)?)?;
    m.add_function(wrap_pyfunction!(clean_fits, m)?)?;
    m.add_function(wrap_pyfunction!(fit_ellipse, m)?)?;
    m.add_function(wrap_pyfunction!(write_default_config, m)?)?;
    Ok(())
}

/// separation in arcsec between one position and a list of positions
#[pyfunction]
fn angular_distance(ra_1: f64, dec_1: f64, ra_2: Vec<f64>, dec_2: Vec<f64>) -> Vec<f64> {
    angles::angular_distance(ra_1, dec_1, &ra_2, &dec_2)
}

#[pyfunction]
#[pyo3(signature = (num, lower=0.0, upper=360.0, bounce=false))]
fn normalize_angle(num: f64, lower: f64, upper: f64, bounce: bool) -> PyResult<f64> {
    Ok(angles::normalize_angle(num, lower, upper, bounce)?)
}

#[pyfunction]
#[pyo3(signature = (z, h0=70.0, omega_m=0.3))]
fn kpc_scale(z: f64, h0: f64, omega_m: f64) -> PyResult<f64> {
    Ok(Cosmology::new(h0, omega_m).kpc_scale(z)?)
}

/// `(counts, indices)` of catalog 2 neighbours of each catalog 1 object
#[pyfunction]
#[pyo3(signature = (cat1, cat2, r_kpc=1000.0, include=false, h0=70.0, omega_m=0.3))]
fn pair_match_physical(
    cat1: Vec<(f64, f64, f64)>,
    cat2: Vec<(f64, f64, f64)>,
    r_kpc: f64,
    include: bool,
    h0: f64,
    omega_m: f64,
) -> PyResult<(Vec<usize>, Vec<Vec<usize>>)> {
    let to_objects = |cat: Vec<(f64, f64, f64)>| cat.into_iter()
        .map(|(ra, dec, z)| SkyObject::new(ra, dec, z))
        .collect::<Vec<SkyObject>>();
    let matched = table_pair_match_physical(
        &to_objects(cat1),
        &to_objects(cat2),
        r_kpc,
        &Cosmology::new(h0, omega_m),
        SelfMatch::from_include(include),
    )?;
    Ok((matched.counts, matched.indices))
}

#[pyfunction]
#[pyo3(signature = (input, output, sigma=None, bad=None, config=None, seed=None))]
fn clean_fits(
    input: &str,
    output: &str,
    sigma: Option<&str>,
    bad: Option<&str>,
    config: Option<&str>,
    seed: Option<&str>,
) -> PyResult<()> {
    let config = match config {
        Some(filename) => CleanUpConfig::from_yaml(filename)?,
        None => CleanUpConfig::default(),
    };
    let seed: SeedSource = seed.unwrap_or("none").parse()?;
    let mut rng = check_random_state(seed)?;
    let image = read_fits_image(input)?;
    let sigma = sigma.map(read_fits_image).transpose()?;
    let bad = bad.map(read_fits_mask).transpose()?;
    let cleaned = ImageCleaner::new(config).clean(
        image.view(),
        sigma.as_ref().map(|s| s.view()),
        bad.as_ref().map(|b| b.view()),
        &mut rng,
    )?;
    write_fits_image(output, &cleaned.image)?;
    Ok(())
}

/// `(sma, intens, eps, pa, x0, y0, stop_code)` of every isophote of a FITS image
#[pyfunction]
#[pyo3(signature = (input, x0=None, y0=None, sma0=10.0, eps=0.2, pa=0.0, maxsma=None))]
fn fit_ellipse(
    input: &str,
    x0: Option<f64>,
    y0: Option<f64>,
    sma0: f64,
    eps: f64,
    pa: f64,
    maxsma: Option<f64>,
) -> PyResult<Vec<(f64, f64, f64, f64, f64, f64, i32)>> {
    let image = read_fits_image(input)?;
    let (rows, cols) = image.dim();
    let geometry = EllipseGeometry::new(
        x0.unwrap_or(cols as f64 / 2.0),
        y0.unwrap_or(rows as f64 / 2.0),
        sma0,
        eps,
        pa,
    );
    let config = IsophoteConfig { maxsma, ..Default::default() };
    let isophotes = IsophoteFitter::new(image.view(), Some(geometry), config)?.fit_image(None);
    Ok(isophotes.iter().map(|iso| {
        let g = &iso.geometry;
        (g.sma, iso.intens, g.eps, g.pa, g.x0, g.y0, iso.stop_code.code())
    }).collect())
}

#[pyfunction]
fn write_default_config(filename: &str) -> PyResult<()> {
    Ok(CleanUpConfig::default().to_yaml(filename)?)
}
