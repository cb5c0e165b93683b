//! Bright star masks from the Gaia archive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geom::Vec2D;
use crate::wcs::Wcs;
use crate::{KungpaoError, Result};

pub const GAIA_TAP_URL: &str = "https://gea.esac.esa.int/tap-server/tap";
pub const GAIA_TABLE: &str = "gaiadr3.gaia_source";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Star {
    /// degrees
    pub ra: f64,
    pub dec: f64,
    /// NaN when the archive has no G magnitude
    pub phot_g_mean_mag: f64,
}

/// A catalog star placed on the image, with its mask radius.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MaskedStar {
    #[serde(flatten)]
    pub star: Star,
    pub x_pix: f64,
    pub y_pix: f64,
    pub rmask_arcsec: f64,
}

/// Anything that can list stars inside a sky box.
pub trait StarCatalogService {
    /// Stars inside the box centred on `(ra, dec)` (degrees) with the given
    /// full width and height in arcsec.
    fn query_box(&self, ra: f64, dec: f64, width_arcsec: f64, height_arcsec: f64) -> Result<Vec<Star>>;
}

/// Synchronous TAP client for the ESA Gaia archive.
#[derive(Clone, Debug)]
pub struct GaiaArchive {
    base_url: String,
    table: String,
    row_limit: Option<usize>,
}

impl Default for GaiaArchive {
    fn default() -> Self {
        Self::new(GAIA_TAP_URL)
    }
}

impl GaiaArchive {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: GAIA_TABLE.to_string(),
            row_limit: None,
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn box_query(&self, ra: f64, dec: f64, width_arcsec: f64, height_arcsec: f64) -> String {
        let top = match self.row_limit {
            Some(n) => format!("TOP {} ", n),
            None => String::new(),
        };
        format!(
            "SELECT {top}ra, dec, phot_g_mean_mag, \
            DISTANCE(POINT('ICRS', ra, dec), POINT('ICRS', {ra}, {dec})) AS dist \
            FROM {table} \
            WHERE 1 = CONTAINS(POINT('ICRS', ra, dec), BOX('ICRS', {ra}, {dec}, {w}, {h})) \
            ORDER BY dist ASC",
            top = top,
            ra = ra,
            dec = dec,
            table = self.table,
            w = width_arcsec / 3600.0,
            h = height_arcsec / 3600.0,
        )
    }
}

fn column(names: &[&str], wanted: &str) -> Result<usize> {
    names.iter().position(|n| n.eq_ignore_ascii_case(wanted)).ok_or_else(|| KungpaoError::Catalog(
        format!("column {} missing from archive response", wanted)
    ))
}

/// Decode a TAP `FORMAT=json` response (`metadata` + `data` arrays).
pub fn parse_tap_json(response: &Value) -> Result<Vec<Star>> {
    let metadata = response.get("metadata").and_then(Value::as_array).ok_or_else(|| {
        KungpaoError::Catalog("archive response has no metadata".to_string())
    })?;
    let names = metadata.iter()
        .map(|m| m.get("name").and_then(Value::as_str).unwrap_or(""))
        .collect::<Vec<&str>>();
    let (i_ra, i_dec, i_g) = (column(&names, "ra")?, column(&names, "dec")?, column(&names, "phot_g_mean_mag")?);

    let rows = response.get("data").and_then(Value::as_array).ok_or_else(|| {
        KungpaoError::Catalog("archive response has no data".to_string())
    })?;
    rows.iter().map(|row| {
        let cell = |i: usize| row.get(i).and_then(Value::as_f64);
        Ok(Star {
            ra: cell(i_ra).ok_or_else(|| KungpaoError::Catalog(format!("bad ra in row {}", row)))?,
            dec: cell(i_dec).ok_or_else(|| KungpaoError::Catalog(format!("bad dec in row {}", row)))?,
            phot_g_mean_mag: cell(i_g).unwrap_or(f64::NAN),
        })
    }).collect()
}

impl StarCatalogService for GaiaArchive {
    fn query_box(&self, ra: f64, dec: f64, width_arcsec: f64, height_arcsec: f64) -> Result<Vec<Star>> {
        let url = format!("{}/sync", self.base_url);
        let query = self.box_query(ra, dec, width_arcsec, height_arcsec);
        log::debug!("gaia query: {}", query);

        let response = ureq::get(&url)
            .query("REQUEST", "doQuery")
            .query("LANG", "ADQL")
            .query("FORMAT", "json")
            .query("QUERY", &query)
            .call()?;

        if response.status() != 200 {
            return Err(KungpaoError::Catalog(format!(
                "gaia archive query failed: HTTP {}", response.status()
            )));
        }
        let body: Value = response.into_body().read_json()?;
        parse_tap_json(&body)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaiaMaskOptions {
    /// arcsec per pixel
    pub pixel: f64,
    pub mask_a: f64,
    pub mask_b: f64,
    /// search box size relative to the image
    pub size_buffer: f64,
}

impl Default for GaiaMaskOptions {
    fn default() -> Self {
        Self {
            pixel: 0.168,
            mask_a: 694.7,
            mask_b: 4.04,
            size_buffer: 1.4,
        }
    }
}

impl GaiaMaskOptions {
    /// `mask_a * exp(-G / mask_b)`
    pub fn mask_radius(&self, g_mag: f64) -> f64 {
        self.mask_a * (-g_mag / self.mask_b).exp()
    }
}

/// Gaia stars over an image of `shape = (rows, cols)`. `Ok(None)` when the
/// archive returns nothing.
pub fn image_gaia_stars(
    shape: (usize, usize),
    wcs: &Wcs,
    service: &dyn StarCatalogService,
    options: &GaiaMaskOptions,
) -> Result<Option<Vec<MaskedStar>>> {
    let (rows, cols) = shape;
    let (ra_cen, dec_cen) = wcs.pix2world(Vec2D { x: cols as f64 / 2.0, y: rows as f64 / 2.0 });
    let width = options.pixel * cols as f64 * options.size_buffer;
    let height = options.pixel * rows as f64 * options.size_buffer;

    let stars = service.query_box(ra_cen, dec_cen, width, height)?;
    log::info!("gaia: {} stars around ({:.5}, {:.5})", stars.len(), ra_cen, dec_cen);
    if stars.is_empty() {
        return Ok(None);
    }
    let masked = stars.into_iter().filter_map(|star| {
        let pixel = wcs.world2pix(star.ra, star.dec)?;
        Some(MaskedStar {
            star,
            x_pix: pixel.x,
            y_pix: pixel.y,
            rmask_arcsec: options.mask_radius(star.phot_g_mean_mag),
        })
    }).collect();
    Ok(Some(masked))
}
