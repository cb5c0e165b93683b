use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::angles::angular_distance;
use crate::cosmology::Cosmology;
use crate::{KungpaoError, Result};

/// one row of an object catalog
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SkyObject {
    /// degrees
    #[serde(alias = "RA")]
    pub ra: f64,
    /// degrees
    #[serde(alias = "DEC", alias = "Dec")]
    pub dec: f64,
    #[serde(alias = "z", alias = "z_best")]
    pub redshift: f64,
}

impl SkyObject {
    pub fn new(ra: f64, dec: f64, redshift: f64) -> Self {
        Self { ra, dec, redshift }
    }
}

/// Load a catalog from a YAML or JSON list of records, picked by extension.
pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<Vec<SkyObject>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&contents)?),
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&contents)?),
        _ => Err(KungpaoError::Catalog(format!(
            "unknown catalog format for {}, expected .json, .yaml or .yml", path.display()
        ))),
    }
}

/// How the trivial zero-distance match of an object to itself is counted.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum SelfMatch {
    /// every neighbour inside the radius counts
    #[default]
    Keep,
    /// catalog 1 is contained in catalog 2: one match is taken off each count
    SubtractOne,
    /// catalog 1 *is* catalog 2: the match with the same index is not counted
    SameIndex,
}

impl SelfMatch {
    /// the `include` flag of the classic interface
    pub fn from_include(include: bool) -> Self {
        if include {
            SelfMatch::SubtractOne
        } else {
            SelfMatch::Keep
        }
    }
}

/// Neighbour counts and the matching catalog-2 indices, one entry per
/// catalog-1 object and in catalog-1 order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PairMatch {
    pub counts: Vec<usize>,
    /// always includes a self match when there is one; only `counts` honour
    /// [`SelfMatch`]
    pub indices: Vec<Vec<usize>>,
}

/// Count the catalog-2 objects within `r_kpc` projected kpc of each
/// catalog-1 object, using the redshift of the catalog-1 object for the
/// angular-to-physical conversion.
pub fn table_pair_match_physical(
    cat1: &[SkyObject],
    cat2: &[SkyObject],
    r_kpc: f64,
    cosmo: &Cosmology,
    self_match: SelfMatch,
) -> Result<PairMatch> {
    let ra_2: Vec<f64> = cat2.iter().map(|obj| obj.ra).collect();
    let dec_2: Vec<f64> = cat2.iter().map(|obj| obj.dec).collect();

    let rows = cat1.par_iter().enumerate().map(|(i, obj)| {
        let scale = cosmo.kpc_scale(obj.redshift)?;
        let matched: Vec<usize> = angular_distance(obj.ra, obj.dec, &ra_2, &dec_2)
            .into_iter()
            .enumerate()
            .filter(|(_, sep)| sep * scale < r_kpc)
            .map(|(j, _)| j)
            .collect();
        let count = match self_match {
            SelfMatch::Keep => matched.len(),
            SelfMatch::SubtractOne => matched.len().saturating_sub(1),
            SelfMatch::SameIndex => matched.iter().filter(|j| **j != i).count(),
        };
        Ok((count, matched))
    }).collect::<Result<Vec<(usize, Vec<usize>)>>>()?;

    let (counts, indices) = rows.into_iter().unzip();
    log::debug!("matched {} objects against {} within {} kpc", cat1.len(), cat2.len(), r_kpc);
    Ok(PairMatch { counts, indices })
}
