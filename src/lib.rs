mod errors;
pub mod angles;
pub mod background;
pub mod catalog;
pub mod clean;
pub mod cosmology;
pub mod diagnostics;
pub mod extract;
pub mod gaia;
pub mod geom;
pub mod io;
pub mod isophote;
pub mod random;
pub mod segmentation;
pub mod stats;
pub mod wcs;
#[cfg(feature = "python")]
mod python;

pub use crate::errors::{KungpaoError, Result};
pub use crate::angles::{angular_distance, angular_distance_single, normalize_angle};
pub use crate::background::{Background, BackgroundParams};
pub use crate::catalog::{table_pair_match_physical, PairMatch, SelfMatch, SkyObject};
pub use crate::clean::{image_clean_up, CleanUpConfig, ImageCleaner};
pub use crate::cosmology::Cosmology;
pub use crate::diagnostics::{DiagnosticSink, FigureDiagnostics, FitsDiagnostics, ScaleBar};
pub use crate::extract::{extract, DetectionParams, NoiseModel, SourceObject};
pub use crate::gaia::{image_gaia_stars, GaiaArchive, GaiaMaskOptions, StarCatalogService};
pub use crate::geom::Vec2D;
pub use crate::isophote::{EllipseGeometry, Isophote, IsophoteConfig, IsophoteFitter};
pub use crate::random::{check_random_state, SeedSource};
pub use crate::wcs::Wcs;
