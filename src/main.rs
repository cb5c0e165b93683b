//! `kungpao` command line tool.
//!
//! ```bash
//! # clean every image matching a pattern, writing <stem>_clean.fits
//! kungpao clean "cutouts/*.fits" --seed 42 --out-dir cleaned --figure --pixel-scale 0.168
//!
//! # neighbours within 100 kpc, catalog 1 drawn from catalog 2
//! kungpao pairs massive.yaml all.yaml --r-kpc 100 --include
//!
//! # bright star masks from Gaia for an image with a TAN WCS
//! kungpao gaia cutout.fits --pixel 0.168
//!
//! # isophotes of the galaxy on the image centre, out to 60 pixels
//! kungpao ellipse galaxy.fits --eps 0.3 --pa 45 --maxsma 60
//!
//! # write the default clean-up configuration
//! kungpao config clean.yaml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kungpao::angles::deg2rad;
use kungpao::diagnostics::plot_star_masks;
use kungpao::isophote::{DEFAULT_EPS, DEFAULT_SMA};
use kungpao::io::{load_images, read_fits_image, read_fits_mask, read_fits_wcs, write_fits_image};
use kungpao::random::get_time_label;
use kungpao::{
    catalog, check_random_state, image_gaia_stars, table_pair_match_physical, CleanUpConfig,
    Cosmology, DiagnosticSink, EllipseGeometry, FigureDiagnostics, FitsDiagnostics, GaiaArchive,
    GaiaMaskOptions, ImageCleaner, IsophoteConfig, IsophoteFitter, Result, SeedSource, SelfMatch,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log progress (repeat for debug output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace every non-central source with sky noise
    Clean {
        /// Glob pattern of input FITS images
        pattern: String,

        /// Per-pixel sigma map matching every input
        #[arg(long)]
        sigma: Option<PathBuf>,

        /// Bad pixel mask (non-zero = bad)
        #[arg(long)]
        bad: Option<PathBuf>,

        /// YAML clean-up configuration, defaults when absent
        #[arg(short, long)]
        config: Option<String>,

        /// Seed: none, an integer or a comma separated list of integers
        #[arg(short, long, default_value = "none")]
        seed: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Dump every intermediate map as FITS
        #[arg(long)]
        diagnose: bool,

        /// Save a PNG summary figure per image
        #[arg(long)]
        figure: bool,

        /// Pixel scale in arcsec, adds a scale bar to the figure
        #[arg(long, requires = "figure")]
        pixel_scale: Option<f64>,

        /// Scale bar length in arcsec
        #[arg(long, default_value_t = 5.0)]
        scale_bar: f64,
    },
    /// Count catalog 2 neighbours of each catalog 1 object
    Pairs {
        /// Catalog 1 (.json, .yaml or .yml)
        cat1: PathBuf,

        /// Catalog 2
        cat2: PathBuf,

        /// Projected radius in kpc
        #[arg(short, long, default_value_t = 1000.0)]
        r_kpc: f64,

        /// Catalog 1 is a subset of catalog 2, discount one self match
        #[arg(long, conflicts_with = "same_index")]
        include: bool,

        /// Catalog 1 and 2 are the same table, skip the same-index match
        #[arg(long)]
        same_index: bool,

        /// YAML cosmology, overrides --h0 and --omega-m
        #[arg(long)]
        cosmology: Option<String>,

        #[arg(long, default_value_t = 70.0)]
        h0: f64,

        #[arg(long, default_value_t = 0.3)]
        omega_m: f64,
    },
    /// List Gaia stars over an image with their mask radii
    Gaia {
        /// FITS image with a TAN WCS
        image: PathBuf,

        /// Pixel scale in arcsec
        #[arg(short, long, default_value_t = 0.168)]
        pixel: f64,

        #[arg(long, default_value_t = 694.7)]
        mask_a: f64,

        #[arg(long, default_value_t = 4.04)]
        mask_b: f64,

        /// Search box size relative to the image
        #[arg(long, default_value_t = 1.4)]
        size_buffer: f64,

        /// Maximum number of stars returned by the archive
        #[arg(long)]
        row_limit: Option<usize>,

        /// Save the image with the star masks drawn over it
        #[arg(long)]
        figure: Option<PathBuf>,
    },
    /// Fit elliptical isophotes, printed as JSON
    Ellipse {
        /// FITS image
        image: PathBuf,

        /// YAML fitting parameters, defaults when absent
        #[arg(short, long)]
        config: Option<String>,

        /// Starting centre column, the image centre by default
        #[arg(long, requires = "y0")]
        x0: Option<f64>,

        /// Starting centre row
        #[arg(long, requires = "x0")]
        y0: Option<f64>,

        /// Starting semi-major axis in pixels
        #[arg(long, default_value_t = DEFAULT_SMA)]
        sma0: f64,

        #[arg(long, default_value_t = DEFAULT_EPS)]
        eps: f64,

        /// Starting position angle in degrees counter-clockwise from +x
        #[arg(long, default_value_t = 0.0)]
        pa: f64,

        /// Stop growing at this semi-major axis, overrides the configuration
        #[arg(long)]
        maxsma: Option<f64>,
    },
    /// Write the default clean-up configuration
    Config {
        #[arg(default_value = "clean.yaml")]
        filename: String,
    },
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

#[allow(clippy::too_many_arguments)]
fn run_clean(
    pattern: &str,
    sigma: Option<PathBuf>,
    bad: Option<PathBuf>,
    config: Option<String>,
    seed: &str,
    out_dir: &Path,
    diagnose: bool,
    figure: Option<Option<f64>>,
    scale_bar: f64,
) -> Result<()> {
    let config = match config {
        Some(filename) => CleanUpConfig::from_yaml(&filename)?,
        None => CleanUpConfig::default(),
    };
    let mut rng = check_random_state(seed.parse::<SeedSource>()?)?;
    let sigma = sigma.map(read_fits_image).transpose()?;
    let bad = bad.map(read_fits_mask).transpose()?;

    log::info!("loading images");
    let images = load_images(pattern)?;
    if images.is_empty() {
        log::warn!("no images match {}", pattern);
    }
    std::fs::create_dir_all(out_dir)?;
    let cleaner = ImageCleaner::new(config);
    for (path, image) in images {
        log::info!("cleaning {}", path.display());
        let name = stem(&path);
        let mut sinks: Vec<Box<dyn DiagnosticSink>> = vec![];
        if diagnose {
            let dir = out_dir.join(format!("{}_{}", name, get_time_label()));
            sinks.push(Box::new(FitsDiagnostics::new(dir, &name)));
        }
        if let Some(pixel_scale) = figure {
            let mut sink = FigureDiagnostics::new(out_dir.join(format!("{}_clean.png", name)));
            if let Some(pixel_scale) = pixel_scale {
                sink = sink.with_scale_bar(pixel_scale, scale_bar);
            }
            sinks.push(Box::new(sink));
        }
        let cleaned = cleaner.clean_with_sink(
            image.view(),
            sigma.as_ref().map(|s| s.view()),
            bad.as_ref().map(|b| b.view()),
            &mut rng,
            &mut sinks,
        )?;

        let target = out_dir.join(format!("{}_clean.fits", name));
        write_fits_image(&target, &cleaned)?;
        println!("{}", target.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_ellipse(
    image: &Path,
    config: Option<String>,
    x0: Option<f64>,
    y0: Option<f64>,
    sma0: f64,
    eps: f64,
    pa: f64,
    maxsma: Option<f64>,
) -> Result<()> {
    let mut config = match config {
        Some(filename) => IsophoteConfig::from_yaml(&filename)?,
        None => IsophoteConfig::default(),
    };
    if maxsma.is_some() {
        config.maxsma = maxsma;
    }
    let data = read_fits_image(image)?;
    let (rows, cols) = data.dim();
    let geometry = EllipseGeometry::new(
        x0.unwrap_or(cols as f64 / 2.0),
        y0.unwrap_or(rows as f64 / 2.0),
        sma0,
        eps,
        deg2rad(pa),
    );
    let isophotes = IsophoteFitter::new(data.view(), Some(geometry), config)?.fit_image(None);
    if isophotes.is_empty() {
        log::warn!("no isophote could be fitted on {}", image.display());
    }
    println!("{}", serde_json::to_string_pretty(&isophotes)?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Clean { pattern, sigma, bad, config, seed, out_dir, diagnose, figure, pixel_scale, scale_bar } => {
            let figure = figure.then_some(pixel_scale);
            run_clean(&pattern, sigma, bad, config, &seed, &out_dir, diagnose, figure, scale_bar)
        },
        Commands::Pairs { cat1, cat2, r_kpc, include, same_index, cosmology, h0, omega_m } => {
            let cosmo = match cosmology {
                Some(filename) => Cosmology::from_yaml(&filename)?,
                None => Cosmology::new(h0, omega_m),
            };
            let self_match = if same_index {
                SelfMatch::SameIndex
            } else {
                SelfMatch::from_include(include)
            };
            let cat1 = catalog::load_catalog(cat1)?;
            let cat2 = catalog::load_catalog(cat2)?;
            let matched = table_pair_match_physical(&cat1, &cat2, r_kpc, &cosmo, self_match)?;
            println!("{}", serde_json::to_string_pretty(&matched)?);
            Ok(())
        },
        Commands::Gaia { image, pixel, mask_a, mask_b, size_buffer, row_limit, figure } => {
            let data = read_fits_image(&image)?;
            let wcs = read_fits_wcs(&image)?;
            let options = GaiaMaskOptions { pixel, mask_a, mask_b, size_buffer };
            let archive = GaiaArchive::default().with_row_limit(row_limit);
            match image_gaia_stars(data.dim(), &wcs, &archive, &options)? {
                Some(stars) => {
                    if let Some(figure) = figure {
                        plot_star_masks(figure, &data, &stars, pixel)?;
                    }
                    println!("{}", serde_json::to_string_pretty(&stars)?);
                },
                None => log::warn!("no gaia stars found around {}", image.display()),
            }
            Ok(())
        },
        Commands::Ellipse { image, config, x0, y0, sma0, eps, pa, maxsma } => {
            run_ellipse(&image, config, x0, y0, sma0, eps, pa, maxsma)
        },
        Commands::Config { filename } => {
            CleanUpConfig::default().to_yaml(&filename)?;
            println!("{}", filename);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        },
    }
}
