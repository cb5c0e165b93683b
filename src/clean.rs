//! Three-pass source removal.
//!
//! 1. a fine background is subtracted and sources are deblended to find the
//!    object sitting on the image centre,
//! 2. a coarse background pass flags every significant source,
//! 3. those sources are replaced by sky noise and a deeper pass picks up the
//!    faint objects they were hiding.
//!
//! Everything flagged by passes 2 and 3, except the central object, is then
//! replaced by synthetic sky noise.

use ndarray::{Array2, ArrayView2, Zip};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::background::{check_shape, Background, BackgroundParams};
use crate::diagnostics::DiagnosticSink;
use crate::extract::{extract, DetectionParams, NoiseModel, SourceObject};
use crate::segmentation::{center_pixel, combine, footprint};
use crate::{KungpaoError, Result};

/// floor applied to the sky rms before drawing noise
pub const MIN_NOISE_RMS: f64 = 1e-8;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct PassConfig {
    pub background: BackgroundParams,
    pub detection: DetectionParams,
}

/// Parameters of the three passes.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CleanUpConfig {
    /// fine local sky, only used to find the central object
    pub pass_1: PassConfig,
    /// full detection
    pub pass_2: PassConfig,
    /// faint residuals after noise replacement
    pub pass_3: PassConfig,
}

impl Default for CleanUpConfig {
    fn default() -> Self {
        Self {
            pass_1: PassConfig {
                background: BackgroundParams::new(20, 20, 3, 3),
                detection: DetectionParams::new(1.5, 40, 128, 0.00001),
            },
            pass_2: PassConfig {
                background: BackgroundParams::new(150, 150, 7, 7),
                detection: DetectionParams::new(2.0, 20, 64, 0.001),
            },
            pass_3: PassConfig {
                background: BackgroundParams::new(60, 60, 5, 5),
                detection: DetectionParams::new(3.5, 10, 64, 0.005),
            },
        }
    }
}

impl CleanUpConfig {
    pub fn from_yaml(filename: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(filename)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn to_yaml(&self, filename: &str) -> Result<()> {
        std::fs::write(filename, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Background, sources and segmentation of one pass.
#[derive(Clone, Debug)]
pub struct PassResult {
    pub background: Background,
    pub objects: Vec<SourceObject>,
    pub segmentation: Array2<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CentralObject {
    NotDetected,
    Detected { label: i32, npix: usize },
}

/// Every intermediate product of a clean-up run.
#[derive(Clone, Debug)]
pub struct CleanDiagnostics {
    pub image: Array2<f64>,
    pub sigma: Option<Array2<f64>>,
    pub pass_1: PassResult,
    pub pass_2: PassResult,
    /// background with pass-2 sources masked, and detections on the noise
    /// replaced image
    pub pass_3: PassResult,
    pub noise: Array2<f64>,
    /// union of the pass 2 and 3 maps with the central object removed
    pub combined: Array2<i32>,
    pub central: CentralObject,
}

#[derive(Clone, Debug)]
pub struct CleanOutput {
    pub image: Array2<f64>,
    pub diagnostics: CleanDiagnostics,
}

pub struct ImageCleaner {
    config: CleanUpConfig,
}

fn or_masks(a: Option<ArrayView2<bool>>, b: &Array2<bool>) -> Array2<bool> {
    match a {
        Some(a) => Zip::from(&a).and(b).map_collect(|x, y| *x || *y),
        None => b.clone(),
    }
}

fn run_pass(
    image: ArrayView2<f64>,
    sigma: Option<ArrayView2<f64>>,
    background: Background,
    params: &DetectionParams,
) -> Result<PassResult> {
    let noise = match sigma {
        Some(sigma) => NoiseModel::PerPixel(sigma),
        None => NoiseModel::Global(background.global_rms()),
    };
    let extraction = extract(background.subtract_from(image).view(), noise, params)?;
    Ok(PassResult {
        background,
        objects: extraction.objects,
        segmentation: extraction.segmentation,
    })
}

/// Draw a sky noise image from `background`: per-pixel level and rms when
/// `local`, the global summaries otherwise.
pub fn synthesize_noise<R: Rng + ?Sized>(background: &Background, local: bool, rng: &mut R) -> Result<Array2<f64>> {
    let shape = background.back().dim();
    if local {
        let back = background.back();
        let rms = background.rms();
        Ok(Array2::from_shape_fn(shape, |(y, x)| {
            let z: f64 = StandardNormal.sample(&mut *rng);
            back[[y, x]] + rms[[y, x]].max(MIN_NOISE_RMS) * z
        }))
    } else {
        let normal = Normal::new(background.global_back(), background.global_rms().max(MIN_NOISE_RMS))
            .map_err(|e| KungpaoError::Background(format!("cannot draw sky noise: {}", e)))?;
        Ok(Array2::from_shape_fn(shape, |_| normal.sample(&mut *rng)))
    }
}

impl ImageCleaner {
    pub fn new(config: CleanUpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CleanUpConfig {
        &self.config
    }

    /// Clean `image`. `sigma` is an optional per-pixel noise map and `bad`
    /// flags pixels kept out of every background estimate.
    pub fn clean<R: Rng + ?Sized>(
        &self,
        image: ArrayView2<f64>,
        sigma: Option<ArrayView2<f64>>,
        bad: Option<ArrayView2<bool>>,
        rng: &mut R,
    ) -> Result<CleanOutput> {
        if let Some(sigma) = &sigma {
            check_shape("sigma map", image.shape(), sigma.shape())?;
        }
        if let Some(bad) = &bad {
            check_shape("bad pixel mask", image.shape(), bad.shape())?;
        }
        let config = &self.config;

        let bkg_1 = Background::new(image, bad, &config.pass_1.background)?;
        log::info!("BKG 1: mean sky / rms sky = {:10.5} / {:10.5}", bkg_1.global_back(), bkg_1.global_rms());
        let pass_1 = run_pass(image, sigma, bkg_1, &config.pass_1.detection)?;
        log::info!("DET 1: detected {} objects", pass_1.objects.len());

        let bkg_2 = Background::new(image, bad, &config.pass_2.background)?;
        let pass_2 = run_pass(image, sigma, bkg_2, &config.pass_2.detection)?;
        log::info!("DET 2: detected {} objects", pass_2.objects.len());

        let seg_2_mask = footprint(&pass_2.segmentation);
        let bkg_3 = Background::new(image, Some(or_masks(bad, &seg_2_mask).view()), &config.pass_3.background)?;
        log::info!("BKG 3: mean sky / rms sky = {:10.5} / {:10.5}", bkg_3.global_back(), bkg_3.global_rms());

        let noise = synthesize_noise(&bkg_3, sigma.is_some(), rng)?;

        let mut replaced = image.to_owned();
        Zip::from(&mut replaced).and(&seg_2_mask).and(&noise).for_each(|pixel, flagged, n| {
            if *flagged {
                *pixel = *n;
            }
        });
        let pass_3 = run_pass(replaced.view(), sigma, bkg_3, &config.pass_3.detection)?;
        log::info!("DET 3: detected {} objects", pass_3.objects.len());

        let mut combined = combine(&pass_2.segmentation, &pass_3.segmentation)?;
        let (row, col) = center_pixel(&pass_1.segmentation);
        let central = match pass_1.segmentation[[row, col]] {
            label if label > 0 => {
                let mut npix = 0;
                Zip::from(&mut combined).and(&pass_1.segmentation).for_each(|c, s| {
                    if *s == label {
                        *c = 0;
                        npix += 1;
                    }
                });
                log::info!("central object: {} pixels", npix);
                CentralObject::Detected { label, npix }
            }
            _ => {
                log::info!("central object not detected");
                CentralObject::NotDetected
            }
        };

        let mut cleaned = image.to_owned();
        Zip::from(&mut cleaned).and(&combined).and(&noise).for_each(|pixel, label, n| {
            if *label > 0 {
                *pixel = *n;
            }
        });

        Ok(CleanOutput {
            image: cleaned,
            diagnostics: CleanDiagnostics {
                image: image.to_owned(),
                sigma: sigma.map(|s| s.to_owned()),
                pass_1,
                pass_2,
                pass_3,
                noise,
                combined,
                central,
            },
        })
    }

    /// [`ImageCleaner::clean`], handing the intermediates to `sink` before
    /// returning the cleaned image.
    pub fn clean_with_sink<R: Rng + ?Sized>(
        &self,
        image: ArrayView2<f64>,
        sigma: Option<ArrayView2<f64>>,
        bad: Option<ArrayView2<bool>>,
        rng: &mut R,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Array2<f64>> {
        let output = self.clean(image, sigma, bad, rng)?;
        sink.record(&output.image, &output.diagnostics)?;
        Ok(output.image)
    }
}

/// Clean `image` with `config`, returning only the cleaned image.
pub fn image_clean_up<R: Rng + ?Sized>(
    image: ArrayView2<f64>,
    sigma: Option<ArrayView2<f64>>,
    bad: Option<ArrayView2<bool>>,
    config: &CleanUpConfig,
    rng: &mut R,
) -> Result<Array2<f64>> {
    Ok(ImageCleaner::new(*config).clean(image, sigma, bad, rng)?.image)
}
