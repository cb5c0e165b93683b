//! Optional outputs of a clean-up run: intermediate FITS maps and PNG figures.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::clean::CleanDiagnostics;
use crate::gaia::MaskedStar;
use crate::io::{write_fits_image, write_fits_segmentation};
use crate::{KungpaoError, Result};

/// Receives the intermediates of a clean-up run.
pub trait DiagnosticSink {
    fn record(&mut self, cleaned: &Array2<f64>, diagnostics: &CleanDiagnostics) -> Result<()>;
}

/// Every sink in turn, stopping at the first failure.
impl DiagnosticSink for Vec<Box<dyn DiagnosticSink>> {
    fn record(&mut self, cleaned: &Array2<f64>, diagnostics: &CleanDiagnostics) -> Result<()> {
        for sink in self.iter_mut() {
            sink.record(cleaned, diagnostics)?;
        }
        Ok(())
    }
}

fn plot_err<E: std::fmt::Display>(e: E) -> KungpaoError {
    KungpaoError::Plot(e.to_string())
}

/// Writes every intermediate map as `<dir>/<prefix>_<name>.fits`.
pub struct FitsDiagnostics {
    dir: PathBuf,
    prefix: String,
}

impl FitsDiagnostics {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.fits", self.prefix, name))
    }
}

impl DiagnosticSink for FitsDiagnostics {
    fn record(&mut self, cleaned: &Array2<f64>, diag: &CleanDiagnostics) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_fits_image(self.path("img"), &diag.image)?;
        if let Some(sigma) = &diag.sigma {
            write_fits_image(self.path("sig"), sigma)?;
        }
        for (i, pass) in [&diag.pass_1, &diag.pass_2, &diag.pass_3].into_iter().enumerate() {
            write_fits_image(self.path(&format!("bkg{}_back", i + 1)), pass.background.back())?;
            write_fits_image(self.path(&format!("bkg{}_rms", i + 1)), pass.background.rms())?;
            write_fits_segmentation(self.path(&format!("seg{}", i + 1)), &pass.segmentation)?;
        }
        write_fits_image(self.path("noise"), &diag.noise)?;
        write_fits_segmentation(self.path("seg_combined"), &diag.combined)?;
        write_fits_image(self.path("clean"), cleaned)?;
        log::info!("diagnostic maps written to {}", self.dir.display());
        Ok(())
    }
}

/// Display limits from the finite pixels, `None` for an all-NaN image.
fn display_limits(image: &Array2<f64>, percentile: f64) -> Option<(f64, f64)> {
    let mut values: Vec<f64> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let at = |q: f64| values[((values.len() - 1) as f64 * q).round() as usize];
    let (lo, hi) = (at(percentile / 100.0), at(1.0 - percentile / 100.0));
    Some((lo, if hi > lo { hi } else { lo + 1.0 }))
}

/// Arcsinh stretch of `value` between `lo` and `hi` into `[0, 1]`.
pub fn asinh_stretch(value: f64, lo: f64, hi: f64, softening: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let t = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
    (t * softening).asinh() / softening.asinh()
}

fn label_color(label: i32) -> RGBColor {
    if label <= 0 {
        return BLACK;
    }
    let hue = (label as f64 * 0.618_033_988_75).fract();
    let rgba = HSLColor(hue, 0.75, 0.55).to_rgba();
    RGBColor(rgba.0, rgba.1, rgba.2)
}

enum Panel<'a> {
    Image(&'a Array2<f64>),
    Labels(&'a Array2<i32>),
    Blank,
}

/// Nearest-pixel rendering, row 0 at the bottom of the panel.
fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    panel: &Panel,
    percentile: f64,
    softening: f64,
) -> Result<()> {
    let (width, height) = area.dim_in_pixel();
    let (rows, cols) = match panel {
        Panel::Image(image) => image.dim(),
        Panel::Labels(seg) => seg.dim(),
        Panel::Blank => return Ok(()),
    };
    if rows == 0 || cols == 0 || width == 0 || height == 0 {
        return Ok(());
    }
    let limits = match panel {
        Panel::Image(image) => display_limits(image, percentile),
        _ => None,
    };
    for py in 0..height {
        let row = rows - 1 - (py as usize * rows / height as usize).min(rows - 1);
        for px in 0..width {
            let col = (px as usize * cols / width as usize).min(cols - 1);
            let color = match panel {
                Panel::Image(image) => {
                    let grey = limits.map_or(0.0, |(lo, hi)| asinh_stretch(image[[row, col]], lo, hi, softening));
                    let grey = (grey * 255.0).round() as u8;
                    RGBColor(grey, grey, grey)
                },
                Panel::Labels(seg) => label_color(seg[[row, col]]),
                Panel::Blank => WHITE,
            };
            area.draw_pixel((px as i32, py as i32), &color).map_err(plot_err)?;
        }
    }
    Ok(())
}

/// Angular scale bar drawn in the lower left corner of an image panel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleBar {
    /// arcsec per image pixel
    pub pixel_scale: f64,
    pub length_arcsec: f64,
}

impl ScaleBar {
    /// Bar length in display pixels for an image `cols` wide shown `width`
    /// pixels wide, `None` when it would not fit inside the panel margins.
    pub fn display_length(&self, cols: usize, width: u32) -> Option<u32> {
        if !(self.pixel_scale > 0.0 && self.length_arcsec > 0.0) || cols == 0 {
            return None;
        }
        let length = (self.length_arcsec / self.pixel_scale * width as f64 / cols as f64).round();
        let room = width.saturating_sub(2 * scale_bar_margin(width)) as f64;
        (length >= 1.0 && length <= room).then_some(length as u32)
    }
}

fn scale_bar_margin(width: u32) -> u32 {
    (width / 20).max(1)
}

fn draw_scale_bar<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, bar: &ScaleBar, cols: usize) -> Result<()> {
    let (width, height) = area.dim_in_pixel();
    let Some(length) = bar.display_length(cols, width) else {
        log::debug!("{} arcsec scale bar does not fit a {} pixel panel", bar.length_arcsec, width);
        return Ok(());
    };
    let margin = scale_bar_margin(width) as i32;
    let thickness = (height / 60).max(2) as i32;
    let (x0, y1) = (margin, height as i32 - margin);
    area.draw(&Rectangle::new([(x0, y1 - thickness), (x0 + length as i32, y1)], WHITE.filled()))
        .map_err(plot_err)
}

/// 3x3 PNG summary: input, sigma, pass-1 background, seg 1, pass-3
/// background, seg 2, seg 3, noise, cleaned.
pub struct FigureDiagnostics {
    path: PathBuf,
    panel_size: u32,
    /// percent of pixels clipped at each end of the grey scale
    pub percentile: f64,
    pub softening: f64,
    /// drawn on the input and cleaned panels
    pub scale_bar: Option<ScaleBar>,
}

impl FigureDiagnostics {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            panel_size: 300,
            percentile: 0.5,
            softening: 10.0,
            scale_bar: None,
        }
    }

    pub fn with_panel_size(mut self, panel_size: u32) -> Self {
        self.panel_size = panel_size.max(1);
        self
    }

    pub fn with_scale_bar(mut self, pixel_scale: f64, length_arcsec: f64) -> Self {
        self.scale_bar = Some(ScaleBar { pixel_scale, length_arcsec });
        self
    }

    /// Scale bar of `length_kpc` at a source with `kpc_per_arcsec`, see
    /// [`Cosmology::kpc_scale`](crate::Cosmology::kpc_scale).
    pub fn with_physical_scale_bar(self, pixel_scale: f64, kpc_per_arcsec: f64, length_kpc: f64) -> Self {
        self.with_scale_bar(pixel_scale, length_kpc / kpc_per_arcsec)
    }
}

impl DiagnosticSink for FigureDiagnostics {
    fn record(&mut self, cleaned: &Array2<f64>, diag: &CleanDiagnostics) -> Result<()> {
        let size = self.panel_size;
        let root = BitMapBackend::new(&self.path, (3 * size, 3 * size)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let panels = [
            Panel::Image(&diag.image),
            diag.sigma.as_ref().map_or(Panel::Blank, Panel::Image),
            Panel::Image(diag.pass_1.background.back()),
            Panel::Labels(&diag.pass_1.segmentation),
            Panel::Image(diag.pass_3.background.back()),
            Panel::Labels(&diag.pass_2.segmentation),
            Panel::Labels(&diag.pass_3.segmentation),
            Panel::Image(&diag.noise),
            Panel::Image(cleaned),
        ];
        for (i, (area, panel)) in root.split_evenly((3, 3)).iter().zip(panels.iter()).enumerate() {
            draw_panel(area, panel, self.percentile, self.softening)?;
            if let (Some(bar), 0 | 8) = (&self.scale_bar, i) {
                draw_scale_bar(area, bar, cleaned.ncols())?;
            }
        }
        root.present().map_err(plot_err)?;
        log::info!("diagnostic figure written to {}", self.path.display());
        Ok(())
    }
}

/// Draw `image` with a circle of radius `rmask_arcsec / pixel` around every
/// star.
pub fn plot_star_masks<P: AsRef<Path>>(
    path: P,
    image: &Array2<f64>,
    stars: &[MaskedStar],
    pixel: f64,
) -> Result<()> {
    let (rows, cols) = image.dim();
    let root = BitMapBackend::new(path.as_ref(), (cols as u32, rows as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    draw_panel(&root, &Panel::Image(image), 0.5, 10.0)?;
    for star in stars {
        // panel rows run bottom to top
        let centre = (star.x_pix.round() as i32, rows as i32 - 1 - star.y_pix.round() as i32);
        let radius = (star.rmask_arcsec / pixel).round().max(1.0) as i32;
        root.draw(&Circle::new(centre, radius, RED.stroke_width(2))).map_err(plot_err)?;
    }
    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::{CleanUpConfig, ImageCleaner};
    use crate::gaia::Star;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kungpao-diag-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn cleaned() -> (Array2<f64>, CleanDiagnostics) {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(10.0, 1.0).unwrap();
        let image = Array2::from_shape_fn((48, 48), |(y, x)| {
            let r2 = (x as f64 - 12.0).powi(2) + (y as f64 - 12.0).powi(2);
            normal.sample(&mut rng) + 200.0 * (-r2 / 6.0).exp()
        });
        let output = ImageCleaner::new(CleanUpConfig::default())
            .clean(image.view(), None, None, &mut rng)
            .unwrap();
        (output.image, output.diagnostics)
    }

    #[test]
    fn test_stretch() {
        assert_eq!(asinh_stretch(-5.0, 0.0, 1.0, 10.0), 0.0);
        assert_eq!(asinh_stretch(5.0, 0.0, 1.0, 10.0), 1.0);
        assert_eq!(asinh_stretch(f64::NAN, 0.0, 1.0, 10.0), 0.0);
        let a = asinh_stretch(0.1, 0.0, 1.0, 10.0);
        let b = asinh_stretch(0.2, 0.0, 1.0, 10.0);
        assert!(a > 0.1 && b > a);
    }

    #[test]
    fn test_display_limits() {
        let flat = Array2::from_elem((4, 4), 2.0);
        assert_eq!(display_limits(&flat, 1.0), Some((2.0, 3.0)));
        assert_eq!(display_limits(&Array2::from_elem((2, 2), f64::NAN), 1.0), None);
    }

    #[test]
    fn test_fits_sink() {
        let (image, diag) = cleaned();
        let dir = scratch("maps");
        FitsDiagnostics::new(&dir, "obj").record(&image, &diag).unwrap();
        for name in ["img", "bkg1_back", "seg2", "bkg3_rms", "noise", "seg_combined", "clean"] {
            assert!(dir.join(format!("obj_{}.fits", name)).exists(), "{}", name);
        }
        assert!(!dir.join("obj_sig.fits").exists());
    }

    #[test]
    fn test_figure_sink() {
        let (image, diag) = cleaned();
        let path = scratch("clean.png");
        FigureDiagnostics::new(&path).with_panel_size(40).record(&image, &diag).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_scale_bar_length() {
        // 10 arcsec at 0.5 arcsec per pixel is 20 of 48 image pixels
        let bar = ScaleBar { pixel_scale: 0.5, length_arcsec: 10.0 };
        assert_eq!(bar.display_length(48, 300), Some(125));
        assert_eq!(bar.display_length(48, 48), Some(20));
        // longer than the panel
        assert_eq!(bar.display_length(10, 300), None);
        assert_eq!(ScaleBar { pixel_scale: 0.0, length_arcsec: 10.0 }.display_length(48, 300), None);

        let kpc = FigureDiagnostics::new("unused.png").with_physical_scale_bar(0.168, 2.0, 10.0);
        assert_eq!(kpc.scale_bar, Some(ScaleBar { pixel_scale: 0.168, length_arcsec: 5.0 }));
    }

    #[test]
    fn test_all_sinks_record() {
        let (image, diag) = cleaned();
        let dir = scratch("fanout");
        let figure = dir.join("clean.png");
        let mut sinks: Vec<Box<dyn DiagnosticSink>> = vec![
            Box::new(FitsDiagnostics::new(&dir, "obj")),
            Box::new(FigureDiagnostics::new(&figure).with_panel_size(60).with_scale_bar(0.168, 2.0)),
        ];
        sinks.record(&image, &diag).unwrap();
        assert!(dir.join("obj_clean.fits").exists());
        assert!(std::fs::metadata(&figure).unwrap().len() > 0);
    }

    #[test]
    fn test_star_overlay() {
        let image = Array2::from_shape_fn((32, 32), |(y, x)| (x + y) as f64);
        let star = MaskedStar {
            star: Star { ra: 0.0, dec: 0.0, phot_g_mean_mag: 10.0 },
            x_pix: 10.0,
            y_pix: 20.0,
            rmask_arcsec: 1.0,
        };
        let path = scratch("stars.png");
        plot_star_masks(&path, &image, &[star], 0.168).unwrap();
        assert!(path.exists());
    }
}
