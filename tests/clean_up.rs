use approx::assert_abs_diff_eq;
use kungpao::clean::CentralObject;
use kungpao::{check_random_state, CleanUpConfig, ImageCleaner, SeedSource};
use ndarray::Array2;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

const SIZE: usize = 101;

/// flat sky of 100 with unit noise plus gaussian sources `(col, row, amp, sigma)`
fn sky(seed: u64, sources: &[(f64, f64, f64, f64)]) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(100.0, 1.0).unwrap();
    Array2::from_shape_fn((SIZE, SIZE), |(y, x)| {
        let flux: f64 = sources.iter().map(|&(cx, cy, amp, sigma)| {
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            amp * (-r2 / (2.0 * sigma * sigma)).exp()
        }).sum();
        normal.sample(&mut rng) + flux
    })
}

#[test]
fn off_centre_source_is_replaced() {
    let image = sky(1, &[(25.0, 70.0, 200.0, 3.0)]);
    let mut rng = check_random_state(SeedSource::IntegerSeed(42)).unwrap();
    let output = ImageCleaner::new(CleanUpConfig::default())
        .clean(image.view(), None, None, &mut rng)
        .unwrap();
    let diag = &output.diagnostics;

    assert_eq!(diag.central, CentralObject::NotDetected);
    assert!(diag.combined[[70, 25]] > 0);
    assert!(image[[70, 25]] > 250.0);
    assert!((output.image[[70, 25]] - 100.0).abs() < 6.0);

    // untouched outside the combined mask
    for ((y, x), label) in diag.combined.indexed_iter() {
        if *label == 0 {
            assert_eq!(output.image[[y, x]], image[[y, x]]);
        }
    }
    assert_eq!(output.image[[50, 50]], image[[50, 50]]);
    let flagged = diag.combined.iter().filter(|l| **l > 0).count();
    assert!(flagged < SIZE * SIZE / 10, "{} flagged pixels", flagged);

    assert_abs_diff_eq!(diag.pass_3.background.global_back(), 100.0, epsilon = 0.5);
    assert_abs_diff_eq!(diag.pass_3.background.global_rms(), 1.0, epsilon = 0.3);
}

#[test]
fn central_object_is_kept() {
    let image = sky(2, &[(50.0, 50.0, 200.0, 4.0), (15.0, 20.0, 150.0, 2.5)]);
    let mut rng = StdRng::seed_from_u64(7);
    let output = ImageCleaner::new(CleanUpConfig::default())
        .clean(image.view(), None, None, &mut rng)
        .unwrap();
    let diag = &output.diagnostics;

    match diag.central {
        CentralObject::Detected { label, npix } => {
            assert!(label > 0);
            assert!(npix >= 40);
        },
        CentralObject::NotDetected => panic!("central source missed"),
    }
    assert_eq!(diag.combined[[50, 50]], 0);
    assert_eq!(output.image[[50, 50]], image[[50, 50]]);
    assert!(diag.combined[[20, 15]] > 0);
    assert!((output.image[[20, 15]] - 100.0).abs() < 6.0);
}

#[test]
fn sigma_map_and_bad_pixels() {
    let image = sky(3, &[(80.0, 30.0, 300.0, 3.0)]);
    let sigma = Array2::from_elem((SIZE, SIZE), 1.0);
    let mut bad = Array2::from_elem((SIZE, SIZE), false);
    for y in 0..10 {
        for x in 0..10 {
            bad[[y, x]] = true;
        }
    }
    let mut rng = StdRng::seed_from_u64(9);
    let output = ImageCleaner::new(CleanUpConfig::default())
        .clean(image.view(), Some(sigma.view()), Some(bad.view()), &mut rng)
        .unwrap();
    assert!(output.diagnostics.sigma.is_some());
    assert!(output.diagnostics.combined[[30, 80]] > 0);
    assert!((output.image[[30, 80]] - 100.0).abs() < 6.0);
    assert_eq!(output.image[[50, 50]], image[[50, 50]]);
}

#[test]
fn fully_masked_image_is_an_error() {
    let image = sky(4, &[]);
    let bad = Array2::from_elem((SIZE, SIZE), true);
    let mut rng = StdRng::seed_from_u64(0);
    assert!(ImageCleaner::new(CleanUpConfig::default())
        .clean(image.view(), None, Some(bad.view()), &mut rng)
        .is_err());
}
