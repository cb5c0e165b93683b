use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{KungpaoError, Result};

pub const DEFAULT_STRING_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The accepted ways of seeding a random generator.
#[derive(Debug, Clone)]
pub enum SeedSource {
    /// fresh generator seeded from the OS
    NoSeed,
    IntegerSeed(i64),
    VectorSeed(Vec<u32>),
    /// an already constructed generator, passed through unchanged
    ExistingGenerator(StdRng),
}

/// Resolve a [`SeedSource`] into a concrete generator.
pub fn check_random_state(seed: SeedSource) -> Result<StdRng> {
    match seed {
        SeedSource::NoSeed => Ok(StdRng::from_entropy()),
        SeedSource::IntegerSeed(value) if value < 0 => {
            Err(KungpaoError::InvalidSeed(value.to_string()))
        }
        SeedSource::IntegerSeed(value) => Ok(StdRng::seed_from_u64(value as u64)),
        SeedSource::VectorSeed(values) if values.is_empty() => {
            Err(KungpaoError::InvalidSeed("[]".to_string()))
        }
        SeedSource::VectorSeed(values) => {
            // FNV-1a over the words
            let folded = values.iter().fold(0xcbf2_9ce4_8422_2325_u64, |h, v| {
                (h ^ *v as u64).wrapping_mul(0x0000_0100_0000_01b3)
            });
            Ok(StdRng::seed_from_u64(folded))
        }
        SeedSource::ExistingGenerator(rng) => Ok(rng),
    }
}

impl FromStr for SeedSource {
    type Err = KungpaoError;

    /// parse `none`, an integer (floats are truncated) or a comma separated
    /// list of integers
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(SeedSource::NoSeed);
        }
        if let Ok(value) = s.parse::<i64>() {
            return Ok(SeedSource::IntegerSeed(value));
        }
        if s.contains(',') {
            return s.split(',')
                .map(|part| part.trim().parse::<u32>())
                .collect::<std::result::Result<Vec<u32>, _>>()
                .map(SeedSource::VectorSeed)
                .map_err(|_| KungpaoError::InvalidSeed(format!("{:?}", s)));
        }
        match s.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(SeedSource::IntegerSeed(value.trunc() as i64)),
            _ => Err(KungpaoError::InvalidSeed(format!("{:?}", s))),
        }
    }
}

/// random string of `size` characters drawn from `chars`
pub fn random_string<R: Rng + ?Sized>(rng: &mut R, size: usize, chars: &str) -> String {
    let pool: Vec<char> = chars.chars().collect();
    (0..size).filter_map(|_| pool.choose(rng).copied()).collect()
}

/// time label for new files and directories, e.g. `20240131-235959`
pub fn get_time_label() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_seed_reproducible() {
        let mut a = check_random_state(SeedSource::IntegerSeed(42)).unwrap();
        let mut b = check_random_state(SeedSource::IntegerSeed(42)).unwrap();
        let xs: Vec<u64> = (0..5).map(|_| a.gen()).collect();
        let ys: Vec<u64> = (0..5).map(|_| b.gen()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_vector_seed() {
        let mut a = check_random_state(SeedSource::VectorSeed(vec![1, 2, 3])).unwrap();
        let mut b = check_random_state(SeedSource::VectorSeed(vec![1, 2, 3])).unwrap();
        let mut c = check_random_state(SeedSource::VectorSeed(vec![3, 2, 1])).unwrap();
        let (x, y, z): (u64, u64, u64) = (a.gen(), b.gen(), c.gen());
        assert_eq!(x, y);
        assert_ne!(x, z);
    }

    #[test]
    fn test_existing_generator_passthrough() {
        let rng = StdRng::seed_from_u64(7);
        let mut reference = rng.clone();
        let mut resolved = check_random_state(SeedSource::ExistingGenerator(rng)).unwrap();
        assert_eq!(resolved.gen::<u64>(), reference.gen::<u64>());
    }

    #[test]
    fn test_invalid_seeds() {
        assert!(matches!(
            check_random_state(SeedSource::IntegerSeed(-1)),
            Err(KungpaoError::InvalidSeed(_))
        ));
        assert!(check_random_state(SeedSource::VectorSeed(vec![])).is_err());
        let err = "banana".parse::<SeedSource>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("none") && message.contains("list of integers"));
    }

    #[test]
    fn test_parse_seed() {
        assert!(matches!("none".parse::<SeedSource>().unwrap(), SeedSource::NoSeed));
        assert!(matches!("12".parse::<SeedSource>().unwrap(), SeedSource::IntegerSeed(12)));
        assert!(matches!("3.9".parse::<SeedSource>().unwrap(), SeedSource::IntegerSeed(3)));
        match "1, 2,3".parse::<SeedSource>().unwrap() {
            SeedSource::VectorSeed(v) => assert_eq!(v, vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
        assert!("1,x".parse::<SeedSource>().is_err());
    }

    #[test]
    fn test_random_string() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = random_string(&mut rng, 8, DEFAULT_STRING_CHARS);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| DEFAULT_STRING_CHARS.contains(c)));
        assert_eq!(random_string(&mut rng, 4, ""), "");
    }

    #[test]
    fn test_time_label_format() {
        let label = get_time_label();
        assert_eq!(label.len(), 15);
        assert_eq!(&label[8..9], "-");
        assert!(label.chars().filter(|c| *c != '-').all(|c| c.is_ascii_digit()));
    }
}
