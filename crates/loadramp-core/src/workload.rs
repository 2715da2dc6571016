//! Randomized publish/fetch workload generation

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Workload parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Subject prefixes, one drawn uniformly per iteration
    pub categories: Vec<String>,

    /// Characters the subject suffix is drawn from
    pub suffix_alphabet: String,

    /// Length of the subject suffix
    pub suffix_length: usize,

    /// Inclusive body length range
    pub body_min_len: usize,
    pub body_max_len: usize,

    /// Characters the body is drawn from
    pub body_charset: String,

    /// Inclusive message expiration range, in seconds
    pub expiration_min_secs: u32,
    pub expiration_max_secs: u32,

    /// Probability that a publish is followed by a fetch
    pub fetch_probability: f64,

    /// Publish/fetch rounds executed on one connection before it is closed
    pub iterations_per_connection: usize,

    /// Do not count `Unavailable` call statuses in `grpc_req_failed`
    pub ignore_unavailable_errors: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            categories: [
                "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota",
                "kappa",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            suffix_alphabet: "01".to_string(),
            suffix_length: 2,
            body_min_len: 10,
            body_max_len: 60,
            body_charset: "abcdefghijklmnopqrstuvwxyz".to_string(),
            expiration_min_secs: 1,
            expiration_max_secs: 20,
            fetch_probability: 1.0 / 3.0,
            iterations_per_connection: 1,
            ignore_unavailable_errors: false,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(LoadError::InvalidWorkload("categories must not be empty".into()));
        }
        if self.suffix_length > 0 && self.suffix_alphabet.is_empty() {
            return Err(LoadError::InvalidWorkload(
                "suffix_alphabet must not be empty when suffix_length > 0".into(),
            ));
        }
        if self.body_min_len > self.body_max_len {
            return Err(LoadError::InvalidWorkload(format!(
                "body length range {}..={} is empty",
                self.body_min_len, self.body_max_len
            )));
        }
        if self.body_max_len > 0 && self.body_charset.is_empty() {
            return Err(LoadError::InvalidWorkload("body_charset must not be empty".into()));
        }
        if self.expiration_min_secs > self.expiration_max_secs {
            return Err(LoadError::InvalidWorkload(format!(
                "expiration range {}..={} is empty",
                self.expiration_min_secs, self.expiration_max_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.fetch_probability) {
            return Err(LoadError::InvalidWorkload(format!(
                "fetch_probability {} outside [0, 1]",
                self.fetch_probability
            )));
        }
        if self.iterations_per_connection == 0 {
            return Err(LoadError::InvalidWorkload(
                "iterations_per_connection must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One publish and its optional follow-up fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub subject: String,
    pub body: Vec<u8>,
    pub expiration: Duration,
    /// Decided up front; the fetch still needs a publish id to happen
    pub fetch: bool,
    /// Filled in by the session once publish returns
    pub published_id: Option<i32>,
    pub did_fetch: bool,
}

/// Builds iterations from a [`WorkloadConfig`]
///
/// The generator itself holds no random state: every caller passes its own
/// RNG, so concurrent workers never share one.
#[derive(Debug, Clone)]
pub struct WorkloadGenerator {
    categories: Vec<String>,
    suffix_alphabet: Vec<char>,
    suffix_length: usize,
    body_len: RangeInclusive<usize>,
    body_charset: Vec<char>,
    expiration: RangeInclusive<u32>,
    fetch_probability: f64,
}

impl WorkloadGenerator {
    pub fn new(config: &WorkloadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            categories: config.categories.clone(),
            suffix_alphabet: config.suffix_alphabet.chars().collect(),
            suffix_length: config.suffix_length,
            body_len: config.body_min_len..=config.body_max_len,
            body_charset: config.body_charset.chars().collect(),
            expiration: config.expiration_min_secs..=config.expiration_max_secs,
            fetch_probability: config.fetch_probability,
        })
    }

    /// Number of distinct subjects this generator can produce
    pub fn subject_cardinality(&self) -> u128 {
        (self.categories.len() as u128)
            .saturating_mul((self.suffix_alphabet.len() as u128).saturating_pow(self.suffix_length as u32))
    }

    pub fn subject<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut subject = self
            .categories
            .choose(rng)
            .cloned()
            .unwrap_or_default();
        subject.push_str(&random_string(rng, self.suffix_length, &self.suffix_alphabet));
        subject
    }

    pub fn body<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<u8> {
        let len = rng.gen_range(self.body_len.clone());
        random_string(rng, len, &self.body_charset).into_bytes()
    }

    pub fn expiration<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_secs(rng.gen_range(self.expiration.clone()) as u64)
    }

    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Iteration {
        Iteration {
            subject: self.subject(rng),
            body: self.body(rng),
            expiration: self.expiration(rng),
            fetch: rng.gen_bool(self.fetch_probability),
            published_id: None,
            did_fetch: false,
        }
    }
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize, charset: &[char]) -> String {
    (0..len)
        .filter_map(|_| charset.choose(rng).copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn test_defaults_match_reference_scenario() {
        let gen = WorkloadGenerator::new(&WorkloadConfig::default()).unwrap();
        assert_eq!(gen.subject_cardinality(), 40);

        let mut rng = rng();
        for _ in 0..500 {
            let it = gen.generate(&mut rng);
            assert!((10..=60).contains(&it.body.len()));
            assert!(it.body.iter().all(|b| b.is_ascii_lowercase()));
            assert!((1..=20).contains(&it.expiration.as_secs()));
            assert!(it.published_id.is_none());
            assert!(!it.did_fetch);
        }
    }

    #[test]
    fn test_fetch_probability_extremes() {
        let mut rng = rng();
        let always = WorkloadGenerator::new(&WorkloadConfig {
            fetch_probability: 1.0,
            ..Default::default()
        })
        .unwrap();
        assert!((0..100).all(|_| always.generate(&mut rng).fetch));

        let never = WorkloadGenerator::new(&WorkloadConfig {
            fetch_probability: 0.0,
            ..Default::default()
        })
        .unwrap();
        assert!((0..100).all(|_| !never.generate(&mut rng).fetch));
    }

    #[test]
    fn test_fetch_probability_roughly_respected() {
        let gen = WorkloadGenerator::new(&WorkloadConfig::default()).unwrap();
        let mut rng = rng();
        let fetches = (0..3000).filter(|_| gen.generate(&mut rng).fetch).count();
        assert!((800..1200).contains(&fetches), "fetches = {}", fetches);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad = [
            WorkloadConfig {
                categories: vec![],
                ..Default::default()
            },
            WorkloadConfig {
                body_min_len: 61,
                ..Default::default()
            },
            WorkloadConfig {
                expiration_min_secs: 30,
                ..Default::default()
            },
            WorkloadConfig {
                fetch_probability: 1.5,
                ..Default::default()
            },
            WorkloadConfig {
                suffix_alphabet: String::new(),
                ..Default::default()
            },
            WorkloadConfig {
                iterations_per_connection: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                WorkloadGenerator::new(&config),
                Err(LoadError::InvalidWorkload(_))
            ));
        }
    }

    proptest! {
        #[test]
        fn prop_subject_shape(seed in any::<u64>(), len in 0usize..6, alphabet in "[a-z0-9]{1,5}") {
            let config = WorkloadConfig {
                categories: vec!["alpha".into(), "beta".into(), "gamma".into()],
                suffix_alphabet: alphabet.clone(),
                suffix_length: len,
                ..Default::default()
            };
            let gen = WorkloadGenerator::new(&config).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let subject = gen.subject(&mut rng);

            let category = config
                .categories
                .iter()
                .find(|c| subject.starts_with(c.as_str()) && subject.len() == c.len() + len);
            prop_assert!(category.is_some(), "subject {} has no category", subject);
            let suffix = &subject[category.unwrap().len()..];
            prop_assert!(suffix.chars().all(|c| alphabet.contains(c)));
        }
    }
}
