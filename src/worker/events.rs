//! Routing keys and payload bodies for writer loops.
//!
//! Keys are drawn uniformly from `number_of_keys` names, or, with
//! `dynamic_key_probability`, from a clipped normal distribution centred on
//! a hot key that moves to a random position every ten minutes.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::config::PayloadConfig;

const HOT_KEY_INTERVAL: Duration = Duration::from_secs(600);
const GAUSSIAN_CLIP: f64 = 2.0;

/// One routing key and body about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedEvent {
    pub key: String,
    pub data: String,
}

#[derive(Debug)]
pub struct EventGenerator {
    rng: StdRng,
    number_of_keys: usize,
    minimum_size: usize,
    maximum_size: usize,
    dynamic: bool,
    hot_key: usize,
    hot_key_since: Instant,
}

impl EventGenerator {
    #[must_use]
    pub fn new(config: &PayloadConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic generator for tests.
    #[must_use]
    pub fn with_seed(config: &PayloadConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &PayloadConfig, mut rng: StdRng) -> Self {
        let number_of_keys = config.number_of_keys.max(1);
        let minimum_size = config.minimum_size;
        let maximum_size = config.effective_maximum_size().max(minimum_size);
        let hot_key = rng.random_range(0..number_of_keys);
        Self {
            rng,
            number_of_keys,
            minimum_size,
            maximum_size,
            dynamic: config.dynamic_key_probability,
            hot_key,
            hot_key_since: Instant::now(),
        }
    }

    pub fn next_event(&mut self) -> GeneratedEvent {
        let index = if self.dynamic {
            self.skewed_index()
        } else {
            self.rng.random_range(0..self.number_of_keys)
        };
        let size = self.rng.random_range(self.minimum_size..=self.maximum_size);
        let data = (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(size)
            .map(char::from)
            .collect();
        GeneratedEvent {
            key: key_name(index),
            data,
        }
    }

    fn skewed_index(&mut self) -> usize {
        if self.hot_key_since.elapsed() >= HOT_KEY_INTERVAL {
            self.hot_key = self.rng.random_range(0..self.number_of_keys);
            self.hot_key_since = Instant::now();
        }
        let spread = self.number_of_keys as f64 / (2.0 * GAUSSIAN_CLIP);
        let offset = (self.gaussian() * spread).round();
        let keys = self.number_of_keys as i64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let shifted = self.hot_key as i64 + offset as i64;
        #[allow(clippy::cast_sign_loss)]
        let index = shifted.rem_euclid(keys) as usize;
        index
    }

    /// Standard normal sample (Box-Muller), clipped to `[-2, 2]`.
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.random();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        z.clamp(-GAUSSIAN_CLIP, GAUSSIAN_CLIP)
    }

    #[must_use]
    pub const fn hot_key(&self) -> usize {
        self.hot_key
    }
}

#[must_use]
pub fn key_name(index: usize) -> String {
    format!("key{index}")
}
