//! Raw observations, their transformation into model arrays, and the
//! deterministic initial values used to start inference.

use std::{fs::File, io::BufReader, ops::Range, path::Path, sync::Arc};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma as GammaSampler, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Gamma};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{AgeModel, ParameterSet};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("could not read dataset {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse dataset")]
    Parse(#[from] serde_json::Error),

    #[error("invalid dataset: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> DataError {
    DataError::Invalid(msg.into())
}

/// Mean and standard deviation of a gamma distributed delay in days.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaDelay {
    pub mean: f64,
    pub sd: f64,
}

impl GammaDelay {
    fn distribution(&self) -> Result<Gamma, DataError> {
        if !(self.mean > 0. && self.sd > 0.) {
            return Err(invalid(format!(
                "gamma delay needs positive mean and sd, got {} and {}",
                self.mean, self.sd
            )));
        }
        let shape = (self.mean / self.sd).powi(2);
        let rate = self.mean / (self.sd * self.sd);
        Gamma::new(shape, rate).map_err(|e| invalid(format!("gamma delay: {e}")))
    }

    /// Probability mass of days `0..len`, with day `s` covering
    /// `[s - 0.5, s + 0.5)` and nothing on day zero.
    fn discretize(&self, len: usize) -> Result<Vec<f64>, DataError> {
        let dist = self.distribution()?;
        let mut pmf = vec![0f64; len];
        for (s, p) in pmf.iter_mut().enumerate().skip(1) {
            let lower = if s == 1 { 0. } else { s as f64 - 0.5 };
            *p = dist.cdf(s as f64 + 0.5) - dist.cdf(lower);
        }
        Ok(pmf)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    pub locations: Vec<String>,
    pub age_groups: Vec<String>,
    /// Days of constant seeding at the start of the epidemic (`N0`).
    pub num_seed_days: usize,
    /// Days modelled in total (`N2`).
    pub num_days: usize,
    /// Longest serial interval considered (`SI_CUT`).
    pub si_cut: usize,
    /// Population by location and age group.
    pub population: Vec<Vec<f64>>,
    /// Contacts of age group `a` (row) with age group `b` (column).
    pub contact_matrix: Vec<Vec<f64>>,
    pub ifr: Vec<f64>,
    pub serial_interval: GammaDelay,
    pub death_delay: GammaDelay,
    /// First day of the intervention in each location.
    pub intervention_day: Vec<usize>,
    /// Deaths by location, day and age group; `None` if not reported.
    pub deaths: Vec<Vec<Vec<Option<u32>>>>,
}

impl RawDataset {
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    pub fn num_age_groups(&self) -> usize {
        self.age_groups.len()
    }

    pub fn validate(&self) -> Result<(), DataError> {
        let m = self.num_locations();
        let a = self.num_age_groups();
        if m == 0 || a == 0 {
            return Err(invalid("at least one location and age group are required"));
        }
        if self.num_seed_days == 0 || self.num_days <= self.num_seed_days {
            return Err(invalid(format!(
                "need 0 < N0 < N2, got N0 = {} and N2 = {}",
                self.num_seed_days, self.num_days
            )));
        }
        if self.si_cut == 0 {
            return Err(invalid("SI_CUT must be positive"));
        }
        if self.population.len() != m || self.population.iter().any(|p| p.len() != a) {
            return Err(invalid("population must be locations x age groups"));
        }
        if self
            .population
            .iter()
            .flatten()
            .any(|&p| !(p > 0. && p.is_finite()))
        {
            return Err(invalid("population counts must be positive"));
        }
        if self.contact_matrix.len() != a || self.contact_matrix.iter().any(|r| r.len() != a) {
            return Err(invalid("contact matrix must be age groups x age groups"));
        }
        if self
            .contact_matrix
            .iter()
            .flatten()
            .any(|&c| !(c >= 0. && c.is_finite()))
        {
            return Err(invalid("contact rates must be non-negative"));
        }
        if self.ifr.len() != a || self.ifr.iter().any(|&r| !(r > 0. && r <= 1.)) {
            return Err(invalid("one infection fatality ratio in (0, 1] per age group"));
        }
        if self.intervention_day.len() != m {
            return Err(invalid("one intervention day per location"));
        }
        if self.deaths.len() != m
            || self
                .deaths
                .iter()
                .any(|d| d.len() != self.num_days || d.iter().any(|day| day.len() != a))
        {
            return Err(invalid("deaths must be locations x days x age groups"));
        }
        Ok(())
    }
}

/// One reported death count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub day: usize,
    pub age: usize,
    pub count: f64,
    pub ln_factorial: f64,
}

/// Model-ready arrays derived from a [`RawDataset`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedDataset {
    pub num_locations: usize,
    pub num_age_groups: usize,
    pub num_seed_days: usize,
    pub num_days: usize,
    pub si_cut: usize,
    /// Population share of each age group, by location.
    pub population_share: Vec<f64>,
    /// Row-major contact matrix with spectral radius one.
    pub contact: Vec<f64>,
    /// Serial interval mass for lags `0..=si_cut`, summing to one.
    pub serial_interval: Vec<f64>,
    /// Infection-to-death mass for lags `0..num_days`.
    pub death_delay: Vec<f64>,
    pub ifr: Vec<f64>,
    /// One if the intervention is active, by location and day.
    pub intervention: Vec<f64>,
    /// Observations from day `N0` on, grouped by location.
    pub observations: Vec<Observation>,
    observation_ranges: Vec<Range<usize>>,
}

impl TransformedDataset {
    pub fn population_share(&self, location: usize) -> &[f64] {
        let a = self.num_age_groups;
        &self.population_share[location * a..(location + 1) * a]
    }

    pub fn intervention(&self, location: usize, day: usize) -> f64 {
        self.intervention[location * self.num_days + day]
    }

    pub fn observations_for(&self, location: usize) -> &[Observation] {
        &self.observations[self.observation_ranges[location].clone()]
    }
}

/// Largest eigenvalue of a non-negative square matrix by power iteration.
fn spectral_radius(matrix: &[f64], n: usize) -> f64 {
    let mut v = vec![1f64 / n as f64; n];
    let mut radius = 0f64;
    for _ in 0..500 {
        let next: Vec<f64> = (0..n)
            .map(|i| (0..n).map(|j| matrix[i * n + j] * v[j]).sum())
            .collect();
        let norm: f64 = next.iter().sum();
        if norm <= 0. {
            return 0.;
        }
        let converged = (norm - radius).abs() <= 1e-12 * norm;
        radius = norm;
        v = next.into_iter().map(|x| x / norm).collect();
        if converged {
            break;
        }
    }
    radius
}

fn ln_factorial(count: u32) -> f64 {
    statrs::function::factorial::ln_factorial(count as u64)
}

pub fn transform_data(raw: &RawDataset) -> Result<TransformedDataset, DataError> {
    raw.validate()?;
    let m = raw.num_locations();
    let a = raw.num_age_groups();

    let population_share = raw
        .population
        .iter()
        .flat_map(|row| {
            let total: f64 = row.iter().sum();
            row.iter().map(move |p| p / total)
        })
        .collect();

    let contact: Vec<f64> = raw.contact_matrix.iter().flatten().copied().collect();
    let radius = spectral_radius(&contact, a);
    if !(radius > 0.) {
        return Err(invalid("contact matrix has no positive eigenvalue"));
    }
    let contact = contact.iter().map(|c| c / radius).collect();

    let mut serial_interval = raw.serial_interval.discretize(raw.si_cut + 1)?;
    let total: f64 = serial_interval.iter().sum();
    if !(total > 0.) {
        return Err(invalid("serial interval has no mass below SI_CUT"));
    }
    serial_interval.iter_mut().for_each(|p| *p /= total);

    let death_delay = raw.death_delay.discretize(raw.num_days)?;

    let mut intervention = vec![0f64; m * raw.num_days];
    for (loc, &start) in raw.intervention_day.iter().enumerate() {
        for day in start.min(raw.num_days)..raw.num_days {
            intervention[loc * raw.num_days + day] = 1.;
        }
    }

    let mut observations = Vec::new();
    let mut observation_ranges = Vec::with_capacity(m);
    for deaths in &raw.deaths {
        let start = observations.len();
        for (day, by_age) in deaths.iter().enumerate().skip(raw.num_seed_days) {
            for (age, count) in by_age.iter().enumerate() {
                if let Some(count) = *count {
                    observations.push(Observation {
                        day,
                        age,
                        count: count as f64,
                        ln_factorial: ln_factorial(count),
                    });
                }
            }
        }
        observation_ranges.push(start..observations.len());
    }
    debug!(
        observations = observations.len(),
        spectral_radius = radius,
        "transformed dataset"
    );

    Ok(TransformedDataset {
        num_locations: m,
        num_age_groups: a,
        num_seed_days: raw.num_seed_days,
        num_days: raw.num_days,
        si_cut: raw.si_cut,
        population_share,
        contact,
        serial_interval,
        death_delay,
        ifr: raw.ifr.clone(),
        intervention,
        observations,
        observation_ranges,
    })
}

/// Shape and seed of a simulated dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticOptions {
    pub num_locations: usize,
    pub num_age_groups: usize,
    pub num_seed_days: usize,
    pub num_days: usize,
    pub si_cut: usize,
    pub seed: u64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        SyntheticOptions {
            num_locations: 2,
            num_age_groups: 3,
            num_seed_days: 6,
            num_days: 60,
            si_cut: 21,
            seed: 2020,
        }
    }
}

fn age_labels(num_age_groups: usize) -> Vec<String> {
    let width = (80 / num_age_groups.max(1)).max(1);
    (0..num_age_groups)
        .map(|i| {
            if i + 1 == num_age_groups {
                format!("{}+", i * width)
            } else {
                format!("{}-{}", i * width, (i + 1) * width - 1)
            }
        })
        .collect()
}

/// Simulate deaths from the model with fixed parameters.
pub fn synthetic(options: &SyntheticOptions) -> Result<RawDataset, DataError> {
    let m = options.num_locations;
    let a = options.num_age_groups;
    let n2 = options.num_days;

    let ifr = (0..a)
        .map(|age| {
            if a == 1 {
                5e-3
            } else {
                1e-4 * 300f64.powf(age as f64 / (a - 1) as f64)
            }
        })
        .collect();
    let mut raw = RawDataset {
        locations: (0..m).map(|i| format!("region-{i}")).collect(),
        age_groups: age_labels(a),
        num_seed_days: options.num_seed_days,
        num_days: n2,
        si_cut: options.si_cut,
        population: (0..m)
            .map(|loc| {
                (0..a)
                    .map(|age| 1e6 * (loc + 1) as f64 * (1. - 0.05 * age as f64).max(0.2))
                    .collect()
            })
            .collect(),
        contact_matrix: (0..a)
            .map(|i| (0..a).map(|j| if i == j { 3. } else { 1. }).collect())
            .collect(),
        ifr,
        serial_interval: GammaDelay {
            mean: 6.5,
            sd: 0.62 * 6.5,
        },
        death_delay: GammaDelay {
            mean: 23.,
            sd: 9.1,
        },
        intervention_day: (0..m)
            .map(|loc| options.num_seed_days + (n2 - options.num_seed_days.min(n2)) / 3 + loc)
            .collect(),
        deaths: vec![vec![vec![None; a]; n2]; m],
    };

    let data = Arc::new(transform_data(&raw)?);
    let mut model = AgeModel::new(data);
    let mut truth = ParameterSet::new();
    truth.insert("log_r0", vec![2.4f64.ln(); m]);
    truth.insert("log_e0", vec![100f64.ln(); m]);
    truth.insert("npi_effect", vec![1.2; m]);
    truth.insert("log_rho", vec![0.; a]);
    truth.insert("log_phi", vec![20f64.ln()]);
    let position = model
        .layout()
        .flatten(&truth)
        .map_err(|e| invalid(e.to_string()))?;
    let expected = model
        .expected_deaths(&position)
        .map_err(|e| invalid(e.to_string()))?;

    let phi = 20f64;
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    for loc in 0..m {
        for day in options.num_seed_days..n2 {
            for age in 0..a {
                let mu = expected[(loc * n2 + day) * a + age];
                let count = if mu > 0. {
                    let rate = GammaSampler::new(phi, mu / phi)
                        .map_err(|e| invalid(format!("simulated rate: {e}")))?
                        .sample(&mut rng);
                    if rate > 0. {
                        Poisson::new(rate)
                            .map_err(|e| invalid(format!("simulated count: {e}")))?
                            .sample(&mut rng)
                    } else {
                        0.
                    }
                } else {
                    0.
                };
                raw.deaths[loc][day][age] = Some(count as u32);
            }
        }
    }
    info!(
        locations = m,
        age_groups = a,
        days = n2,
        "simulated synthetic dataset"
    );
    Ok(raw)
}

/// Load a dataset from JSON, or simulate the default synthetic one.
pub fn get_data(path: Option<&Path>) -> Result<RawDataset, DataError> {
    let Some(path) = path else {
        return synthetic(&SyntheticOptions::default());
    };
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawDataset = serde_json::from_reader(BufReader::new(file))?;
    raw.validate()?;
    info!(path = %path.display(), "loaded dataset");
    Ok(raw)
}

const INIT_JITTER: f64 = 0.1;

/// Prior means with a small deterministic jitter, for every latent site.
pub fn generate_init_values(data: &TransformedDataset, seed: u64) -> ParameterSet {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut values = ParameterSet::new();
    for site in AgeModel::sites(data) {
        let init = (0..site.size)
            .map(|_| site.prior.loc + INIT_JITTER * rng.sample::<f64, _>(StandardNormal))
            .collect();
        values.insert(site.name, init);
    }
    values
}
