//! The age-stratified renewal model.
//!
//! Infections are seeded at a constant rate for the first `N0` days and
//! then follow a renewal equation mixed across age groups by the contact
//! matrix. Reported deaths are negative-binomial around the infections
//! convolved with the infection-to-death delay, scaled by the per-age
//! infection fatality ratio.
//!
//! All latent sites live on the unconstrained scale, so the flat position
//! vector used by the samplers is the concatenation of the sites.

use std::{collections::BTreeMap, f64::consts::PI, sync::Arc};

use serde::{Deserialize, Serialize};
use statrs::function::gamma::{digamma, ln_gamma};
use thiserror::Error;

use crate::{data::TransformedDataset, nuts::LogpError, potential::LogpFunc};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("log density is not finite")]
    NonFiniteDensity,

    #[error("parameter site `{name}` is missing")]
    MissingSite { name: String },

    #[error("parameter site `{name}` is not part of the model")]
    UnknownSite { name: String },

    #[error("parameter site `{name}` has {found} values, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("position has {found} coordinates, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

impl LogpError for ModelError {
    fn is_recoverable(&self) -> bool {
        matches!(self, ModelError::NonFiniteDensity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalPrior {
    pub loc: f64,
    pub scale: f64,
}

impl NormalPrior {
    fn logpdf(&self, x: f64) -> f64 {
        let z = (x - self.loc) / self.scale;
        -0.5 * z * z - self.scale.ln() - 0.5 * (2. * PI).ln()
    }

    fn dlogpdf(&self, x: f64) -> f64 {
        -(x - self.loc) / (self.scale * self.scale)
    }
}

/// A named latent variable of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub name: &'static str,
    pub size: usize,
    pub prior: NormalPrior,
}

/// Values of the latent sites, keyed by site name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet(BTreeMap<String, Vec<f64>>);

impl ParameterSet {
    pub fn new() -> Self {
        ParameterSet(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.0.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn num_sites(&self) -> usize {
        self.0.len()
    }
}

/// Maps between named sites and the flat position vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLayout {
    sites: Vec<Site>,
}

impl ParamLayout {
    pub fn new(sites: Vec<Site>) -> Self {
        ParamLayout { sites }
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn dim(&self) -> usize {
        self.sites.iter().map(|s| s.size).sum()
    }

    /// Pack a parameter set into a flat position, in site order.
    pub fn flatten(&self, params: &ParameterSet) -> Result<Vec<f64>, ModelError> {
        if let Some((name, _)) = params
            .iter()
            .find(|(name, _)| !self.sites.iter().any(|s| s.name == *name))
        {
            return Err(ModelError::UnknownSite {
                name: name.to_string(),
            });
        }
        let mut out = Vec::with_capacity(self.dim());
        for site in &self.sites {
            let values = params.get(site.name).ok_or_else(|| ModelError::MissingSite {
                name: site.name.to_string(),
            })?;
            if values.len() != site.size {
                return Err(ModelError::ShapeMismatch {
                    name: site.name.to_string(),
                    expected: site.size,
                    found: values.len(),
                });
            }
            out.extend_from_slice(values);
        }
        Ok(out)
    }

    /// Split a flat position into named sites.
    pub fn unflatten(&self, position: &[f64]) -> Result<ParameterSet, ModelError> {
        if position.len() != self.dim() {
            return Err(ModelError::DimensionMismatch {
                expected: self.dim(),
                found: position.len(),
            });
        }
        let mut params = ParameterSet::new();
        let mut offset = 0;
        for site in &self.sites {
            params.insert(site.name, position[offset..offset + site.size].to_vec());
            offset += site.size;
        }
        Ok(params)
    }

    /// One label per coordinate, `site[i]` for vector sites.
    pub fn coordinate_names(&self) -> Vec<String> {
        self.sites
            .iter()
            .flat_map(|site| {
                (0..site.size).map(move |i| {
                    if site.size == 1 {
                        site.name.to_string()
                    } else {
                        format!("{}[{}]", site.name, i)
                    }
                })
            })
            .collect()
    }
}

/// Offsets of the sites in the flat position.
#[derive(Debug, Clone, Copy)]
struct Offsets {
    log_r0: usize,
    log_e0: usize,
    npi_effect: usize,
    log_rho: usize,
    log_phi: usize,
}

impl Offsets {
    fn new(num_locations: usize, num_age_groups: usize) -> Self {
        Offsets {
            log_r0: 0,
            log_e0: num_locations,
            npi_effect: 2 * num_locations,
            log_rho: 3 * num_locations,
            log_phi: 3 * num_locations + num_age_groups,
        }
    }
}

#[derive(Clone)]
pub struct AgeModel {
    data: Arc<TransformedDataset>,
    layout: ParamLayout,
    offsets: Offsets,
    infections: Vec<f64>,
    adjoint: Vec<f64>,
    conv: Vec<f64>,
    conv_adjoint: Vec<f64>,
}

impl AgeModel {
    pub fn new(data: Arc<TransformedDataset>) -> Self {
        let layout = ParamLayout::new(Self::sites(&data));
        let size = data.num_days * data.num_age_groups;
        AgeModel {
            offsets: Offsets::new(data.num_locations, data.num_age_groups),
            infections: vec![0.; size],
            adjoint: vec![0.; size],
            conv: vec![0.; data.num_age_groups],
            conv_adjoint: vec![0.; data.num_age_groups],
            layout,
            data,
        }
    }

    /// The latent sites and their priors, in position order.
    pub fn sites(data: &TransformedDataset) -> Vec<Site> {
        let m = data.num_locations;
        let a = data.num_age_groups;
        vec![
            Site {
                name: "log_r0",
                size: m,
                prior: NormalPrior {
                    loc: 1.0,
                    scale: 0.5,
                },
            },
            Site {
                name: "log_e0",
                size: m,
                prior: NormalPrior {
                    loc: 2.0,
                    scale: 1.0,
                },
            },
            Site {
                name: "npi_effect",
                size: m,
                prior: NormalPrior {
                    loc: 0.5,
                    scale: 0.5,
                },
            },
            Site {
                name: "log_rho",
                size: a,
                prior: NormalPrior {
                    loc: 0.0,
                    scale: 0.25,
                },
            },
            Site {
                name: "log_phi",
                size: 1,
                prior: NormalPrior {
                    loc: 2.0,
                    scale: 1.0,
                },
            },
        ]
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn data(&self) -> &TransformedDataset {
        &self.data
    }

    /// Run the renewal equation for one location, filling `infections`
    /// as a `[day][age]` array.
    fn forward(&mut self, position: &[f64], location: usize) {
        let data = &*self.data;
        let ages = data.num_age_groups;
        let o = self.offsets;
        let e0 = position[o.log_e0 + location].exp();
        let log_r0 = position[o.log_r0 + location];
        let npi = position[o.npi_effect + location];
        let log_rho = &position[o.log_rho..o.log_rho + ages];
        let share = data.population_share(location);

        for t in 0..data.num_seed_days {
            for a in 0..ages {
                self.infections[t * ages + a] = e0 * share[a];
            }
        }
        for t in data.num_seed_days..data.num_days {
            let lag = t.min(data.si_cut);
            for b in 0..ages {
                self.conv[b] = (1..=lag)
                    .map(|s| data.serial_interval[s] * self.infections[(t - s) * ages + b])
                    .sum();
            }
            let x = data.intervention(location, t);
            for a in 0..ages {
                let g = (log_r0 + log_rho[a] - npi * x).exp();
                let row = &data.contact[a * ages..(a + 1) * ages];
                let pressure: f64 = row.iter().zip(&self.conv).map(|(c, v)| c * v).sum();
                self.infections[t * ages + a] = g * pressure;
            }
        }
    }

    fn expected_deaths_at(&self, day: usize, age: usize) -> f64 {
        let data = &*self.data;
        let ages = data.num_age_groups;
        let convolved: f64 = (1..=day)
            .map(|s| data.death_delay[s] * self.infections[(day - s) * ages + age])
            .sum();
        data.ifr[age] * convolved
    }

    /// Expected deaths as a `[location][day][age]` array.
    pub fn expected_deaths(&mut self, position: &[f64]) -> Result<Vec<f64>, ModelError> {
        self.check_dim(position)?;
        let data = Arc::clone(&self.data);
        let mut out = vec![0.; data.num_locations * data.num_days * data.num_age_groups];
        for m in 0..data.num_locations {
            self.forward(position, m);
            for t in 0..data.num_days {
                for a in 0..data.num_age_groups {
                    out[(m * data.num_days + t) * data.num_age_groups + a] =
                        self.expected_deaths_at(t, a);
                }
            }
        }
        Ok(out)
    }

    fn check_dim(&self, position: &[f64]) -> Result<(), ModelError> {
        if position.len() != self.layout.dim() {
            return Err(ModelError::DimensionMismatch {
                expected: self.layout.dim(),
                found: position.len(),
            });
        }
        Ok(())
    }
}

/// `ln NegBinomial2(y | mu, phi)`.
fn neg_binomial_logpmf(y: f64, mu: f64, phi: f64, ln_factorial: f64) -> f64 {
    let ln_total = (phi + mu).ln();
    ln_gamma(y + phi) - ln_gamma(phi) - ln_factorial + phi * (phi.ln() - ln_total)
        + y * (mu.ln() - ln_total)
}

impl LogpFunc for AgeModel {
    type LogpError = ModelError;

    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, ModelError> {
        self.check_dim(position)?;
        grad.fill(0.);

        let data = Arc::clone(&self.data);
        let ages = data.num_age_groups;
        let o = self.offsets;

        let mut logp = 0f64;
        let mut offset = 0;
        for site in self.layout.sites() {
            for x in offset..offset + site.size {
                logp += site.prior.logpdf(position[x]);
                grad[x] += site.prior.dlogpdf(position[x]);
            }
            offset += site.size;
        }

        let phi = position[o.log_phi].exp();
        let mut dphi = 0f64;

        for m in 0..data.num_locations {
            self.forward(position, m);
            self.adjoint.fill(0.);

            for obs in data.observations_for(m) {
                let (t, a) = (obs.day, obs.age);
                let mu = self.expected_deaths_at(t, a);
                if !(mu > 0. && mu.is_finite()) {
                    return Err(ModelError::NonFiniteDensity);
                }
                let y = obs.count;
                logp += neg_binomial_logpmf(y, mu, phi, obs.ln_factorial);

                let dmu = y / mu - (phi + y) / (phi + mu);
                dphi += digamma(y + phi) - digamma(phi) + phi.ln() + 1.
                    - (phi + mu).ln()
                    - (phi + y) / (phi + mu);

                let scaled = dmu * data.ifr[a];
                for s in 1..=t {
                    self.adjoint[(t - s) * ages + a] += scaled * data.death_delay[s];
                }
            }

            let log_r0 = position[o.log_r0 + m];
            let npi = position[o.npi_effect + m];
            for t in (data.num_seed_days..data.num_days).rev() {
                let x = data.intervention(m, t);
                for b in 0..ages {
                    self.conv_adjoint[b] = 0.;
                }
                for a in 0..ages {
                    let idx = t * ages + a;
                    let contribution = self.adjoint[idx] * self.infections[idx];
                    grad[o.log_r0 + m] += contribution;
                    grad[o.log_rho + a] += contribution;
                    grad[o.npi_effect + m] -= x * contribution;

                    let g = (log_r0 + position[o.log_rho + a] - npi * x).exp();
                    let pressure_adjoint = self.adjoint[idx] * g;
                    let row = &data.contact[a * ages..(a + 1) * ages];
                    for (b, c) in row.iter().enumerate() {
                        self.conv_adjoint[b] += c * pressure_adjoint;
                    }
                }
                let lag = t.min(data.si_cut);
                for b in 0..ages {
                    let conv_adjoint = self.conv_adjoint[b];
                    for s in 1..=lag {
                        self.adjoint[(t - s) * ages + b] += conv_adjoint * data.serial_interval[s];
                    }
                }
            }

            for t in 0..data.num_seed_days {
                for a in 0..ages {
                    let idx = t * ages + a;
                    grad[o.log_e0 + m] += self.adjoint[idx] * self.infections[idx];
                }
            }
        }

        grad[o.log_phi] += dphi * phi;

        if !logp.is_finite() || !grad.iter().all(|g| g.is_finite()) {
            return Err(ModelError::NonFiniteDensity);
        }
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic, transform_data, SyntheticOptions};
    use pretty_assertions::assert_eq;

    fn small_model(ages: usize) -> AgeModel {
        let raw = synthetic(&SyntheticOptions {
            num_locations: 2,
            num_age_groups: ages,
            num_seed_days: 4,
            num_days: 30,
            si_cut: 10,
            seed: 7,
        })
        .unwrap();
        AgeModel::new(Arc::new(transform_data(&raw).unwrap()))
    }

    fn test_position(model: &AgeModel) -> Vec<f64> {
        (0..model.dim())
            .map(|i| {
                let base = [0.9, 2.5, 0.6, 0.05, 2.2];
                base[i % base.len()] + 0.01 * i as f64
            })
            .collect()
    }

    #[test]
    fn gradient_matches_finite_differences() {
        for ages in [1, 3] {
            let mut model = small_model(ages);
            let position = test_position(&model);
            let mut grad = vec![0.; model.dim()];
            let logp = model.logp(&position, &mut grad).unwrap();
            assert!(logp.is_finite());

            let mut scratch = vec![0.; model.dim()];
            let h = 1e-6;
            for i in 0..model.dim() {
                let mut up = position.clone();
                up[i] += h;
                let mut down = position.clone();
                down[i] -= h;
                let numeric = (model.logp(&up, &mut scratch).unwrap()
                    - model.logp(&down, &mut scratch).unwrap())
                    / (2. * h);
                let tol = 1e-4 * (1. + numeric.abs());
                assert!(
                    (numeric - grad[i]).abs() < tol,
                    "coordinate {i}: analytic {} numeric {}",
                    grad[i],
                    numeric
                );
            }
        }
    }

    #[test]
    fn layout_roundtrip_and_errors() {
        let model = small_model(3);
        let layout = model.layout();
        assert_eq!(layout.dim(), 3 * 2 + 3 + 1);
        let position = test_position(&model);
        let params = layout.unflatten(&position).unwrap();
        assert_eq!(params.num_sites(), 5);
        assert_eq!(params.get("log_rho").unwrap().len(), 3);
        assert_eq!(layout.flatten(&params).unwrap(), position);

        let mut missing = params.clone();
        missing.0.remove("log_phi");
        assert!(matches!(
            layout.flatten(&missing),
            Err(ModelError::MissingSite { .. })
        ));

        let mut wrong = params.clone();
        wrong.insert("log_r0", vec![0.]);
        assert!(matches!(
            layout.flatten(&wrong),
            Err(ModelError::ShapeMismatch { expected: 2, found: 1, .. })
        ));

        let mut extra = params;
        extra.insert("sigma", vec![1.]);
        assert!(matches!(
            layout.flatten(&extra),
            Err(ModelError::UnknownSite { .. })
        ));

        let names = layout.coordinate_names();
        assert_eq!(names[0], "log_r0[0]");
        assert_eq!(names.last().unwrap(), "log_phi");
    }

    #[test]
    fn exploding_epidemic_is_recoverable() {
        let mut model = small_model(1);
        let mut position = test_position(&model);
        position[0] = 400.;
        let mut grad = vec![0.; model.dim()];
        let err = model.logp(&position, &mut grad).unwrap_err();
        assert!(err.is_recoverable());

        let err = model.logp(&position[1..], &mut grad[1..]).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn expected_deaths_grow_with_r0() {
        let mut model = small_model(1);
        let position = test_position(&model);
        let low = model.expected_deaths(&position).unwrap();
        let mut high_position = position.clone();
        high_position[0] += 0.3;
        let high = model.expected_deaths(&high_position).unwrap();
        let last = model.data().num_days - 1;
        assert!(high[last] > low[last]);
        assert_eq!(low[0], 0.);
    }
}
