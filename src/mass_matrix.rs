use itertools::izip;
use multiversion::multiversion;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    adaptation::AdaptationState,
    math::{multiply, vector_dot},
    state::PhasePoint,
};

/// Diagonal mass matrix of the kinetic energy `p^T M^{-1} p / 2`.
#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    /// Diagonal of `M^{-1}`.
    inverse: Box<[f64]>,
    /// Diagonal of `M^{1/2}`, the standard deviation of the momentum.
    sqrt: Box<[f64]>,
}

impl DiagMassMatrix {
    #[cfg(test)]
    pub(crate) fn identity(dim: usize) -> Self {
        DiagMassMatrix {
            inverse: vec![1f64; dim].into(),
            sqrt: vec![1f64; dim].into(),
        }
    }

    pub(crate) fn from_adaptation(state: &AdaptationState) -> Self {
        DiagMassMatrix {
            inverse: state.inverse_mass_matrix.clone(),
            sqrt: state.mass_matrix_sqrt.clone(),
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.inverse.len()
    }

    /// Recompute velocity and kinetic energy after the momentum changed.
    pub(crate) fn refresh(&self, point: &mut PhasePoint) {
        multiply(&self.inverse, &point.momentum, &mut point.velocity);
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    pub(crate) fn draw_momentum<R: Rng + ?Sized>(&self, point: &mut PhasePoint, rng: &mut R) {
        izip!(point.momentum.iter_mut(), self.sqrt.iter()).for_each(|(p, &s)| {
            let z: f64 = rng.sample(StandardNormal);
            *p = s * z;
        });
        self.refresh(point);
    }
}

/// Welford estimator of the per-coordinate variance of the draws in one
/// adaptation window.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        RunningVariance {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        add_sample(&mut self.mean, &mut self.m2, value, self.count as f64);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Sample variance shrunk towards `1e-3`, as in Stan's windowed
    /// adaptation. `None` until two draws were seen.
    pub(crate) fn regularized(&self) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let shrink = n / (n + 5.);
        let prior = 1e-3 * (5. / (n + 5.));
        Some(
            self.m2
                .iter()
                .map(|&m2| shrink * (m2 / (n - 1.)) + prior)
                .collect(),
        )
    }

    pub(crate) fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
fn add_sample(mean: &mut [f64], m2: &mut [f64], value: &[f64], count: f64) {
    izip!(value, mean.iter_mut(), m2.iter_mut()).for_each(|(&x, mean, m2)| {
        let delta = x - *mean;
        *mean += delta / count;
        *m2 += delta * (x - *mean);
    });
}
