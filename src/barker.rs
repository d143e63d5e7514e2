//! Metropolis-Hastings with the Barker proposal.
//!
//! Each coordinate moves by a Gaussian increment whose sign is flipped
//! towards the gradient with probability `sigmoid(w·g)`. The increments
//! are scaled by the step size and the square root of the inverse mass
//! matrix, both tuned during warmup.

use anyhow::{ensure, Result};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    adaptation::{AdaptEvent, AdaptationState, WarmupAdapter, WarmupSettings},
    chain::Chain,
    math::{sigmoid, softplus},
    nuts::{LogpError, NutsError},
    potential::LogpFunc,
    sampler::Progress,
};

#[derive(Debug, Clone, Copy)]
pub struct BarkerSettings {
    pub num_tune: u64,
    pub warmup: WarmupSettings,
}

impl Default for BarkerSettings {
    fn default() -> Self {
        BarkerSettings {
            num_tune: 1000,
            warmup: WarmupSettings {
                target_accept: 0.4,
                ..WarmupSettings::default()
            },
        }
    }
}

pub struct BarkerChain<F: LogpFunc, R: Rng> {
    logp: F,
    rng: R,
    adapter: WarmupAdapter,
    position: Box<[f64]>,
    grad: Box<[f64]>,
    logp_value: f64,
    proposal: Box<[f64]>,
    proposal_grad: Box<[f64]>,
    increment: Box<[f64]>,
    chain: u64,
    draw_count: u64,
}

impl<F: LogpFunc, R: Rng> BarkerChain<F, R> {
    pub fn new(
        logp: F,
        settings: BarkerSettings,
        initial: AdaptationState,
        rng: R,
        chain: u64,
    ) -> Result<Self> {
        let dim = logp.dim();
        ensure!(
            initial.dim() == dim,
            "mass matrix has dimension {} but the density has {}",
            initial.dim(),
            dim
        );
        Ok(BarkerChain {
            logp,
            rng,
            adapter: WarmupAdapter::new(settings.warmup, settings.num_tune, initial),
            position: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
            logp_value: f64::NEG_INFINITY,
            proposal: vec![0f64; dim].into(),
            proposal_grad: vec![0f64; dim].into(),
            increment: vec![0f64; dim].into(),
            chain,
            draw_count: 0,
        })
    }

    /// Fill `proposal` and `increment` with a Barker move from `position`.
    fn propose(&mut self) {
        let state = self.adapter.current();
        let step_size = state.step_size;
        for i in 0..self.position.len() {
            let scale = state.inverse_mass_matrix[i].sqrt();
            let normal: f64 = self.rng.sample(StandardNormal);
            let w = step_size * scale * normal;
            let toward_gradient = self.rng.random::<f64>() < sigmoid(w * self.grad[i]);
            let z = if toward_gradient { w } else { -w };
            self.increment[i] = z;
            self.proposal[i] = self.position[i] + z;
        }
    }

    /// Log acceptance ratio and log density of the current proposal.
    /// The ratio is `-inf` if the density could not be evaluated.
    fn log_accept_ratio(&mut self) -> Result<(f64, f64)> {
        let rejected = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        let proposal_logp = match self.logp.logp(&self.proposal, &mut self.proposal_grad) {
            Ok(value) => value,
            Err(err) if err.is_recoverable() => return Ok(rejected),
            Err(err) => return Err(NutsError::LogpFailure(Box::new(err)).into()),
        };
        if !proposal_logp.is_finite() || !self.proposal_grad.iter().all(|g| g.is_finite()) {
            return Ok(rejected);
        }
        let correction: f64 = self
            .increment
            .iter()
            .zip(self.grad.iter().zip(self.proposal_grad.iter()))
            .map(|(&z, (&g_x, &g_y))| softplus(-z * g_x) - softplus(z * g_y))
            .sum();
        Ok((proposal_logp - self.logp_value + correction, proposal_logp))
    }
}

impl<F: LogpFunc, R: Rng> Chain for BarkerChain<F, R> {
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        ensure!(position.len() == self.dim(), "initial position has wrong length");
        self.position.copy_from_slice(position);
        let value = self
            .logp
            .logp(&self.position, &mut self.grad)
            .map_err(|e| NutsError::BadInitialPosition(Box::new(e)))?;
        if !value.is_finite() || !self.grad.iter().all(|g| g.is_finite()) {
            return Err(NutsError::BadInitialPosition(
                "log density at the initial position is not finite".into(),
            )
            .into());
        }
        self.logp_value = value;
        Ok(())
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, Progress)> {
        let step_size = self.adapter.current().step_size;
        self.propose();
        let (log_alpha, proposal_logp) = self.log_accept_ratio()?;
        let accept_prob = if log_alpha.is_nan() {
            0.
        } else {
            log_alpha.min(0.).exp()
        };

        if self.rng.random::<f64>() < accept_prob {
            std::mem::swap(&mut self.position, &mut self.proposal);
            std::mem::swap(&mut self.grad, &mut self.proposal_grad);
            self.logp_value = proposal_logp;
        }

        let tuning = self.adapter.is_tuning(self.draw_count);
        if tuning
            && self.adapter.adapt(self.draw_count, &self.position, accept_prob)
                == AdaptEvent::MassMatrixUpdated
        {
            let step_size = self.adapter.current().step_size;
            self.adapter.restart_step_size(step_size);
        }

        let progress = Progress {
            draw: self.draw_count,
            chain: self.chain,
            diverging: false,
            tuning,
            step_size,
            num_steps: 1,
            accept_prob,
            depth: 0,
            reached_maxdepth: false,
            logp: self.logp_value,
        };
        self.draw_count += 1;
        Ok((self.position.clone(), progress))
    }

    fn dim(&self) -> usize {
        self.position.len()
    }

    fn adaptation_state(&self) -> AdaptationState {
        self.adapter.current().clone()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use thiserror::Error;

    use super::*;
    use crate::potential::test_logps::NormalLogp;

    #[derive(Debug, Error)]
    #[error("outside of the support")]
    struct OutsideSupport;

    impl LogpError for OutsideSupport {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    /// A standard normal truncated to the positive half line.
    struct HalfNormal;

    impl LogpFunc for HalfNormal {
        type LogpError = OutsideSupport;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, OutsideSupport> {
            if position[0] < 0. {
                return Err(OutsideSupport);
            }
            grad[0] = -position[0];
            Ok(-0.5 * position[0] * position[0])
        }
    }

    fn settings(num_tune: u64) -> BarkerSettings {
        BarkerSettings {
            num_tune,
            ..Default::default()
        }
    }

    #[test]
    fn samples_shifted_normal() {
        let mut chain = BarkerChain::new(
            NormalLogp::new(2, 1.),
            settings(500),
            AdaptationState::unit(0.5, 2),
            ChaCha8Rng::seed_from_u64(11),
            0,
        )
        .unwrap();
        chain.set_position(&[0., 0.]).unwrap();

        let mut sum = 0.;
        let mut accept = 0.;
        let num_samples = 4000;
        for _ in 0..500 {
            chain.draw().unwrap();
        }
        for _ in 0..num_samples {
            let (position, progress) = chain.draw().unwrap();
            assert!(!progress.tuning);
            sum += position.iter().sum::<f64>();
            accept += progress.accept_prob;
        }
        let mean = sum / (2. * num_samples as f64);
        assert!((mean - 1.).abs() < 0.25, "mean {mean}");
        let accept = accept / num_samples as f64;
        assert!(accept > 0.15 && accept < 0.8, "acceptance {accept}");
    }

    #[test]
    fn tracks_log_density_of_current_point() {
        let mut chain = BarkerChain::new(
            NormalLogp::new(3, 0.),
            settings(0),
            AdaptationState::unit(0.8, 3),
            ChaCha8Rng::seed_from_u64(2),
            0,
        )
        .unwrap();
        chain.set_position(&[0.3, -0.2, 1.]).unwrap();
        for _ in 0..50 {
            let (position, progress) = chain.draw().unwrap();
            let expect: f64 = position.iter().map(|x| -0.5 * x * x).sum();
            assert!((progress.logp - expect).abs() < 1e-9);
        }
    }

    #[test]
    fn recoverable_errors_are_rejected() {
        let mut chain = BarkerChain::new(
            HalfNormal,
            settings(100),
            AdaptationState::unit(1., 1),
            ChaCha8Rng::seed_from_u64(4),
            0,
        )
        .unwrap();
        chain.set_position(&[0.1]).unwrap();
        for _ in 0..500 {
            let (position, _) = chain.draw().unwrap();
            assert!(position[0] >= 0.);
        }
    }

    #[test]
    fn rejects_bad_initial_position() {
        let mut chain = BarkerChain::new(
            HalfNormal,
            settings(10),
            AdaptationState::unit(1., 1),
            ChaCha8Rng::seed_from_u64(4),
            0,
        )
        .unwrap();
        assert!(chain.set_position(&[-1.]).is_err());
    }
}
