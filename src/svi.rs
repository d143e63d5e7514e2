//! Stochastic variational inference with a diagonal normal guide.
//!
//! The guide is a fully factorized normal on the unconstrained position.
//! Each step draws one reparameterized sample, evaluates the negative
//! ELBO and its gradient, and updates the guide with clipped Adam.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    math::{sigmoid, softplus, softplus_inv},
    nuts::LogpError,
    potential::LogpFunc,
    progress::optimization_bar,
};

#[derive(Error, Debug)]
pub enum SviError {
    #[error("loss is not finite at step {step}")]
    NonFiniteLoss { step: u64 },

    #[error("log density failed during optimization")]
    Logp(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("initial location has {found} values, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// `init · rate^(step / decay_steps)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub init: f64,
    pub decay_steps: u64,
    pub decay_rate: f64,
}

impl ExponentialDecay {
    pub fn learning_rate(&self, step: u64) -> f64 {
        self.init * self.decay_rate.powf(step as f64 / self.decay_steps.max(1) as f64)
    }
}

/// Settings for the clipped Adam optimizer
#[derive(Debug, Clone, Copy)]
pub struct ClippedAdamOptions {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Gradients are clipped elementwise to `[-clip_norm, clip_norm]`.
    pub clip_norm: f64,
}

impl Default for ClippedAdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            clip_norm: 0.1,
        }
    }
}

/// Adam on a parameter vector, with elementwise gradient clipping and a
/// decaying learning rate.
#[derive(Debug, Clone)]
pub struct ClippedAdam {
    m: Box<[f64]>,
    v: Box<[f64]>,
    t: u64,
    schedule: ExponentialDecay,
    settings: ClippedAdamOptions,
}

impl ClippedAdam {
    pub fn new(dim: usize, schedule: ExponentialDecay, settings: ClippedAdamOptions) -> Self {
        Self {
            m: vec![0f64; dim].into(),
            v: vec![0f64; dim].into(),
            t: 0,
            schedule,
            settings,
        }
    }

    /// Take one descent step on `params` given the loss gradient `grad`.
    pub fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        let lr = self.schedule.learning_rate(self.t);
        self.t += 1;
        let ClippedAdamOptions {
            beta1,
            beta2,
            epsilon,
            clip_norm,
        } = self.settings;
        let m_correction = 1. - beta1.powf(self.t as f64);
        let v_correction = 1. - beta2.powf(self.t as f64);
        for (((x, &g), m), v) in params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let g = g.clamp(-clip_norm, clip_norm);
            *m = beta1 * *m + (1. - beta1) * g;
            *v = beta2 * *v + (1. - beta2) * g * g;
            let m_hat = *m / m_correction;
            let v_hat = *v / v_correction;
            *x -= lr * m_hat / (v_hat.sqrt() + epsilon);
        }
    }
}

/// A diagonal normal guide on the unconstrained position.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoDiagonalNormal {
    pub loc: Vec<f64>,
    /// Unconstrained scale, `scale = softplus(raw_scale)`.
    pub raw_scale: Vec<f64>,
}

impl AutoDiagonalNormal {
    pub fn new(loc: Vec<f64>, init_scale: f64) -> Self {
        let raw_scale = vec![softplus_inv(init_scale); loc.len()];
        AutoDiagonalNormal { loc, raw_scale }
    }

    pub fn dim(&self) -> usize {
        self.loc.len()
    }

    pub fn scale(&self) -> Vec<f64> {
        self.raw_scale.iter().map(|&u| softplus(u)).collect()
    }

    fn params(&self) -> Vec<f64> {
        self.loc.iter().chain(&self.raw_scale).copied().collect()
    }

    fn set_params(&mut self, params: &[f64]) {
        let (loc, raw_scale) = params.split_at(self.dim());
        self.loc.copy_from_slice(loc);
        self.raw_scale.copy_from_slice(raw_scale);
    }
}

/// Negative ELBO with a single reparameterized sample.
struct TraceElbo {
    noise: Vec<f64>,
    sample: Vec<f64>,
    logp_grad: Vec<f64>,
}

impl TraceElbo {
    fn new(dim: usize) -> Self {
        TraceElbo {
            noise: vec![0.; dim],
            sample: vec![0.; dim],
            logp_grad: vec![0.; dim],
        }
    }

    /// Loss and its gradient with respect to `(loc, raw_scale)`.
    fn loss_and_grad<F: LogpFunc, R: Rng + ?Sized>(
        &mut self,
        model: &mut F,
        guide: &AutoDiagonalNormal,
        rng: &mut R,
        grad: &mut [f64],
    ) -> Result<f64, SviError> {
        let dim = guide.dim();
        let scale = guide.scale();
        for i in 0..dim {
            self.noise[i] = rng.sample(StandardNormal);
            self.sample[i] = guide.loc[i] + scale[i] * self.noise[i];
        }
        let logp = match model.logp(&self.sample, &mut self.logp_grad) {
            Ok(logp) => logp,
            Err(err) if err.is_recoverable() => return Ok(f64::NAN),
            Err(err) => return Err(SviError::Logp(Box::new(err))),
        };
        let entropy: f64 = self
            .noise
            .iter()
            .zip(&scale)
            .map(|(e, s)| 0.5 * e * e + s.ln() + 0.5 * (2. * PI).ln())
            .sum();

        let (loc_grad, scale_grad) = grad.split_at_mut(dim);
        for i in 0..dim {
            loc_grad[i] = -self.logp_grad[i];
            let d_scale = -(self.logp_grad[i] * self.noise[i] + scale[i].recip());
            scale_grad[i] = d_scale * sigmoid(guide.raw_scale[i]);
        }
        Ok(-(logp + entropy))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SviSettings {
    pub num_steps: u64,
    pub init_scale: f64,
    pub learning_rate: f64,
    pub decay_rate: f64,
    pub adam: ClippedAdamOptions,
    pub progress_bar: bool,
}

impl Default for SviSettings {
    fn default() -> Self {
        SviSettings {
            num_steps: 3200,
            init_scale: 0.01,
            learning_rate: 0.01,
            decay_rate: 0.01,
            adam: ClippedAdamOptions::default(),
            progress_bar: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SviResult {
    pub guide: AutoDiagonalNormal,
    pub losses: Vec<f64>,
}

impl SviResult {
    pub fn auto_loc(&self) -> &[f64] {
        &self.guide.loc
    }

    pub fn auto_scale(&self) -> Vec<f64> {
        self.guide.scale()
    }
}

/// Fit a diagonal normal guide to `model`, starting at `init_loc`.
pub fn run_svi<F: LogpFunc, R: Rng + ?Sized>(
    model: &mut F,
    init_loc: &[f64],
    settings: &SviSettings,
    rng: &mut R,
) -> Result<SviResult, SviError> {
    let dim = model.dim();
    if init_loc.len() != dim {
        return Err(SviError::DimensionMismatch {
            expected: dim,
            found: init_loc.len(),
        });
    }
    let mut guide = AutoDiagonalNormal::new(init_loc.to_vec(), settings.init_scale);
    let schedule = ExponentialDecay {
        init: settings.learning_rate,
        decay_steps: settings.num_steps,
        decay_rate: settings.decay_rate,
    };
    let mut optimizer = ClippedAdam::new(2 * dim, schedule, settings.adam);
    let mut elbo = TraceElbo::new(dim);
    let mut grad = vec![0f64; 2 * dim];
    let mut params = guide.params();
    let mut losses = Vec::with_capacity(settings.num_steps as usize);

    let report_every = (settings.num_steps / 20).max(1);
    let bar = optimization_bar(settings.num_steps, settings.progress_bar);
    for step in 0..settings.num_steps {
        let loss = elbo.loss_and_grad(model, &guide, rng, &mut grad)?;
        if !loss.is_finite() {
            return Err(SviError::NonFiniteLoss { step });
        }
        if step == 0 {
            info!(loss, "initial loss");
        }
        optimizer.step(&mut params, &grad);
        guide.set_params(&params);
        losses.push(loss);

        if (step + 1) % report_every == 0 {
            let window = &losses[losses.len().saturating_sub(report_every as usize)..];
            let avg = window.iter().sum::<f64>() / window.len() as f64;
            bar.set_message(format!("avg. loss {avg:.4e}"));
            debug!(step = step + 1, avg_loss = avg, "svi progress");
        }
        bar.inc(1);
    }
    bar.finish();

    if let Some(last) = losses.last() {
        info!(steps = settings.num_steps, final_loss = last, "svi finished");
    }
    Ok(SviResult { guide, losses })
}
