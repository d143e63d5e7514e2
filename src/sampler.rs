use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    adaptation::AdaptationState,
    chain::Chain,
    progress::{record_draw, ChainBars},
    runtime::Runtime,
};

/// Diagnostic information about a single draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub draw: u64,
    pub chain: u64,
    pub diverging: bool,
    pub tuning: bool,
    pub step_size: f64,
    pub num_steps: u64,
    pub accept_prob: f64,
    pub depth: u64,
    pub reached_maxdepth: bool,
    pub logp: f64,
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Total draws per chain, tuning draws included. All are kept.
    pub num_draws: u64,
    pub num_chains: usize,
    pub seed: u64,
    pub progress_bar: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        SamplerSettings {
            num_draws: 300,
            num_chains: 1,
            seed: 0,
            progress_bar: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainTrace {
    pub chain: u64,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<Progress>,
    /// Step size and mass matrix after the last draw.
    pub final_adaptation: AdaptationState,
}

impl ChainTrace {
    pub fn num_divergences(&self) -> usize {
        self.stats.iter().filter(|s| s.diverging).count()
    }

    pub fn mean_accept_prob(&self) -> f64 {
        self.stats.iter().map(|s| s.accept_prob).sum::<f64>() / self.stats.len() as f64
    }
}

/// Draws of all chains, in chain order.
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<ChainTrace>,
}

impl Trace {
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn num_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.num_divergences()).sum()
    }

    /// Values of coordinate `idx`, one vector per chain.
    pub fn coordinate(&self, idx: usize) -> Vec<Vec<f64>> {
        self.chains
            .iter()
            .map(|c| c.draws.iter().map(|d| d[idx]).collect())
            .collect()
    }
}

/// The random number generator of chain `chain` for a given seed.
pub fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

fn run_chain<C: Chain>(
    mut sampler: C,
    chain: u64,
    init: &[f64],
    settings: &SamplerSettings,
    bar: indicatif::ProgressBar,
) -> Result<ChainTrace> {
    sampler
        .set_position(init)
        .with_context(|| format!("Could not initialize chain {chain}"))?;

    let mut draws = Vec::with_capacity(settings.num_draws as usize);
    let mut stats = Vec::with_capacity(settings.num_draws as usize);
    for _ in 0..settings.num_draws {
        let (position, progress) = sampler
            .draw()
            .with_context(|| format!("Sampling failed in chain {chain}"))?;
        record_draw(&bar, &progress);
        draws.push(position);
        stats.push(progress);
    }
    bar.finish();

    let trace = ChainTrace {
        chain,
        draws,
        stats,
        final_adaptation: sampler.adaptation_state(),
    };
    info!(
        chain,
        divergences = trace.num_divergences(),
        step_size = trace.final_adaptation.step_size,
        "chain finished"
    );
    Ok(trace)
}

/// Run `settings.num_chains` chains from `init` on the runtime's thread pool.
///
/// Chains are created inside their worker thread by `make_chain`, which
/// receives the chain index and its random number generator.
pub fn sample_parallel<C, F>(
    runtime: &Runtime,
    settings: &SamplerSettings,
    init: &[f64],
    make_chain: F,
) -> Result<Trace>
where
    C: Chain,
    F: Fn(u64, ChaCha8Rng) -> Result<C> + Sync,
{
    debug!(?settings, "starting chains");
    let bars = ChainBars::new(settings.num_chains, settings.num_draws, settings.progress_bar);
    let results: Vec<Result<ChainTrace>> = runtime.pool().install(|| {
        (0..settings.num_chains)
            .into_par_iter()
            .map(|idx| {
                let chain = idx as u64;
                let sampler = make_chain(chain, chain_rng(settings.seed, chain))?;
                run_chain(sampler, chain, init, settings, bars.bar(idx))
            })
            .collect()
    });
    let chains = results.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(Trace { chains })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{NutsChain, NutsSettings},
        config::Device,
        potential::test_logps::NormalLogp,
    };
    use pretty_assertions::assert_eq;

    fn run(seed: u64, num_chains: usize) -> Trace {
        let runtime = Runtime::new(Device::Cpu, num_chains).unwrap();
        let settings = SamplerSettings {
            num_draws: 80,
            num_chains,
            seed,
            progress_bar: false,
        };
        sample_parallel(&runtime, &settings, &[0.5, 0.5], |chain, rng| {
            NutsChain::new(
                NormalLogp::new(2, 0.),
                NutsSettings {
                    num_tune: 50,
                    ..Default::default()
                },
                AdaptationState::unit(0.1, 2),
                rng,
                chain,
            )
        })
        .unwrap()
    }

    #[test]
    fn chains_are_reproducible() {
        let first = run(3, 2);
        let second = run(3, 2);
        assert_eq!(first.num_chains(), 2);
        for (a, b) in first.chains.iter().zip(&second.chains) {
            assert_eq!(a.draws, b.draws);
            assert_eq!(a.final_adaptation, b.final_adaptation);
        }
        assert_eq!(first.chains[0].draws.len(), 80);
        assert_ne!(first.chains[0].draws, first.chains[1].draws);
        assert_eq!(first.coordinate(1)[0].len(), 80);
    }

    #[test]
    fn tuning_flag_covers_warmup() {
        let trace = run(0, 1);
        let stats = &trace.chains[0].stats;
        assert!(stats[..50].iter().all(|s| s.tuning));
        assert!(stats[50..].iter().all(|s| !s.tuning));
        assert!(trace.chains[0].mean_accept_prob() > 0.3);
    }
}
