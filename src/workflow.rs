//! The three ways of running inference on the age model.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::{
    adaptation::{AdaptationState, WarmupSettings},
    artifact::{results_file_name, AdaptationArtifact},
    barker::{BarkerChain, BarkerSettings},
    chain::{NutsChain, NutsSettings},
    config::{Config, MassInit, Mode},
    data::{generate_init_values, get_data, transform_data, TransformedDataset},
    diagnostics::{ScaleRatio, Summary},
    model::AgeModel,
    runtime::Runtime,
    sampler::{sample_parallel, SamplerSettings, Trace},
    svi::{run_svi as fit_guide, SviSettings},
};

/// Seed of the initial values handed to SVI.
const SVI_INIT_SEED: u64 = 3;

/// Target acceptance probability of NUTS during warmup.
const NUTS_TARGET_ACCEPT: f64 = 0.95;

/// Result of a sampling workflow.
#[derive(Debug)]
pub struct McmcOutcome {
    pub trace: Trace,
    pub summary: Summary,
    /// The scale the chains were seeded with.
    pub seeded_scale: Vec<f64>,
    pub ratio: ScaleRatio,
    /// Where the results were written, if they were.
    pub results_path: Option<PathBuf>,
}

/// Load the data and dispatch to the workflow selected by `config.mode`.
pub fn run(config: &Config, runtime: &Runtime) -> Result<()> {
    info!(?config, "starting");
    let data = load_data(config)?;
    match config.mode {
        Mode::Svi => run_svi(config, data).map(|_| ()),
        Mode::Mcmc => run_mcmc(config, runtime, data).map(|_| ()),
        Mode::Barker => run_barker(config, runtime, data).map(|_| ()),
    }
}

pub fn load_data(config: &Config) -> Result<Arc<TransformedDataset>> {
    let raw = get_data(config.data.as_deref()).context("Failed to load dataset")?;
    let data = transform_data(&raw).context("Failed to transform dataset")?;
    println!(
        "M = {}  N0 = {}  N2 = {}  A = {}  SI_CUT = {}",
        data.num_locations, data.num_seed_days, data.num_days, data.num_age_groups, data.si_cut
    );
    Ok(Arc::new(data))
}

/// Fit the diagonal normal guide and store its scale and location.
pub fn run_svi(config: &Config, data: Arc<TransformedDataset>) -> Result<AdaptationArtifact> {
    let mut model = AgeModel::new(Arc::clone(&data));
    let init_values = generate_init_values(&data, SVI_INIT_SEED);
    let init_loc = model.layout().flatten(&init_values)?;

    let settings = SviSettings {
        num_steps: config.num_steps,
        progress_bar: !config.no_progress_bar,
        ..SviSettings::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let result = fit_guide(&mut model, &init_loc, &settings, &mut rng).context("SVI failed")?;

    let auto_scale = result.auto_scale();
    let init_params = model.layout().unflatten(result.auto_loc())?;
    let min = auto_scale.iter().copied().fold(f64::INFINITY, f64::min);
    let max = auto_scale.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = auto_scale.iter().sum::<f64>() / auto_scale.len() as f64;
    println!("auto_scale {min} {mean} {max}");

    let artifact = AdaptationArtifact::new(auto_scale, init_params)?;
    artifact
        .save(&config.artifact)
        .context("Failed to store the SVI result")?;
    info!(path = %config.artifact.display(), "stored svi artifact");
    Ok(artifact)
}

/// The scale the chains start from.
pub fn resolve_scale(auto_scale: &[f64], config: &Config) -> Vec<f64> {
    match config.mass_init {
        MassInit::Svi => auto_scale.iter().map(|s| s * config.scale).collect(),
        MassInit::Unit => vec![1.; auto_scale.len()],
    }
}

/// Initial position and seeded adaptation state from the stored artifact.
fn seed_chains(
    config: &Config,
    model: &AgeModel,
) -> Result<(AdaptationArtifact, Vec<f64>, Vec<f64>)> {
    let artifact = AdaptationArtifact::load(&config.artifact)?;
    let init = model
        .layout()
        .flatten(&artifact.init_params)
        .context("Stored parameters do not match the model")?;
    let scale = resolve_scale(&artifact.auto_scale, config);
    ensure!(
        scale.len() == init.len(),
        "stored scale has {} entries but the model has {} parameters",
        scale.len(),
        init.len()
    );
    Ok((artifact, init, scale))
}

fn sampler_settings(config: &Config) -> SamplerSettings {
    SamplerSettings {
        num_draws: config.num_samples + config.num_warmup,
        num_chains: config.num_chains as usize,
        seed: config.seed,
        progress_bar: !config.no_progress_bar,
    }
}

fn report(trace: Trace, model: &AgeModel, seeded_scale: Vec<f64>) -> McmcOutcome {
    let summary = Summary::from_trace(&trace, &model.layout().coordinate_names());
    println!("{summary}");

    let finals: Vec<AdaptationState> = trace
        .chains
        .iter()
        .map(|c| c.final_adaptation.clone())
        .collect();
    let ratio = ScaleRatio::new(&seeded_scale, &finals);
    for line in ratio.lines() {
        println!("{line}");
    }
    McmcOutcome {
        trace,
        summary,
        seeded_scale,
        ratio,
        results_path: None,
    }
}

/// Run NUTS seeded with the SVI result and store the seeded scale.
pub fn run_mcmc(
    config: &Config,
    runtime: &Runtime,
    data: Arc<TransformedDataset>,
) -> Result<McmcOutcome> {
    let model = AgeModel::new(data);
    let (artifact, init, scale) = seed_chains(config, &model)?;
    let seeded = AdaptationState::from_scale(config.step_size, &scale);
    let settings = NutsSettings {
        num_tune: config.num_warmup,
        maxdepth: config.mtd,
        warmup: WarmupSettings {
            target_accept: NUTS_TARGET_ACCEPT,
            adapt_step_size: true,
            ..WarmupSettings::default()
        },
        ..NutsSettings::default()
    };

    let trace = sample_parallel(runtime, &sampler_settings(config), &init, |chain, rng| {
        NutsChain::new(model.clone(), settings, seeded.clone(), rng, chain)
    })?;
    let mut outcome = report(trace, &model, scale);

    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("Could not create {}", config.output_dir.display())
    })?;
    let path = config.output_dir.join(results_file_name(config));
    AdaptationArtifact::new(outcome.seeded_scale.clone(), artifact.init_params)?
        .save(&path)
        .context("Failed to store results")?;
    info!(path = %path.display(), "stored results");
    outcome.results_path = Some(path);
    Ok(outcome)
}

/// Run the Barker sampler seeded with the SVI result.
pub fn run_barker(
    config: &Config,
    runtime: &Runtime,
    data: Arc<TransformedDataset>,
) -> Result<McmcOutcome> {
    let model = AgeModel::new(data);
    let (_, init, scale) = seed_chains(config, &model)?;
    let seeded = AdaptationState::from_scale(config.step_size, &scale);
    let settings = BarkerSettings {
        num_tune: config.num_warmup,
        ..BarkerSettings::default()
    };

    let trace = sample_parallel(runtime, &sampler_settings(config), &init, |chain, rng| {
        BarkerChain::new(model.clone(), settings, seeded.clone(), rng, chain)
    })?;
    Ok(report(trace, &model, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn config(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("age-infer").chain(args.iter().copied()))
    }

    #[test]
    fn unit_mass_init_ignores_scale() {
        let config = config(&["--scale", "3"]);
        assert_eq!(resolve_scale(&[0.1, 0.2], &config), vec![1., 1.]);
    }

    proptest! {
        #[test]
        fn svi_mass_init_multiplies(scale in prop::collection::vec(1e-4f64..1e2, 1..20)) {
            let unchanged = resolve_scale(&scale, &config(&["--mass-init", "svi"]));
            prop_assert_eq!(&unchanged, &scale);

            let doubled = resolve_scale(&scale, &config(&["--mass-init", "svi", "--scale", "2"]));
            for (d, s) in doubled.iter().zip(&scale) {
                prop_assert_eq!(*d, 2. * s);
            }
        }
    }
}
