//! Command line configuration.

use std::{fmt, path::PathBuf};

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Mcmc,
    Svi,
    /// Barker-proposal Metropolis-Hastings. Accepted, but not listed.
    #[value(hide = true)]
    Barker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Device {
    Cpu,
    Gpu,
}

/// How the mass matrix of the MCMC chains is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MassInit {
    /// The scale learned by SVI, times `--scale`.
    Svi,
    /// The identity.
    #[value(name = "default")]
    Unit,
}

impl MassInit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MassInit::Svi => "svi",
            MassInit::Unit => "default",
        }
    }
}

impl fmt::Display for MassInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn positive_f64(value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number"))?;
    if parsed > 0. && parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(format!("`{value}` must be a positive number"))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "age-infer")]
#[command(version)]
#[command(about = "Covid Age Model")]
pub struct Config {
    /// Number of draws kept after warmup
    #[arg(short = 'n', long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_samples: u64,

    /// Number of adaptation draws
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_warmup: u64,

    #[arg(long, value_enum, default_value_t = Mode::Mcmc)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    pub device: Device,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_chains: u64,

    /// Number of SVI optimization steps
    #[arg(long, default_value_t = 3200, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_steps: u64,

    /// Multiplier for the SVI scale when `--mass-init svi`
    #[arg(long, default_value_t = 1.0, value_parser = positive_f64)]
    pub scale: f64,

    #[arg(long, default_value_t = 0.02, value_parser = positive_f64)]
    pub step_size: f64,

    /// Maximum tree depth of NUTS
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub mtd: u64,

    #[arg(long, value_enum, default_value_t = MassInit::Unit)]
    pub mass_init: MassInit,

    /// Where SVI stores its scale and parameters for the MCMC modes
    #[arg(long, default_value = "svi.pkl")]
    pub artifact: PathBuf,

    /// Directory for the mcmc results file
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// JSON dataset; a synthetic dataset is simulated if omitted
    #[arg(long)]
    pub data: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(std::iter::once("age-infer").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.num_samples, 100);
        assert_eq!(config.num_warmup, 200);
        assert_eq!(config.mode, Mode::Mcmc);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.num_chains, 1);
        assert_eq!(config.num_steps, 3200);
        assert_eq!(config.scale, 1.0);
        assert_eq!(config.step_size, 0.02);
        assert_eq!(config.mtd, 15);
        assert_eq!(config.mass_init, MassInit::Unit);
        assert_eq!(config.artifact, PathBuf::from("svi.pkl"));
        assert_eq!(config.seed, 0);
        assert!(config.data.is_none());
    }

    #[test]
    fn closed_choices() {
        assert_eq!(parse(&["--mode", "svi"]).unwrap().mode, Mode::Svi);
        assert_eq!(parse(&["--mode", "barker"]).unwrap().mode, Mode::Barker);
        assert_eq!(parse(&["--mass-init", "svi"]).unwrap().mass_init, MassInit::Svi);
        assert_eq!(parse(&["--device", "gpu"]).unwrap().device, Device::Gpu);
        assert!(parse(&["--mode", "hmc"]).is_err());
        assert!(parse(&["--mass-init", "unit"]).is_err());
        assert!(parse(&["--device", "tpu"]).is_err());
    }

    #[test]
    fn barker_is_hidden_from_help() {
        let help = Config::command().render_long_help().to_string();
        assert!(help.contains("mcmc"));
        assert!(!help.contains("barker"));
    }

    #[test]
    fn rejects_non_positive_numbers() {
        assert!(parse(&["-n", "0"]).is_err());
        assert!(parse(&["--num-chains", "0"]).is_err());
        assert!(parse(&["--scale", "0"]).is_err());
        assert!(parse(&["--step-size", "-0.1"]).is_err());
        assert!(parse(&["--step-size", "nan"]).is_err());
        assert!(parse(&["--mtd", "0"]).is_err());
    }

    #[test]
    fn mass_init_names() {
        assert_eq!(MassInit::Unit.to_string(), "default");
        assert_eq!(MassInit::Svi.to_string(), "svi");
    }
}
