//! Bayesian inference for an age-structured renewal model of deaths.
//!
//! A run either fits a diagonal normal guide by stochastic variational
//! inference and stores its scale and location, or uses such a stored
//! result to seed the step size and mass matrix of parallel NUTS chains.

pub(crate) mod adaptation;
pub mod artifact;
pub(crate) mod barker;
pub(crate) mod chain;
pub mod config;
pub mod data;
pub mod diagnostics;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub mod model;
pub(crate) mod nuts;
pub(crate) mod potential;
pub(crate) mod progress;
pub mod runtime;
pub mod sampler;
pub(crate) mod state;
pub(crate) mod stepsize;
pub mod svi;
pub mod workflow;

pub use adaptation::{AdaptationState, WarmupSettings};
pub use artifact::{results_file_name, AdaptationArtifact, ArtifactError};
pub use barker::{BarkerChain, BarkerSettings};
pub use chain::{Chain, NutsChain, NutsSettings};
pub use config::{Config, Device, MassInit, Mode};
pub use data::{get_data, transform_data, RawDataset, SyntheticOptions, TransformedDataset};
pub use model::{AgeModel, ModelError, ParamLayout, ParameterSet};
pub use nuts::{LogpError, NutsError};
pub use potential::LogpFunc;
pub use runtime::Runtime;
pub use sampler::{sample_parallel, Progress, SamplerSettings, Trace};
pub use workflow::{run, McmcOutcome};
