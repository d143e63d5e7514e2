//! File storage for the scale and initial parameters learned by SVI.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{config::Config, model::ParameterSet};

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact {} does not exist, run the svi mode first", path.display())]
    Missing { path: PathBuf },

    #[error("could not access artifact {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode artifact")]
    Encode(#[source] bincode::Error),

    #[error("could not decode artifact {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("scale entry {index} is {value}, expected a positive finite number")]
    NonPositiveScale { index: usize, value: f64 },

    #[error("artifact has an empty scale vector")]
    Empty,
}

/// Per-coordinate posterior scale and a point estimate of the latent sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationArtifact {
    pub auto_scale: Vec<f64>,
    pub init_params: ParameterSet,
}

impl AdaptationArtifact {
    pub fn new(auto_scale: Vec<f64>, init_params: ParameterSet) -> Result<Self, ArtifactError> {
        let artifact = AdaptationArtifact {
            auto_scale,
            init_params,
        };
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.auto_scale.is_empty() {
            return Err(ArtifactError::Empty);
        }
        if let Some((index, &value)) = self
            .auto_scale
            .iter()
            .enumerate()
            .find(|&(_, &s)| !(s > 0. && s.is_finite()))
        {
            return Err(ArtifactError::NonPositiveScale { index, value });
        }
        Ok(())
    }

    /// Write the artifact, replacing any existing file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        self.validate()?;
        let bytes = bincode::serialize(self).map_err(ArtifactError::Encode)?;
        fs::write(path, bytes).map_err(|source| ArtifactError::Io {
            path: path.to_owned(),
            source,
        })?;
        debug!(path = %path.display(), dim = self.auto_scale.len(), "saved artifact");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::Missing {
                    path: path.to_owned(),
                }
            } else {
                ArtifactError::Io {
                    path: path.to_owned(),
                    source,
                }
            }
        })?;
        let artifact: AdaptationArtifact =
            bincode::deserialize(&bytes).map_err(|source| ArtifactError::Decode {
                path: path.to_owned(),
                source,
            })?;
        artifact.validate()?;
        debug!(path = %path.display(), dim = artifact.auto_scale.len(), "loaded artifact");
        Ok(artifact)
    }
}

/// Name of the file the mcmc workflow writes, derived from the run settings.
pub fn results_file_name(config: &Config) -> String {
    format!(
        "samples.ns_nw_{}_{}.scale_{:.2}.ss_{:.5}.mtd_{}.{}.pkl",
        config.num_samples,
        config.num_warmup,
        config.scale,
        config.step_size,
        config.mtd,
        config.mass_init
    )
}
