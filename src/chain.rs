use anyhow::{bail, ensure, Result};
use rand::Rng;
use tracing::debug;

use crate::{
    adaptation::{AdaptEvent, AdaptationState, WarmupAdapter, WarmupSettings},
    mass_matrix::DiagMassMatrix,
    nuts::{draw, Direction, NutsError},
    potential::{Hamiltonian, LogpFunc, Step},
    sampler::Progress,
    state::{Point, PointPool},
    stepsize::AcceptanceStats,
};

/// Draw samples from a posterior with a Markov chain.
pub trait Chain {
    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error.
    fn set_position(&mut self, position: &[f64]) -> Result<()>;

    /// Draw a new sample and return the position and some diagnostic information.
    fn draw(&mut self) -> Result<(Box<[f64]>, Progress)>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;

    /// The current step size and mass matrix.
    fn adaptation_state(&self) -> AdaptationState;
}

#[derive(Debug, Clone, Copy)]
pub struct NutsSettings {
    /// Number of draws during which step size and mass matrix are tuned.
    pub num_tune: u64,
    /// Maximum depth of the trajectory tree.
    pub maxdepth: u64,
    /// Energy errors above this mark a trajectory as divergent.
    pub max_energy_error: f64,
    pub warmup: WarmupSettings,
}

impl Default for NutsSettings {
    fn default() -> Self {
        NutsSettings {
            num_tune: 1000,
            maxdepth: 10,
            max_energy_error: 1000.,
            warmup: WarmupSettings::default(),
        }
    }
}

/// Upper bound on doublings or halvings while searching an initial step size.
const MAX_STEP_SIZE_SEARCH: usize = 100;

/// Double or halve the step size until the acceptance probability of a
/// single leapfrog step from `start` crosses 0.8.
fn find_reasonable_step_size<F, R>(
    hamiltonian: &mut Hamiltonian<F>,
    pool: &mut PointPool,
    start: &Point,
    rng: &mut R,
) -> std::result::Result<f64, NutsError>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    let log_target = 0.8f64.ln();
    let initial = hamiltonian.step_size;
    let mut step_size = initial;
    let mut previous = 0i32;
    let mut direction = 0i32;

    for _ in 0..MAX_STEP_SIZE_SEARCH {
        if previous != 0 && direction != previous {
            break;
        }
        let next = step_size * 2f64.powi(direction);
        if !(next > f64::MIN_POSITIVE && next < f64::MAX) {
            break;
        }
        step_size = next;
        hamiltonian.step_size = step_size;

        let mut point = hamiltonian.copy_point(pool, start);
        hamiltonian.resample_momentum(&mut point, rng);
        let energy = point.energy();
        let delta_energy = match hamiltonian.leapfrog(pool, &point, Direction::Forward, energy)? {
            Step::Moved(end) => end.energy() - energy,
            Step::Diverged(_) => f64::INFINITY,
        };

        previous = direction;
        direction = if log_target < -delta_energy { 1 } else { -1 };
    }
    hamiltonian.step_size = initial;
    Ok(step_size)
}

/// The No-U-Turn sampler with a diagonal mass matrix.
pub struct NutsChain<F: LogpFunc, R: Rng> {
    hamiltonian: Hamiltonian<F>,
    pool: PointPool,
    stats: AcceptanceStats,
    adapter: WarmupAdapter,
    rng: R,
    point: Option<Point>,
    chain: u64,
    draw_count: u64,
    settings: NutsSettings,
}

impl<F: LogpFunc, R: Rng> NutsChain<F, R> {
    /// Create a chain whose step size and mass matrix start at `initial`.
    pub fn new(
        logp: F,
        settings: NutsSettings,
        initial: AdaptationState,
        rng: R,
        chain: u64,
    ) -> Result<Self> {
        ensure!(
            initial.dim() == logp.dim(),
            "mass matrix has dimension {} but the density has {}",
            initial.dim(),
            logp.dim()
        );
        let hamiltonian = Hamiltonian::new(
            logp,
            DiagMassMatrix::from_adaptation(&initial),
            initial.step_size,
            settings.max_energy_error,
        );
        let pool = hamiltonian.pool(2 * settings.maxdepth as usize + 4);
        Ok(NutsChain {
            hamiltonian,
            pool,
            stats: AcceptanceStats::new(),
            adapter: WarmupAdapter::new(settings.warmup, settings.num_tune, initial),
            rng,
            point: None,
            chain,
            draw_count: 0,
            settings,
        })
    }

    fn search_step_size(&mut self) -> Result<()> {
        let Some(point) = &self.point else {
            bail!("chain {} has no position", self.chain);
        };
        self.hamiltonian.step_size = self.adapter.current().step_size;
        let step_size =
            find_reasonable_step_size(&mut self.hamiltonian, &mut self.pool, point, &mut self.rng)?;
        self.adapter.restart_step_size(step_size);
        self.hamiltonian.step_size = step_size;
        Ok(())
    }
}

impl<F: LogpFunc, R: Rng> Chain for NutsChain<F, R> {
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        ensure!(
            position.len() == self.dim(),
            "initial position has {} entries but the density has {}",
            position.len(),
            self.dim()
        );
        self.point = Some(self.hamiltonian.init_point(&mut self.pool, position)?);
        if self.settings.num_tune > 0 && self.settings.warmup.adapt_step_size {
            self.search_step_size()?;
        }
        Ok(())
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, Progress)> {
        let Some(mut init) = self.point.take() else {
            bail!("set_position must be called before drawing from chain {}", self.chain);
        };
        let step_size = self.hamiltonian.step_size;
        let (point, info) = draw(
            &mut self.hamiltonian,
            &mut self.pool,
            &mut init,
            &mut self.rng,
            self.settings.maxdepth,
            &mut self.stats,
        )?;
        if let Some(divergence) = &info.divergence {
            debug!(
                chain = self.chain,
                draw = self.draw_count,
                energy_error = ?divergence.energy_error,
                logp_error = ?divergence.logp_error.as_ref().map(|err| err.to_string()),
                "divergent transition"
            );
        }
        let position: Box<[f64]> = point.position.clone();
        let logp = point.logp();
        self.point = Some(point);

        let accept_prob = self.stats.mean();
        let tuning = self.adapter.is_tuning(self.draw_count);
        if tuning {
            let event = self.adapter.adapt(self.draw_count, &position, accept_prob);
            if event == AdaptEvent::MassMatrixUpdated {
                self.hamiltonian.mass = DiagMassMatrix::from_adaptation(self.adapter.current());
                self.search_step_size()?;
            }
            self.hamiltonian.step_size = self.adapter.current().step_size;
        }

        let progress = Progress {
            draw: self.draw_count,
            chain: self.chain,
            diverging: info.divergence.is_some(),
            tuning,
            step_size,
            num_steps: self.stats.num_steps(),
            accept_prob,
            depth: info.depth,
            reached_maxdepth: info.reached_maxdepth,
            logp,
        };
        self.draw_count += 1;
        Ok((position, progress))
    }

    fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    fn adaptation_state(&self) -> AdaptationState {
        self.adapter.current().clone()
    }
}
