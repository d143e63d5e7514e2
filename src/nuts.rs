use rand::Rng;
use thiserror::Error;

use crate::{
    math::logaddexp,
    potential::{Hamiltonian, LogpFunc, Step},
    state::{Point, PointPool},
};

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not initialize chain at the given position")]
    BadInitialPosition(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// Why a leapfrog step was rejected.
#[derive(Debug)]
pub struct Divergence {
    /// Energy at the end of the step minus the energy at the start of the
    /// trajectory. Not available if the logp function failed.
    pub energy_error: Option<f64>,
    pub logp_error: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Direction {
        if rng.random_bool(0.5) {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    pub(crate) fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Observes the leapfrog steps of a trajectory.
pub(crate) trait Collector {
    fn start(&mut self, _point: &Point) {}

    /// Called after every leapfrog step with its end point, or `None`
    /// if the step diverged.
    fn leapfrog(&mut self, _end: Option<&Point>) {}
}

/// How a trajectory ended.
#[derive(Debug)]
pub struct SampleInfo {
    /// Number of doublings of the trajectory.
    pub depth: u64,
    pub divergence: Option<Divergence>,
    pub reached_maxdepth: bool,
}

/// A contiguous piece of the trajectory together with a multinomial
/// draw from its points.
struct Subtree {
    /// The end with the smaller index.
    left: Point,
    right: Point,
    proposal: Point,
    /// Log of the summed Boltzmann weights of all points.
    log_weight: f64,
    depth: u64,
}

/// Result of doubling a subtree.
enum Growth {
    Grown(Subtree),
    /// The trajectory ends. A U-turn between the two halves keeps the
    /// joined tree, any other stop drops the new half.
    Stopped(Subtree, Stop),
}

enum Stop {
    Turning,
    Diverged(Divergence),
}

struct Builder<'a, F: LogpFunc, R: ?Sized, C> {
    hamiltonian: &'a mut Hamiltonian<F>,
    pool: &'a mut PointPool,
    rng: &'a mut R,
    collector: &'a mut C,
    initial_energy: f64,
}

impl<F, R, C> Builder<'_, F, R, C>
where
    F: LogpFunc,
    R: Rng + ?Sized,
    C: Collector,
{
    fn leaf(
        &mut self,
        from: &Point,
        direction: Direction,
    ) -> Result<std::result::Result<Subtree, Divergence>> {
        let step = self
            .hamiltonian
            .leapfrog(self.pool, from, direction, self.initial_energy)?;
        match step {
            Step::Moved(end) => {
                self.collector.leapfrog(Some(&end));
                Ok(Ok(Subtree {
                    left: end.clone(),
                    right: end.clone(),
                    log_weight: self.initial_energy - end.energy(),
                    proposal: end,
                    depth: 0,
                }))
            }
            Step::Diverged(divergence) => {
                self.collector.leapfrog(None);
                Ok(Err(divergence))
            }
        }
    }

    /// Build a new subtree of the same depth next to `tree` in `direction`
    /// and join the two.
    ///
    /// The proposal of the trajectory containing the start point is only
    /// replaced in proportion to the weight of the new half (biased
    /// progressive sampling), inner subtrees use uniform progressive sampling.
    fn double(
        &mut self,
        mut tree: Subtree,
        direction: Direction,
        contains_start: bool,
    ) -> Result<Growth> {
        let edge = match direction {
            Direction::Forward => tree.right.clone(),
            Direction::Backward => tree.left.clone(),
        };
        let mut other = match self.leaf(&edge, direction)? {
            Ok(leaf) => leaf,
            Err(divergence) => return Ok(Growth::Stopped(tree, Stop::Diverged(divergence))),
        };
        while other.depth < tree.depth {
            other = match self.double(other, direction, false)? {
                Growth::Grown(other) => other,
                Growth::Stopped(_, stop) => return Ok(Growth::Stopped(tree, stop)),
            };
        }

        let (left, right) = match direction {
            Direction::Forward => (&tree, &other),
            Direction::Backward => (&other, &tree),
        };
        let turning = left.left.is_turning(&right.right)
            || (tree.depth > 0
                && (left.right.is_turning(&right.right) || left.left.is_turning(&right.left)));

        let joint_weight = logaddexp(tree.log_weight, other.log_weight);
        let reference = if contains_start {
            tree.log_weight
        } else {
            joint_weight
        };
        let accept = other.log_weight - reference;
        if accept >= 0. || self.rng.random_bool(accept.exp()) {
            tree.proposal = other.proposal;
        }
        match direction {
            Direction::Forward => tree.right = other.right,
            Direction::Backward => tree.left = other.left,
        }
        tree.log_weight = joint_weight;
        tree.depth += 1;

        if turning {
            Ok(Growth::Stopped(tree, Stop::Turning))
        } else {
            Ok(Growth::Grown(tree))
        }
    }
}

/// One NUTS transition from `init`, with multinomial sampling of the
/// proposal. `init` gets a fresh momentum.
pub(crate) fn draw<F, R, C>(
    hamiltonian: &mut Hamiltonian<F>,
    pool: &mut PointPool,
    init: &mut Point,
    rng: &mut R,
    maxdepth: u64,
    collector: &mut C,
) -> Result<(Point, SampleInfo)>
where
    F: LogpFunc,
    R: Rng + ?Sized,
    C: Collector,
{
    hamiltonian.resample_momentum(init, rng);
    collector.start(init);

    let mut builder = Builder {
        initial_energy: init.energy(),
        hamiltonian,
        pool,
        rng,
        collector,
    };
    let mut tree = Subtree {
        left: init.clone(),
        right: init.clone(),
        proposal: init.clone(),
        log_weight: 0.,
        depth: 0,
    };
    while tree.depth < maxdepth {
        let direction = Direction::random(&mut *builder.rng);
        tree = match builder.double(tree, direction, true)? {
            Growth::Grown(tree) => tree,
            Growth::Stopped(tree, stop) => {
                let info = SampleInfo {
                    depth: tree.depth,
                    divergence: match stop {
                        Stop::Turning => None,
                        Stop::Diverged(divergence) => Some(divergence),
                    },
                    reached_maxdepth: false,
                };
                return Ok((tree.proposal, info));
            }
        };
    }
    let info = SampleInfo {
        depth: tree.depth,
        divergence: None,
        reached_maxdepth: true,
    };
    Ok((tree.proposal, info))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        mass_matrix::DiagMassMatrix, potential::test_logps::NormalLogp,
        stepsize::AcceptanceStats,
    };

    fn draw_once(seed: u64, step_size: f64, maxdepth: u64) -> (Box<[f64]>, SampleInfo, u64) {
        let dim = 3usize;
        let mut hamiltonian = Hamiltonian::new(
            NormalLogp::new(dim, 3.),
            DiagMassMatrix::identity(dim),
            step_size,
            1000.,
        );
        let mut pool = hamiltonian.pool(10);
        let mut point = hamiltonian.init_point(&mut pool, &[3.5; 3]).unwrap();
        let mut stats = AcceptanceStats::new();
        let mut rng = StdRng::seed_from_u64(seed);

        let (out, info) = draw(
            &mut hamiltonian,
            &mut pool,
            &mut point,
            &mut rng,
            maxdepth,
            &mut stats,
        )
        .unwrap();
        (out.position.clone(), info, stats.num_steps())
    }

    #[test]
    fn deterministic() {
        let (sample1, info1, steps1) = draw_once(42, 0.3, 10);
        let (sample2, info2, steps2) = draw_once(42, 0.3, 10);

        assert_eq!(sample1, sample2);
        assert_eq!(info1.depth, info2.depth);
        assert_eq!(steps1, steps2);
        assert!(info1.divergence.is_none());
        assert!(!info1.reached_maxdepth);
        assert!(steps1 < 1 << (info1.depth + 1));
    }

    #[test]
    fn maxdepth_is_respected() {
        let (_, info, steps) = draw_once(1, 1e-4, 3);
        assert_eq!(info.depth, 3);
        assert!(info.reached_maxdepth);
        assert_eq!(steps, 7);
    }

    #[test]
    fn huge_step_size_diverges() {
        let (sample, info, steps) = draw_once(7, 1e4, 10);
        assert_eq!(steps, 1);
        assert_eq!(info.depth, 0);
        assert!(info.divergence.unwrap().energy_error.unwrap() > 1000.);
        assert_eq!(&*sample, &[3.5; 3]);
    }
}
