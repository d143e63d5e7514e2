use rand::Rng;

use crate::{
    mass_matrix::DiagMassMatrix,
    math::{axpy, axpy_out},
    nuts::{Direction, Divergence, LogpError, NutsError},
    state::{Point, PointPool},
};

/// A log density with its gradient.
pub trait LogpFunc {
    type LogpError: LogpError + 'static;

    /// Evaluate the log density at `position` and write its gradient into `grad`.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;

    fn dim(&self) -> usize;
}

/// Outcome of one leapfrog step.
pub(crate) enum Step {
    Moved(Point),
    Diverged(Divergence),
}

/// Hamiltonian dynamics with potential energy `-logp` and a diagonal
/// Euclidean kinetic energy.
pub(crate) struct Hamiltonian<F: LogpFunc> {
    logp: F,
    pub(crate) mass: DiagMassMatrix,
    pub(crate) step_size: f64,
    max_energy_error: f64,
}

impl<F: LogpFunc> Hamiltonian<F> {
    pub(crate) fn new(
        logp: F,
        mass: DiagMassMatrix,
        step_size: f64,
        max_energy_error: f64,
    ) -> Self {
        debug_assert_eq!(mass.dim(), logp.dim());
        Hamiltonian {
            logp,
            mass,
            step_size,
            max_energy_error,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub(crate) fn pool(&self, capacity: usize) -> PointPool {
        PointPool::new(self.dim(), capacity)
    }

    fn eval(&mut self, point: &mut Point) -> Result<(), F::LogpError> {
        let inner = point.try_mut().expect("Point is shared");
        let logp = self.logp.logp(&inner.position, &mut inner.gradient)?;
        inner.potential_energy = -logp;
        Ok(())
    }

    /// A point at `position` with an unset momentum.
    pub(crate) fn init_point(
        &mut self,
        pool: &mut PointPool,
        position: &[f64],
    ) -> Result<Point, NutsError> {
        let mut point = pool.point();
        point
            .try_mut()
            .expect("Point is shared")
            .position
            .copy_from_slice(position);
        self.eval(&mut point)
            .map_err(|e| NutsError::BadInitialPosition(Box::new(e)))?;
        let finite = point.potential_energy.is_finite() && point.gradient.iter().all(|g| g.is_finite());
        if !finite {
            return Err(NutsError::BadInitialPosition(
                "log density or gradient at the initial position is not finite".into(),
            ));
        }
        Ok(point)
    }

    /// A copy of `source`'s position and gradient, to be given a fresh momentum.
    pub(crate) fn copy_point(&self, pool: &mut PointPool, source: &Point) -> Point {
        let mut point = pool.point();
        let inner = point.try_mut().expect("Point is shared");
        inner.position.copy_from_slice(&source.position);
        inner.gradient.copy_from_slice(&source.gradient);
        inner.potential_energy = source.potential_energy;
        point
    }

    /// Draw a new momentum and make `point` the start of a trajectory.
    pub(crate) fn resample_momentum<R: Rng + ?Sized>(&self, point: &mut Point, rng: &mut R) {
        self.mass
            .draw_momentum(point.try_mut().expect("Point is shared"), rng);
        point.start_trajectory();
    }

    /// One leapfrog step from `start`.
    ///
    /// Recoverable logp errors and energy errors above the threshold
    /// end the step as a divergence.
    pub(crate) fn leapfrog(
        &mut self,
        pool: &mut PointPool,
        start: &Point,
        direction: Direction,
        initial_energy: f64,
    ) -> Result<Step, NutsError> {
        let epsilon = direction.sign() as f64 * self.step_size;
        let mut end = pool.point();
        {
            let out = end.try_mut().expect("Point is shared");
            axpy_out(&start.gradient, &start.momentum, epsilon / 2., &mut out.momentum);
            self.mass.refresh(out);
            axpy_out(&out.velocity, &start.position, epsilon, &mut out.position);
        }

        if let Err(err) = self.eval(&mut end) {
            if !err.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(err)));
            }
            return Ok(Step::Diverged(Divergence {
                energy_error: None,
                logp_error: Some(Box::new(err)),
            }));
        }

        let out = end.try_mut().expect("Point is shared");
        axpy(&out.gradient, &mut out.momentum, epsilon / 2.);
        self.mass.refresh(out);
        out.index = start.index + direction.sign();
        if out.index == -1 {
            out.momentum_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &start.momentum_sum, 1., &mut out.momentum_sum);
        }

        let energy_error = out.energy() - initial_energy;
        if !energy_error.is_finite() || energy_error.abs() > self.max_energy_error {
            return Ok(Step::Diverged(Divergence {
                energy_error: Some(energy_error),
                logp_error: None,
            }));
        }
        Ok(Step::Moved(end))
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use thiserror::Error;

    use super::LogpFunc;
    use crate::nuts::LogpError;

    #[derive(Debug, Error)]
    pub(crate) enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    /// Independent normals with unit variance around `mu`.
    #[derive(Clone)]
    pub(crate) struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub(crate) fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    impl LogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, NormalLogpError> {
            Ok(position
                .iter()
                .zip(grad.iter_mut())
                .map(|(x, g)| {
                    *g = self.mu - x;
                    -0.5 * (x - self.mu).powi(2)
                })
                .sum())
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{test_logps::NormalLogp, *};

    fn moved(step: Step) -> Point {
        match step {
            Step::Moved(point) => point,
            Step::Diverged(div) => panic!("unexpected divergence {div:?}"),
        }
    }

    #[test]
    fn leapfrog_conserves_energy() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(4, 1.), DiagMassMatrix::identity(4), 0.01, 1000.);
        let mut pool = hamiltonian.pool(4);
        let mut point = hamiltonian.init_point(&mut pool, &[0.2, 0.5, 1.5, 2.]).unwrap();
        {
            let inner = point.try_mut().unwrap();
            inner.momentum.copy_from_slice(&[1., -1., 0.5, 0.]);
            hamiltonian.mass.refresh(inner);
        }
        point.start_trajectory();

        let initial = point.energy();
        let forward = moved(
            hamiltonian
                .leapfrog(&mut pool, &point, Direction::Forward, initial)
                .unwrap(),
        );
        assert_eq!(forward.index, 1);
        assert!((forward.energy() - initial).abs() < 1e-3);
        assert!(forward.position[0] > 0.2);

        let backward = moved(
            hamiltonian
                .leapfrog(&mut pool, &point, Direction::Backward, initial)
                .unwrap(),
        );
        assert_eq!(backward.index, -1);
        assert_eq!(backward.momentum_sum, backward.momentum);
        assert!(backward.position[0] < 0.2);
    }

    #[test]
    fn huge_steps_diverge() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(2, 0.), DiagMassMatrix::identity(2), 1e3, 1000.);
        let mut pool = hamiltonian.pool(4);
        let mut point = hamiltonian.init_point(&mut pool, &[1., -1.]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        hamiltonian.resample_momentum(&mut point, &mut rng);
        let step = hamiltonian
            .leapfrog(&mut pool, &point, Direction::Forward, point.energy())
            .unwrap();
        match step {
            Step::Diverged(div) => assert!(div.energy_error.unwrap() > 1000.),
            Step::Moved(_) => panic!("expected a divergence"),
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("outside the wall")]
    struct OutsideWall;

    impl LogpError for OutsideWall {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    /// Flat density on `x < 1`.
    struct Wall;

    impl LogpFunc for Wall {
        type LogpError = OutsideWall;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, OutsideWall> {
            if position[0] > 1. {
                return Err(OutsideWall);
            }
            grad[0] = 0.;
            Ok(0.)
        }
    }

    #[test]
    fn recoverable_errors_keep_the_cause() {
        let mut hamiltonian = Hamiltonian::new(Wall, DiagMassMatrix::identity(1), 1., 1000.);
        let mut pool = hamiltonian.pool(4);
        let mut point = hamiltonian.init_point(&mut pool, &[0.5]).unwrap();
        {
            let inner = point.try_mut().unwrap();
            inner.momentum[0] = 10.;
            hamiltonian.mass.refresh(inner);
        }
        point.start_trajectory();
        let step = hamiltonian
            .leapfrog(&mut pool, &point, Direction::Forward, point.energy())
            .unwrap();
        match step {
            Step::Diverged(div) => {
                assert!(div.energy_error.is_none());
                assert_eq!(div.logp_error.unwrap().to_string(), "outside the wall");
            }
            Step::Moved(_) => panic!("expected a divergence"),
        }
    }

    #[test]
    fn copied_points_keep_the_gradient() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(2, 3.), DiagMassMatrix::identity(2), 0.1, 1000.);
        let mut pool = hamiltonian.pool(4);
        let point = hamiltonian.init_point(&mut pool, &[1., 2.]).unwrap();
        let copy = hamiltonian.copy_point(&mut pool, &point);
        assert_eq!(copy.position, point.position);
        assert_eq!(&*copy.gradient, &[2., 1.]);
        assert_eq!(copy.potential_energy, point.potential_energy);
    }
}
