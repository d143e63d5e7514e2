use crate::{nuts::Collector, state::Point};

/// Settings for step size adaptation by dual averaging.
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    /// Decay exponent of the weight of the iterates in the average.
    pub kappa: f64,
    /// Stabilizes the first iterations.
    pub t0: f64,
    /// Shrinkage towards the proximal center `ln(10 * initial step size)`.
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            kappa: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Nesterov dual averaging of the log step size towards a target
/// acceptance statistic.
#[derive(Debug, Clone)]
pub struct DualAverage {
    options: DualAverageOptions,
    log_step: f64,
    log_step_avg: f64,
    grad_avg: f64,
    prox_center: f64,
    t: u64,
}

impl DualAverage {
    pub fn new(options: DualAverageOptions, initial_step: f64) -> DualAverage {
        let mut adapt = DualAverage {
            options,
            log_step: 0.,
            log_step_avg: 0.,
            grad_avg: 0.,
            prox_center: 0.,
            t: 0,
        };
        adapt.restart(initial_step);
        adapt
    }

    /// Forget all history and continue from `step_size`.
    pub fn restart(&mut self, step_size: f64) {
        self.log_step = step_size.ln();
        self.log_step_avg = step_size.ln();
        self.grad_avg = 0.;
        self.prox_center = (10. * step_size).ln();
        self.t = 0;
    }

    pub fn update(&mut self, accept_stat: f64, target: f64) {
        // A NaN acceptance statistic counts as a rejection.
        let accept_stat = if accept_stat.is_nan() { 0. } else { accept_stat };
        self.t += 1;
        let t = self.t as f64;
        let weight = 1. / (t + self.options.t0);
        self.grad_avg = (1. - weight) * self.grad_avg + weight * (target - accept_stat);
        self.log_step = self.prox_center - t.sqrt() / self.options.gamma * self.grad_avg;
        let eta = t.powf(-self.options.kappa);
        self.log_step_avg = eta * self.log_step + (1. - eta) * self.log_step_avg;
    }

    /// The step size to use for the next warmup draw.
    pub fn step_size(&self) -> f64 {
        self.log_step.exp()
    }

    /// The step size to keep once the adaptation ends.
    pub fn averaged_step_size(&self) -> f64 {
        self.log_step_avg.exp()
    }
}

/// Mean Metropolis acceptance probability over the leapfrog steps of
/// one trajectory, divergent steps counting as zero.
pub(crate) struct AcceptanceStats {
    initial_energy: f64,
    sum: f64,
    count: u64,
}

impl AcceptanceStats {
    pub(crate) fn new() -> AcceptanceStats {
        AcceptanceStats {
            initial_energy: 0.,
            sum: 0.,
            count: 0,
        }
    }

    pub(crate) fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn num_steps(&self) -> u64 {
        self.count
    }
}

impl Collector for AcceptanceStats {
    fn start(&mut self, point: &Point) {
        self.initial_energy = point.energy();
        self.sum = 0.;
        self.count = 0;
    }

    fn leapfrog(&mut self, end: Option<&Point>) {
        self.count += 1;
        if let Some(end) = end {
            self.sum += (self.initial_energy - end.energy()).min(0.).exp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PointPool;

    #[test]
    fn step_size_shrinks_on_low_acceptance() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 0.5);
        for _ in 0..50 {
            adapt.update(0.1, 0.8);
        }
        assert!(adapt.step_size() < 0.5);
        assert!(adapt.averaged_step_size() < 0.5);
    }

    #[test]
    fn step_size_grows_on_high_acceptance() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 0.01);
        for _ in 0..50 {
            adapt.update(1.0, 0.8);
        }
        assert!(adapt.step_size() > 0.01);

        adapt.restart(0.2);
        assert!((adapt.step_size() - 0.2).abs() < 1e-12);
        assert!((adapt.averaged_step_size() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn nan_acceptance_is_a_rejection() {
        let mut with_nan = DualAverage::new(DualAverageOptions::default(), 0.1);
        let mut with_zero = with_nan.clone();
        with_nan.update(f64::NAN, 0.8);
        with_zero.update(0., 0.8);
        assert_eq!(with_nan.step_size(), with_zero.step_size());
    }

    #[test]
    fn acceptance_is_averaged_per_trajectory() {
        let mut pool = PointPool::new(1, 4);
        let mut start = pool.point();
        start.try_mut().unwrap().potential_energy = 1.;
        let mut better = pool.point();
        better.try_mut().unwrap().potential_energy = 0.5;
        let mut worse = pool.point();
        worse.try_mut().unwrap().potential_energy = 1. + 2f64.ln();

        let mut stats = AcceptanceStats::new();
        stats.start(&start);
        stats.leapfrog(Some(&better));
        stats.leapfrog(Some(&worse));
        stats.leapfrog(None);
        assert_eq!(stats.num_steps(), 3);
        assert!((stats.mean() - 0.5).abs() < 1e-12);

        stats.start(&start);
        assert_eq!(stats.num_steps(), 0);
    }
}
