//! Warmup adaptation of step size and diagonal mass matrix.
//!
//! Warmup is split into windows. The first and last window only tune the
//! step size; at the end of every window in between, the inverse mass
//! matrix is replaced by the regularized variance of that window's draws.
//! Dual averaging restarts at every window end, and the averaged step size
//! is only used once warmup is over.

use tracing::debug;

use crate::{
    mass_matrix::RunningVariance,
    stepsize::{DualAverage, DualAverageOptions},
};

/// Tuning parameters handed from one phase of a sampler to the next.
///
/// Chains are seeded with one of these (for example built from the scale
/// learned by SVI) and report the one they ended up with.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationState {
    pub step_size: f64,
    /// Diagonal of the inverse mass matrix.
    pub inverse_mass_matrix: Box<[f64]>,
    /// Diagonal of the mass matrix square root, `1 / sqrt(inverse_mass_matrix)`.
    pub mass_matrix_sqrt: Box<[f64]>,
}

impl AdaptationState {
    /// Seed from a per-coordinate posterior scale: the inverse mass matrix
    /// is `scale²` and the mass matrix square root `1 / scale`.
    pub fn from_scale(step_size: f64, scale: &[f64]) -> Self {
        AdaptationState {
            step_size,
            inverse_mass_matrix: scale.iter().map(|s| s * s).collect(),
            mass_matrix_sqrt: scale.iter().map(|s| s.recip()).collect(),
        }
    }

    pub fn unit(step_size: f64, dim: usize) -> Self {
        AdaptationState::from_scale(step_size, &vec![1f64; dim])
    }

    /// The per-coordinate scale, `sqrt(inverse_mass_matrix)`.
    pub fn scale(&self) -> Vec<f64> {
        self.inverse_mass_matrix.iter().map(|v| v.sqrt()).collect()
    }

    pub fn dim(&self) -> usize {
        self.inverse_mass_matrix.len()
    }
}

/// Inclusive range of warmup draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptWindow {
    pub start: u64,
    pub end: u64,
}

/// Split `num_steps` warmup draws into adaptation windows.
pub fn build_adaptation_schedule(num_steps: u64) -> Vec<AdaptWindow> {
    let mut schedule = Vec::new();
    if num_steps == 0 {
        return schedule;
    }
    if num_steps < 20 {
        schedule.push(AdaptWindow {
            start: 0,
            end: num_steps - 1,
        });
        return schedule;
    }

    let mut init_buffer_size = 75;
    let mut term_buffer_size = 50;
    let mut base_window_size = 25;
    if init_buffer_size + base_window_size + term_buffer_size > num_steps {
        init_buffer_size = (0.15 * num_steps as f64) as u64;
        term_buffer_size = (0.1 * num_steps as f64) as u64;
        base_window_size = num_steps - init_buffer_size - term_buffer_size;
    }
    schedule.push(AdaptWindow {
        start: 0,
        end: init_buffer_size - 1,
    });

    let end_window_start = num_steps - term_buffer_size;
    let mut next_window_size = base_window_size;
    let mut next_window_start = init_buffer_size;
    while next_window_start < end_window_start {
        let cur_window_start = next_window_start;
        let mut cur_window_size = next_window_size;
        if 3 * cur_window_size <= end_window_start - cur_window_start {
            next_window_size = 2 * cur_window_size;
        } else {
            cur_window_size = end_window_start - cur_window_start;
        }
        next_window_start = cur_window_start + cur_window_size;
        schedule.push(AdaptWindow {
            start: cur_window_start,
            end: next_window_start - 1,
        });
    }
    schedule.push(AdaptWindow {
        start: end_window_start,
        end: num_steps - 1,
    });
    schedule
}

#[derive(Debug, Clone, Copy)]
pub struct WarmupSettings {
    pub target_accept: f64,
    pub adapt_step_size: bool,
    pub adapt_mass_matrix: bool,
    pub dual_average: DualAverageOptions,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        WarmupSettings {
            target_accept: 0.8,
            adapt_step_size: true,
            adapt_mass_matrix: true,
            dual_average: DualAverageOptions::default(),
        }
    }
}

/// What changed after a warmup draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdaptEvent {
    None,
    /// The inverse mass matrix was replaced. The caller should search a
    /// new step size and pass it to `WarmupAdapter::restart_step_size`.
    MassMatrixUpdated,
}

pub(crate) struct WarmupAdapter {
    settings: WarmupSettings,
    schedule: Vec<AdaptWindow>,
    window_idx: usize,
    num_warmup: u64,
    step_size_adapt: DualAverage,
    variance: RunningVariance,
    state: AdaptationState,
}

impl WarmupAdapter {
    pub(crate) fn new(settings: WarmupSettings, num_warmup: u64, initial: AdaptationState) -> Self {
        WarmupAdapter {
            schedule: build_adaptation_schedule(num_warmup),
            window_idx: 0,
            num_warmup,
            step_size_adapt: DualAverage::new(settings.dual_average, initial.step_size),
            variance: RunningVariance::new(initial.dim()),
            state: initial,
            settings,
        }
    }

    pub(crate) fn current(&self) -> &AdaptationState {
        &self.state
    }

    pub(crate) fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_warmup
    }

    fn is_middle_window(&self) -> bool {
        0 < self.window_idx && self.window_idx + 1 < self.schedule.len()
    }

    /// Record warmup draw number `draw` and update the tuning parameters.
    pub(crate) fn adapt(&mut self, draw: u64, position: &[f64], accept_stat: f64) -> AdaptEvent {
        if !self.is_tuning(draw) {
            return AdaptEvent::None;
        }

        if self.settings.adapt_step_size {
            self.step_size_adapt
                .update(accept_stat, self.settings.target_accept);
            self.state.step_size = self.step_size_adapt.step_size();
        }

        let Some(window) = self.schedule.get(self.window_idx).copied() else {
            return AdaptEvent::None;
        };

        let middle = self.settings.adapt_mass_matrix && self.is_middle_window();
        if middle {
            self.variance.add_sample(position);
        }

        let mut event = AdaptEvent::None;
        if draw == window.end {
            if middle {
                if let Some(variance) = self.variance.regularized() {
                    debug!(
                        window = self.window_idx,
                        draws = self.variance.count(),
                        "updating mass matrix"
                    );
                    self.state.mass_matrix_sqrt = variance.iter().map(|v| v.sqrt().recip()).collect();
                    self.state.inverse_mass_matrix = variance;
                    event = AdaptEvent::MassMatrixUpdated;
                }
                self.variance.reset();
            }
            if event == AdaptEvent::None && self.settings.adapt_step_size {
                if draw + 1 == self.num_warmup {
                    self.state.step_size = self.step_size_adapt.averaged_step_size();
                } else {
                    let step_size = self.state.step_size;
                    self.restart_step_size(step_size);
                }
            }
            self.window_idx += 1;
        }
        event
    }

    /// Restart dual averaging around a new step size.
    pub(crate) fn restart_step_size(&mut self, step_size: f64) {
        self.state.step_size = step_size;
        self.step_size_adapt.restart(step_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn window(start: u64, end: u64) -> AdaptWindow {
        AdaptWindow { start, end }
    }

    #[test]
    fn schedule_for_default_warmup() {
        assert_eq!(
            build_adaptation_schedule(200),
            vec![window(0, 74), window(75, 99), window(100, 149), window(150, 199)]
        );
    }

    #[test]
    fn schedule_for_short_warmup() {
        assert_eq!(build_adaptation_schedule(5), vec![window(0, 4)]);
        assert_eq!(
            build_adaptation_schedule(20),
            vec![window(0, 2), window(3, 17), window(18, 19)]
        );
        assert!(build_adaptation_schedule(0).is_empty());
    }

    #[test]
    fn short_warmup_keeps_seeded_mass_matrix() {
        let seed = AdaptationState::from_scale(0.1, &[2., 0.5]);
        let mut adapter = WarmupAdapter::new(WarmupSettings::default(), 5, seed.clone());
        for draw in 0..5 {
            let event = adapter.adapt(draw, &[draw as f64, 1.], 0.8);
            assert_eq!(event, AdaptEvent::None);
        }
        assert_eq!(adapter.current().inverse_mass_matrix, seed.inverse_mass_matrix);
        assert!(!adapter.is_tuning(5));
        // Draws after warmup change nothing.
        let before = adapter.current().clone();
        adapter.adapt(5, &[0., 0.], 0.);
        assert_eq!(adapter.current(), &before);
    }

    #[test]
    fn middle_windows_update_mass_matrix() {
        let seed = AdaptationState::unit(0.1, 1);
        let mut adapter = WarmupAdapter::new(WarmupSettings::default(), 200, seed);
        let mut updates = vec![];
        for draw in 0..200 {
            let x = if draw % 2 == 0 { 3. } else { -3. };
            if adapter.adapt(draw, &[x], 0.8) == AdaptEvent::MassMatrixUpdated {
                updates.push(draw);
                adapter.restart_step_size(0.2);
            }
        }
        assert_eq!(updates, vec![99, 149]);
        let scale = adapter.current().scale();
        assert!(scale[0] > 2.5 && scale[0] < 3.5);
    }

    #[test]
    fn averaged_step_size_only_after_warmup() {
        let settings = WarmupSettings::default();
        let mut adapter = WarmupAdapter::new(settings, 200, AdaptationState::unit(0.1, 1));
        let mut reference = DualAverage::new(settings.dual_average, 0.1);
        for draw in 0..75 {
            adapter.adapt(draw, &[0.], 1.);
            reference.update(1., settings.target_accept);
        }
        // End of the initial buffer: keep the last iterate, not the average.
        assert_eq!(adapter.current().step_size, reference.step_size());
        assert!(reference.step_size() != reference.averaged_step_size());

        // Dual averaging continues from a fresh start at that step size.
        let mut restarted = DualAverage::new(settings.dual_average, reference.step_size());
        adapter.adapt(75, &[0.], 1.);
        restarted.update(1., settings.target_accept);
        assert_eq!(adapter.current().step_size, restarted.step_size());

        let mut adapter = WarmupAdapter::new(settings, 10, AdaptationState::unit(0.1, 1));
        let mut reference = DualAverage::new(settings.dual_average, 0.1);
        for draw in 0..10 {
            adapter.adapt(draw, &[0.], 0.5);
            reference.update(0.5, settings.target_accept);
        }
        assert_eq!(adapter.current().step_size, reference.averaged_step_size());
    }

    proptest! {
        #[test]
        fn seeded_state_inverts_scale(scale in prop::collection::vec(1e-3f64..1e3, 1..20)) {
            let state = AdaptationState::from_scale(0.02, &scale);
            for ((s, inv), sqrt) in scale.iter().zip(state.inverse_mass_matrix.iter()).zip(state.mass_matrix_sqrt.iter()) {
                prop_assert!((inv - s * s).abs() <= 1e-12 * s * s);
                prop_assert!((sqrt * s - 1.).abs() <= 1e-12);
            }
            let back = state.scale();
            for (a, b) in back.iter().zip(&scale) {
                prop_assert!((a - b).abs() <= 1e-12 * b);
            }
        }

        #[test]
        fn schedule_covers_warmup(num_steps in 1u64..2000) {
            let schedule = build_adaptation_schedule(num_steps);
            prop_assert_eq!(schedule[0].start, 0);
            prop_assert_eq!(schedule.last().unwrap().end, num_steps - 1);
            for pair in schedule.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].start);
            }
        }
    }
}
