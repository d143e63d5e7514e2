use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::sampler::Progress;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {prefix} {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// One progress bar per chain, drawn to stderr.
pub(crate) struct ChainBars {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ChainBars {
    pub(crate) fn new(num_chains: usize, draws_per_chain: u64, enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let bars = (0..num_chains)
            .map(|chain| {
                let bar = multi.add(ProgressBar::new(draws_per_chain));
                bar.set_style(bar_style());
                bar.set_prefix(format!("chain {chain}"));
                bar
            })
            .collect();
        ChainBars {
            _multi: multi,
            bars,
        }
    }

    pub(crate) fn bar(&self, chain: usize) -> ProgressBar {
        self.bars
            .get(chain)
            .cloned()
            .unwrap_or_else(ProgressBar::hidden)
    }
}

/// Advance a chain's bar by one draw.
pub(crate) fn record_draw(bar: &ProgressBar, progress: &Progress) {
    let phase = if progress.tuning { "warmup" } else { "sample" };
    bar.set_message(format!(
        "{phase}: {} steps of size {:.2e}. acc. prob={:.2}",
        progress.num_steps, progress.step_size, progress.accept_prob
    ));
    bar.inc(1);
}

/// A spinner-style bar for optimization loops.
pub(crate) fn optimization_bar(num_steps: u64, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(num_steps);
    bar.set_style(bar_style());
    bar.set_prefix("svi");
    bar
}
