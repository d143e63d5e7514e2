//! Posterior summaries and the comparison of seeded and adapted scales.
//!
//! The summary follows the usual NumPyro layout: mean, standard deviation,
//! median, the 90% highest posterior density interval, the effective
//! sample size (Geyer's initial monotone sequence) and split R-hat.

use std::fmt;

use crate::{
    adaptation::AdaptationState,
    math::{percentile_sorted, sorted},
    sampler::Trace,
};

/// Summary of one coordinate over all chains.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub hpdi_low: f64,
    pub hpdi_high: f64,
    pub n_eff: f64,
    pub r_hat: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub params: Vec<ParamSummary>,
    pub num_divergences: usize,
}

const HPDI_PROB: f64 = 0.9;

impl Summary {
    pub fn from_trace(trace: &Trace, names: &[String]) -> Self {
        let params = names
            .iter()
            .enumerate()
            .map(|(idx, name)| summarize(name, &trace.coordinate(idx)))
            .collect();
        Summary {
            params,
            num_divergences: trace.num_divergences(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.params.iter().map(|p| p.name.len()).max().unwrap_or(0) + 5;
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "", "mean", "std", "median", "5.0%", "95.0%", "n_eff", "r_hat"
        )?;
        for p in &self.params {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
                p.name, p.mean, p.std, p.median, p.hpdi_low, p.hpdi_high, p.n_eff, p.r_hat
            )?;
        }
        writeln!(f)?;
        write!(f, "Number of divergences: {}", self.num_divergences)
    }
}

fn summarize(name: &str, chains: &[Vec<f64>]) -> ParamSummary {
    let all: Vec<f64> = chains.iter().flatten().copied().collect();
    let n = all.len() as f64;
    let mean = all.iter().sum::<f64>() / n;
    let std = (all.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
    let all = sorted(all);
    let (hpdi_low, hpdi_high) = hpdi(&all, HPDI_PROB);
    ParamSummary {
        name: name.to_string(),
        mean,
        std,
        median: percentile_sorted(&all, 50.),
        hpdi_low,
        hpdi_high,
        n_eff: effective_sample_size(chains),
        r_hat: split_gelman_rubin(chains),
    }
}

/// Narrowest interval holding `prob` of the sorted draws.
pub fn hpdi(sorted: &[f64], prob: f64) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let inc = ((prob * n as f64).floor() as usize).min(n - 1);
    let best = (0..n - inc)
        .min_by(|&a, &b| {
            (sorted[a + inc] - sorted[a]).total_cmp(&(sorted[b + inc] - sorted[b]))
        })
        .unwrap_or(0);
    (sorted[best], sorted[best + inc])
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.)
}

/// Biased autocovariance of lags `0..len`.
fn autocovariance(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let m = mean(values);
    let centered: Vec<f64> = values.iter().map(|x| x - m).collect();
    (0..n)
        .map(|lag| {
            centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / n as f64
        })
        .collect()
}

/// Gelman-Rubin statistic on the first and second half of every chain.
pub fn split_gelman_rubin(chains: &[Vec<f64>]) -> f64 {
    let half = chains.iter().map(|c| c.len()).min().unwrap_or(0) / 2;
    if half < 2 {
        return f64::NAN;
    }
    let split: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| [&c[..half], &c[c.len() - half..]])
        .collect();
    let n = half as f64;
    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let within = split.iter().map(|c| variance(c)).sum::<f64>() / split.len() as f64;
    let estimate = within * (n - 1.) / n + variance(&means);
    (estimate / within).sqrt()
}

/// Effective sample size over all chains.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let num_chains = chains.len();
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    if num_chains == 0 || n < 2 {
        return f64::NAN;
    }
    let acov: Vec<Vec<f64>> = chains.iter().map(|c| autocovariance(&c[..n])).collect();
    let mean_acov: Vec<f64> = (0..n)
        .map(|lag| acov.iter().map(|a| a[lag]).sum::<f64>() / num_chains as f64)
        .collect();
    let nf = n as f64;
    let mut within = mean_acov[0] * nf / (nf - 1.);
    if within == 0. {
        within = 1.;
    }
    let mut var_plus = within * (nf - 1.) / nf;
    if num_chains > 1 {
        let means: Vec<f64> = chains.iter().map(|c| mean(&c[..n])).collect();
        var_plus += variance(&means);
    }

    let rho: Vec<f64> = mean_acov
        .iter()
        .map(|g| 1. - (within - g) / var_plus)
        .collect();
    let mut tau = -1.;
    let mut previous = f64::INFINITY;
    for pair in rho.chunks_exact(2) {
        let p = (pair[0] + pair[1]).max(0.).min(previous);
        if p == 0. {
            break;
        }
        tau += 2. * p;
        previous = p;
    }
    num_chains as f64 * nf / tau
}

/// Python style `%.2e`: two decimals and an exponent of at least two digits.
pub fn format_sci(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0. { "inf" } else { "-inf" }.to_string();
    }
    let formatted = format!("{value:.2e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

/// Element-wise `seeded scale / adapted scale`, summarized over all chains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleRatio {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub q03: f64,
    pub q50: f64,
    pub q97: f64,
}

impl ScaleRatio {
    pub fn new(seeded_scale: &[f64], finals: &[AdaptationState]) -> Self {
        let ratios: Vec<f64> = finals
            .iter()
            .flat_map(|state| {
                seeded_scale
                    .iter()
                    .zip(state.inverse_mass_matrix.iter())
                    .map(|(s, inv)| s / inv.sqrt())
            })
            .collect();
        let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
        let ratios = sorted(ratios);
        ScaleRatio {
            min: ratios.first().copied().unwrap_or(f64::NAN),
            mean,
            max: ratios.last().copied().unwrap_or(f64::NAN),
            q03: percentile_sorted(&ratios, 3.),
            q50: percentile_sorted(&ratios, 50.),
            q97: percentile_sorted(&ratios, 97.),
        }
    }

    pub fn lines(&self) -> [String; 2] {
        [
            format!(
                "[auto_scale / final_scale ratio] (min/mean/max):  {} {} {}",
                format_sci(self.min),
                format_sci(self.mean),
                format_sci(self.max)
            ),
            format!(
                "[auto_scale / final_scale ratio] (q03/q50/q97):   {} {} {}",
                format_sci(self.q03),
                format_sci(self.q50),
                format_sci(self.q97)
            ),
        ]
    }
}
