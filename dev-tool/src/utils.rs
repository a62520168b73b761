use std::convert::TryFrom;

use anyhow::Error;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rand::{rngs::StdRng, SeedableRng};
use reclearn::{
    evaluation::{EvaluationSettings, ValidationReport},
    metrics::DcgMethod,
};
use structopt::StructOpt;

/// Shows a spinner with the message while `func` runs.
pub(crate) fn progress_spin_until_done<R>(msg: &'static str, func: impl FnOnce() -> R) -> R {
    let progress_bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::default_spinner().template("{msg}: {elapsed:>10} {spinner:.green}"),
    );
    progress_bar.set_message(msg);
    progress_bar.enable_steady_tick(100);
    let res = func();
    progress_bar.finish_and_clear();
    res
}

/// Settings of the ranking evaluation.
#[derive(StructOpt, Debug)]
pub(crate) struct EvaluationArgs {
    /// Cut-off for recall and precision.
    #[structopt(long, default_value = "50")]
    k: usize,

    /// Cut-off for the NDCG, defaults to `k`.
    #[structopt(long)]
    ndcg_k: Option<usize>,

    /// How the first position is discounted: `0`/`first` or `1`/`log2`.
    #[structopt(long, default_value = "first", parse(try_from_str = parse_dcg_method))]
    dcg_method: DcgMethod,

    /// Evaluate at most this many users.
    #[structopt(long)]
    max_users: Option<usize>,

    /// Number of users scored at once.
    #[structopt(long, default_value = "300")]
    chunk_size: usize,
}

impl EvaluationArgs {
    pub(crate) fn into_settings(self) -> EvaluationSettings {
        EvaluationSettings {
            k: self.k,
            ndcg_k: self.ndcg_k.unwrap_or(self.k),
            dcg_method: self.dcg_method,
            max_users: self.max_users,
            chunk_size: self.chunk_size,
        }
    }
}

fn parse_dcg_method(method: &str) -> Result<DcgMethod, Error> {
    match method.trim() {
        "first" => Ok(DcgMethod::First),
        "log2" => Ok(DcgMethod::Log2),
        number => Ok(DcgMethod::try_from(number.parse::<u8>()?)?),
    }
}

/// Seeded rng if a seed is given, otherwise seeded from the OS.
pub(crate) fn rng_from_seed(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Formats the metrics in one line, e.g. `recall=0.12500 precision=...`.
pub(crate) fn format_report(report: &ValidationReport) -> String {
    let metrics = [
        ("recall", Some(report.recall)),
        ("precision", Some(report.precision)),
        ("ndcg", Some(report.ndcg)),
        ("auc", report.auc),
    ];
    metrics
        .iter()
        .map(|(name, value)| match value {
            Some(value) => format!("{}={:.5}", name, value),
            None => format!("{}=--", name),
        })
        .chain(std::iter::once(format!("users={}", report.nr_users)))
        .join(" ")
}
