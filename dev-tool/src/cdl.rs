use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use reclearn::{
    cdl::{evaluate_sampled, LatentFactors},
    data::InteractionMatrix,
};
use structopt::StructOpt;

use crate::{
    data::{load_dense_matrix, load_pairs},
    exit_code::{NON_FATAL_ERROR, NO_ERROR},
    utils::{format_report, progress_spin_until_done, rng_from_seed, EvaluationArgs},
};

/// Commands related to pre-trained collaborative deep learning factors.
#[derive(StructOpt, Debug)]
pub enum CdlCmd {
    Evaluate(EvaluateCdlCmd),
}

impl CdlCmd {
    pub fn run(self) -> Result<i32, Error> {
        match self {
            CdlCmd::Evaluate(cmd) => cmd.run(),
        }
    }
}

/// Evaluates latent factors on a random sample of users.
#[derive(StructOpt, Debug)]
pub struct EvaluateCdlCmd {
    /// A csv file with the `user,item` test interactions.
    #[structopt(long)]
    test: PathBuf,

    /// A `.binparams` file with the `user_factors` and `item_factors`.
    #[structopt(long, conflicts_with_all = &["user-factors", "item-factors"])]
    factors: Option<PathBuf>,

    /// A text file with one space separated row of factors per user (e.g. `final-U.dat`).
    #[structopt(long, requires = "item-factors")]
    user_factors: Option<PathBuf>,

    /// A text file with one space separated row of factors per item (e.g. `final-V.dat`).
    #[structopt(long, requires = "user-factors")]
    item_factors: Option<PathBuf>,

    /// Number of users sampled without replacement.
    #[structopt(long, default_value = "300")]
    nr_users: usize,

    /// Seed for the user sampling.
    #[structopt(long)]
    seed: Option<u64>,

    #[structopt(flatten)]
    evaluation: EvaluationArgs,
}

impl EvaluateCdlCmd {
    pub fn run(self) -> Result<i32, Error> {
        let Self {
            test,
            factors,
            user_factors,
            item_factors,
            nr_users,
            seed,
            evaluation,
        } = self;

        let factors = progress_spin_until_done("Loading factors", || -> Result<_, Error> {
            match (factors, user_factors, item_factors) {
                (Some(factors), _, _) => Ok(LatentFactors::load_from_file(factors)?),
                (None, Some(users), Some(items)) => Ok(LatentFactors::new(
                    load_dense_matrix(&users, b' ')?,
                    load_dense_matrix(&items, b' ')?,
                )?),
                _ => bail!("Either --factors or --user-factors and --item-factors are needed."),
            }
        })
        .context("Loading the latent factors failed.")?;

        let test = InteractionMatrix::from_pairs(
            factors.nr_users(),
            factors.nr_items(),
            load_pairs(&test)?,
        )
        .context("Test interactions don't fit the latent factors.")?;

        let mut rng = rng_from_seed(seed);
        let report = evaluate_sampled(
            &factors,
            test,
            nr_users,
            &evaluation.into_settings(),
            &mut rng,
        )?;
        println!("{}", format_report(&report));

        if report.nr_users == 0 {
            eprintln!("None of the sampled users has test interactions.");
            Ok(NON_FATAL_ERROR)
        } else {
            Ok(NO_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_files_are_required() {
        let cmd = EvaluateCdlCmd::from_iter(&["evaluate", "--test", "test.csv"]);
        let error = cmd.run().unwrap_err();
        assert!(format!("{:?}", error).contains("--user-factors"));
    }

    #[test]
    fn test_factor_sources_conflict() {
        let result = EvaluateCdlCmd::from_iter_safe(&[
            "evaluate",
            "--test",
            "test.csv",
            "--factors",
            "cdl.binparams",
            "--user-factors",
            "final-U.dat",
            "--item-factors",
            "final-V.dat",
        ]);
        assert!(result.is_err());

        let result = EvaluateCdlCmd::from_iter_safe(&[
            "evaluate",
            "--test",
            "test.csv",
            "--user-factors",
            "final-U.dat",
        ]);
        assert!(result.is_err());
    }
}
