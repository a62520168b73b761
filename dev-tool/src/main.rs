use std::process::exit;

use anyhow::{Context, Error};
use structopt::StructOpt;

use crate::exit_code::FATAL_ERROR;

mod cdl;
mod cml;
mod data;
mod exit_code;
mod utils;

/// Training and evaluation of recommendation models.
#[derive(StructOpt, Debug)]
struct Args {
    /// Number of threads used for the evaluation, defaults to the number of cpus.
    #[structopt(long, global = true)]
    threads: Option<usize>,

    #[structopt(subcommand)]
    command: CommandArgs,
}

#[derive(StructOpt, Debug)]
enum CommandArgs {
    Cml(cml::CmlCmd),
    Cdl(cdl::CdlCmd),
}

impl CommandArgs {
    fn run(self) -> Result<i32, Error> {
        match self {
            CommandArgs::Cml(cmd) => cmd.run(),
            CommandArgs::Cdl(cmd) => cmd.run(),
        }
    }
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        if let Some(threads) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .context("Setting up the thread pool failed.")?;
        }
        self.command.run()
    }
}

fn main() {
    env_logger::init();

    let exit_code = match Args::from_args().run() {
        Ok(exit_code) => exit_code,
        Err(error) => {
            eprintln!("{:?}", error);
            FATAL_ERROR
        }
    };

    exit(exit_code);
}
