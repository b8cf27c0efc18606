mod cli;
mod paths;
mod run;

use anyhow::Result;
use cli::Command;
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    let paths = AppPaths::discover()?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        "resolved rendervisor paths"
    );

    match cli.command {
        Command::Run(args) => run::run_job(&paths, &cli.global, args),
        Command::Fetch(args) => run::fetch_file(&paths, &cli.global, args),
        Command::Probe(args) => run::probe(&paths, args),
        Command::Paths => run::print_paths(&paths, &cli.global),
    }
}
