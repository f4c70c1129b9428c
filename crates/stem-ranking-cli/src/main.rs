use std::process::ExitCode;

use clap::Parser;
use stem_ranking_cli::{render_error, run_cli, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (rendered, code) = render_error(&err);
            eprintln!("{rendered}");
            ExitCode::from(code)
        }
    }
}
