use clap::Parser;
use mipsevm::cli;
use std::process::ExitCode;

pub fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cli::Commands::parse();
    match args {
        cli::Commands::Run(args) => cli::run::main(args),
    }
}
