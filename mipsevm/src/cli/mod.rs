use clap::Parser;

pub mod run;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mipsevm",
    version = "0.1",
    about = "mipsevm - a single-step MIPS32 interpreter producing verifiable step witnesses"
)]
pub enum Commands {
    /// Run a program from a JSON state, optionally emitting step proofs.
    Run(run::RunArgs),
}
