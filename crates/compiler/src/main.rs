//! BX Compiler CLI
//!
//! `bxc build` compiles a `.bx` source file to GAS-syntax x86-64 assembly
//! plus a JSON dump of the intermediate representation. Progress goes to
//! stdout through tracing; diagnostics go to stderr and exit nonzero.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "bxc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "BX compiler - compile .bx programs to x86-64 assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .bx file to assembly and a TAC dump
    Build {
        /// Input .bx source file
        input: PathBuf,

        /// Output stem (defaults to the input path without its extension);
        /// `<stem>.s` and `<stem>.tac.json` are written next to it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run the optimization round (dead-copy removal, jump threading,
        /// block coalescing) before assembling
        #[arg(short = 'O', long = "fenable-opt")]
        fenable_opt: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            fenable_opt,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension(""));
            run_build(&input, &output, fenable_opt);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "bxc", &mut io::stdout());
        }
    }
}

fn run_build(input: &Path, output: &Path, fenable_opt: bool) {
    match bxc::compile_file(input, output, fenable_opt) {
        Ok(()) => {
            println!(
                "Compiled {} -> {}.s",
                input.display(),
                output.display()
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
