//! Basil compiler command-line interface
//!
//! The front end serialises its validated IR to JSON; this tool runs the
//! RV32 back end over it and writes a static executable.

use basil_ir::IrProgram;
use basil_rv32::Backend;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Compile a Basil IR program to an RV32 executable
#[derive(Parser)]
#[command(name = "basilc")]
#[command(about = "RV32 back end for the Basil compiler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Serialised IR program (JSON)
    input: PathBuf,

    /// Path of the executable to write
    #[arg(short, long, default_value = "a.out")]
    output: PathBuf,

    /// Print the IR before lowering
    #[arg(long)]
    dump_ir: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: &Cli) -> Result<(), String> {
    let text = std::fs::read_to_string(&cli.input)
        .map_err(|e| format!("{}: {e}", cli.input.display()))?;
    let prog: IrProgram =
        serde_json::from_str(&text).map_err(|e| format!("{}: {e}", cli.input.display()))?;

    if cli.dump_ir {
        prog.dump();
    }

    Backend::new()
        .compile_to_file(&prog, &cli.output)
        .map_err(|e| e.to_string())?;

    log::info!("wrote {}", cli.output.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
