use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cobra::bytecode::Program;
use cobra::bytecode::disasm::print_program;
use cobra::lexer::Lexer;
use cobra::object;
use cobra::runtime::Vm;

#[derive(Parser, Debug)]
#[command(name = "cobra")]
#[command(about = "Compile, disassemble and run Cobra programs")]
struct Cli {
    /// Source file, or an object file when running with --exec
    file: PathBuf,

    /// Print the scanned tokens and stop
    #[arg(short, long)]
    tokens: bool,

    /// Print the disassembly of the linked program
    #[arg(short, long)]
    disassemble: bool,

    /// Run the program on the VM
    #[arg(short, long)]
    exec: bool,

    /// Where to write the object file
    #[arg(short, long, default_value = "a.bin")]
    output: PathBuf,

    /// Log compiler and VM activity
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "cobra=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.tokens {
        return dump_tokens(&cli.file);
    }

    let program = load(&cli.file)?;

    if cli.disassemble {
        print_program(&program);
    }

    if cli.exec {
        let mut vm = Vm::new();
        let report = vm.run_program(&program)?;
        if cli.verbose {
            eprintln!("{}", report);
        }
    } else if !cli.disassemble {
        object::write_to(&cli.output, &program)
            .with_context(|| format!("failed to write '{}'", cli.output.display()))?;
        info!(path = %cli.output.display(), size = program.code.len(), "object written");
    }
    Ok(())
}

fn dump_tokens(path: &Path) -> anyhow::Result<()> {
    let source = fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    for token in Lexer::new(&source).tokenize() {
        println!("{:>4}:{:<3} {:<12} {}", token.line, token.col, format!("{:?}", token.kind), token.lexeme);
    }
    Ok(())
}

/// Reads `path` as an object file if it carries the magic, else compiles it.
fn load(path: &Path) -> anyhow::Result<Program> {
    let bytes = fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    if bytes.is_empty() {
        bail!("{}: empty file", path.display());
    }

    if object::is_object(&bytes) {
        return object::decode(&bytes).with_context(|| format!("failed to load '{}'", path.display()));
    }

    let source = String::from_utf8(bytes)
        .with_context(|| format!("'{}' is not valid UTF-8 source", path.display()))?;
    Ok(cobra::compile(&source)?)
}
