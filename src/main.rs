mod ast;
mod codegen;
mod error;
mod jit;
mod lexer;
mod parser;
mod token;
mod toplevel;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Kaleidoscope compiler front end and MCJIT runner.
#[derive(Parser, Debug)]
#[command(name = "kaleidoscope")]
struct Args {
    /// Source file to run; starts an interactive session when omitted.
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    match args.file {
        Some(path) => {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    error!("cannot read {}: {}", path.display(), err);
                    exit(1);
                }
            };
            toplevel::main_loop(source.chars());
        }
        None => repl(),
    }
}

/// Interactive loop: one line per read, state carried across lines.
fn repl() {
    let mut session = toplevel::Session::new();
    let stdin = io::stdin();

    loop {
        print!("ready> ");
        if io::stdout().flush().is_err() {
            return;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        for value in session.run(line.chars()) {
            println!("Evaluated to {}", value);
        }
    }
}
