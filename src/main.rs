// File: src/main.rs
//
// Main entry point for the Lox interpreter.
// With a script path, runs the file; with no arguments, starts the
// REPL. Exit codes follow sysexits: 64 usage, 65 compile error, 70
// runtime error, 74 unreadable source.

mod bytecode;
mod compiler;
mod debug;
mod errors;
mod heap;
mod lexer;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use clap::error::ErrorKind;
use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;
use std::process;

const EX_USAGE: i32 = 64;
const EX_IOERR: i32 = 74;

#[derive(ClapParser)]
#[command(
    name = "lox",
    about = "Lox: a small, fast scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a .lox script; starts the REPL when omitted
    script: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error)
            if error.kind() == ErrorKind::DisplayHelp
                || error.kind() == ErrorKind::DisplayVersion =>
        {
            let _ = error.print();
            return;
        }
        Err(_) => {
            eprintln!("Usage: lox [script]");
            process::exit(EX_USAGE);
        }
    };

    match cli.script {
        Some(path) => run_file(&path),
        None => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(error) = repl.run() {
                    eprintln!("REPL error: {}", error);
                    process::exit(1);
                }
            }
            Err(error) => {
                eprintln!("Failed to start REPL: {}", error);
                process::exit(1);
            }
        },
    }
}

fn run_file(path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read \"{}\": {}", path.display(), error);
            process::exit(EX_IOERR);
        }
    };

    let mut vm = vm::Vm::new();
    if let Err(error) = vm.interpret(&source) {
        eprint!("{}", error);
        process::exit(error.exit_code());
    }
}
