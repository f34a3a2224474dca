// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for Lox.
// Reads one line at a time, interprets it against a persistent VM, and
// keeps going past errors. Line editing and history come from rustyline.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

/// REPL session holding the VM state shared across inputs.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Lox".bright_cyan().bold(),
            format!("v{} interactive shell", env!("CARGO_PKG_VERSION")).dimmed()
        );
        println!("{}", "Ctrl+D to exit".dimmed());
        println!();
    }

    /// Run the loop until EOF.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        loop {
            match self.editor.readline(&"lox> ".bright_green().to_string()) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());
                    // Errors are printed and the session continues; the
                    // VM resets its own stack after a runtime error.
                    if let Err(error) = self.vm.interpret(&line) {
                        eprint!("{}", error);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(error) => {
                    eprintln!("{} {}", "Error:".bright_red(), error);
                    break;
                }
            }
        }

        Ok(())
    }
}
