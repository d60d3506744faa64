//! The interactive session.
//!
//! Lines are interpreted one at a time against a single VM, so definitions
//! accumulate; REPL modules permit global re-definition. History persists
//! under the user's home directory across sessions.

use std::path::PathBuf;

use crux_runtime::Vm;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const HISTORY_FILE: &str = ".crux_history";

pub fn run() {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start the interactive session: {}.", e);
            std::process::exit(74);
        }
    };

    let history_path = history_path();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    println!("crux {} — interactive session", env!("CARGO_PKG_VERSION"));

    let mut vm = Vm::new(vec![]);
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Errors were already reported; the VM stays usable.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}.", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(HISTORY_FILE))
}
