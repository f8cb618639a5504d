//! The `siesta` command: run a script file, or start a REPL.

use std::io::{BufRead, Write};
use std::process::ExitCode;

use siesta::{eval, Context, Globals, ScriptError, Value};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    match args.next() {
        None => repl(),
        Some(flag) if flag == "-h" || flag == "--help" => {
            println!("usage: siesta [script.siesta]");
            println!("With no arguments, starts an interactive REPL.");
            ExitCode::SUCCESS
        }
        Some(path) => run_file(&path),
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("siesta: cannot read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut context = Context::new();
    let mut bindings = Globals::new();
    match eval(&source, &mut bindings, &mut context) {
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Interactive loop. Top-level declarations persist across lines: the
/// context runs in REPL mode, so declarations become globals held in the
/// bindings map.
fn repl() -> ExitCode {
    let mut context = Context::new().repl_mode(true);
    let mut bindings = Globals::new();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    println!("siesta repl — blank line or ctrl-d to exit");
    loop {
        print!("> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(e) => {
                eprintln!("siesta: {e}");
                return ExitCode::FAILURE;
            }
        }
        let line = line.trim_end();
        if line.is_empty() {
            return ExitCode::SUCCESS;
        }
        match eval(line, &mut bindings, &mut context) {
            Ok(Value::Null) => {}
            Ok(value) => println!("{value}"),
            Err(ScriptError::Compile(e)) => eprint!("{e}"),
            Err(ScriptError::Runtime(e)) => eprint!("{e}"),
        }
    }
}
