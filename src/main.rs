use std::env;
use std::process;

use skiff::error::InterpretError;
use skiff::vm::Vm;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut vm = Vm::new();

    match args.len() {
        1 => vm.repl(),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: skiff [path]");
            process::exit(64);
        }
    }
}

fn run_file(vm: &mut Vm, path: &str) {
    match vm.dofile(path) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(65),
        Err(e @ InterpretError::Runtime { .. }) => {
            eprintln!("{}", e);
            process::exit(70);
        }
    }
}
