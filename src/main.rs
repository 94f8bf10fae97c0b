//! Command line driver: read a C source, write an executable.
//!
//! With no arguments the compiler is a filter from stdin to stdout, like
//! the classic `cc` pipeline stage. `minicc prog.c -o prog` names the
//! files instead. Set `RUST_LOG=debug` for a look at the layout and
//! relocation work.

use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;

fn usage() -> ExitCode {
	eprintln!("usage: minicc [input.c] [-o output]");
	ExitCode::FAILURE
}

fn main() -> ExitCode {
	env_logger::init();

	let mut input = None;
	let mut output = None;
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		if arg == "-o" {
			match args.next() {
				Some(path) if output.is_none() => output = Some(path),
				_ => return usage(),
			}
		} else if input.is_none() {
			input = Some(arg);
		} else {
			return usage();
		}
	}

	let source = match &input {
		Some(path) => fs::read_to_string(path),
		None => {
			let mut text = String::new();
			io::stdin().read_to_string(&mut text).map(|_| text)
		}
	};
	let source = match source {
		Ok(source) => source,
		Err(err) => {
			eprintln!("{}: {err}", input.as_deref().unwrap_or("<stdin>"));
			return ExitCode::FAILURE;
		}
	};

	let image = match minicc::compile(&source) {
		Ok(image) => image,
		Err(err) => {
			eprintln!("{err}");
			return ExitCode::FAILURE;
		}
	};

	let written = match &output {
		Some(path) => fs::File::create(path).and_then(|mut file| image.write(&mut file)),
		None => {
			let stdout = io::stdout();
			let mut out = stdout.lock();
			image.write(&mut out).and_then(|_| out.flush())
		}
	};
	if let Err(err) = written {
		eprintln!("{}: {err}", output.as_deref().unwrap_or("<stdout>"));
		return ExitCode::FAILURE;
	}
	ExitCode::SUCCESS
}
