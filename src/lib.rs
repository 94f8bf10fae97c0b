//! A single pass compiler for a small subset of C, targeting 32-bit x86.
//!
//! There is no intermediate representation: the parser emits machine code
//! while it reads tokens, with one backpatch pass at the end to fill in
//! addresses that were unknown at emit time. `compile` turns source text
//! into an [`Image`] which [`Image::write`] serializes as a ready-to-run
//! executable. The container format is selected by crate feature, `elf32`
//! (the default) or `pe32`.

pub mod emit;
pub mod errors;
pub mod expr;
pub mod gen;
pub mod lexer;
pub mod parser;
pub mod symtab;

#[cfg(feature = "elf32")]
pub mod elf32;
#[cfg(all(feature = "pe32", not(feature = "elf32")))]
pub mod pe32;

#[cfg(feature = "elf32")]
use elf32 as output;
#[cfg(all(feature = "pe32", not(feature = "elf32")))]
use pe32 as output;

#[cfg(not(any(feature = "elf32", feature = "pe32")))]
compile_error!("select an output format: feature \"elf32\" or \"pe32\"");

pub use errors::{CompileError, ErrorCode};

use emit::{Emitter, Patch, StringTable};
use lexer::Lexer;
use symtab::SymbolTable;

pub const MAX_POSTFIX: usize = 10;

/// All compilation state: token source, symbols, the code buffer and the
/// bookkeeping the parser and code generator share.
pub struct Compiler {
	pub(crate) lexer: Lexer,
	pub(crate) syms: SymbolTable,
	pub(crate) strings: StringTable,
	pub(crate) emit: Emitter,
	/// Bytes of global data allocated so far.
	pub(crate) global_space: i32,
	/// Bytes of locals in the current frame, patched into the prologue
	/// once the function body has been parsed.
	pub(crate) local_space: i32,
	/// Pending postfix `++`/`--` side effects of the current statement,
	/// as (delta, frame offset of the saved operand address) pairs.
	pub(crate) postfix: Vec<(u8, i32)>,
}

impl Compiler {
	pub fn new(source: &str) -> Result<Self, CompileError> {
		let syms = SymbolTable::new().map_err(|code| CompileError::new(code, 0))?;
		Ok(Self {
			lexer: Lexer::new(source),
			syms,
			strings: StringTable::default(),
			emit: Emitter::new(),
			global_space: 0,
			local_space: 0,
			postfix: Vec::new(),
		})
	}

	pub(crate) fn err(&self, code: ErrorCode) -> CompileError {
		CompileError::new(code, self.lexer.line())
	}

	pub(crate) fn emit_err(&self, code: ErrorCode) -> CompileError {
		// resource exhaustion while emitting, reported at the current line
		CompileError::new(code, self.lexer.line())
	}

	/// Startup stub at the very beginning of the text segment: call `main`,
	/// then hand its return value to `_sys_exit`.
	fn emit_entry(&mut self) -> Result<(), CompileError> {
		let mainidx = self.syms.add("main").map_err(|code| self.emit_err(code))?;
		self.emit.byte(0xe8).map_err(|code| self.emit_err(code))?; // call main
		self.emit
			.patched_dword(Patch::Symbol, mainidx as i32)
			.map_err(|code| self.emit_err(code))?;

		let exitidx = self.syms.add("_sys_exit").map_err(|code| self.emit_err(code))?;
		self.emit.byte(0x50).map_err(|code| self.emit_err(code))?; // push eax
		self.emit.byte(0xe8).map_err(|code| self.emit_err(code))?; // call _sys_exit
		self.emit
			.patched_dword(Patch::Symbol, exitidx as i32)
			.map_err(|code| self.emit_err(code))
	}
}

/// A compiled program, ready to be laid out into an executable file.
pub struct Image {
	pub(crate) emit: Emitter,
	pub(crate) strings: StringTable,
	pub(crate) syms: SymbolTable,
	pub(crate) global_space: i32,
}

impl std::fmt::Debug for Image {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Image")
			.field("code_bytes", &self.emit.pos())
			.field("string_bytes", &self.strings.len())
			.field("symbols", &self.syms.len())
			.field("global_space", &self.global_space)
			.finish()
	}
}

impl Image {
	/// The raw text segment before relocation.
	pub fn code(&self) -> &[u8] {
		self.emit.code()
	}

	/// Lays out the final binary, resolves all relocations against the
	/// computed segment bases and writes the executable image.
	pub fn write<W: std::io::Write>(self, out: &mut W) -> std::io::Result<()> {
		output::write_image(self, out)
	}
}

/// Compiles a complete translation unit into an executable image.
pub fn compile(source: &str) -> Result<Image, CompileError> {
	let mut c = Compiler::new(source)?;
	c.emit_entry()?;
	c.parse_program()?;
	output::emit_runtime(&mut c)?;
	log::debug!(
		"compiled {} bytes of code, {} bytes of strings, {} symbols",
		c.emit.pos(),
		c.strings.len(),
		c.syms.len()
	);
	Ok(Image {
		emit: c.emit,
		strings: c.strings,
		syms: c.syms,
		global_space: c.global_space,
	})
}
