//! Machine code buffer, string table and relocation list
//!
//! Code is appended byte by byte while parsing; anything whose final address
//! is not known at emit time gets a 4-byte placeholder plus a relocation
//! entry, resolved exactly once after the binary layout is fixed.

use crate::errors::ErrorCode;
use crate::symtab::SymbolTable;

pub const EMIT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub const MAX_STRING_TABLE: usize = 64 * 1024;
pub const MAX_BACKPATCH: usize = 1024;

/// How the 4-byte placeholder at a patch offset is interpreted at
/// resolution time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Patch {
	/// Placeholder holds a symbol index; becomes a near relative
	/// displacement to that symbol's final address.
	Symbol,
	/// Placeholder is an offset into the string table.
	Str,
	/// Placeholder is an offset into the global data segment.
	Global,
	/// Placeholder is an offset into the initialized data segment
	/// (the import table, on formats that have one).
	Idata,
}

/// Append-only buffer of string literal contents. Offsets handed out here
/// are raw table offsets; the string base is added during relocation.
#[derive(Default)]
pub struct StringTable {
	buf: Vec<u8>,
}

impl StringTable {
	/// Appends the literal plus its NUL terminator, returning the offset of
	/// its first byte.
	pub fn add(&mut self, text: &[u8]) -> Result<i32, ErrorCode> {
		if self.buf.len() + text.len() + 1 > MAX_STRING_TABLE {
			return Err(ErrorCode::StringTableFull);
		}
		let offset = self.buf.len() as i32;
		self.buf.extend_from_slice(text);
		self.buf.push(0);
		Ok(offset)
	}

	pub fn bytes(&self) -> &[u8] {
		&self.buf
	}

	pub fn len(&self) -> i32 {
		self.buf.len() as i32
	}
}

pub struct Emitter {
	buf: Vec<u8>,
	patches: Vec<(usize, Patch)>,
}

impl Emitter {
	pub fn new() -> Self {
		Self {
			buf: Vec::new(),
			patches: Vec::new(),
		}
	}

	/// Current length of the emitted code, i.e. the address the next byte
	/// will land on.
	pub fn pos(&self) -> i32 {
		self.buf.len() as i32
	}

	pub fn code(&self) -> &[u8] {
		&self.buf
	}

	pub fn byte(&mut self, byte: u8) -> Result<(), ErrorCode> {
		if self.buf.len() >= EMIT_BUFFER_SIZE {
			return Err(ErrorCode::EmitBufferFull);
		}
		self.buf.push(byte);
		Ok(())
	}

	pub fn bytes(&mut self, bytes: &[u8]) -> Result<(), ErrorCode> {
		for &byte in bytes {
			self.byte(byte)?;
		}
		Ok(())
	}

	pub fn dword(&mut self, dword: i32) -> Result<(), ErrorCode> {
		self.bytes(&dword.to_le_bytes())
	}

	pub fn read_dword_at(&self, pos: usize) -> i32 {
		let mut bytes = [0u8; 4];
		bytes.copy_from_slice(&self.buf[pos..pos + 4]);
		i32::from_le_bytes(bytes)
	}

	pub fn write_dword_at(&mut self, pos: usize, dword: i32) {
		self.buf[pos..pos + 4].copy_from_slice(&dword.to_le_bytes());
	}

	/// Records a relocation at the current position and emits the 4-byte
	/// placeholder value.
	pub fn patched_dword(&mut self, kind: Patch, value: i32) -> Result<(), ErrorCode> {
		if self.patches.len() >= MAX_BACKPATCH {
			return Err(ErrorCode::TooManyRelocations);
		}
		self.patches.push((self.buf.len(), kind));
		self.dword(value)
	}

	/// Rewrites every placeholder once the segment bases are final. Call-
	/// and jump-style entries turn the stored symbol index into a relative
	/// displacement from the instruction's end.
	pub fn resolve(&mut self, symbols: &SymbolTable, string_base: i32, idata_base: i32, data_base: i32) {
		log::debug!(
			"resolving {} relocations (string base {string_base:#x}, data base {data_base:#x})",
			self.patches.len()
		);
		for (offset, kind) in std::mem::take(&mut self.patches) {
			let stored = self.read_dword_at(offset);
			let value = match kind {
				Patch::Str => stored + string_base,
				Patch::Global => stored + data_base,
				Patch::Idata => stored + idata_base,
				Patch::Symbol => symbols.get(stored as usize).address - (offset as i32 + 4),
			};
			log::trace!("patch {kind:?} at {offset:#x}: {stored:#x} -> {value:#x}");
			self.write_dword_at(offset, value);
		}
	}
}

#[cfg(test)]
mod test {
	#[allow(unused_imports)]
	use super::*;
	#[allow(unused_imports)]
	use crate::symtab::SymbolTable;

	#[test]
	fn dwords_are_little_endian() {
		let mut emitter = Emitter::new();
		emitter.dword(0x11223344).unwrap();
		assert_eq!(&[0x44, 0x33, 0x22, 0x11], emitter.code());
		assert_eq!(0x11223344, emitter.read_dword_at(0));
	}

	#[test]
	fn patched_call_becomes_relative_displacement() {
		let mut symbols = SymbolTable::new().unwrap();
		let target = symbols.add("f").unwrap();
		symbols.get_mut(target).address = 0x100;

		let mut emitter = Emitter::new();
		emitter.byte(0xe8).unwrap();
		emitter.patched_dword(Patch::Symbol, target as i32).unwrap();
		emitter.resolve(&symbols, 0, 0, 0);
		// displacement is target - (end of the call instruction)
		assert_eq!(0x100 - 5, emitter.read_dword_at(1));
	}

	#[test]
	fn base_relative_patches() {
		let symbols = SymbolTable::new().unwrap();
		let mut emitter = Emitter::new();
		emitter.patched_dword(Patch::Str, 8).unwrap();
		emitter.patched_dword(Patch::Global, 12).unwrap();
		emitter.resolve(&symbols, 0x1000, 0, 0x2000);
		assert_eq!(0x1008, emitter.read_dword_at(0));
		assert_eq!(0x200c, emitter.read_dword_at(4));
	}

	#[test]
	fn string_table_offsets_and_terminators() {
		let mut strings = StringTable::default();
		assert_eq!(0, strings.add(b"ab").unwrap());
		assert_eq!(3, strings.add(b"c").unwrap());
		assert_eq!(b"ab\0c\0", strings.bytes());
	}
}
