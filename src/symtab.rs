//! Symbol Table
//!
//! A flat, append-only list of symbols. Lookup scans newest-first, which is
//! what gives block-local declarations shadowing over outer ones; scope exit
//! only erases name bindings, the slots themselves are never reclaimed
//! because emitted code refers to symbols by index until relocation.

use crate::errors::ErrorCode;
use crate::lexer::KEYWORDS;

pub const MAX_SYMBOLS: usize = 1024;

/// Index 0 and the keyword slots are reserved; `lookup` results below this
/// mean "not found or keyword".
pub const NUM_KEYWORDS: usize = KEYWORDS.len() + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Base {
	#[default]
	Void,
	Char,
	Int,
	/// Enum constants; the address field holds the literal value.
	Enum,
	/// Jump labels defined by `name:` or created by a forward `goto`.
	Label,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Storage {
	#[default]
	None,
	/// Address is an offset into the global data segment.
	Global,
	/// Address is a positive offset below the frame base (negated on use).
	Local,
	/// Address is a positive offset above the frame base.
	Param,
}

/// Structured replacement for a combined type/storage bitmask: base kind,
/// independent `array`/`pointer`/`function` attributes and the storage class
/// that decides how the address field is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SymType {
	pub base: Base,
	pub array: bool,
	pub pointer: bool,
	pub function: bool,
	pub storage: Storage,
}

impl SymType {
	pub fn of(base: Base) -> Self {
		Self {
			base,
			..Self::default()
		}
	}

	pub fn int() -> Self {
		Self::of(Base::Int)
	}

	pub fn char_pointer() -> Self {
		Self {
			base: Base::Char,
			pointer: true,
			..Self::default()
		}
	}

	pub fn is_ptr_like(self) -> bool {
		self.array || self.pointer
	}

	/// Type after one level of dereference: the array attribute goes first,
	/// then the pointer attribute.
	pub fn deref(self) -> Self {
		let mut ty = self;
		if ty.array {
			ty.array = false;
		} else if ty.pointer {
			ty.pointer = false;
		}
		ty
	}

	/// Size in bytes of a value of this type: 4 for arrays, pointers and
	/// ints, 1 otherwise.
	pub fn size(self) -> i32 {
		if self.array || self.pointer || self.base == Base::Int {
			4
		} else {
			1
		}
	}

	/// Pointer arithmetic on this type advances in strides of 4.
	pub fn scaled(self) -> bool {
		self.is_ptr_like() && self.deref().size() == 4
	}
}

#[derive(Clone, Debug, Default)]
pub struct Symbol {
	pub name: Option<String>,
	pub ty: SymType,
	pub address: i32,
	pub size: i32,
}

pub struct SymbolTable {
	symbols: Vec<Symbol>,
}

impl SymbolTable {
	/// Seeds the reserved empty slot and one slot per keyword, verifying that
	/// each keyword lands on its token's slot index.
	pub fn new() -> Result<Self, ErrorCode> {
		let mut table = Self {
			symbols: Vec::new(),
		};
		table.add("")?;
		for (name, reserved) in KEYWORDS {
			if table.add(name)? != reserved as usize {
				return Err(ErrorCode::BadInitialization);
			}
		}
		Ok(table)
	}

	pub fn len(&self) -> usize {
		self.symbols.len()
	}

	pub fn get(&self, idx: usize) -> &Symbol {
		&self.symbols[idx]
	}

	pub fn get_mut(&mut self, idx: usize) -> &mut Symbol {
		&mut self.symbols[idx]
	}

	pub fn add(&mut self, name: &str) -> Result<usize, ErrorCode> {
		let idx = self.add_label()?;
		self.symbols[idx].name = Some(name.to_string());
		Ok(idx)
	}

	/// Appends an unnamed slot, used for internal jump targets.
	pub fn add_label(&mut self) -> Result<usize, ErrorCode> {
		if self.symbols.len() >= MAX_SYMBOLS {
			return Err(ErrorCode::TooManySymbols);
		}
		self.symbols.push(Symbol::default());
		Ok(self.symbols.len() - 1)
	}

	/// Scans from the most recently added symbol backwards and returns the
	/// first name match; 0 means not found (or a keyword slot).
	pub fn lookup(&self, name: &str) -> usize {
		self.symbols
			.iter()
			.rposition(|sym| sym.name.as_deref() == Some(name))
			.unwrap_or(0)
	}

	/// Block exit: erase the name binding of every non-global entry at or
	/// after `from`.
	pub fn forget_scope(&mut self, from: usize) {
		for sym in &mut self.symbols[from..] {
			if sym.ty.storage != Storage::Global {
				sym.name = None;
			}
		}
	}

	/// Function exit: erase every name binding at or after `from`, including
	/// parameters and jump labels.
	pub fn forget_frame(&mut self, from: usize) {
		for sym in &mut self.symbols[from..] {
			sym.name = None;
		}
	}
}

#[cfg(test)]
mod test {
	#[allow(unused_imports)]
	use super::*;

	#[test]
	fn keyword_slots_are_reserved() {
		let table = SymbolTable::new().unwrap();
		assert_eq!(NUM_KEYWORDS, table.len());
		assert!(table.lookup("while") < NUM_KEYWORDS);
		assert_ne!(0, table.lookup("while"));
		assert_eq!(0, table.lookup("nosuch"));
	}

	#[test]
	fn newest_first_lookup_shadows() {
		let mut table = SymbolTable::new().unwrap();
		let outer = table.add("x").unwrap();
		table.get_mut(outer).ty.storage = Storage::Global;
		let inner = table.add("x").unwrap();
		table.get_mut(inner).ty.storage = Storage::Local;
		assert_eq!(inner, table.lookup("x"));

		// block exit unbinds the local, the global becomes visible again
		table.forget_scope(inner);
		assert_eq!(outer, table.lookup("x"));
	}

	#[test]
	fn forget_frame_unbinds_globals_too() {
		let mut table = SymbolTable::new().unwrap();
		let label = table.add("out").unwrap();
		table.get_mut(label).ty.storage = Storage::Global;
		table.forget_frame(label);
		assert_eq!(0, table.lookup("out"));
	}

	#[test]
	fn deref_strips_array_before_pointer() {
		let ty = SymType {
			base: Base::Int,
			array: true,
			pointer: true,
			..SymType::default()
		};
		assert!(ty.deref().pointer);
		assert!(!ty.deref().array);
		assert!(!ty.deref().deref().pointer);
	}

	#[test]
	fn sizes_and_scaling() {
		assert_eq!(4, SymType::int().size());
		assert_eq!(1, SymType::of(Base::Char).size());
		assert_eq!(4, SymType::char_pointer().size());
		let int_ptr = SymType {
			base: Base::Int,
			pointer: true,
			..SymType::default()
		};
		assert!(int_ptr.scaled());
		assert!(!SymType::char_pointer().scaled());
	}
}
