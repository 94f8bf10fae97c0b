//! Statement and Declaration Parsing
//!
//! Recursive descent over statements and declarations, emitting code as it
//! goes. Forward control flow inside one statement (`if`, `else`) is patched
//! in place since both ends are known before the statement finishes; loops,
//! `goto` and short-circuit operators go through unnamed label symbols and
//! the relocation pass instead.

use crate::emit::Patch;
use crate::errors::{CompileError, ErrorCode};
use crate::lexer::{Reserved, Token};
use crate::symtab::{Base, Storage, SymType};
use crate::Compiler;

fn base_type(keyword: Reserved) -> Base {
	match keyword {
		Reserved::Char => Base::Char,
		Reserved::Int => Base::Int,
		_ => Base::Void,
	}
}

impl Compiler {
	/// A full statement-level expression: parses, emits and then flushes the
	/// postfix `++`/`--` side effects collected along the way, newest first.
	pub(crate) fn parse_expr(
		&mut self,
		tok: Token,
		delim: Option<Token>,
	) -> Result<Token, CompileError> {
		self.postfix.clear();
		let (tok, _) = self.parse_calcexpr(tok, false, delim)?;

		while let Some((delta, temp)) = self.postfix.pop() {
			self.bytes(&[0x8b, 0x85])?; // mov eax,[ebp+temp]
			self.dword(temp)?;
			self.bytes(&[0x83, 0x00, delta])?; // add dword [eax],delta
		}
		Ok(tok)
	}

	/// Parameter list of a function definition. Parameters live at positive
	/// frame offsets starting at 8, each one dword wide.
	fn parse_args(&mut self, tok: Token) -> Result<Token, CompileError> {
		if tok != Token::LeftParenthesis {
			return Err(self.err(ErrorCode::FunctionMissingParenthesis));
		}
		let mut tok = self.lexer.next()?;

		if tok == Token::Keyword(Reserved::Void) {
			tok = self.lexer.next()?;
			if tok != Token::RightParenthesis {
				return Err(self.err(ErrorCode::FunctionMissingParenthesis));
			}
		} else {
			let mut address = 8;

			while let Token::Keyword(
				keyword @ (Reserved::Int | Reserved::Char | Reserved::Void),
			) = tok
			{
				let mut ty = SymType::of(base_type(keyword));
				tok = self.lexer.next()?;
				if !matches!(tok, Token::Identifier(_)) {
					if tok != Token::Star {
						return Err(self.err(ErrorCode::MissingIdentifier));
					}
					ty.pointer = true;
					tok = self.lexer.next()?;
				}

				let name = match tok {
					Token::Identifier(idx) => self.lexer.name(idx).to_string(),
					_ => return Err(self.err(ErrorCode::MissingIdentifier)),
				};
				let symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
				self.syms.get_mut(symidx).address = address;
				address += 4;

				tok = self.lexer.next()?;

				if tok == Token::LeftSquare {
					tok = self.lexer.next()?;
					ty.array = true;
					if tok != Token::RightSquare {
						return Err(self.err(ErrorCode::WrongArrayDefinition));
					}
					tok = self.lexer.next()?;
				}

				ty.storage = Storage::Param;
				let sym = self.syms.get_mut(symidx);
				sym.ty = ty;
				sym.size = 4;

				match tok {
					Token::Comma => tok = self.lexer.next()?,
					Token::RightParenthesis => return self.lexer.next(),
					_ => return Err(self.err(ErrorCode::ParameterDefinition)),
				}
			}
		}
		self.lexer.next()
	}

	/// `enum { A, B = expr, ... };` with an optional (ignored) tag name.
	/// Values count up from the last explicit initializer.
	fn parse_enum_decl(&mut self, tok: Token) -> Result<Token, CompileError> {
		let mut enumval = 0;

		if tok == Token::Keyword(Reserved::Enum) {
			let mut tok = self.lexer.next()?;
			if matches!(tok, Token::Identifier(_)) {
				tok = self.lexer.next()?;
			}

			if tok != Token::LeftBrace {
				return Err(self.err(ErrorCode::EnumMissingOpeningBraces));
			}

			tok = self.lexer.next()?;
			while tok != Token::RightBrace {
				let name = match tok {
					Token::Identifier(idx) => self.lexer.name(idx).to_string(),
					_ => return Err(self.err(ErrorCode::EnumMissingIdentifier)),
				};
				let symidx = self.syms.add(&name).map_err(|code| self.err(code))?;

				tok = self.lexer.next()?;
				if tok == Token::Equal {
					tok = self.lexer.next()?;
					let (next, number) = self.parse_calcexpr(tok, true, None)?;
					tok = next;
					enumval = number;
				}

				let sym = self.syms.get_mut(symidx);
				sym.address = enumval;
				sym.ty = SymType::of(Base::Enum);
				sym.size = 4;

				if tok == Token::Comma {
					enumval += 1;
					tok = self.lexer.next()?;
				}
			}
			let tok = self.lexer.next()?;
			if tok != Token::Semicolon {
				return Err(self.err(ErrorCode::MissingSemicolon));
			}
		}
		self.lexer.next()
	}

	/// Declarators after the first identifier of a declaration: array
	/// brackets, storage allocation and the comma-separated rest. Entered
	/// with `tok` being the token after the identifier named `name`.
	fn parse_vardecl2(
		&mut self,
		tok: Token,
		ty: SymType,
		name: String,
	) -> Result<Token, CompileError> {
		let mut tok = tok;
		let mut ty = ty;
		let mut name = name;

		loop {
			let mut array_count = 0;
			if tok == Token::LeftSquare {
				// reuse the expression parser for the size by pretending
				// the bracket pair was (...]
				let (next, count) = self.parse_calcexpr(
					Token::LeftParenthesis,
					true,
					Some(Token::RightSquare),
				)?;
				tok = next;
				array_count = count;
				ty.array = true;
			}

			let mut size = if ty.pointer || ty.base == Base::Int { 4 } else { 1 };
			if array_count > 1 {
				size *= array_count;
			}
			let mut padded_size = size;
			while padded_size % 4 != 0 {
				padded_size += 1;
			}

			let symidx = if ty.storage == Storage::Local {
				let symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
				self.local_space += padded_size;
				self.syms.get_mut(symidx).address = self.local_space;
				symidx
			} else {
				// a global redeclaration reuses the slot
				let mut symidx = self.syms.lookup(&name);
				if symidx == 0 {
					symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
				}
				self.syms.get_mut(symidx).address = self.global_space;
				self.global_space += padded_size;
				symidx
			};
			let sym = self.syms.get_mut(symidx);
			sym.size = size;
			sym.ty = ty;

			if tok == Token::Comma {
				// pointer and array attributes belong to one declarator
				ty.pointer = false;
				ty.array = false;

				tok = self.lexer.next()?;
				if !matches!(tok, Token::Identifier(_)) {
					if tok != Token::Star {
						return Err(self.err(ErrorCode::MissingIdentifier));
					}
					ty.pointer = true;
					tok = self.lexer.next()?;
				}
				name = match tok {
					Token::Identifier(idx) => self.lexer.name(idx).to_string(),
					_ => return Err(self.err(ErrorCode::MissingIdentifier)),
				};
				tok = self.lexer.next()?;
				continue;
			}
			if tok != Token::Semicolon {
				return Err(self.err(ErrorCode::MissingSemicolon));
			}
			return self.lexer.next();
		}
	}

	/// A local declaration inside a block.
	fn parse_vardecl(&mut self, tok: Token) -> Result<Token, CompileError> {
		if tok == Token::Keyword(Reserved::Enum) {
			return self.parse_enum_decl(tok);
		}

		let keyword = match tok {
			Token::Keyword(k @ (Reserved::Void | Reserved::Int | Reserved::Char)) => k,
			_ => return Err(self.err(ErrorCode::MissingType)),
		};
		let mut ty = SymType::of(base_type(keyword));
		ty.storage = Storage::Local;

		let mut tok = self.lexer.next()?;
		if !matches!(tok, Token::Identifier(_)) {
			if tok != Token::Star {
				return Err(self.err(ErrorCode::MissingIdentifier));
			}
			ty.pointer = true;
			tok = self.lexer.next()?;
		}
		let name = match tok {
			Token::Identifier(idx) => self.lexer.name(idx).to_string(),
			_ => return Err(self.err(ErrorCode::MissingIdentifier)),
		};
		let tok = self.lexer.next()?;
		self.parse_vardecl2(tok, ty, name)
	}

	fn parse_stmt(
		&mut self,
		tok: Token,
		continue_label: i32,
		break_label: i32,
	) -> Result<Token, CompileError> {
		match tok {
			Token::LeftBrace => {
				let tok = self.lexer.next()?;
				self.parse_stmtblock(tok, continue_label, break_label)
			}
			Token::Keyword(Reserved::If) => {
				let tok = self.lexer.next()?;
				if tok != Token::LeftParenthesis {
					return Err(self.err(ErrorCode::IfMissingOpeningParenthesis));
				}

				let mut tok = self.parse_expr(tok, Some(Token::RightParenthesis))?;
				self.byte(0x58)?; // pop eax
				self.bytes(&[0x09, 0xc0])?; // or eax,eax
				self.bytes(&[0x0f, 0x84])?; // jz past the then branch
				let jz_pos = self.emit.pos() as usize;
				self.dword(0)?;

				tok = self.parse_stmt(tok, continue_label, break_label)?;

				if tok == Token::Keyword(Reserved::Else) {
					self.byte(0xe9)?; // jmp past the else branch
					let jmp_pos = self.emit.pos() as usize;
					self.dword(0)?;

					let pos = self.emit.pos();
					self.emit.write_dword_at(jz_pos, pos - (jz_pos as i32 + 4));

					let next = self.lexer.next()?;
					tok = self.parse_stmt(next, continue_label, break_label)?;

					let pos = self.emit.pos();
					self.emit.write_dword_at(jmp_pos, pos - (jmp_pos as i32 + 4));
				} else {
					let pos = self.emit.pos();
					self.emit.write_dword_at(jz_pos, pos - (jz_pos as i32 + 4));
				}
				Ok(tok)
			}
			Token::Keyword(Reserved::While) => {
				let tok = self.lexer.next()?;
				if tok != Token::LeftParenthesis {
					return Err(self.err(ErrorCode::WhileMissingOpeningParenthesis));
				}

				let continue_label = self.syms.add_label().map_err(|code| self.err(code))?;
				let pos = self.emit.pos();
				self.syms.get_mut(continue_label).address = pos;
				let break_label = self.syms.add_label().map_err(|code| self.err(code))?;

				let tok = self.parse_expr(tok, Some(Token::RightParenthesis))?;
				self.byte(0x58)?; // pop eax
				self.bytes(&[0x09, 0xc0])?; // or eax,eax
				self.bytes(&[0x0f, 0x84])?; // jz break
				self.patch(Patch::Symbol, break_label as i32)?;

				let tok = self.parse_stmt(tok, continue_label as i32, break_label as i32)?;
				self.byte(0xe9)?; // jmp continue
				self.patch(Patch::Symbol, continue_label as i32)?;

				let pos = self.emit.pos();
				self.syms.get_mut(break_label).address = pos;
				Ok(tok)
			}
			Token::Keyword(Reserved::Do) => {
				let continue_label = self.syms.add_label().map_err(|code| self.err(code))?;
				let break_label = self.syms.add_label().map_err(|code| self.err(code))?;
				let start_label = self.syms.add_label().map_err(|code| self.err(code))?;
				let pos = self.emit.pos();
				self.syms.get_mut(start_label).address = pos;

				let next = self.lexer.next()?;
				let tok = self.parse_stmt(next, continue_label as i32, break_label as i32)?;

				if tok != Token::Keyword(Reserved::While) {
					return Err(self.err(ErrorCode::DoMissingWhile));
				}

				let pos = self.emit.pos();
				self.syms.get_mut(continue_label).address = pos;

				let next = self.lexer.next()?;
				let tok = self.parse_expr(next, None)?;
				if tok != Token::Semicolon {
					return Err(self.err(ErrorCode::MissingSemicolon));
				}
				let tok = self.lexer.next()?;

				self.byte(0x58)?; // pop eax
				self.bytes(&[0x09, 0xc0])?; // or eax,eax
				self.bytes(&[0x0f, 0x85])?; // jnz start
				self.patch(Patch::Symbol, start_label as i32)?;

				let pos = self.emit.pos();
				self.syms.get_mut(break_label).address = pos;
				Ok(tok)
			}
			Token::Keyword(Reserved::Continue) => {
				let tok = self.lexer.next()?;
				if tok != Token::Semicolon {
					return Err(self.err(ErrorCode::MissingSemicolon));
				}
				let next = self.lexer.next()?;

				if continue_label == 0 {
					return Err(self.err(ErrorCode::ContinueOutsideLoop));
				}
				self.byte(0xe9)?; // jmp continue
				self.patch(Patch::Symbol, continue_label)?;
				Ok(next)
			}
			Token::Keyword(Reserved::Break) => {
				let tok = self.lexer.next()?;
				if tok != Token::Semicolon {
					return Err(self.err(ErrorCode::MissingSemicolon));
				}
				let next = self.lexer.next()?;

				if break_label == 0 {
					return Err(self.err(ErrorCode::BreakOutsideLoop));
				}
				self.byte(0xe9)?; // jmp break
				self.patch(Patch::Symbol, break_label)?;
				Ok(next)
			}
			Token::Keyword(Reserved::Goto) => {
				let tok = self.lexer.next()?;
				let name = match tok {
					Token::Identifier(idx) => self.lexer.name(idx).to_string(),
					_ => return Err(self.err(ErrorCode::GotoMissingIdentifier)),
				};

				let mut symidx = self.syms.lookup(&name);
				if symidx == 0 {
					// forward jump, the label fills in its address later
					symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
					self.syms.get_mut(symidx).ty = SymType {
						base: Base::Label,
						storage: Storage::Global,
						..SymType::default()
					};
				}

				self.byte(0xe9)?; // jmp label
				self.patch(Patch::Symbol, symidx as i32)?;

				let tok = self.lexer.next()?;
				if tok != Token::Semicolon {
					return Err(self.err(ErrorCode::MissingSemicolon));
				}
				self.lexer.next()
			}
			_ => {
				let mut tok = tok;
				if tok == Token::Keyword(Reserved::Return) {
					tok = self.lexer.next()?;
					if tok != Token::Semicolon {
						tok = self.parse_expr(tok, None)?;
						self.byte(0x58)?; // pop eax, the return value
					}
					self.bytes(&[0x89, 0xec, 0x5d, 0xc3])?; // mov esp,ebp; pop ebp; ret
				} else if tok != Token::Semicolon {
					if let Token::Identifier(idx) = tok {
						let next = self.lexer.next()?;
						if next == Token::Colon {
							// labeled statement
							let name = self.lexer.name(idx).to_string();
							let mut symidx = self.syms.lookup(&name);
							if symidx == 0 {
								symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
							}
							let pos = self.emit.pos();
							let sym = self.syms.get_mut(symidx);
							sym.ty = SymType {
								base: Base::Label,
								storage: Storage::Global,
								..SymType::default()
							};
							sym.address = pos;

							let next = self.lexer.next()?;
							return self.parse_stmt(next, continue_label, break_label);
						}
						self.lexer.push(next);
					}
					tok = self.parse_expr(tok, None)?;
					self.bytes(&[0x83, 0xc4, 0x04])?; // add esp,4, drop the value
				}

				if tok != Token::Semicolon {
					return Err(self.err(ErrorCode::MissingSemicolon));
				}
				self.lexer.next()
			}
		}
	}

	/// Statements and declarations up to the closing brace. Names declared
	/// inside stop resolving afterwards.
	fn parse_stmtblock(
		&mut self,
		tok: Token,
		continue_label: i32,
		break_label: i32,
	) -> Result<Token, CompileError> {
		let scope_start = self.syms.len();
		let mut tok = tok;

		while tok != Token::RightBrace {
			tok = match tok {
				Token::Keyword(
					Reserved::Int | Reserved::Char | Reserved::Void | Reserved::Enum,
				) => self.parse_vardecl(tok)?,
				_ => self.parse_stmt(tok, continue_label, break_label)?,
			};
		}

		self.syms.forget_scope(scope_start);
		self.lexer.next()
	}

	/// The whole translation unit: a sequence of enum declarations, global
	/// variable declarations and function declarations or definitions.
	pub(crate) fn parse_program(&mut self) -> Result<(), CompileError> {
		let mut tok = self.lexer.next()?;

		loop {
			match tok {
				Token::Eof => return Ok(()),
				Token::Keyword(Reserved::Enum) => tok = self.parse_enum_decl(tok)?,
				Token::Keyword(
					keyword @ (Reserved::Int | Reserved::Char | Reserved::Void),
				) => {
					let mut ty = SymType::of(base_type(keyword));
					ty.storage = Storage::Global;

					tok = self.lexer.next()?;
					if !matches!(tok, Token::Identifier(_)) {
						if tok != Token::Star {
							return Err(self.err(ErrorCode::MissingIdentifier));
						}
						ty.pointer = true;
						tok = self.lexer.next()?;
					}
					let name = match tok {
						Token::Identifier(idx) => self.lexer.name(idx).to_string(),
						_ => return Err(self.err(ErrorCode::MissingIdentifier)),
					};

					let mut symidx = self.syms.lookup(&name);
					if symidx == 0 {
						symidx = self.syms.add(&name).map_err(|code| self.err(code))?;
					}
					self.syms.get_mut(symidx).ty = ty;

					tok = self.lexer.next()?;
					if tok == Token::LeftParenthesis {
						let frame_start = self.syms.len();
						self.syms.get_mut(symidx).ty.function = true;

						tok = self.parse_args(tok)?;
						if tok == Token::Semicolon {
							// prototype only
							tok = self.lexer.next()?;
						} else if tok == Token::LeftBrace {
							self.local_space = 4; // minimum frame
							let pos = self.emit.pos();
							self.syms.get_mut(symidx).address = pos;

							self.bytes(&[0x55, 0x89, 0xe5])?; // push ebp; mov ebp,esp
							self.bytes(&[0x81, 0xec])?; // sub esp,n
							let link = self.emit.pos() as usize;
							self.dword(0)?;

							let next = self.lexer.next()?;
							tok = self.parse_stmtblock(next, 0, 0)?;

							let space = self.local_space;
							self.emit.write_dword_at(link, space);
							self.bytes(&[0x89, 0xec, 0x5d, 0xc3])?; // epilogue
						} else {
							return Err(self.err(ErrorCode::MissingFunctionBlock));
						}

						self.syms.forget_frame(frame_start);
					} else {
						tok = self.parse_vardecl2(tok, ty, name)?;
					}
				}
				_ => return Err(self.err(ErrorCode::MissingType)),
			}
		}
	}
}

#[cfg(test)]
mod test {
	#[allow(unused_imports)]
	use super::*;

	fn has(code: &[u8], needle: &[u8]) -> bool {
		code.windows(needle.len()).any(|window| window == needle)
	}

	fn parse(source: &str) -> Compiler {
		let mut c = Compiler::new(source).unwrap();
		c.parse_program().unwrap();
		c
	}

	#[test]
	fn enum_values_count_up_from_initializers() {
		let c = parse("enum { A, B = 2 * 3 - 1, C };");
		assert_eq!(0, c.syms.get(c.syms.lookup("A")).address);
		assert_eq!(5, c.syms.get(c.syms.lookup("B")).address);
		assert_eq!(6, c.syms.get(c.syms.lookup("C")).address);
	}

	#[test]
	fn global_layout_pads_to_dwords() {
		let c = parse("int x; char buf[10]; int *p;");
		let x = c.syms.get(c.syms.lookup("x"));
		assert_eq!((0, 4), (x.address, x.size));
		let buf = c.syms.get(c.syms.lookup("buf"));
		assert_eq!((4, 10), (buf.address, buf.size));
		assert!(buf.ty.array);
		let p = c.syms.get(c.syms.lookup("p"));
		assert_eq!((16, 4), (p.address, p.size));
		assert!(p.ty.pointer);
		assert_eq!(20, c.global_space);
	}

	#[test]
	fn comma_resets_declarator_attributes() {
		let c = parse("int *p, x;");
		assert!(c.syms.get(c.syms.lookup("p")).ty.pointer);
		assert!(!c.syms.get(c.syms.lookup("x")).ty.pointer);
	}

	#[test]
	fn function_frame_and_return() {
		let c = parse("int main(void) { return 42; }");
		let code = c.emit.code();
		// prologue with the minimum 4-byte frame patched in
		assert!(has(code, &[0x55, 0x89, 0xe5, 0x81, 0xec, 4, 0, 0, 0]));
		// push 42; pop eax; epilogue
		assert!(has(code, &[0x68, 42, 0, 0, 0, 0x58, 0x89, 0xec, 0x5d, 0xc3]));
		let main = c.syms.get(c.syms.lookup("main"));
		assert!(main.ty.function);
		assert_eq!(0, main.address);
	}

	#[test]
	fn locals_grow_the_frame() {
		let c = parse("void f(void) { int i; char buf[5]; i = 1; }");
		// 4 minimum + 4 for i + 8 for buf
		assert!(has(c.emit.code(), &[0x81, 0xec, 16, 0, 0, 0]));
	}

	#[test]
	fn parameters_sit_above_the_frame_base() {
		let c = parse("int add(int a, int b) { return a + b; }");
		let code = c.emit.code();
		// push dword [ebp+8] and [ebp+12]
		assert!(has(code, &[0xff, 0xb5, 8, 0, 0, 0]));
		assert!(has(code, &[0xff, 0xb5, 12, 0, 0, 0]));
	}

	#[test]
	fn postfix_side_effect_flushes_at_statement_end() {
		let c = parse("void f(void) { int i; i = 0; i++; }");
		let code = c.emit.code();
		// mov eax,[ebp+temp]; add dword [eax],1
		assert!(has(code, &[0x8b, 0x85, 0xf4, 0xff, 0xff, 0xff, 0x83, 0x00, 0x01]));
	}

	#[test]
	fn two_postfix_ops_flush_newest_first() {
		let c = parse("void f(void) { int i; i = 0; i = i++ + i++; }");
		// temps at ebp-12 and ebp-16; the later one is applied first
		let needle = [
			0x8b, 0x85, 0xf0, 0xff, 0xff, 0xff, 0x83, 0x00, 0x01, // [ebp-16] += 1
			0x8b, 0x85, 0xf4, 0xff, 0xff, 0xff, 0x83, 0x00, 0x01, // [ebp-12] += 1
		];
		assert!(has(c.emit.code(), &needle));
	}

	#[test]
	fn if_else_patches_both_jumps_in_place() {
		let c = parse("int f(void) { if (1) return 1; else return 2; return 0; }");
		let code = c.emit.code();
		// jz skips the then branch (10 bytes) and the jmp over the else (5)
		let jz = code
			.windows(2)
			.position(|window| window == [0x0f, 0x84])
			.unwrap();
		let mut displacement = [0u8; 4];
		displacement.copy_from_slice(&code[jz + 2..jz + 6]);
		assert_eq!(15, i32::from_le_bytes(displacement));
	}

	#[test]
	fn goto_forward_label_resolves_by_name() {
		let mut c = parse("void f(void) { goto out; out: return; }");
		// function exit wiped the label name
		assert_eq!(0, c.syms.lookup("out"));
		// the jmp placeholder still holds the label's symbol index; after
		// resolution it jumps to the epilogue right behind it
		let code = c.emit.code().to_vec();
		let jmp = code.iter().position(|&byte| byte == 0xe9).unwrap();
		c.emit.resolve(&c.syms, 0, 0, 0);
		let target = c.emit.read_dword_at(jmp + 1);
		assert_eq!(0, target);
	}

	#[test]
	fn break_outside_loop_is_rejected() {
		let mut c = Compiler::new("void f(void) { break; }").unwrap();
		let err = c.parse_program().unwrap_err();
		assert_eq!(ErrorCode::BreakOutsideLoop, err.code);
		assert_eq!(1, err.line);
	}

	#[test]
	fn missing_semicolon_reports_the_line() {
		let mut c = Compiler::new("int x\n\nint y;").unwrap();
		let err = c.parse_program().unwrap_err();
		assert_eq!(ErrorCode::MissingSemicolon, err.code);
	}

	#[test]
	fn blocks_shadow_and_forget() {
		let c = parse("int g; void f(void) { int g; g = 1; } void h(void) { g = 2; }");
		// after both functions only the global binding is left
		let g = c.syms.get(c.syms.lookup("g"));
		assert_eq!(Storage::Global, g.ty.storage);
	}
}
