//! Code Generation
//!
//! A stack machine on the x86 stack: every expression node leaves exactly
//! one value pushed. `gen_expr` walks the finished tree and appends the
//! instruction bytes for each node directly, recording a relocation wherever
//! a final address is still unknown. In address mode (`addr_only`) an lvalue
//! node pushes the address of its storage instead of the value, which is how
//! assignment, `&` and `++`/`--` get at their operand.

use crate::emit::Patch;
use crate::errors::{CompileError, ErrorCode};
use crate::expr::{ExprArena, NodeKind, Op};
use crate::lexer::Token;
use crate::symtab::{Base, Storage, SymType};
use crate::{Compiler, MAX_POSTFIX};

impl Compiler {
	pub(crate) fn byte(&mut self, byte: u8) -> Result<(), CompileError> {
		self.emit.byte(byte).map_err(|code| self.emit_err(code))
	}

	pub(crate) fn bytes(&mut self, bytes: &[u8]) -> Result<(), CompileError> {
		self.emit.bytes(bytes).map_err(|code| self.emit_err(code))
	}

	pub(crate) fn dword(&mut self, dword: i32) -> Result<(), CompileError> {
		self.emit.dword(dword).map_err(|code| self.emit_err(code))
	}

	pub(crate) fn patch(&mut self, kind: Patch, value: i32) -> Result<(), CompileError> {
		self.emit
			.patched_dword(kind, value)
			.map_err(|code| self.emit_err(code))
	}

	/// Emits code for the subtree at `root` and reports the type its pushed
	/// value has. `comma_count` counts comma operators underneath, which is
	/// how a call knows how many arguments were pushed.
	pub(crate) fn gen_expr(
		&mut self,
		arena: &ExprArena,
		root: i32,
		comma_count: &mut i32,
		addr_only: bool,
	) -> Result<SymType, CompileError> {
		use Token::*;

		if root <= 0 {
			return Ok(SymType::default());
		}
		let node = *arena.get(root);

		let op = match node.kind {
			NodeKind::Op(op) => op,
			NodeKind::Number(value) => {
				self.byte(0x68)?; // push imm32
				self.dword(value)?;
				return Ok(SymType::int());
			}
			NodeKind::Str(offset) => {
				self.byte(0x68)?; // push imm32
				self.patch(Patch::Str, offset)?;
				return Ok(SymType::char_pointer());
			}
			NodeKind::Sym(symidx, _) => {
				let sym = self.syms.get(symidx);
				let ty = sym.ty;
				let mut address = sym.address;
				let size = sym.size;

				// an array name is its address, unless it is a parameter
				// and therefore really a pointer slot
				let addr_only = addr_only || (ty.storage != Storage::Param && ty.array);

				if ty.storage == Storage::Local || ty.storage == Storage::Param {
					if ty.storage == Storage::Local {
						address = -address;
					}
					if addr_only {
						self.bytes(&[0x8d, 0x85])?; // lea eax,[ebp+X]
						self.dword(address)?;
						self.byte(0x50)?; // push eax
					} else if size >= 4 {
						self.bytes(&[0xff, 0xb5])?; // push dword [ebp+X]
						self.dword(address)?;
					} else {
						self.bytes(&[0x0f, 0xb6, 0x85])?; // movzx eax,byte [ebp+X]
						self.dword(address)?;
						self.byte(0x50)?; // push eax
					}
				} else if addr_only {
					self.byte(0x68)?; // push imm32
					self.patch(Patch::Global, address)?;
				} else if size >= 4 {
					self.bytes(&[0xff, 0x35])?; // push dword [X]
					self.patch(Patch::Global, address)?;
				} else {
					self.bytes(&[0x0f, 0xb6, 0x05])?; // movzx eax,byte [X]
					self.patch(Patch::Global, address)?;
					self.byte(0x50)?; // push eax
				}
				return Ok(ty);
			}
		};

		match op {
			Op::Token {
				tok: Comma,
				unary: false,
			} => {
				// arguments are pushed right to left
				*comma_count += 1;
				self.gen_expr(arena, node.child2, comma_count, false)?;
				self.gen_expr(arena, node.child1, comma_count, false)?;
				Ok(SymType::int())
			}
			Op::Token {
				tok: Star,
				unary: true,
			} => {
				let ty = self.gen_expr(arena, node.child1, comma_count, false)?.deref();
				if addr_only {
					// the operand value is the address the parent wants
					return Ok(ty);
				}
				self.byte(0x58)?; // pop eax
				if ty.pointer || ty.base == Base::Int {
					self.bytes(&[0xff, 0x30])?; // push dword [eax]
				} else {
					self.bytes(&[0x0f, 0xb6, 0x00])?; // movzx eax,byte [eax]
					self.byte(0x50)?; // push eax
				}
				Ok(ty)
			}
			Op::Token {
				tok: Minus,
				unary: true,
			} => {
				let ty = self.gen_expr(arena, node.child1, comma_count, false)?;
				self.byte(0x58)?; // pop eax
				self.bytes(&[0x83, 0xf0, 0xff])?; // xor eax,-1
				self.byte(0x40)?; // inc eax
				self.byte(0x50)?; // push eax
				Ok(ty)
			}
			Op::Token {
				tok: Amp,
				unary: true,
			} => {
				let mut ty = self.gen_expr(arena, node.child1, comma_count, true)?;
				ty.pointer = true;
				Ok(ty)
			}
			Op::Token {
				tok: Bang,
				unary: true,
			} => {
				self.gen_expr(arena, node.child1, comma_count, false)?;
				self.byte(0x5b)?; // pop ebx
				self.bytes(&[0x31, 0xc0])?; // xor eax,eax
				self.bytes(&[0x09, 0xdb])?; // or ebx,ebx
				self.bytes(&[0x0f, 0x94, 0xc0])?; // sete al
				self.byte(0x50)?; // push eax
				Ok(SymType::int())
			}
			Op::Token { tok: Tilde, .. } => {
				let ty = self.gen_expr(arena, node.child1, comma_count, false)?;
				self.byte(0x5b)?; // pop ebx
				self.bytes(&[0xf7, 0xd3])?; // not ebx
				self.byte(0x53)?; // push ebx
				Ok(ty)
			}
			Op::Call { .. } => {
				let symidx = match arena.get(node.child1).kind {
					NodeKind::Sym(symidx, _) => symidx,
					_ => return Err(self.err(ErrorCode::BadExpression)),
				};

				let mut param_count = 0;
				if node.child2 != 0 {
					param_count = 1;
					self.gen_expr(arena, node.child2, &mut param_count, false)?;
				}

				self.byte(0xe8)?; // call
				let address = self.syms.get(symidx).address;
				if address != 0 {
					let pos = self.emit.pos();
					self.dword(address - (pos + 4))?;
				} else {
					// not defined yet, leave it to the backpatch pass
					self.patch(Patch::Symbol, symidx as i32)?;
				}

				if param_count > 0 {
					self.bytes(&[0x81, 0xc4])?; // add esp,n
					self.dword(param_count * 4)?;
				}
				self.byte(0x50)?; // push eax

				let mut ty = self.syms.get(symidx).ty;
				ty.function = false;
				Ok(ty)
			}
			Op::Token {
				tok: Equal,
				unary: false,
			} => {
				let ty = self.gen_expr(arena, node.child2, comma_count, false)?;
				let type_left = self.gen_expr(arena, node.child1, comma_count, true)?;
				self.byte(0x5b)?; // pop ebx
				self.byte(0x58)?; // pop eax
				if type_left.is_ptr_like() || type_left.base == Base::Int {
					self.bytes(&[0x89, 0x03])?; // mov dword [ebx],eax
				} else {
					self.bytes(&[0x88, 0x03])?; // mov byte [ebx],al
				}
				self.byte(0x50)?; // push eax
				Ok(ty)
			}
			Op::Token {
				tok: cmp @ (EqualEqual | BangEqual | Less | Greater | LessEqual | GreaterEqual),
				unary: false,
			} => {
				self.gen_expr(arena, node.child2, comma_count, false)?;
				let ty = self.gen_expr(arena, node.child1, comma_count, false)?;
				self.byte(0x58)?; // pop eax
				self.byte(0x5b)?; // pop ebx
				self.bytes(&[0x31, 0xc9])?; // xor ecx,ecx
				self.bytes(&[0x39, 0xd8])?; // cmp eax,ebx
				let cc = match cmp {
					BangEqual => 0x95,
					EqualEqual => 0x94,
					Less => 0x9c,
					Greater => 0x9f,
					LessEqual => 0x9e,
					_ => 0x9d,
				};
				self.bytes(&[0x0f, cc, 0xc1])?; // setcc cl
				self.byte(0x51)?; // push ecx
				Ok(ty)
			}
			Op::Token {
				tok: mul @ (Star | Slash | Percent),
				unary: false,
			} => {
				self.gen_expr(arena, node.child1, comma_count, false)?;
				let ty = self.gen_expr(arena, node.child2, comma_count, false)?;
				self.byte(0x59)?; // pop ecx
				self.byte(0x58)?; // pop eax
				if mul == Star {
					self.bytes(&[0xf7, 0xe9])?; // imul ecx
				} else {
					self.bytes(&[0x31, 0xd2])?; // xor edx,edx
					self.bytes(&[0xf7, 0xf9])?; // idiv ecx
				}
				// quotient in eax, remainder in edx
				self.byte(if mul == Percent { 0x52 } else { 0x50 })?;
				Ok(ty)
			}
			Op::Token {
				tok: add @ (Plus | Minus | Caret | Pipe | Amp | LessLess | GreaterGreater),
				unary: false,
			} => {
				let type_left = self.gen_expr(arena, node.child1, comma_count, false)?;
				let type_right = self.gen_expr(arena, node.child2, comma_count, false)?;
				self.byte(0x59)?; // pop ecx

				let mut left_ptr = false;
				let mut right_ptr = false;
				if add == Plus || add == Minus {
					left_ptr = type_left.is_ptr_like();
					right_ptr = type_right.is_ptr_like();

					if left_ptr && !right_ptr {
						if add == Minus {
							self.bytes(&[0x83, 0xf1, 0xff])?; // xor ecx,-1
							self.byte(0x41)?; // inc ecx
						}
						self.byte(0x5b)?; // pop ebx
						if type_left.scaled() {
							self.bytes(&[0x8d, 0x1c, 0x8b])?; // lea ebx,[ebx+ecx*4]
						} else {
							self.bytes(&[0x8d, 0x1c, 0x0b])?; // lea ebx,[ebx+ecx*1]
						}
						self.byte(0x53)?; // push ebx
						return Ok(type_left);
					}
					if !left_ptr && right_ptr {
						self.byte(0x5b)?; // pop ebx
						if add == Minus {
							self.bytes(&[0x83, 0xf3, 0xff])?; // xor ebx,-1
							self.byte(0x43)?; // inc ebx
						}
						if type_right.scaled() {
							self.bytes(&[0x8d, 0x1c, 0x99])?; // lea ebx,[ecx+ebx*4]
						} else {
							self.bytes(&[0x8d, 0x1c, 0x19])?; // lea ebx,[ecx+ebx*1]
						}
						self.byte(0x53)?; // push ebx
						return Ok(type_right);
					}
				}

				match add {
					Plus => self.bytes(&[0x01, 0x0c, 0x24])?, // add [esp],ecx
					Pipe => self.bytes(&[0x09, 0x0c, 0x24])?, // or [esp],ecx
					Minus => self.bytes(&[0x29, 0x0c, 0x24])?, // sub [esp],ecx
					Amp => self.bytes(&[0x21, 0x0c, 0x24])?, // and [esp],ecx
					Caret => self.bytes(&[0x31, 0x0c, 0x24])?, // xor [esp],ecx
					LessLess => self.bytes(&[0xd3, 0x24, 0x24])?, // shl [esp],cl
					_ => self.bytes(&[0xd3, 0x2c, 0x24])?, // shr [esp],cl
				}

				if left_ptr && right_ptr && type_left.scaled() {
					// pointer difference counts elements, not bytes
					self.bytes(&[0xc1, 0x2c, 0x24, 0x02])?; // shr [esp],2
				}
				Ok(SymType::int())
			}
			Op::Token {
				tok: mas @ (StarEqual | SlashEqual | PercentEqual),
				unary: false,
			} => {
				let ty = self.gen_expr(arena, node.child2, comma_count, false)?;
				self.gen_expr(arena, node.child1, comma_count, true)?;
				self.byte(0x5b)?; // pop ebx
				self.bytes(&[0x8b, 0x03])?; // mov eax,[ebx]
				if mas == StarEqual {
					self.bytes(&[0xf7, 0x2c, 0x24])?; // imul dword [esp]
				} else {
					self.bytes(&[0x31, 0xd2])?; // xor edx,edx
					self.bytes(&[0xf7, 0x3c, 0x24])?; // idiv dword [esp]
				}
				if mas == PercentEqual {
					self.bytes(&[0x89, 0x13])?; // mov [ebx],edx
					self.bytes(&[0x89, 0x14, 0x24])?; // mov [esp],edx
				} else {
					self.bytes(&[0x89, 0x03])?; // mov [ebx],eax
					self.bytes(&[0x89, 0x04, 0x24])?; // mov [esp],eax
				}
				Ok(ty)
			}
			Op::Token {
				tok:
					aas @ (PlusEqual | MinusEqual | LessLessEqual | GreaterGreaterEqual | AmpEqual
					| CaretEqual | PipeEqual),
				unary: false,
			} => {
				let ty = self.gen_expr(arena, node.child2, comma_count, false)?;
				let type_left = self.gen_expr(arena, node.child1, comma_count, true)?;
				self.byte(0x5b)?; // pop ebx
				self.byte(0x59)?; // pop ecx

				if (aas == PlusEqual || aas == MinusEqual) && type_left.scaled() {
					// pointer arithmetic in += and -=
					self.bytes(&[0xc1, 0xe1, 0x02])?; // shl ecx,2
				}

				match aas {
					PlusEqual => self.bytes(&[0x01, 0x0b])?, // add [ebx],ecx
					PipeEqual => self.bytes(&[0x09, 0x0b])?, // or [ebx],ecx
					MinusEqual => self.bytes(&[0x29, 0x0b])?, // sub [ebx],ecx
					AmpEqual => self.bytes(&[0x21, 0x0b])?, // and [ebx],ecx
					CaretEqual => self.bytes(&[0x31, 0x0b])?, // xor [ebx],ecx
					LessLessEqual => self.bytes(&[0xd3, 0x23])?, // shl [ebx],cl
					_ => self.bytes(&[0xd3, 0x2b])?, // shr [ebx],cl
				}

				self.bytes(&[0xff, 0x33])?; // push dword [ebx]
				Ok(ty)
			}
			Op::Token {
				tok: inc @ (PlusPlus | MinusMinus),
				unary,
			} => {
				let type_left = self.gen_expr(arena, node.child1, comma_count, true)?;
				self.byte(0x58)?; // pop eax

				let step: u8 = if type_left.scaled() { 4 } else { 1 };
				let delta = if inc == MinusMinus {
					step.wrapping_neg()
				} else {
					step
				};

				if unary {
					// prefix: apply before the value is read
					self.bytes(&[0x83, 0x00, delta])?; // add dword [eax],delta
				} else {
					// postfix: remember the operand address in a frame temp,
					// applied when the statement is done
					if self.postfix.len() >= MAX_POSTFIX {
						return Err(self.err(ErrorCode::TooManyPostfixOps));
					}
					self.local_space += 4;
					let temp = -self.local_space;
					self.postfix.push((delta, temp));
					self.bytes(&[0x89, 0x85])?; // mov [ebp+temp],eax
					self.dword(temp)?;
				}
				self.bytes(&[0xff, 0x30])?; // push dword [eax]
				Ok(type_left)
			}
			Op::Token {
				tok: logical @ (AmpAmp | PipePipe),
				unary: false,
			} => {
				let end_label = self.syms.add_label().map_err(|code| self.err(code))? as i32;

				self.gen_expr(arena, node.child1, comma_count, false)?;
				self.byte(0x58)?; // pop eax
				self.bytes(&[0x09, 0xc0])?; // or eax,eax
				if logical == AmpAmp {
					self.bytes(&[0x0f, 0x84])?; // jz end
				} else {
					self.bytes(&[0x0f, 0x85])?; // jnz end
				}
				self.patch(Patch::Symbol, end_label)?;

				self.gen_expr(arena, node.child2, comma_count, false)?;
				self.byte(0x58)?; // pop eax

				let pos = self.emit.pos();
				self.syms.get_mut(end_label as usize).address = pos;

				self.bytes(&[0x31, 0xc9])?; // xor ecx,ecx
				self.bytes(&[0x09, 0xc0])?; // or eax,eax
				self.bytes(&[0x0f, 0x95, 0xc1])?; // setne cl
				self.byte(0x51)?; // push ecx
				Ok(SymType::int())
			}
			// unary plus and anything unmatched pass their operand through
			_ => self.gen_expr(arena, node.child1, comma_count, false),
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

	fn compiler_with_local(source: &str, name: &str, ty: SymType, size: i32) -> Compiler {
		let mut c = Compiler::new(source).unwrap();
		let idx = c.syms.add(name).unwrap();
		c.syms.get_mut(idx).ty = ty;
		c.syms.get_mut(idx).address = 4;
		c.syms.get_mut(idx).size = size;
		c
	}

	fn gen(mut c: Compiler) -> Compiler {
		let tok = c.lexer.next().unwrap();
		c.parse_calcexpr(tok, false, None).unwrap();
		c
	}

	#[test]
	fn folded_constant_is_a_single_push() {
		let mut c = Compiler::new("1 + 2;").unwrap();
		let tok = c.lexer.next().unwrap();
		c.parse_calcexpr(tok, false, None).unwrap();
		assert_eq!(&[0x68, 3, 0, 0, 0], c.emit.code());
	}

	#[test]
	fn int_pointer_addition_scales_by_four() {
		let ty = SymType {
			base: Base::Int,
			pointer: true,
			storage: Storage::Local,
			..SymType::default()
		};
		let c = gen(compiler_with_local("p + 1;", "p", ty, 4));
		assert!(has(c.emit.code(), &[0x8d, 0x1c, 0x8b])); // lea ebx,[ebx+ecx*4]
	}

	#[test]
	fn char_pointer_addition_scales_by_one() {
		let mut ty = SymType::char_pointer();
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("p + 1;", "p", ty, 4));
		assert!(has(c.emit.code(), &[0x8d, 0x1c, 0x0b])); // lea ebx,[ebx+ecx*1]
	}

	#[test]
	fn pointer_difference_is_element_count() {
		let ty = SymType {
			base: Base::Int,
			pointer: true,
			storage: Storage::Local,
			..SymType::default()
		};
		let c = gen(compiler_with_local("p - p;", "p", ty, 4));
		assert!(has(c.emit.code(), &[0xc1, 0x2c, 0x24, 0x02])); // shr [esp],2
	}

	#[test]
	fn postfix_increment_defers_the_side_effect() {
		let mut ty = SymType::int();
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("i++;", "i", ty, 4));
		// the old value is what remains pushed
		assert!(has(c.emit.code(), &[0xff, 0x30]));
		assert_eq!(vec![(1u8, -4)], c.postfix);
		assert_eq!(4, c.local_space);
	}

	#[test]
	fn prefix_increment_applies_immediately() {
		let mut ty = SymType::int();
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("++i;", "i", ty, 4));
		assert!(has(c.emit.code(), &[0x83, 0x00, 0x01])); // add dword [eax],1
		assert!(c.postfix.is_empty());
	}

	#[test]
	fn char_load_zero_extends() {
		let mut ty = SymType::of(Base::Char);
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("ch;", "ch", ty, 1));
		assert!(has(c.emit.code(), &[0x0f, 0xb6, 0x85])); // movzx eax,byte [ebp+X]
	}

	#[test]
	fn short_circuit_and_branches_over_the_rhs() {
		let mut ty = SymType::int();
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("i && i;", "i", ty, 4));
		let code = c.emit.code();
		assert!(has(code, &[0x09, 0xc0, 0x0f, 0x84])); // or eax,eax; jz
		assert!(has(code, &[0x0f, 0x95, 0xc1])); // setne cl
	}

	#[test]
	fn assignment_to_char_stores_one_byte() {
		let mut ty = SymType::of(Base::Char);
		ty.storage = Storage::Local;
		let c = gen(compiler_with_local("ch = 65;", "ch", ty, 1));
		assert!(has(c.emit.code(), &[0x88, 0x03])); // mov byte [ebx],al
	}

	#[test]
	fn enum_constant_folds_inside_a_call_argument() {
		let mut c = Compiler::new("f(N);").unwrap();
		let f = c.syms.add("f").unwrap();
		c.syms.get_mut(f).ty = SymType {
			function: true,
			base: Base::Int,
			..SymType::default()
		};
		let n = c.syms.add("N").unwrap();
		c.syms.get_mut(n).ty = SymType::of(Base::Enum);
		c.syms.get_mut(n).address = 5;
		let tok = c.lexer.next().unwrap();
		c.parse_calcexpr(tok, false, None).unwrap();
		// the argument is an immediate, not a data segment load
		assert!(has(c.emit.code(), &[0x68, 5, 0, 0, 0]));
		assert!(!has(c.emit.code(), &[0xff, 0x35]));
	}

	#[test]
	fn assignment_chains_right_to_left() {
		let mut c = Compiler::new("a = b = 7;").unwrap();
		for (name, address) in [("a", 4), ("b", 8)] {
			let idx = c.syms.add(name).unwrap();
			let mut ty = SymType::int();
			ty.storage = Storage::Local;
			c.syms.get_mut(idx).ty = ty;
			c.syms.get_mut(idx).address = address;
			c.syms.get_mut(idx).size = 4;
		}
		let tok = c.lexer.next().unwrap();
		c.parse_calcexpr(tok, false, None).unwrap();
		let code = c.emit.code();
		// b's slot address is taken before a's
		let lea = |address: i32| {
			let mut needle = vec![0x8d, 0x85];
			needle.extend_from_slice(&address.to_le_bytes());
			code.windows(6).position(move |window| window == needle)
		};
		assert!(lea(-8).unwrap() < lea(-4).unwrap());
	}

	#[test]
	fn call_to_forward_function_leaves_a_relocation() {
		let mut c = Compiler::new("f();").unwrap();
		let idx = c.syms.add("f").unwrap();
		c.syms.get_mut(idx).ty = SymType {
			function: true,
			base: Base::Int,
			..SymType::default()
		};
		let tok = c.lexer.next().unwrap();
		c.parse_calcexpr(tok, false, None).unwrap();
		// call with the symbol index as placeholder
		let code = c.emit.code();
		assert_eq!(0xe8, code[0]);
		assert_eq!(idx as i32, c.emit.read_dword_at(1));
	}
}
