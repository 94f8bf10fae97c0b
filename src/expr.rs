//! Expression Parsing
//!
//! A two-stack operator precedence parser: operands collect in an arena as
//! tree nodes while operators wait on a stack until something of equal or
//! lower binding arrives. `a[b]` reduces to `*(a+b)`, calls keep a `-1`
//! marker under their arguments so a reduction can tell where the argument
//! list started. The finished tree is folded where constant and then handed
//! to the code generator, or its root is required to be a number when a
//! constant is expected (enum values, array sizes).

use crate::errors::{CompileError, ErrorCode};
use crate::lexer::Token;
use crate::symtab::{Base, SymType, SymbolTable, NUM_KEYWORDS};
use crate::Compiler;

pub const EXPR_STACK_SIZE: usize = 128;

/// An operator waiting on the stack or stored in a tree node. Prefix and
/// postfix forms of the same token differ in the `unary` flag; a call with
/// `unary` set is one without arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
	Token { tok: Token, unary: bool },
	Subscript,
	Call { unary: bool },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NodeKind {
	Number(i32),
	/// String literal, by string table offset.
	Str(i32),
	/// Symbol reference, with the type it had at parse time.
	Sym(usize, SymType),
	Op(Op),
}

#[derive(Clone, Copy, Debug)]
pub struct Node {
	pub kind: NodeKind,
	pub child1: i32,
	pub child2: i32,
}

/// Flat node storage; index 0 is a reserved empty slot so that 0 can mean
/// "no child" and "no expression".
pub struct ExprArena {
	nodes: Vec<Node>,
	pub root: i32,
}

impl ExprArena {
	fn new() -> Self {
		Self {
			nodes: vec![Node {
				kind: NodeKind::Number(0),
				child1: 0,
				child2: 0,
			}],
			root: 0,
		}
	}

	pub fn get(&self, idx: i32) -> &Node {
		&self.nodes[idx as usize]
	}

	fn get_mut(&mut self, idx: i32) -> &mut Node {
		&mut self.nodes[idx as usize]
	}

	fn add(&mut self, kind: NodeKind, child1: i32, child2: i32) -> Result<i32, ErrorCode> {
		if self.nodes.len() > EXPR_STACK_SIZE {
			return Err(ErrorCode::ExpressionTooDeep);
		}
		self.nodes.push(Node { kind, child1, child2 });
		let idx = (self.nodes.len() - 1) as i32;
		if self.root == 0 {
			self.root = idx;
		}
		Ok(idx)
	}
}

/// Precedence and associativity; smaller numbers bind tighter, `true` means
/// right-to-left. Open brackets get a precedence that never wins so they
/// stay on the stack until their closing bracket.
fn precedence(op: Op) -> (i32, bool) {
	use Token::*;
	match op {
		Op::Token { unary: true, .. } => (12, true),
		Op::Subscript | Op::Call { .. } => (11, false),
		Op::Token { tok, .. } => match tok {
			Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual | PercentEqual
			| LessLessEqual | GreaterGreaterEqual | AmpEqual | CaretEqual | PipeEqual => (24, true),
			PlusPlus | MinusMinus => (11, false),
			Comma => (25, false),
			Star | Slash | Percent => (13, false),
			Plus | Minus => (14, false),
			LessLess | GreaterGreater => (15, false),
			Less | LessEqual | Greater | GreaterEqual => (16, false),
			EqualEqual | BangEqual => (17, false),
			Amp => (18, false),
			Caret => (19, false),
			Pipe => (20, false),
			AmpAmp => (21, false),
			PipePipe => (22, false),
			_ => (1000, false),
		},
	}
}

/// What the previous token was, as far as prefix/postfix disambiguation is
/// concerned.
#[derive(Clone, Copy, PartialEq)]
enum Last {
	Start,
	Number,
	Identifier,
	/// A closing `)` or `]`.
	Close,
	/// A postfix `++` or `--`.
	Postfix,
	Other,
}

/// `!` and `~` are always prefix; `- + * & ++ --` are prefix unless the
/// previous token could end an operand.
fn check_unary(tok: Token, last: Last) -> bool {
	use Token::*;
	match tok {
		Bang | Tilde => true,
		Minus | Plus | Star | Amp | PlusPlus | MinusMinus => !matches!(
			last,
			Last::Number | Last::Identifier | Last::Close | Last::Postfix
		),
		_ => false,
	}
}

fn is_open(op: Op) -> bool {
	matches!(
		op,
		Op::Token {
			tok: Token::LeftParenthesis | Token::LeftSquare,
			unary: false,
		}
	)
}

fn push_op(ops: &mut Vec<Op>, op: Op) -> Result<(), ErrorCode> {
	if ops.len() >= EXPR_STACK_SIZE {
		return Err(ErrorCode::ExpressionTooDeep);
	}
	ops.push(op);
	Ok(())
}

fn push_arg(args: &mut Vec<i32>, arg: i32) -> Result<(), ErrorCode> {
	if args.len() >= EXPR_STACK_SIZE {
		return Err(ErrorCode::ExpressionTooDeep);
	}
	args.push(arg);
	Ok(())
}

/// Pops one operator and its operands into a tree node. A subscript becomes
/// an add wrapped in a dereference; a call discards the `-1` argument list
/// marker while claiming the callee.
fn reduce(arena: &mut ExprArena, ops: &mut Vec<Op>, args: &mut Vec<i32>) -> Result<(), ErrorCode> {
	let op = ops.pop().ok_or(ErrorCode::BadExpression)?;
	let takes_one = match op {
		Op::Token { tok, unary } => {
			unary || matches!(tok, Token::PlusPlus | Token::MinusMinus)
		}
		Op::Call { unary } => unary,
		Op::Subscript => false,
	};

	let mut child2 = 0;
	if !takes_one {
		child2 = args.pop().ok_or(ErrorCode::BadExpression)?;
	}
	let mut child1 = args.pop().ok_or(ErrorCode::BadExpression)?;
	if child1 == -1 && matches!(op, Op::Call { .. }) {
		child1 = args.pop().ok_or(ErrorCode::BadExpression)?;
	}

	let idx = if op == Op::Subscript {
		let sum = arena.add(
			NodeKind::Op(Op::Token {
				tok: Token::Plus,
				unary: false,
			}),
			child1,
			child2,
		)?;
		arena.add(
			NodeKind::Op(Op::Token {
				tok: Token::Star,
				unary: true,
			}),
			sum,
			0,
		)?
	} else {
		arena.add(NodeKind::Op(op), child1, child2)?
	};

	arena.root = idx;
	push_arg(args, idx)
}

/// Constant folding, in place. Enum constants collapse into their value,
/// then `+ - * /`, `!=` and unary minus fold where both sides are numbers.
fn simplify(arena: &mut ExprArena, syms: &SymbolTable, root: i32) {
	if root <= 0 {
		return;
	}
	if let NodeKind::Sym(symidx, ty) = arena.get(root).kind {
		if ty == SymType::of(Base::Enum) {
			arena.get_mut(root).kind = NodeKind::Number(syms.get(symidx).address);
		}
	}
	let op = match arena.get(root).kind {
		NodeKind::Op(op) => op,
		_ => return,
	};

	if let Op::Token { tok, unary: true } = op {
		let child = arena.get(root).child1;
		simplify(arena, syms, child);
		if tok == Token::Minus {
			if let NodeKind::Number(value) = arena.get(child).kind {
				arena.get_mut(root).kind = NodeKind::Number(value.wrapping_neg());
			}
		}
		return;
	}
	let (child1, child2) = {
		let node = arena.get(root);
		(node.child1, node.child2)
	};
	simplify(arena, syms, child1);
	simplify(arena, syms, child2);
	if matches!(op, Op::Call { .. } | Op::Subscript) {
		// arguments fold, the call itself cannot
		return;
	}
	if child1 <= 0 || child2 <= 0 {
		return;
	}

	if let (NodeKind::Number(lhs), NodeKind::Number(rhs)) =
		(arena.get(child1).kind, arena.get(child2).kind)
	{
		let folded = match op {
			Op::Token { tok: Token::Plus, .. } => Some(lhs.wrapping_add(rhs)),
			Op::Token { tok: Token::Minus, .. } => Some(lhs.wrapping_sub(rhs)),
			Op::Token { tok: Token::Star, .. } => Some(lhs.wrapping_mul(rhs)),
			Op::Token { tok: Token::Slash, .. } => lhs.checked_div(rhs),
			Op::Token {
				tok: Token::BangEqual,
				..
			} => Some((lhs != rhs) as i32),
			_ => None,
		};
		if let Some(value) = folded {
			arena.get_mut(root).kind = NodeKind::Number(value);
		}
	}
}

impl Compiler {
	/// Parses one expression starting at `tok` and either requires it to
	/// fold to a number (`is_const`) or emits code for it. Returns the
	/// first token past the expression and the constant value (0 when not
	/// in const mode). `delim` names a closing bracket that terminates the
	/// expression from a synthetic open bracket pushed by the caller.
	pub(crate) fn parse_calcexpr(
		&mut self,
		tok: Token,
		is_const: bool,
		delim: Option<Token>,
	) -> Result<(Token, i32), CompileError> {
		use Token::*;

		let mut arena = ExprArena::new();
		let mut ops: Vec<Op> = Vec::new();
		let mut args: Vec<i32> = Vec::new();
		let mut last = Last::Start;
		let mut tok = tok;

		loop {
			match tok {
				Number(value) => {
					let node = arena
						.add(NodeKind::Number(value), 0, 0)
						.map_err(|code| self.err(code))?;
					push_arg(&mut args, node).map_err(|code| self.err(code))?;
					last = Last::Number;
					tok = self.lexer.next()?;
				}
				Literal(idx) => {
					let offset = self
						.strings
						.add(self.lexer.literal(idx))
						.map_err(|code| self.err(code))?;
					let node = arena
						.add(NodeKind::Str(offset), 0, 0)
						.map_err(|code| self.err(code))?;
					push_arg(&mut args, node).map_err(|code| self.err(code))?;
					last = Last::Other;
					tok = self.lexer.next()?;
				}
				Identifier(idx) => {
					let symidx = self.syms.lookup(self.lexer.name(idx));
					if symidx < NUM_KEYWORDS {
						return Err(self.err(ErrorCode::UndefinedIdentifier));
					}
					let ty = self.syms.get(symidx).ty;
					let node = arena
						.add(NodeKind::Sym(symidx, ty), 0, 0)
						.map_err(|code| self.err(code))?;
					push_arg(&mut args, node).map_err(|code| self.err(code))?;
					if ty.function {
						// argument list marker under the arguments
						push_op(&mut ops, Op::Call { unary: false })
							.map_err(|code| self.err(code))?;
						push_arg(&mut args, -1).map_err(|code| self.err(code))?;
					}
					last = Last::Identifier;
					tok = self.lexer.next()?;
				}
				_ => {
					let terminator = matches!(
						tok,
						Comma | RightParenthesis | RightSquare | Semicolon | RightBrace
							| Keyword(_) | Eof
					);
					if !terminator && ops.is_empty() {
						// shift onto the empty stack
						let unary = check_unary(tok, last);
						if tok == LeftSquare {
							push_op(&mut ops, Op::Subscript).map_err(|code| self.err(code))?;
						}
						push_op(&mut ops, Op::Token { tok, unary })
							.map_err(|code| self.err(code))?;
						last = match tok {
							PlusPlus | MinusMinus if !unary => Last::Postfix,
							_ => Last::Other,
						};
						tok = self.lexer.next()?;
					} else if !ops.is_empty() {
						if tok == RightParenthesis || tok == RightSquare {
							while ops.last().is_some_and(|&top| !is_open(top)) {
								reduce(&mut arena, &mut ops, &mut args)
									.map_err(|code| self.err(code))?;
							}
							if ops.is_empty() {
								return Err(self.err(ErrorCode::BadExpression));
							}

							if args.len() == 1 && ops.len() == 1 && delim == Some(tok) {
								// the expression ends at its delimiter
								tok = self.lexer.next()?;
								ops.pop();
								break;
							}

							ops.pop();
							if ops.last() == Some(&Op::Call { unary: false })
								&& args.last() == Some(&-1)
							{
								// call without arguments
								ops.pop();
								push_op(&mut ops, Op::Call { unary: true })
									.map_err(|code| self.err(code))?;
								reduce(&mut arena, &mut ops, &mut args)
									.map_err(|code| self.err(code))?;
							}

							last = Last::Close;
							tok = self.lexer.next()?;
							// a closing bracket must be followed by a binary
							// operator for the expression to continue
							if matches!(
								tok,
								Number(_) | Literal(_) | Identifier(_) | Semicolon | LeftBrace
									| LeftParenthesis | LeftSquare | Keyword(_) | Eof
							) || check_unary(tok, last)
							{
								break;
							}
							continue;
						}

						let top = *ops.last().ok_or_else(|| self.err(ErrorCode::BadExpression))?;
						let (prec_top, assoc_top) = precedence(top);
						let unary = check_unary(tok, last);
						let (prec_cur, _) = precedence(Op::Token { tok, unary });

						if tok == LeftParenthesis
							|| tok == LeftSquare || prec_top > prec_cur
							|| (prec_top == prec_cur && assoc_top)
						{
							// shift
							if tok == LeftSquare {
								push_op(&mut ops, Op::Subscript)
									.map_err(|code| self.err(code))?;
							}
							push_op(&mut ops, Op::Token { tok, unary })
								.map_err(|code| self.err(code))?;
							last = match tok {
								PlusPlus | MinusMinus if !unary => Last::Postfix,
								_ => Last::Other,
							};
							tok = self.lexer.next()?;
						} else {
							reduce(&mut arena, &mut ops, &mut args)
								.map_err(|code| self.err(code))?;
						}
					} else {
						break;
					}
				}
			}
		}

		while !ops.is_empty() {
			reduce(&mut arena, &mut ops, &mut args).map_err(|code| self.err(code))?;
		}

		let root = arena.root;
		simplify(&mut arena, &self.syms, root);

		if is_const {
			if arena.root == 0 {
				return Err(self.err(ErrorCode::ExpressionNotConst));
			}
			return match arena.get(arena.root).kind {
				NodeKind::Number(value) => Ok((tok, value)),
				_ => Err(self.err(ErrorCode::ExpressionNotConst)),
			};
		}

		let mut comma_count = 0;
		self.gen_expr(&arena, arena.root, &mut comma_count, false)?;
		Ok((tok, 0))
	}
}
