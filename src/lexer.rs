//! Lexical Analyzer
//!
//! `Lexer::next` produces one token at a time from the source bytes; a single
//! token can be pushed back with `Lexer::push` and is replayed exactly once.
//! Identifier and string literal text is interned in the lexer so that
//! `Token` stays `Copy` and the parser can hold tokens across lookahead.

use crate::errors::{CompileError, ErrorCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
	Keyword(Reserved),

	Identifier(usize),
	Literal(usize),
	Number(i32),

	// Brackets
	LeftParenthesis,
	RightParenthesis,
	LeftBrace,
	RightBrace,
	LeftSquare,
	RightSquare,
	Semicolon,
	Colon,
	Comma,

	// Operators
	// Arithmetic
	Plus,
	Minus,
	Star,
	Slash,
	Percent,
	PlusPlus,
	MinusMinus,
	// Comparison
	EqualEqual,
	BangEqual,
	Greater,
	Less,
	GreaterEqual,
	LessEqual,
	// Logical
	Bang,
	AmpAmp,
	PipePipe,
	// Bitwise
	Tilde,
	Amp,
	Pipe,
	Caret,
	LessLess,
	GreaterGreater,
	// Assignment
	Equal,
	PlusEqual,
	MinusEqual,
	StarEqual,
	SlashEqual,
	PercentEqual,
	AmpEqual,
	PipeEqual,
	CaretEqual,
	LessLessEqual,
	GreaterGreaterEqual,

	Eof,
}

/// Keyword token kinds; the discriminants double as the reserved slot index
/// in the symbol table, which seeds one entry per keyword at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reserved {
	Char = 1,
	Int,
	Void,
	Return,
	If,
	While,
	Continue,
	Break,
	Else,
	Enum,
	Do,
	Goto,
}

pub const KEYWORDS: [(&str, Reserved); 12] = [
	("char", Reserved::Char),
	("int", Reserved::Int),
	("void", Reserved::Void),
	("return", Reserved::Return),
	("if", Reserved::If),
	("while", Reserved::While),
	("continue", Reserved::Continue),
	("break", Reserved::Break),
	("else", Reserved::Else),
	("enum", Reserved::Enum),
	("do", Reserved::Do),
	("goto", Reserved::Goto),
];

fn keyword(id: &str) -> Option<Reserved> {
	KEYWORDS
		.iter()
		.find(|(name, _)| *name == id)
		.map(|(_, reserved)| *reserved)
}

/// Value of an ASCII hex digit, valid for `0-9`, `a-f` and `A-F`.
fn xdigit(byte: u8) -> i32 {
	((byte & 0xf) + 9 * (byte >> 6)) as i32
}

pub struct Lexer {
	src: Vec<u8>,
	pos: usize,
	line: usize,
	pushed: Option<Token>,
	names: Vec<String>,
	literals: Vec<Vec<u8>>,
}

impl Lexer {
	pub fn new(source: &str) -> Self {
		Self {
			src: source.as_bytes().to_vec(),
			pos: 0,
			line: 1,
			pushed: None,
			names: Vec::new(),
			literals: Vec::new(),
		}
	}

	pub fn line(&self) -> usize {
		self.line
	}

	/// Remember one token for reading it again.
	pub fn push(&mut self, tok: Token) {
		self.pushed = Some(tok);
	}

	pub fn name(&self, idx: usize) -> &str {
		&self.names[idx]
	}

	pub fn literal(&self, idx: usize) -> &[u8] {
		&self.literals[idx]
	}

	fn peek(&self) -> u8 {
		self.src.get(self.pos).copied().unwrap_or(0)
	}

	fn getc(&mut self) -> u8 {
		let ch = self.peek();
		if ch != 0 {
			self.pos += 1;
		}
		ch
	}

	fn accept(&mut self, want: u8) -> bool {
		if self.peek() == want {
			self.pos += 1;
			return true;
		}
		false
	}

	fn intern_name(&mut self, name: String) -> usize {
		self.names.iter().position(|n| **n == name).unwrap_or_else(|| {
			self.names.push(name);
			self.names.len() - 1
		})
	}

	fn intern_literal(&mut self, bytes: Vec<u8>) -> usize {
		self.literals.iter().position(|l| **l == bytes).unwrap_or_else(|| {
			self.literals.push(bytes);
			self.literals.len() - 1
		})
	}

	fn err(&self, code: ErrorCode) -> CompileError {
		CompileError::new(code, self.line)
	}

	fn skip_line_comment(&mut self) {
		loop {
			let ch = self.getc();
			if ch == 0 {
				return;
			}
			if ch == b'\n' {
				self.line += 1;
				return;
			}
		}
	}

	fn skip_block_comment(&mut self) {
		loop {
			let ch = self.getc();
			if ch == 0 {
				return;
			}
			if ch == b'\n' {
				self.line += 1;
			}
			if ch == b'*' && self.accept(b'/') {
				return;
			}
		}
	}

	/// Scan the remainder of a quoted string or character literal, with the
	/// delimiter already consumed. Translates the escape sequences
	/// `\n \r \0 \' \t \xHH`; any other escaped character stands for itself.
	fn scan_quoted(&mut self, delim: u8) -> Vec<u8> {
		let mut text = Vec::new();
		loop {
			let mut ch = self.getc();
			if ch == 0 || ch == delim {
				break;
			}
			if ch == b'\\' {
				ch = self.getc();
				ch = match ch {
					b'x' | b'X' => {
						let hi = self.getc();
						let lo = self.getc();
						((xdigit(hi) << 4) + xdigit(lo)) as u8
					}
					b'n' => 0x0a,
					b'r' => 0x0d,
					b'0' => 0,
					b'\'' => 0x27,
					b't' => 0x9,
					other => other,
				};
			}
			text.push(ch);
		}
		text
	}

	fn scan_number(&mut self, first: u8) -> i32 {
		if first != b'0' {
			// decimal
			let mut value = (first - b'0') as i32;
			while self.peek().is_ascii_digit() {
				value = value.wrapping_mul(10).wrapping_add((self.getc() - b'0') as i32);
			}
			return value;
		}
		if self.accept(b'x') || self.accept(b'X') {
			let mut value = 0i32;
			while self.peek().is_ascii_hexdigit() {
				value = (value << 4).wrapping_add(xdigit(self.getc()));
			}
			return value;
		}
		// leading zero: octal
		let mut value = 0i32;
		while (b'0'..=b'7').contains(&self.peek()) {
			value = (value << 3).wrapping_add((self.getc() - b'0') as i32);
		}
		value
	}

	pub fn next(&mut self) -> Result<Token, CompileError> {
		if let Some(tok) = self.pushed.take() {
			return Ok(tok);
		}
		loop {
			let current = self.getc();
			let tok = match current {
				0 => Token::Eof,
				b' ' | b'\t' | b'\r' | b'\n' => {
					if current == b'\n' {
						self.line += 1;
					}
					continue;
				}
				b'#' => {
					// treated as a line comment
					self.skip_line_comment();
					continue;
				}
				b'/' => {
					if self.accept(b'/') {
						self.skip_line_comment();
						continue;
					} else if self.accept(b'*') {
						self.skip_block_comment();
						continue;
					} else if self.accept(b'=') {
						Token::SlashEqual
					} else {
						Token::Slash
					}
				}
				b'>' => {
					if self.accept(b'>') {
						if self.accept(b'=') {
							Token::GreaterGreaterEqual
						} else {
							Token::GreaterGreater
						}
					} else if self.accept(b'=') {
						Token::GreaterEqual
					} else {
						Token::Greater
					}
				}
				b'<' => {
					if self.accept(b'<') {
						if self.accept(b'=') {
							Token::LessLessEqual
						} else {
							Token::LessLess
						}
					} else if self.accept(b'=') {
						Token::LessEqual
					} else {
						Token::Less
					}
				}
				b'+' => {
					if self.accept(b'+') {
						Token::PlusPlus
					} else if self.accept(b'=') {
						Token::PlusEqual
					} else {
						Token::Plus
					}
				}
				b'-' => {
					if self.accept(b'-') {
						Token::MinusMinus
					} else if self.accept(b'=') {
						Token::MinusEqual
					} else {
						Token::Minus
					}
				}
				b'*' => {
					if self.accept(b'=') {
						Token::StarEqual
					} else {
						Token::Star
					}
				}
				b'=' => {
					if self.accept(b'=') {
						Token::EqualEqual
					} else {
						Token::Equal
					}
				}
				b'!' => {
					if self.accept(b'=') {
						Token::BangEqual
					} else {
						Token::Bang
					}
				}
				b'|' => {
					if self.accept(b'|') {
						Token::PipePipe
					} else if self.accept(b'=') {
						Token::PipeEqual
					} else {
						Token::Pipe
					}
				}
				b'&' => {
					if self.accept(b'&') {
						Token::AmpAmp
					} else if self.accept(b'=') {
						Token::AmpEqual
					} else {
						Token::Amp
					}
				}
				b'%' => {
					if self.accept(b'=') {
						Token::PercentEqual
					} else {
						Token::Percent
					}
				}
				b'^' => {
					if self.accept(b'=') {
						Token::CaretEqual
					} else {
						Token::Caret
					}
				}
				b'~' => Token::Tilde,
				b',' => Token::Comma,
				b';' => Token::Semicolon,
				b':' => Token::Colon,
				b'(' => Token::LeftParenthesis,
				b')' => Token::RightParenthesis,
				b'{' => Token::LeftBrace,
				b'}' => Token::RightBrace,
				b'[' => Token::LeftSquare,
				b']' => Token::RightSquare,
				b'"' | b'\'' => {
					let text = self.scan_quoted(current);
					if current == b'\'' {
						// character literals are plain numbers, sign extended
						Token::Number(text.first().copied().unwrap_or(0) as i8 as i32)
					} else {
						Token::Literal(self.intern_literal(text))
					}
				}
				ch if ch.is_ascii_alphabetic() || ch == b'_' => {
					let mut ident = String::from(ch as char);
					while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
						ident.push(self.getc() as char);
					}
					match keyword(&ident) {
						Some(reserved) => Token::Keyword(reserved),
						None => Token::Identifier(self.intern_name(ident)),
					}
				}
				ch if ch.is_ascii_digit() => Token::Number(self.scan_number(ch)),
				_ => return Err(self.err(ErrorCode::UnexpectedCharacter)),
			};
			return Ok(tok);
		}
	}
}
