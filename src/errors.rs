//! Compilation error codes and the fatal diagnostic type
//!
//! Every stage returns `Result<_, CompileError>`; the first error aborts the
//! whole compilation. The numeric codes 1..=24 match the diagnostic numbering
//! the compiler has always printed; codes from 25 on cover conditions that a
//! typed token stream and bounded tables surface explicitly.

use std::error::Error;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
	MissingType = 1,
	MissingIdentifier,
	MissingFunctionBlock,
	IfMissingOpeningParenthesis,
	IfMissingClosingParenthesis,
	WhileMissingOpeningParenthesis,
	WhileMissingClosingParenthesis,
	LabelMissingColon,
	GotoMissingIdentifier,
	MissingSemicolon,
	BadInitialization,
	EnumMissingOpeningBraces,
	EnumMissingIdentifier,
	EnumMissingNumber,
	MissingArraySize,
	WrongArrayDefinition,
	BadExpression,
	FunctionMissingParenthesis,
	ParameterDefinition,
	UndefinedIdentifier,
	ExpressionNotConst,
	ContinueOutsideLoop,
	BreakOutsideLoop,
	DoMissingWhile,
	UnexpectedCharacter,
	TooManySymbols,
	StringTableFull,
	EmitBufferFull,
	ExpressionTooDeep,
	TooManyRelocations,
	TooManyPostfixOps,
}

/// Fatal diagnostic: an error code plus the source line it was raised on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileError {
	pub code: ErrorCode,
	pub line: usize,
}

impl CompileError {
	pub fn new(code: ErrorCode, line: usize) -> Self {
		Self { code, line }
	}
}

impl fmt::Display for CompileError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "error: {} in line {}", self.code as i32, self.line)
	}
}

impl Error for CompileError {}

#[cfg(test)]
mod test {
	#[allow(unused_imports)]
	use super::*;

	#[test]
	fn diagnostic_format() {
		let err = CompileError::new(ErrorCode::MissingSemicolon, 7);
		assert_eq!("error: 10 in line 7", err.to_string());
	}

	#[test]
	fn code_numbering() {
		assert_eq!(1, ErrorCode::MissingType as i32);
		assert_eq!(21, ErrorCode::ExpressionNotConst as i32);
		assert_eq!(24, ErrorCode::DoMissingWhile as i32);
	}
}
