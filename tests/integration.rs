//! Whole-program checks: source text in, executable bytes out.

use minicc::{compile, CompileError, ErrorCode};

fn has(code: &[u8], needle: &[u8]) -> bool {
	code.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn minimal_program() {
	let image = compile("int main(void) { return 42; }").unwrap();
	// startup call, then somewhere a push of the return value
	assert_eq!(0xe8, image.code()[0]);
	assert!(has(image.code(), &[0x68, 42, 0, 0, 0]));

	let mut file = Vec::new();
	image.write(&mut file).unwrap();
	assert!(file.len() > 0x80);
}

#[test]
fn a_program_using_the_whole_language() {
	let source = r#"
		enum { BUFFER_SIZE = 64, NEWLINE = '\n' };

		int _sys_write(int fd, char *buffer, int count);

		char line[BUFFER_SIZE];

		int length(char *text)
		{
			char *p;
			p = text;
			while (*p)
				++p;
			return p - text;
		}

		void print(char *text)
		{
			_sys_write(1, text, length(text));
		}

		int gcd(int a, int b)
		{
			while (b) {
				int t;
				t = b;
				b = a % b;
				a = t;
			}
			return a;
		}

		int factorial(int n)
		{
			if (n <= 1)
				return 1;
			return n * factorial(n - 1);
		}

		int main(void)
		{
			int i;
			int checksum;

			checksum = 0;
			i = 0;
			do {
				line[i] = 'a' + i % 26;
				checksum = checksum ^ line[i] << i % 8;
			} while (++i < BUFFER_SIZE - 1);
			line[i] = 0;

			print("hello, world");

			if (gcd(12, 18) != 6)
				goto fail;
			if (factorial(5) != 120)
				goto fail;
			return checksum & 0xff;
		fail:
			return 1;
		}
	"#;
	let image = compile(source).unwrap();
	let mut file = Vec::new();
	image.write(&mut file).unwrap();
	#[cfg(feature = "elf32")]
	assert_eq!(&[0x7f, b'E', b'L', b'F'], &file[0..4]);
	#[cfg(not(feature = "elf32"))]
	assert_eq!(b"MZ", &file[0..2]);
	// the string literal travels with the text segment
	assert!(has(&file, b"hello, world\0"));
}

#[cfg(feature = "elf32")]
#[test]
fn global_addresses_map_into_the_data_segment() {
	let source = "
		int counter;
		int main(void) { counter = 5; return counter; }
	";
	let image = compile(source).unwrap();
	let mut file = Vec::new();
	image.write(&mut file).unwrap();
	// the first global sits at the start of the read-write segment
	assert!(has(&file, &[0x68, 0x00, 0x30, 0x41, 0x00]));
}

#[test]
fn enum_constants_fold_to_immediates() {
	let source = "
		enum { FIRST = 3, SECOND };
		int main(void) { return SECOND; }
	";
	let image = compile(source).unwrap();
	assert!(has(image.code(), &[0x68, 4, 0, 0, 0]));
}

#[test]
fn enum_constants_fold_in_call_arguments() {
	let source = "
		enum { N = 5 };
		int f(int x) { return x; }
		int main(void) { return f(N); }
	";
	let image = compile(source).unwrap();
	assert!(has(image.code(), &[0x68, 5, 0, 0, 0]));
}

#[test]
fn diagnostics_name_the_line() {
	let source = "int main(void) {\n\treturn 0\n}\n";
	let err = compile(source).unwrap_err();
	assert_eq!(CompileError::new(ErrorCode::MissingSemicolon, 3), err);
	assert_eq!("error: 10 in line 3", err.to_string());
}

#[test]
fn undeclared_names_are_rejected() {
	let err = compile("int main(void) { return whatever; }").unwrap_err();
	assert_eq!(ErrorCode::UndefinedIdentifier, err.code);
}

#[test]
fn break_needs_a_loop() {
	let err = compile("int main(void) { break; }").unwrap_err();
	assert_eq!(ErrorCode::BreakOutsideLoop, err.code);
}

#[test]
fn do_loop_needs_its_while() {
	let err = compile("int main(void) { int x; do x = 1; until (x); }").unwrap_err();
	assert_eq!(ErrorCode::DoMissingWhile, err.code);
}

#[test]
fn array_sizes_must_be_constant() {
	let source = "
		int size;
		int table[size];
		int main(void) { return 0; }
	";
	let err = compile(source).unwrap_err();
	assert_eq!(ErrorCode::ExpressionNotConst, err.code);
}

#[test]
fn main_may_come_last() {
	let source = "
		int helper(int x) { return x + 1; }
		int main(void) { return helper(41); }
	";
	let image = compile(source).unwrap();
	let mut file = Vec::new();
	image.write(&mut file).unwrap();
	// the startup call reaches past helper to main
	#[cfg(feature = "elf32")]
	let text_offset = 0x80;
	#[cfg(not(feature = "elf32"))]
	let text_offset = 512;
	assert_eq!(0xe8, file[text_offset]);
}

#[test]
fn prototypes_allow_mutual_recursion() {
	let source = "
		int is_odd(int n);
		int is_even(int n) { if (n == 0) return 1; return is_odd(n - 1); }
		int is_odd(int n) { if (n == 0) return 0; return is_even(n - 1); }
		int main(void) { return is_even(10); }
	";
	assert!(compile(source).is_ok());
}

#[test]
fn comments_and_hash_lines_are_skipped() {
	let source = "
		#include <stdio.h>
		// line comment
		/* block
		   comment */
		int main(void) { return 0; }
	";
	assert!(compile(source).is_ok());
}
