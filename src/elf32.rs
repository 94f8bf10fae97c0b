//! ELF32 executable writer and Linux runtime stubs
//!
//! The whole program is one `PT_LOAD` text segment at file offset 0x80,
//! mapped at 0x400080, with string literals appended right after the code.
//! Globals live in a second, file-empty read-write segment at 0x413000.
//! The `_sys_*` primitives are `int 0x80` system call stubs, appended only
//! for the ones the program actually declared.

use std::io::{self, Write};

use crate::errors::CompileError;
use crate::{Compiler, Image};

const E_ENTRY: i32 = 0x400080;
const BSS_BASE: i32 = 0x413000;
const BSS_SIZE: i32 = 0x800000;

const PF_X: i32 = 1;
const PF_W: i32 = 2;
const PF_R: i32 = 4;

const SHF_WRITE: i32 = 1;
const SHF_ALLOC: i32 = 2;
const SHF_EXECINSTR: i32 = 4;

const SHT_PROGBITS: i32 = 1;
const SHT_STRTAB: i32 = 3;
const SHT_NOBITS: i32 = 8;

// "\0.shstrtab\0.text\0.bss\0.data\0"
const SHSTRTAB: &[u8] = b"\0.shstrtab\0.text\0.bss\0.data\0";

/// Appends the system call stubs for whichever of the runtime primitives
/// the program referenced. A symbol with a nonzero address was defined by
/// the program itself and keeps its definition.
pub(crate) fn emit_runtime(c: &mut Compiler) -> Result<(), CompileError> {
	let symidx = c.syms.lookup("_sys_exit");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		c.bytes(&[0x8b, 0x44, 0x24, 0x04])?; // mov eax, [esp+4]
		c.bytes(&[0x89, 0xc3])?; // mov ebx, eax
		c.byte(0xb8)?; // mov eax, 1
		c.dword(1)?;
		c.bytes(&[0xcd, 0x80])?; // int 0x80
	}

	let symidx = c.syms.lookup("_sys_write");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		syscall_stub(c, 4)?;
	}

	let symidx = c.syms.lookup("_sys_read");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		syscall_stub(c, 3)?;
	}
	Ok(())
}

/// `read` and `write` take the same (fd, buffer, count) arguments, so they
/// share one stub body differing only in the system call number.
fn syscall_stub(c: &mut Compiler, number: i32) -> Result<(), CompileError> {
	c.bytes(&[0x55, 0x89, 0xe5])?; // push ebp / mov ebp, esp
	c.bytes(&[0x52, 0x51, 0x53])?; // push edx / push ecx / push ebx
	c.bytes(&[0x8b, 0x5d, 0x08])?; // mov ebx, [ebp+8]
	c.bytes(&[0x8b, 0x4d, 0x0c])?; // mov ecx, [ebp+12]
	c.bytes(&[0x8b, 0x55, 0x10])?; // mov edx, [ebp+16]
	c.byte(0xb8)?; // mov eax, number
	c.dword(number)?;
	c.bytes(&[0xcd, 0x80])?; // int 0x80
	c.bytes(&[0x5b, 0x59, 0x5a])?; // pop ebx / pop ecx / pop edx
	c.bytes(&[0x89, 0xec, 0x5d, 0xc3]) // mov esp, ebp / pop ebp / ret
}

/// Byte sink that tracks how much has been written, for the alignment
/// padding between file parts.
struct Out<'a, W: Write> {
	out: &'a mut W,
	written: usize,
}

impl<'a, W: Write> Out<'a, W> {
	fn new(out: &'a mut W) -> Self {
		Self { out, written: 0 }
	}

	fn bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
		self.out.write_all(bytes)?;
		self.written += bytes.len();
		Ok(())
	}

	fn word(&mut self, value: u16) -> io::Result<()> {
		self.bytes(&value.to_le_bytes())
	}

	fn dword(&mut self, value: i32) -> io::Result<()> {
		self.bytes(&value.to_le_bytes())
	}

	fn pad(&mut self, count: usize) -> io::Result<()> {
		for _ in 0..count {
			self.bytes(&[0])?;
		}
		Ok(())
	}
}

fn write_header<W: Write>(out: &mut Out<W>, e_entry: i32, e_shoff: i32, phnum: u16, shnum: u16) -> io::Result<()> {
	out.bytes(&[0x7f, b'E', b'L', b'F'])?; // e_ident: magic
	out.bytes(&[0x01, 0x01, 0x01, 0x00])?; // 32-bit, little endian, version 1
	out.pad(8)?;
	out.word(0x02)?; // e_type: ET_EXEC
	out.word(0x03)?; // e_machine: EM_386
	out.dword(0x01)?; // e_version
	out.dword(e_entry)?;
	out.dword(0x34)?; // e_phoff: right after this header
	out.dword(e_shoff)?;
	out.dword(0)?; // e_flags
	out.word(0x34)?; // e_ehsize
	out.word(0x20)?; // e_phentsize
	out.word(phnum)?;
	out.word(0x28)?; // e_shentsize
	out.word(shnum)?;
	out.word(shnum - 1) // e_shstrndx is the last section
}

fn write_program_header<W: Write>(
	out: &mut Out<W>,
	p_offset: i32,
	p_vaddr: i32,
	p_filesz: i32,
	p_memsz: i32,
	p_flags: i32,
	p_align: i32,
) -> io::Result<()> {
	out.dword(1)?; // p_type: PT_LOAD
	out.dword(p_offset)?;
	out.dword(p_vaddr)?;
	out.dword(0)?; // p_paddr
	out.dword(p_filesz)?;
	out.dword(p_memsz)?;
	out.dword(p_flags)?;
	out.dword(p_align)
}

fn write_section_header<W: Write>(
	out: &mut Out<W>,
	sh_name: i32,
	sh_type: i32,
	sh_flags: i32,
	sh_addr: i32,
	sh_offset: i32,
	sh_size: i32,
	sh_align: i32,
) -> io::Result<()> {
	out.dword(sh_name)?;
	out.dword(sh_type)?;
	out.dword(sh_flags)?;
	out.dword(sh_addr)?;
	out.dword(sh_offset)?;
	out.dword(sh_size)?;
	out.dword(0)?; // sh_link
	out.dword(0)?; // sh_info
	out.dword(sh_align)?;
	out.dword(0) // sh_entsize
}

/// Lays the image out as an ELF32 executable. The section headers are not
/// needed to run the file; they are there so `objdump` can disassemble it.
pub(crate) fn write_image<W: Write>(mut image: Image, out: &mut W) -> io::Result<()> {
	let code_size = image.emit.pos() + image.strings.len();
	let mut e_shoff = 0x80 + code_size + SHSTRTAB.len() as i32;
	e_shoff += 16 - e_shoff % 16;

	let string_base = E_ENTRY + code_size - image.strings.len();
	image.emit.resolve(&image.syms, string_base, 0, BSS_BASE);
	log::debug!(
		"elf32 layout: {code_size:#x} bytes of text at {E_ENTRY:#x}, {} bytes of globals at {BSS_BASE:#x}",
		image.global_space
	);

	let mut out = Out::new(out);
	write_header(&mut out, E_ENTRY, e_shoff, 2, 4)?;
	write_program_header(&mut out, 0x80, E_ENTRY, code_size, 0x10000 + 0x80, PF_R + PF_X, 16)?;
	write_program_header(&mut out, 0x80, BSS_BASE, 0, BSS_SIZE, PF_R + PF_W, 16)?;
	out.pad(16 - out.written % 16)?; // code starts at offset 0x80

	out.bytes(image.emit.code())?;
	out.bytes(image.strings.bytes())?;
	out.bytes(SHSTRTAB)?;
	out.pad(16 - out.written % 16)?;
	out.pad(40)?; // null section header
	write_section_header(
		&mut out,
		11,
		SHT_PROGBITS,
		SHF_EXECINSTR + SHF_ALLOC,
		E_ENTRY,
		0x80,
		code_size,
		16,
	)?; // .text
	write_section_header(&mut out, 17, SHT_NOBITS, SHF_ALLOC + SHF_WRITE, BSS_BASE, 0x80, BSS_SIZE, 16)?; // .bss
	write_section_header(
		&mut out,
		1,
		SHT_STRTAB,
		0,
		0,
		0x80 + code_size,
		SHSTRTAB.len() as i32,
		1,
	) // .shstrtab
}

#[cfg(test)]
mod test {
	#[allow(unused_imports)]
	use super::*;
	use crate::compile;

	fn read_dword(buf: &[u8], pos: usize) -> i32 {
		let mut bytes = [0u8; 4];
		bytes.copy_from_slice(&buf[pos..pos + 4]);
		i32::from_le_bytes(bytes)
	}

	#[test]
	fn exit_stub_is_always_appended() {
		// the startup code calls _sys_exit, so the stub is always reachable
		let image = compile("int main(void) { return 0; }").unwrap();
		let code = image.code();
		assert_eq!(&[0x89, 0xec, 0x5d, 0xc3], &code[code.len() - 17..code.len() - 13]);
		assert_eq!(&[0xcd, 0x80], &code[code.len() - 2..]);
	}

	#[test]
	fn write_stub_appears_when_declared() {
		let source = "
			int _sys_write(int fd, char *buffer, int count);
			int main(void) { return _sys_write(1, \"hi\", 2); }
		";
		let image = compile(source).unwrap();
		// mov eax, 4 followed by int 0x80
		let needle = [0xb8, 0x04, 0x00, 0x00, 0x00, 0xcd, 0x80];
		assert!(image.code().windows(needle.len()).any(|w| w == needle));
	}

	#[test]
	fn undeclared_stubs_are_omitted() {
		let image = compile("int main(void) { return 0; }").unwrap();
		// no mov eax, 3 / int 0x80 pair without a _sys_read reference
		let needle = [0xb8, 0x03, 0x00, 0x00, 0x00, 0xcd, 0x80];
		assert!(!image.code().windows(needle.len()).any(|w| w == needle));
	}

	#[test]
	fn header_fields_and_text_offset() {
		let image = compile("int main(void) { return 7; }").unwrap();
		let code_size = image.code().len() as i32;
		let mut file = Vec::new();
		image.write(&mut file).unwrap();

		assert_eq!(&[0x7f, b'E', b'L', b'F'], &file[0..4]);
		assert_eq!(2, file[16]); // ET_EXEC
		assert_eq!(3, file[18]); // EM_386
		assert_eq!(E_ENTRY, read_dword(&file, 24)); // e_entry
		assert_eq!(2, file[44]); // e_phnum
		assert_eq!(4, file[48]); // e_shnum
		assert_eq!(3, file[50]); // e_shstrndx

		// text segment: file offset 0x80, entry address, code plus strings
		assert_eq!(1, read_dword(&file, 52)); // PT_LOAD
		assert_eq!(0x80, read_dword(&file, 56));
		assert_eq!(E_ENTRY, read_dword(&file, 60));
		assert_eq!(code_size, read_dword(&file, 68)); // no literals in this program

		// the startup call to main lands at offset 0x80
		assert_eq!(0xe8, file[0x80]);
	}

	#[test]
	fn startup_call_resolves_to_main() {
		let image = compile("int main(void) { return 0; }").unwrap();
		let mut file = Vec::new();
		image.write(&mut file).unwrap();
		// entry stub is 11 bytes, so main starts at 11; displacement is
		// relative to the end of the 5-byte call at 0
		assert_eq!(11 - 5, read_dword(&file, 0x80 + 1));
	}

	#[test]
	fn string_literals_follow_the_code() {
		let source = "
			char *greeting(void) { return \"hey\"; }
			int main(void) { return 0; }
		";
		let image = compile(source).unwrap();
		let emit_len = image.code().len();
		let mut file = Vec::new();
		image.write(&mut file).unwrap();
		assert_eq!(b"hey\0", &file[0x80 + emit_len..0x80 + emit_len + 4]);
		// the push in greeting carries the mapped string address
		let expected = E_ENTRY + emit_len as i32;
		let pos = file
			.windows(4)
			.position(|w| w == expected.to_le_bytes())
			.unwrap();
		assert_eq!(0x68, file[pos - 1]);
	}
}
