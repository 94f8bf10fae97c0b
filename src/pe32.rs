//! PE32 executable writer and Windows runtime stubs
//!
//! Three sections: `.text` holds code plus string literals, `.idata` holds
//! the kernel32 import table, `.data` is zero-fill for globals. The
//! `_sys_*` primitives become stubs calling through the import address
//! table, so their relocations use the `.idata` base.

use std::io::{self, Write};

use crate::emit::Patch;
use crate::errors::CompileError;
use crate::{Compiler, Image};

const IMAGE_BASE: i32 = 0x400000;
const TEXT_SEG: i32 = 0x1000;
const HEADER_SIZE: i32 = 512;
const IMPORT_TABLE_SIZE: i32 = 40;
const BSS_SIZE: i32 = 0x800000;

// Fixed slots in the import address table, as offsets into .idata.
const IAT_EXIT_PROCESS: i32 = 0x28;
const IAT_GET_STD_HANDLE: i32 = 0x2c;
const IAT_WRITE_FILE: i32 = 0x30;
const IAT_READ_FILE: i32 = 0x34;

/// Appends the Windows call stubs for whichever of the runtime primitives
/// the program referenced. A symbol with a nonzero address was defined by
/// the program itself and keeps its definition.
pub(crate) fn emit_runtime(c: &mut Compiler) -> Result<(), CompileError> {
	let symidx = c.syms.lookup("_sys_exit");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		c.bytes(&[0xff, 0x25])?; // jmp [ExitProcess]
		c.patch(Patch::Idata, IAT_EXIT_PROCESS)?;
	}

	let symidx = c.syms.lookup("_sys_write");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		io_stub(c, IAT_WRITE_FILE, true)?;
	}

	let symidx = c.syms.lookup("_sys_read");
	if symidx > 0 && c.syms.get(symidx).address == 0 {
		c.syms.get_mut(symidx).address = c.emit.pos();
		io_stub(c, IAT_READ_FILE, false)?;
	}
	Ok(())
}

/// Adapts the (fd, buffer, count) calling convention to WriteFile or
/// ReadFile: resolve the descriptor with GetStdHandle, pass a local for
/// the transfer count and return it, or the file pointer on failure.
/// Writing maps descriptors 1 and 2 to -11 and -12; reading always uses
/// standard input (-10).
fn io_stub(c: &mut Compiler, call_slot: i32, map_descriptor: bool) -> Result<(), CompileError> {
	c.bytes(&[0x55, 0x89, 0xe5])?; // push ebp / mov ebp, esp
	c.bytes(&[0x83, 0xec, 0x08])?; // sub esp, 8
	c.bytes(&[0x6a, 0x00])?; // push 0 (no overlap)
	c.bytes(&[0x8d, 0x45, 0xfc])?; // lea eax, [ebp-4]
	c.byte(0x50)?; // push eax (transferred count)
	c.bytes(&[0x8b, 0x45, 0x10])?; // mov eax, [ebp+16]
	c.byte(0x50)?; // push eax (count)
	c.bytes(&[0x8b, 0x45, 0x0c])?; // mov eax, [ebp+12]
	c.byte(0x50)?; // push eax (buffer)
	if map_descriptor {
		c.byte(0xb8)?; // mov eax, -10
		c.dword(-10)?;
		c.bytes(&[0x2b, 0x45, 0x08])?; // sub eax, [ebp+8]
		c.byte(0x50)?; // push eax
	} else {
		c.bytes(&[0x6a, 0xf6])?; // push -10
	}
	c.bytes(&[0xff, 0x15])?; // call [GetStdHandle]
	c.patch(Patch::Idata, IAT_GET_STD_HANDLE)?;
	c.byte(0x50)?; // push eax (handle)
	c.bytes(&[0xff, 0x15])?; // call [WriteFile or ReadFile]
	c.patch(Patch::Idata, call_slot)?;
	c.bytes(&[0x09, 0xc0])?; // or eax, eax
	c.bytes(&[0x74, 0x03])?; // je +3 (keep the zero on failure)
	c.bytes(&[0x8b, 0x45, 0xfc])?; // mov eax, [ebp-4]
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

fn write_opt_header<W: Write>(
	out: &mut Out<W>,
	size_of_code: i32,
	size_of_initialized_data: i32,
	entry_point: i32,
	base_of_data: i32,
	size_of_image: i32,
) -> io::Result<()> {
	out.word(0x010b)?; // Magic: PE32
	out.word(0x0008)?; // LinkerVersion
	out.dword(size_of_code)?;
	out.dword(size_of_initialized_data)?;
	out.pad(4)?; // SizeOfUninitializedData
	out.dword(entry_point)?; // AddressOfEntryPoint
	out.dword(entry_point)?; // BaseOfCode
	out.dword(base_of_data)?;
	out.dword(IMAGE_BASE)?;
	out.dword(0x1000)?; // SectionAlignment
	out.dword(0x1000)?; // FileAlignment
	out.dword(4)?; // OperatingSystemVersion
	out.dword(0)?; // ImageVersion
	out.dword(4)?; // SubsystemVersion
	out.dword(0)?; // Win32VersionValue
	out.dword(size_of_image)?;
	out.dword(HEADER_SIZE)?; // SizeOfHeaders
	out.dword(0)?; // CheckSum
	out.word(3)?; // Subsystem: console
	out.word(0)?; // DllCharacteristics
	out.dword(0x100000)?; // SizeOfStackReserve
	out.dword(0x1000)?; // SizeOfStackCommit
	out.dword(0x100000)?; // SizeOfHeapReserve
	out.dword(0x1000)?; // SizeOfHeapCommit
	out.dword(0)?; // LoaderFlags
	out.dword(0x10)?; // NumberOfRvaAndSizes
	out.pad(8)?; // no export table
	out.dword(base_of_data)?; // import table RVA
	out.dword(IMPORT_TABLE_SIZE)?;
	out.pad(112) // no other data directory entries
}

fn write_section<W: Write>(
	out: &mut Out<W>,
	name: &[u8; 8],
	virtual_size: i32,
	virtual_address: i32,
	size_of_raw_data: i32,
	pointer_to_raw_data: i32,
	characteristics: u32,
) -> io::Result<()> {
	out.bytes(name)?;
	out.dword(virtual_size)?;
	out.dword(virtual_address)?;
	out.dword(size_of_raw_data)?;
	out.dword(pointer_to_raw_data)?;
	out.pad(8)?; // relocation and line number pointers
	out.pad(4)?; // relocation and line number counts
	out.bytes(&characteristics.to_le_bytes())
}

/// Lays the image out as a PE32 console executable importing from
/// kernel32.dll.
pub(crate) fn write_image<W: Write>(mut image: Image, out: &mut W) -> io::Result<()> {
	let code_size = image.emit.pos() + image.strings.len();
	let padded_code_size = code_size + (0x1000 - code_size % 0x1000);
	let data_size = 0x200;
	let padded_data_size = data_size + (0x1000 - data_size % 0x1000);
	let idata_seg = TEXT_SEG + padded_code_size;

	let string_base = IMAGE_BASE + TEXT_SEG + code_size - image.strings.len();
	image.emit.resolve(
		&image.syms,
		string_base,
		IMAGE_BASE + idata_seg,
		IMAGE_BASE + idata_seg + padded_data_size,
	);
	log::debug!(
		"pe32 layout: {code_size:#x} bytes of text at {:#x}, {} bytes of globals",
		IMAGE_BASE + TEXT_SEG,
		image.global_space
	);

	let mut out = Out::new(out);
	// DOS header with just enough to reach the PE signature
	out.bytes(b"MZ")?;
	out.pad(58)?;
	let e_lfanew = out.written as i32 + 4;
	out.dword(e_lfanew)?;

	out.bytes(b"PE\0\0")?;
	out.word(0x014c)?; // Machine: Intel 386
	out.word(3)?; // NumberOfSections
	out.bytes(&[0x5d, 0xbe, 0x45, 0x45])?; // TimeDateStamp
	out.pad(8)?; // no symbol table
	out.word(224)?; // SizeOfOptionalHeader
	out.word(0x0102)?; // Characteristics: executable, 32 bit, no relocations

	write_opt_header(
		&mut out,
		padded_code_size,
		TEXT_SEG + padded_data_size + BSS_SIZE,
		TEXT_SEG,
		idata_seg,
		TEXT_SEG + padded_code_size + padded_data_size + BSS_SIZE,
	)?;

	write_section(
		&mut out,
		b".text\0\0\0",
		code_size,
		TEXT_SEG,
		padded_code_size,
		HEADER_SIZE,
		0x6000_0020,
	)?;
	write_section(
		&mut out,
		b".idata\0\0",
		data_size,
		idata_seg,
		padded_data_size,
		HEADER_SIZE + code_size + (512 - code_size % 512),
		0xc000_0040,
	)?;
	write_section(
		&mut out,
		b".data\0\0\0",
		BSS_SIZE,
		idata_seg + padded_data_size,
		0,
		0,
		0xc000_0040,
	)?;
	out.pad(512 - out.written % 512)?;

	out.bytes(image.emit.code())?;
	out.bytes(image.strings.bytes())?;
	out.pad(512 - out.written % 512)?;

	// import table: one descriptor for kernel32.dll plus a terminator
	out.pad(12)?; // unused lookup table pointer, timestamp, forwarder chain
	out.dword(idata_seg + 64)?; // library name RVA
	out.dword(idata_seg + IMPORT_TABLE_SIZE)?; // IAT RVA
	out.pad(20)?; // terminating descriptor

	// IAT: the loader overwrites each slot with the resolved entry point
	out.dword(idata_seg + 78)?; // ExitProcess
	out.dword(idata_seg + 94)?; // GetStdHandle
	out.dword(idata_seg + 110)?; // WriteFile
	out.dword(idata_seg + 124)?; // ReadFile
	out.dword(0)?; // end of IAT

	out.pad(4 - out.written % 4)?;
	out.bytes(b"kernel32.dll\0")?;
	out.pad(2 - out.written % 2)?;
	out.bytes(b"\0\0ExitProcess\0")?; // two hint bytes before each name
	out.pad(2 - out.written % 2)?;
	out.bytes(b"\0\0GetStdHandle\0")?;
	out.pad(2 - out.written % 2)?;
	out.bytes(b"\0\0WriteFile\0")?;
	out.pad(2 - out.written % 2)?;
	out.bytes(b"\0\0ReadFile\0")?;
	out.pad(512 - out.written % 512)
}
