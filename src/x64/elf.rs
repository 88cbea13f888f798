//! ELF64 executable images
//!
//! Two `PT_LOAD` segments: a read-only one mapping the headers, and a
//! read+execute one mapping the code from the next page boundary. No section
//! headers, no dynamic linking.

use std::io::{self, Write};

use log::debug;

use super::image::{align_up, check_entry, ExecutableImageBuilder, ImageFormat};
use crate::error::Result;

/// ELF64 constants
pub mod consts {
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    pub const ELFCLASS64: u8 = 2;
    pub const ELFDATA2LSB: u8 = 1;
    pub const EV_CURRENT: u8 = 1;
    pub const ELFOSABI_NONE: u8 = 0;

    pub const ET_EXEC: u16 = 2;
    pub const EM_X86_64: u16 = 0x3E;

    pub const PT_LOAD: u32 = 1;

    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
    pub const PF_R: u32 = 4;

    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_PHDR_SIZE: u16 = 56;

    pub const PAGE_SIZE: u64 = 0x1000;
    pub const DEFAULT_LOAD_ADDR: u64 = 0x400000;
}

/// Number of program headers every image carries
const PHDR_COUNT: u16 = 2;

/// ELF64 file header
#[derive(Debug, Clone)]
pub struct Elf64Header {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Default for Elf64Header {
    fn default() -> Self {
        Self {
            e_type: consts::ET_EXEC,
            e_machine: consts::EM_X86_64,
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: consts::ELF64_EHDR_SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: consts::ELF64_PHDR_SIZE,
            e_phnum: PHDR_COUNT,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[
            consts::ELFCLASS64,
            consts::ELFDATA2LSB,
            consts::EV_CURRENT,
            consts::ELFOSABI_NONE,
        ])?;
        w.write_all(&[0u8; 8])?;

        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 program header
#[derive(Debug, Clone)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64ProgramHeader {
    /// A `PT_LOAD` segment mapping `size` file bytes at `offset` to `vaddr`
    pub fn load(flags: u32, offset: u64, vaddr: u64, size: u64) -> Self {
        Self {
            p_type: consts::PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: size,
            p_memsz: size,
            p_align: consts::PAGE_SIZE,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.p_type.to_le_bytes())?;
        w.write_all(&self.p_flags.to_le_bytes())?;
        w.write_all(&self.p_offset.to_le_bytes())?;
        w.write_all(&self.p_vaddr.to_le_bytes())?;
        w.write_all(&self.p_paddr.to_le_bytes())?;
        w.write_all(&self.p_filesz.to_le_bytes())?;
        w.write_all(&self.p_memsz.to_le_bytes())?;
        w.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 executable builder
#[derive(Debug, Clone)]
pub struct Elf64Builder {
    load_addr: u64,
}

impl Elf64Builder {
    pub fn new() -> Self {
        Self {
            load_addr: consts::DEFAULT_LOAD_ADDR,
        }
    }

    /// Set the load address (default: 0x400000). Must be page aligned.
    pub fn load_addr(mut self, addr: u64) -> Self {
        debug_assert_eq!(addr % consts::PAGE_SIZE, 0, "load address must be page aligned");
        self.load_addr = addr;
        self
    }

    fn headers_size() -> u64 {
        consts::ELF64_EHDR_SIZE as u64 + PHDR_COUNT as u64 * consts::ELF64_PHDR_SIZE as u64
    }

    /// File offset of the first code byte
    pub fn code_offset() -> u64 {
        align_up(Self::headers_size(), consts::PAGE_SIZE)
    }
}

impl Default for Elf64Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableImageBuilder for Elf64Builder {
    fn format(&self) -> ImageFormat {
        ImageFormat::Elf64
    }

    fn code_address(&self) -> u64 {
        self.load_addr + Self::code_offset()
    }

    fn build(&self, code: &[u8], entry_offset: usize) -> Result<Vec<u8>> {
        check_entry(code, entry_offset)?;

        let headers_size = Self::headers_size();
        let code_offset = Self::code_offset();
        let code_size = code.len() as u64;

        let ehdr = Elf64Header {
            e_entry: self.entry_address(entry_offset),
            ..Default::default()
        };
        let headers = Elf64ProgramHeader::load(consts::PF_R, 0, self.load_addr, headers_size);
        let text = Elf64ProgramHeader::load(
            consts::PF_R | consts::PF_X,
            code_offset,
            self.code_address(),
            code_size,
        );

        let mut buf = Vec::with_capacity((code_offset + code_size) as usize);
        ehdr.write(&mut buf)?;
        headers.write(&mut buf)?;
        text.write(&mut buf)?;
        buf.resize(code_offset as usize, 0);
        buf.extend_from_slice(code);

        debug!(
            "ELF64 image: {} bytes, entry {:#x}",
            buf.len(),
            ehdr.e_entry
        );
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn u64_at(buf: &[u8], at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn test_elf_header_size() {
        let mut buf = Vec::new();
        Elf64Header::default().write(&mut buf).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_program_header_size() {
        let mut buf = Vec::new();
        Elf64ProgramHeader::load(consts::PF_R, 0, 0x400000, 176)
            .write(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), 56);
    }

    #[test]
    fn test_elf_identity() {
        let elf = Elf64Builder::new().build(&[0xC3], 0).unwrap();
        assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(elf[4], 2); // 64-bit
        assert_eq!(elf[5], 1); // little endian
        assert_eq!(u16_at(&elf, 16), 2); // ET_EXEC
        assert_eq!(u16_at(&elf, 18), 0x3E); // x86-64
        assert_eq!(u16_at(&elf, 56), 2); // e_phnum
    }

    #[test]
    fn test_entry_is_code_base_plus_offset() {
        let builder = Elf64Builder::new();
        let code = [0x90, 0x90, 0x90, 0xC3];
        let elf = builder.build(&code, 3).unwrap();
        let code_base = builder.code_address();
        assert_eq!(code_base, 0x401000);
        assert_eq!(u64_at(&elf, 24), code_base + 3);
    }

    #[test]
    fn test_code_starts_on_a_page() {
        let code = [0x90, 0xC3];
        let elf = Elf64Builder::new().build(&code, 0).unwrap();
        assert_eq!(elf.len(), 0x1000 + code.len());
        assert_eq!(&elf[0x1000..], &code);
        assert!(elf[176..0x1000].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_segments() {
        let elf = Elf64Builder::new().load_addr(0x800000).build(&[0xC3; 10], 0).unwrap();
        // second program header: flags, offset, vaddr, filesz
        let text = 64 + 56;
        assert_eq!(u32::from_le_bytes(elf[text + 4..text + 8].try_into().unwrap()), 5);
        assert_eq!(u64_at(&elf, text + 8), 0x1000);
        assert_eq!(u64_at(&elf, text + 16), 0x801000);
        assert_eq!(u64_at(&elf, text + 32), 10);
        // first maps only the headers, read-only
        assert_eq!(u32::from_le_bytes(elf[68..72].try_into().unwrap()), 4);
        assert_eq!(u64_at(&elf, 64 + 32), 176);
    }
}
