//! PE32+ executable images for Windows x64
//!
//! One `.text` section and no imports. The entry stub returns main's result
//! to the loader, which uses it as the process exit code.
//!
//! ## File layout
//!
//! ```text
//! 0x000  DOS header + stub
//! 0x080  "PE\0\0", COFF header, optional header, .text section header
//! 0x400  code, padded to FileAlignment
//! ```

use std::io::{self, Cursor, Write};

use log::debug;

use super::image::{align_up, check_entry, ExecutableImageBuilder, ImageFormat};
use crate::error::Result;

/// PE constants
pub mod consts {
    pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
    pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

    pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

    pub const PE32_PLUS_MAGIC: u16 = 0x020B;

    pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

    pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x0020;
    pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;
    pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
    pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

    pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
    pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
    pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

    pub const DOS_HEADER_SIZE: usize = 64;
    pub const COFF_HEADER_SIZE: usize = 20;
    pub const OPTIONAL_HEADER_SIZE: usize = 240;
    pub const SECTION_HEADER_SIZE: usize = 40;
    pub const DATA_DIRECTORY_COUNT: usize = 16;

    /// Where the PE signature starts, right after the DOS stub
    pub const PE_HEADER_OFFSET: u32 = 0x80;
    /// All headers, padded
    pub const SIZE_OF_HEADERS: u32 = 0x400;

    pub const SECTION_ALIGNMENT: u32 = 0x1000;
    pub const FILE_ALIGNMENT: u32 = 0x200;

    pub const DEFAULT_IMAGE_BASE: u64 = 0x1_4000_0000;
}

/// Real-mode program that prints the usual message and exits
const DOS_STUB: &[u8] = b"\x0E\x1F\xBA\x0E\x00\xB4\x09\xCD\x21\xB8\x01\x4C\xCD\x21\
This program cannot be run in DOS mode.\r\r\n$";

/// DOS header (64 bytes)
#[derive(Debug, Clone)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

impl DosHeader {
    pub fn new(pe_header_offset: u32) -> Self {
        Self {
            e_magic: consts::DOS_MAGIC,
            e_lfanew: pe_header_offset,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_magic, e_cblp, e_cp, e_crlc, e_cparhdr, e_minalloc, e_maxalloc,
        // e_ss, e_sp, e_csum, e_ip, e_cs, e_lfarlc, e_ovno
        let fields: [u16; 14] = [
            self.e_magic,
            0x90,
            3,
            0,
            4,
            0,
            0xFFFF,
            0,
            0xB8,
            0,
            0,
            0,
            0x40,
            0,
        ];
        for field in fields {
            w.write_all(&field.to_le_bytes())?;
        }
        // e_res, e_oemid, e_oeminfo, e_res2
        w.write_all(&[0u8; 32])?;
        w.write_all(&self.e_lfanew.to_le_bytes())?;
        Ok(())
    }
}

/// COFF file header (20 bytes)
#[derive(Debug, Clone)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    /// Always 0 so identical input gives identical output
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    pub fn new(num_sections: u16) -> Self {
        Self {
            machine: consts::IMAGE_FILE_MACHINE_AMD64,
            number_of_sections: num_sections,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: consts::OPTIONAL_HEADER_SIZE as u16,
            characteristics: consts::IMAGE_FILE_EXECUTABLE_IMAGE
                | consts::IMAGE_FILE_LARGE_ADDRESS_AWARE,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.machine.to_le_bytes())?;
        w.write_all(&self.number_of_sections.to_le_bytes())?;
        w.write_all(&self.time_date_stamp.to_le_bytes())?;
        w.write_all(&self.pointer_to_symbol_table.to_le_bytes())?;
        w.write_all(&self.number_of_symbols.to_le_bytes())?;
        w.write_all(&self.size_of_optional_header.to_le_bytes())?;
        w.write_all(&self.characteristics.to_le_bytes())?;
        Ok(())
    }
}

/// Data directory entry
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// PE32+ optional header (240 bytes)
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,

    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,

    pub data_directories: [DataDirectory; consts::DATA_DIRECTORY_COUNT],
}

impl Default for OptionalHeader {
    fn default() -> Self {
        Self {
            magic: consts::PE32_PLUS_MAGIC,
            major_linker_version: 1,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            image_base: consts::DEFAULT_IMAGE_BASE,
            section_alignment: consts::SECTION_ALIGNMENT,
            file_alignment: consts::FILE_ALIGNMENT,
            major_os_version: 6,
            minor_os_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: 0,
            size_of_headers: consts::SIZE_OF_HEADERS,
            checksum: 0,
            subsystem: consts::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            dll_characteristics: consts::IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA
                | consts::IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                | consts::IMAGE_DLLCHARACTERISTICS_NX_COMPAT
                | consts::IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: consts::DATA_DIRECTORY_COUNT as u32,
            data_directories: [DataDirectory::default(); consts::DATA_DIRECTORY_COUNT],
        }
    }
}

impl OptionalHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.magic.to_le_bytes())?;
        w.write_all(&[self.major_linker_version, self.minor_linker_version])?;
        for field in [
            self.size_of_code,
            self.size_of_initialized_data,
            self.size_of_uninitialized_data,
            self.address_of_entry_point,
            self.base_of_code,
        ] {
            w.write_all(&field.to_le_bytes())?;
        }
        w.write_all(&self.image_base.to_le_bytes())?;
        w.write_all(&self.section_alignment.to_le_bytes())?;
        w.write_all(&self.file_alignment.to_le_bytes())?;
        for field in [
            self.major_os_version,
            self.minor_os_version,
            self.major_image_version,
            self.minor_image_version,
            self.major_subsystem_version,
            self.minor_subsystem_version,
        ] {
            w.write_all(&field.to_le_bytes())?;
        }
        w.write_all(&self.win32_version_value.to_le_bytes())?;
        w.write_all(&self.size_of_image.to_le_bytes())?;
        w.write_all(&self.size_of_headers.to_le_bytes())?;
        w.write_all(&self.checksum.to_le_bytes())?;
        w.write_all(&self.subsystem.to_le_bytes())?;
        w.write_all(&self.dll_characteristics.to_le_bytes())?;
        for field in [
            self.size_of_stack_reserve,
            self.size_of_stack_commit,
            self.size_of_heap_reserve,
            self.size_of_heap_commit,
        ] {
            w.write_all(&field.to_le_bytes())?;
        }
        w.write_all(&self.loader_flags.to_le_bytes())?;
        w.write_all(&self.number_of_rva_and_sizes.to_le_bytes())?;
        for dd in &self.data_directories {
            w.write_all(&dd.virtual_address.to_le_bytes())?;
            w.write_all(&dd.size.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Section header (40 bytes)
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn new(name: &str, characteristics: u32) -> Self {
        let mut name_bytes = [0u8; 8];
        let len = name.len().min(8);
        name_bytes[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            name: name_bytes,
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.name)?;
        for field in [
            self.virtual_size,
            self.virtual_address,
            self.size_of_raw_data,
            self.pointer_to_raw_data,
            self.pointer_to_relocations,
            self.pointer_to_linenumbers,
        ] {
            w.write_all(&field.to_le_bytes())?;
        }
        w.write_all(&self.number_of_relocations.to_le_bytes())?;
        w.write_all(&self.number_of_linenumbers.to_le_bytes())?;
        w.write_all(&self.characteristics.to_le_bytes())?;
        Ok(())
    }
}

/// PE32+ executable builder for Windows x64
#[derive(Debug, Clone)]
pub struct Pe64Builder {
    image_base: u64,
}

impl Pe64Builder {
    pub fn new() -> Self {
        Self {
            image_base: consts::DEFAULT_IMAGE_BASE,
        }
    }

    /// Set the preferred image base (default: 0x140000000)
    pub fn image_base(mut self, addr: u64) -> Self {
        self.image_base = addr;
        self
    }

    /// RVA of `.text`: the first section-aligned address after the headers
    pub fn text_rva() -> u32 {
        consts::SECTION_ALIGNMENT
    }

    /// Value of `AddressOfEntryPoint` for an entry at `entry_offset`
    pub fn entry_rva(entry_offset: usize) -> u32 {
        Self::text_rva() + entry_offset as u32
    }
}

impl Default for Pe64Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableImageBuilder for Pe64Builder {
    fn format(&self) -> ImageFormat {
        ImageFormat::Pe64
    }

    fn code_address(&self) -> u64 {
        self.image_base + Self::text_rva() as u64
    }

    fn build(&self, code: &[u8], entry_offset: usize) -> Result<Vec<u8>> {
        check_entry(code, entry_offset)?;

        let text_size = code.len() as u64;
        let raw_size = align_up(text_size, consts::FILE_ALIGNMENT as u64) as u32;
        let text_rva = Self::text_rva();
        let size_of_image =
            text_rva + align_up(text_size, consts::SECTION_ALIGNMENT as u64) as u32;

        let optional = OptionalHeader {
            size_of_code: raw_size,
            address_of_entry_point: Self::entry_rva(entry_offset),
            base_of_code: text_rva,
            image_base: self.image_base,
            size_of_image,
            ..Default::default()
        };

        let mut text = SectionHeader::new(
            ".text",
            consts::IMAGE_SCN_CNT_CODE | consts::IMAGE_SCN_MEM_EXECUTE | consts::IMAGE_SCN_MEM_READ,
        );
        text.virtual_size = code.len() as u32;
        text.virtual_address = text_rva;
        text.size_of_raw_data = raw_size;
        text.pointer_to_raw_data = consts::SIZE_OF_HEADERS;

        let total = consts::SIZE_OF_HEADERS as usize + raw_size as usize;
        let mut cursor = Cursor::new(Vec::with_capacity(total));
        DosHeader::new(consts::PE_HEADER_OFFSET).write(&mut cursor)?;
        cursor.write_all(DOS_STUB)?;
        cursor.get_mut().resize(consts::PE_HEADER_OFFSET as usize, 0);
        cursor.set_position(consts::PE_HEADER_OFFSET as u64);
        cursor.write_all(&consts::PE_SIGNATURE.to_le_bytes())?;
        CoffHeader::new(1).write(&mut cursor)?;
        optional.write(&mut cursor)?;
        text.write(&mut cursor)?;

        let mut pe = cursor.into_inner();
        pe.resize(consts::SIZE_OF_HEADERS as usize, 0);
        pe.extend_from_slice(code);
        pe.resize(total, 0);

        debug!(
            "PE32+ image: {} bytes, entry rva {:#x}",
            pe.len(),
            optional.address_of_entry_point
        );
        Ok(pe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    // offsets inside the image
    const COFF: usize = 0x84;
    const OPT: usize = COFF + consts::COFF_HEADER_SIZE;
    const SECTION: usize = OPT + consts::OPTIONAL_HEADER_SIZE;

    #[test]
    fn test_header_sizes() {
        let mut buf = Vec::new();
        DosHeader::new(0x80).write(&mut buf).unwrap();
        assert_eq!(buf.len(), consts::DOS_HEADER_SIZE);

        let mut buf = Vec::new();
        CoffHeader::new(1).write(&mut buf).unwrap();
        assert_eq!(buf.len(), consts::COFF_HEADER_SIZE);

        let mut buf = Vec::new();
        OptionalHeader::default().write(&mut buf).unwrap();
        assert_eq!(buf.len(), consts::OPTIONAL_HEADER_SIZE);
        assert_eq!(buf.len(), 112 + 16 * 8);

        let mut buf = Vec::new();
        SectionHeader::new(".text", 0).write(&mut buf).unwrap();
        assert_eq!(buf.len(), consts::SECTION_HEADER_SIZE);
    }

    #[test]
    fn test_pe_magic_and_stub() {
        let pe = Pe64Builder::new().build(&[0xC3], 0).unwrap();
        assert_eq!(&pe[0..2], b"MZ");
        assert_eq!(u32_at(&pe, 0x3C), 0x80);
        assert_eq!(&pe[0x80..0x84], b"PE\0\0");
        let stub = &pe[0x40..0x80];
        assert!(stub.windows(6).any(|w| w == b"cannot"));
    }

    #[test]
    fn test_coff_header_fields() {
        let pe = Pe64Builder::new().build(&[0xC3], 0).unwrap();
        assert_eq!(u16_at(&pe, COFF), consts::IMAGE_FILE_MACHINE_AMD64);
        assert_eq!(u16_at(&pe, COFF + 2), 1);
        assert_eq!(u32_at(&pe, COFF + 4), 0); // timestamp
        assert_eq!(u16_at(&pe, COFF + 16), 240);
    }

    #[test]
    fn test_optional_header_fields() {
        let code = vec![0x90; 0x30];
        let pe = Pe64Builder::new().build(&code, 0x10).unwrap();
        assert_eq!(u16_at(&pe, OPT), 0x20B);
        assert_eq!(u32_at(&pe, OPT + 4), 0x200); // SizeOfCode
        assert_eq!(u32_at(&pe, OPT + 16), 0x1000 + 0x10); // AddressOfEntryPoint
        assert_eq!(u32_at(&pe, OPT + 20), 0x1000); // BaseOfCode
        assert_eq!(
            u64::from_le_bytes(pe[OPT + 24..OPT + 32].try_into().unwrap()),
            0x1_4000_0000
        );
        assert_eq!(u32_at(&pe, OPT + 32), 0x1000); // SectionAlignment
        assert_eq!(u32_at(&pe, OPT + 36), 0x200); // FileAlignment
        assert_eq!(u32_at(&pe, OPT + 56), 0x2000); // SizeOfImage
        assert_eq!(u32_at(&pe, OPT + 60), 0x400); // SizeOfHeaders
        assert_eq!(u32_at(&pe, OPT + 108), 16); // NumberOfRvaAndSizes
        assert!(pe[OPT + 112..OPT + 240].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_text_section() {
        let code = vec![0xC3; 0x201];
        let pe = Pe64Builder::new().build(&code, 0).unwrap();
        assert_eq!(&pe[SECTION..SECTION + 8], b".text\0\0\0");
        assert_eq!(u32_at(&pe, SECTION + 8), 0x201); // VirtualSize
        assert_eq!(u32_at(&pe, SECTION + 12), 0x1000); // VirtualAddress
        assert_eq!(u32_at(&pe, SECTION + 16), 0x400); // SizeOfRawData
        assert_eq!(u32_at(&pe, SECTION + 20), 0x400); // PointerToRawData
        assert_eq!(pe.len(), 0x400 + 0x400);
        assert_eq!(&pe[0x400..0x601], &code[..]);
        assert!(pe[0x601..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_entry_rva() {
        assert_eq!(Pe64Builder::entry_rva(0), 0x1000);
        assert_eq!(Pe64Builder::entry_rva(0x42), 0x1042);
        assert_eq!(Pe64Builder::new().entry_address(0x42), 0x1_4000_1042);
    }
}
