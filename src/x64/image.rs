//! Executable image selection and writing
//!
//! ELF64 and PE32+ are two implementations of [`ExecutableImageBuilder`],
//! picked by [`ImageFormat`]. Images are written atomically: the bytes go to a
//! temporary file next to the target, which is renamed over it only after a
//! complete write.

use std::fmt;
use std::io::Write;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::elf::Elf64Builder;
use super::pe::Pe64Builder;
use crate::error::{CodegenError, Result};

/// Output container format
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Linux x86-64 ELF executable
    #[default]
    Elf64,
    /// Windows x64 PE32+ executable
    Pe64,
}

impl ImageFormat {
    /// Builder with default layout parameters for this format
    pub fn builder(self) -> Box<dyn ExecutableImageBuilder> {
        match self {
            ImageFormat::Elf64 => Box::new(Elf64Builder::new()),
            ImageFormat::Pe64 => Box::new(Pe64Builder::new()),
        }
    }

    /// Conventional file extension, without the dot
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Elf64 => "",
            ImageFormat::Pe64 => "exe",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Elf64 => write!(f, "ELF64"),
            ImageFormat::Pe64 => write!(f, "PE32+"),
        }
    }
}

/// Serializes linked code into a loadable executable
pub trait ExecutableImageBuilder {
    fn format(&self) -> ImageFormat;

    /// Virtual address of the first code byte once loaded
    fn code_address(&self) -> u64;

    /// Virtual address execution starts at
    fn entry_address(&self, entry_offset: usize) -> u64 {
        self.code_address() + entry_offset as u64
    }

    /// Complete file contents for `code`, starting execution at `entry_offset`
    fn build(&self, code: &[u8], entry_offset: usize) -> Result<Vec<u8>>;
}

/// Round `value` up to a power-of-two `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// The entry point has to land on a code byte
pub(crate) fn check_entry(code: &[u8], entry_offset: usize) -> Result<()> {
    if entry_offset >= code.len() {
        return Err(CodegenError::MissingEntryPoint {
            message: format!(
                "entry offset {:#x} is outside the {}-byte code section",
                entry_offset,
                code.len()
            ),
        });
    }
    Ok(())
}

/// Write `image` to `path` atomically and mark it executable.
///
/// On failure nothing is left at `path` that was not there before.
pub fn write_image(path: &Path, image: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(image)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }

    tmp.persist(path).map_err(|e| CodegenError::ImageWrite(e.error))?;
    debug!("wrote {} bytes to {}", image.len(), path.display());
    Ok(())
}
