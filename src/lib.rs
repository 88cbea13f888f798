//! # evolver
//!
//! x86-64 backend for a small C subset: `int` locals, arithmetic, comparisons,
//! `if`/`while`/`for`, and direct calls. Takes an AST from a frontend and emits
//! a standalone executable with no assembler, linker or C runtime involved.
//!
//! ## Pipeline
//!
//! | Stage     | Module         | Output             |
//! |-----------|----------------|--------------------|
//! | Lowering  | `x64::codegen` | linked code bytes  |
//! | Packaging | `x64::elf`, `x64::pe` | image bytes |
//! | Writing   | `x64::image`   | executable file    |

pub mod ast;
pub mod error;
pub mod x64;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use error::{CodegenError, Diagnostic, ErrorCode, Result};
pub use x64::{CompiledProgram, ImageFormat};

use ast::TranslationUnit;
use x64::frame::DEFAULT_MAX_FRAME_SIZE;

/// Knobs for one compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Container format; also selects the entry stub
    pub format: ImageFormat,
    /// Reject identifiers that were never declared instead of allocating them
    pub strict_locals: bool,
    /// Per-function frame limit in bytes
    pub max_frame_size: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Elf64,
            strict_locals: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl CompileOptions {
    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn strict_locals(mut self, strict: bool) -> Self {
        self.strict_locals = strict;
        self
    }

    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

/// Lower a translation unit to linked machine code
pub fn compile(unit: &TranslationUnit, options: &CompileOptions) -> Result<CompiledProgram> {
    x64::lower(unit, options)
}

/// Package compiled code in the format it was compiled for
pub fn build_image(program: &CompiledProgram) -> Result<Vec<u8>> {
    program
        .format
        .builder()
        .build(&program.code, program.entry_offset)
}

/// Compile and package in one step
pub fn compile_to_image(unit: &TranslationUnit, options: &CompileOptions) -> Result<Vec<u8>> {
    let program = compile(unit, options)?;
    build_image(&program)
}

/// Compile, package and write an executable to `path`.
///
/// Nothing is written unless every earlier stage succeeded.
pub fn compile_to_file(
    unit: &TranslationUnit,
    options: &CompileOptions,
    path: &Path,
) -> Result<CompiledProgram> {
    let program = compile(unit, options)?;
    let image = build_image(&program)?;
    x64::write_image(path, &image)?;
    Ok(program)
}
