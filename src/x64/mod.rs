//! x86-64 backend
//!
//! Direct machine code generation, no assembler or linker involved.
//!
//! ## Architecture
//!
//! ```text
//! TranslationUnit → LoweringContext → CompiledProgram → ELF64/PE32+ → Native Executable
//! ```
//!
//! ## Modules
//!
//! - `registers`: register and condition-code definitions
//! - `encoding`: instruction encoding (REX, ModR/M, SIB) into a [`CodeBuffer`]
//! - `labels`: symbol table, pending relocations and their resolution
//! - `frame`: RBP-based stack frames and local slots
//! - `codegen`: AST to machine code lowering
//! - `image`: format selection and atomic image writes
//! - `elf`: ELF64 executables (Linux)
//! - `pe`: PE32+ executables (Windows)

pub mod codegen;
pub mod elf;
pub mod encoding;
pub mod frame;
pub mod image;
pub mod labels;
pub mod pe;
pub mod registers;

pub use codegen::{lower, CompiledProgram, FunctionRecord, LoweringContext};
pub use elf::Elf64Builder;
pub use encoding::{CodeBuffer, Mem};
pub use frame::{FrameBuilder, LocalSlot};
pub use image::{write_image, ExecutableImageBuilder, ImageFormat};
pub use labels::{Assembler, RelWidth, RelocationList, RelocationSite, SymbolTable};
pub use pe::Pe64Builder;
pub use registers::{Cond, Reg64};
