//! Labels, relocation sites and the assembler that ties them to a CodeBuffer
//!
//! Branches and calls name their target by label. A reference to a label that
//! is already bound is patched on the spot; anything else is queued as a
//! [`RelocationSite`] and patched by [`Assembler::resolve_all`].

use std::collections::HashMap;

use log::trace;

use super::encoding::CodeBuffer;
use super::registers::Cond;
use crate::error::{CodegenError, Result};

/// Width of a relative displacement field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelWidth {
    Rel8,
    Rel32,
}

impl RelWidth {
    pub fn bytes(self) -> usize {
        match self {
            RelWidth::Rel8 => 1,
            RelWidth::Rel32 => 4,
        }
    }
}

/// A named code position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    offset: Option<usize>,
}

impl Label {
    pub fn is_defined(&self) -> bool {
        self.offset.is_some()
    }

    pub fn offset(&self) -> Option<usize> {
        self.offset
    }
}

/// Label name to offset bindings. A name binds at most once.
#[derive(Debug, Default)]
pub struct SymbolTable {
    labels: HashMap<String, Label>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, offset: usize) -> Result<()> {
        if self.labels.get(name).is_some_and(Label::is_defined) {
            return Err(CodegenError::DuplicateLabel {
                name: name.to_string(),
            });
        }
        self.labels.insert(
            name.to_string(),
            Label {
                name: name.to_string(),
                offset: Some(offset),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Label> {
        self.labels.get(name)
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.labels.get(name).and_then(Label::offset)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A displacement field waiting for its label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationSite {
    /// Offset of the displacement field itself
    pub patch_offset: usize,
    pub target: String,
    pub width: RelWidth,
}

impl RelocationSite {
    /// Displacement from the end of the field (which is the end of the
    /// instruction) to `target_offset`.
    pub fn displacement(&self, target_offset: usize) -> i64 {
        target_offset as i64 - (self.patch_offset + self.width.bytes()) as i64
    }
}

#[derive(Debug, Default)]
pub struct RelocationList {
    sites: Vec<RelocationSite>,
}

impl RelocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, site: RelocationSite) {
        self.sites.push(site);
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    fn take(&mut self) -> Vec<RelocationSite> {
        std::mem::take(&mut self.sites)
    }
}

/// Code buffer plus its deferred-linking state for one compilation unit
#[derive(Debug, Default)]
pub struct Assembler {
    pub code: CodeBuffer,
    labels: SymbolTable,
    relocations: RelocationList,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.code.offset()
    }

    pub fn labels(&self) -> &SymbolTable {
        &self.labels
    }

    pub fn relocations(&self) -> &RelocationList {
        &self.relocations
    }

    /// Bind `name` to the current offset
    pub fn define_label(&mut self, name: &str) -> Result<usize> {
        let offset = self.code.offset();
        self.labels.define(name, offset)?;
        trace!("label {} = {:#x}", name, offset);
        Ok(offset)
    }

    /// Fill the displacement at `patch_offset` with the distance to `name`,
    /// now if the label is bound, otherwise once it is.
    pub fn reference_label(&mut self, name: &str, patch_offset: usize, width: RelWidth) -> Result<()> {
        let site = RelocationSite {
            patch_offset,
            target: name.to_string(),
            width,
        };
        match self.labels.offset_of(name) {
            Some(target) => self.patch(&site, target),
            None => {
                self.relocations.push(site);
                Ok(())
            }
        }
    }

    /// Patch every queued site. Any label still unbound is fatal.
    pub fn resolve_all(&mut self) -> Result<()> {
        for site in self.relocations.take() {
            let target = self
                .labels
                .offset_of(&site.target)
                .ok_or_else(|| CodegenError::UnresolvedLabel {
                    name: site.target.clone(),
                    patch_offset: site.patch_offset,
                })?;
            self.patch(&site, target)?;
        }
        Ok(())
    }

    fn patch(&mut self, site: &RelocationSite, target: usize) -> Result<()> {
        let disp = site.displacement(target);
        match site.width {
            RelWidth::Rel32 => {
                let disp = i32::try_from(disp).map_err(|_| CodegenError::Encoding {
                    message: format!("branch to '{}' out of rel32 range ({})", site.target, disp),
                })?;
                self.code.patch_i32(site.patch_offset, disp);
            }
            RelWidth::Rel8 => {
                let disp = i8::try_from(disp).map_err(|_| CodegenError::Encoding {
                    message: format!("branch to '{}' out of rel8 range ({})", site.target, disp),
                })?;
                self.code.patch_i8(site.patch_offset, disp);
            }
        }
        trace!(
            "patched {:?} at {:#x} -> {} ({:+})",
            site.width,
            site.patch_offset,
            site.target,
            disp
        );
        Ok(())
    }

    fn branch_site(&mut self, target: &str, width: RelWidth) -> Result<()> {
        let patch_offset = self.code.offset() - width.bytes();
        self.reference_label(target, patch_offset, width)
    }

    /// `jmp target` (rel32)
    pub fn jmp(&mut self, target: &str) -> Result<usize> {
        let start = self.code.jmp_rel32(0);
        self.branch_site(target, RelWidth::Rel32)?;
        Ok(start)
    }

    /// `jcc target` (rel32)
    pub fn jcc(&mut self, cond: Cond, target: &str) -> Result<usize> {
        let start = self.code.jcc_rel32(cond, 0);
        self.branch_site(target, RelWidth::Rel32)?;
        Ok(start)
    }

    /// `call target` (rel32)
    pub fn call(&mut self, target: &str) -> Result<usize> {
        let start = self.code.call_rel32(0);
        self.branch_site(target, RelWidth::Rel32)?;
        Ok(start)
    }

    /// `jmp short target`; fails at patch time if the target is out of reach
    pub fn jmp_short(&mut self, target: &str) -> Result<usize> {
        let start = self.code.jmp_rel8(0);
        self.branch_site(target, RelWidth::Rel8)?;
        Ok(start)
    }

    /// `jcc short target`
    pub fn jcc_short(&mut self, cond: Cond, target: &str) -> Result<usize> {
        let start = self.code.jcc_rel8(cond, 0);
        self.branch_site(target, RelWidth::Rel8)?;
        Ok(start)
    }

    /// Resolve everything and hand over the finished bytes
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.resolve_all()?;
        Ok(self.code.into_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::registers::Reg64;

    #[test]
    fn test_forward_jump_is_patched_on_resolve() {
        let mut asm = Assembler::new();
        asm.jmp(".Lend").unwrap();
        asm.code.ret();
        asm.define_label(".Lend").unwrap();
        assert_eq!(asm.relocations().len(), 1);
        asm.resolve_all().unwrap();
        // jmp is 5 bytes, ret is 1: skip exactly the ret
        assert_eq!(asm.code.code(), &[0xE9, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        assert!(asm.relocations().is_empty());
    }

    #[test]
    fn test_backward_jump_is_patched_immediately() {
        let mut asm = Assembler::new();
        asm.define_label(".Ltop").unwrap();
        asm.code.push_r64(Reg64::RAX);
        asm.jmp(".Ltop").unwrap();
        assert!(asm.relocations().is_empty());
        // target 0, end of jmp at 6
        assert_eq!(asm.code.read_i32(2), -6);
    }

    #[test]
    fn test_conditional_and_call_displacements() {
        let mut asm = Assembler::new();
        asm.jcc(Cond::Equal, "f").unwrap();
        asm.call("f").unwrap();
        asm.define_label("f").unwrap();
        asm.code.ret();
        let code = asm.finish().unwrap();
        // jz at 0..6 -> f at 11: disp 5; call at 6..11 -> disp 0
        assert_eq!(&code[..6], &[0x0F, 0x84, 0x05, 0x00, 0x00, 0x00]);
        assert_eq!(&code[6..11], &[0xE8, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_duplicate_label() {
        let mut asm = Assembler::new();
        asm.define_label("main").unwrap();
        let err = asm.define_label("main").unwrap_err();
        assert!(matches!(err, CodegenError::DuplicateLabel { ref name } if name == "main"));
    }

    #[test]
    fn test_unresolved_label_is_fatal() {
        let mut asm = Assembler::new();
        asm.code.jmp_rel32(0);
        asm.reference_label(".Lnowhere", 1, RelWidth::Rel32).unwrap();
        let err = asm.resolve_all().unwrap_err();
        assert!(matches!(
            err,
            CodegenError::UnresolvedLabel { ref name, patch_offset: 1 } if name == ".Lnowhere"
        ));
        // the placeholder was not silently turned into a real jump
        assert_eq!(asm.code.read_i32(1), 0);
    }

    #[test]
    fn test_short_branches() {
        let mut asm = Assembler::new();
        asm.jcc_short(Cond::NotEqual, ".Lskip").unwrap();
        asm.code.ret();
        asm.define_label(".Lskip").unwrap();
        asm.jmp_short(".Lskip").unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(code, [0x75, 0x01, 0xC3, 0xEB, 0xFE]);
    }

    #[test]
    fn test_short_branch_out_of_range() {
        let mut asm = Assembler::new();
        asm.jmp_short(".Lfar").unwrap();
        for _ in 0..200 {
            asm.code.emit(0x90);
        }
        asm.define_label(".Lfar").unwrap();
        assert!(matches!(asm.resolve_all(), Err(CodegenError::Encoding { .. })));
    }

    #[test]
    fn test_symbol_table_lookup() {
        let mut table = SymbolTable::new();
        assert!(table.is_empty());
        table.define("a", 4).unwrap();
        assert_eq!(table.offset_of("a"), Some(4));
        assert!(table.get("a").is_some_and(Label::is_defined));
        assert_eq!(table.offset_of("b"), None);
        assert_eq!(table.len(), 1);
    }
}
