//! Per-function stack frames
//!
//! Locals live at negative offsets from RBP. The prologue reserves space with
//! a `sub rsp, imm32` whose immediate is patched once the body is lowered and
//! the footprint is known.

use std::collections::HashMap;

use log::debug;

use super::encoding::{CodeBuffer, Mem};
use super::registers::{FRAME_BASE, STACK_POINTER};
use crate::error::{CodegenError, Result};

/// Stack alignment at call boundaries
pub const STACK_ALIGN: u32 = 16;

/// Size of every scalar slot
pub const SLOT_SIZE: u32 = 8;

/// Default cap on a single function's locals
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 20;

/// Offset of the imm32 inside `REX.W 81 /5 id`
const SUB_RSP_IMM_OFFSET: usize = 3;

/// A local variable's home in the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    pub name: String,
    /// Offset from the frame base (always negative)
    pub frame_offset: i32,
    pub size: u32,
}

impl LocalSlot {
    pub fn mem(&self) -> Mem {
        Mem::new(FRAME_BASE, self.frame_offset)
    }
}

#[derive(Debug)]
pub struct FrameBuilder {
    max_frame_size: u32,
    function: String,
    slots: Vec<LocalSlot>,
    /// Innermost scope last; each maps a name to an index into `slots`
    scopes: Vec<HashMap<String, usize>>,
    used: u32,
    size_patch: Option<usize>,
}

impl FrameBuilder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size,
            function: String::new(),
            slots: Vec::new(),
            scopes: Vec::new(),
            used: 0,
            size_patch: None,
        }
    }

    /// Emit the prologue for `function` and start a fresh slot table.
    ///
    /// ```text
    /// push rbp
    /// mov  rbp, rsp
    /// sub  rsp, <patched by finish>
    /// ```
    pub fn enter_function(&mut self, function: &str, code: &mut CodeBuffer) -> usize {
        self.function = function.to_string();
        self.slots.clear();
        self.scopes.clear();
        self.scopes.push(HashMap::new());
        self.used = 0;

        let start = code.push_r64(FRAME_BASE);
        code.mov_r64_r64(FRAME_BASE, STACK_POINTER);
        let sub = code.sub_r64_imm32(STACK_POINTER, 0);
        self.size_patch = Some(sub + SUB_RSP_IMM_OFFSET);
        start
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        // The function scope stays until the next enter_function.
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Allocate a fresh slot in the innermost scope. Slots are never reused,
    /// so a redeclaration shadows rather than aliases.
    pub fn allocate_slot(&mut self, name: &str, size: u32) -> Result<&LocalSlot> {
        let depth = self.scopes.len().saturating_sub(1);
        self.allocate_in(depth, name, size)
    }

    /// Allocate in the function's outermost scope
    pub fn allocate_function_slot(&mut self, name: &str, size: u32) -> Result<&LocalSlot> {
        self.allocate_in(0, name, size)
    }

    fn allocate_in(&mut self, depth: usize, name: &str, size: u32) -> Result<&LocalSlot> {
        let size = size.max(1).next_multiple_of(SLOT_SIZE);
        let used = u64::from(self.used) + u64::from(size);
        if used > u64::from(self.max_frame_size) || used > i32::MAX as u64 {
            return Err(CodegenError::FrameOverflow {
                function: self.function.clone(),
                size: used,
                limit: self.max_frame_size,
            });
        }
        self.used = used as u32;

        let index = self.slots.len();
        self.slots.push(LocalSlot {
            name: name.to_string(),
            frame_offset: -(self.used as i32),
            size,
        });
        if self.scopes.is_empty() {
            self.scopes.push(HashMap::new());
        }
        let depth = depth.min(self.scopes.len() - 1);
        self.scopes[depth].insert(name.to_string(), index);
        Ok(&self.slots[index])
    }

    /// Innermost visible slot named `name`
    pub fn lookup(&self, name: &str) -> Option<&LocalSlot> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .map(|&index| &self.slots[index])
    }

    pub fn slots(&self) -> &[LocalSlot] {
        &self.slots
    }

    /// Locals footprint rounded up to the stack alignment
    pub fn stack_size(&self) -> u32 {
        self.used.next_multiple_of(STACK_ALIGN)
    }

    /// Patch the prologue's reservation with the final footprint
    pub fn finish(&mut self, code: &mut CodeBuffer) -> Result<u32> {
        let size = self.stack_size();
        let imm = i32::try_from(size).map_err(|_| CodegenError::FrameOverflow {
            function: self.function.clone(),
            size: u64::from(size),
            limit: self.max_frame_size,
        })?;
        let patch = self.size_patch.take().ok_or_else(|| CodegenError::Encoding {
            message: format!("frame for '{}' finished without a prologue", self.function),
        })?;
        code.patch_i32(patch, imm);
        debug!(
            "frame {}: {} slot(s), {} bytes reserved",
            self.function,
            self.slots.len(),
            size
        );
        Ok(size)
    }

    /// Emit the epilogue. Every return site gets its own copy.
    ///
    /// ```text
    /// mov rsp, rbp
    /// pop rbp
    /// ret
    /// ```
    pub fn exit_function(code: &mut CodeBuffer) -> usize {
        let start = code.mov_r64_r64(STACK_POINTER, FRAME_BASE);
        code.pop_r64(FRAME_BASE);
        code.ret();
        start
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_bytes() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        assert_eq!(
            code.code(),
            &[0x55, 0x48, 0x89, 0xE5, 0x48, 0x81, 0xEC, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_epilogue_bytes() {
        let mut code = CodeBuffer::new();
        FrameBuilder::exit_function(&mut code);
        assert_eq!(code.code(), &[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }

    #[test]
    fn test_slots_are_monotonic_and_patched_aligned() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        assert_eq!(frame.allocate_slot("a", 8).unwrap().frame_offset, -8);
        assert_eq!(frame.allocate_slot("b", 8).unwrap().frame_offset, -16);
        assert_eq!(frame.allocate_slot("c", 4).unwrap().frame_offset, -24);
        assert_eq!(frame.finish(&mut code).unwrap(), 32);
        assert_eq!(code.read_i32(7), 32);
    }

    #[test]
    fn test_empty_frame_reserves_nothing() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        assert_eq!(frame.finish(&mut code).unwrap(), 0);
    }

    #[test]
    fn test_inner_scope_shadows_without_reuse() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        frame.allocate_slot("x", 8).unwrap();
        frame.push_scope();
        frame.allocate_slot("x", 8).unwrap();
        assert_eq!(frame.lookup("x").unwrap().frame_offset, -16);
        frame.pop_scope();
        assert_eq!(frame.lookup("x").unwrap().frame_offset, -8);

        // a sibling scope gets a new slot, never -16 again
        frame.push_scope();
        frame.allocate_slot("x", 8).unwrap();
        assert_eq!(frame.lookup("x").unwrap().frame_offset, -24);
        frame.pop_scope();
        assert_eq!(frame.slots().len(), 3);
    }

    #[test]
    fn test_function_slot_outlives_inner_scope() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        frame.push_scope();
        frame.allocate_function_slot("y", 8).unwrap();
        frame.pop_scope();
        assert!(frame.lookup("y").is_some());
    }

    #[test]
    fn test_frame_overflow() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::new(16);
        frame.enter_function("big", &mut code);
        frame.allocate_slot("a", 8).unwrap();
        frame.allocate_slot("b", 8).unwrap();
        let err = frame.allocate_slot("c", 8).unwrap_err();
        assert!(matches!(
            err,
            CodegenError::FrameOverflow { ref function, size: 24, limit: 16 } if function == "big"
        ));
    }

    #[test]
    fn test_enter_resets_previous_function() {
        let mut code = CodeBuffer::new();
        let mut frame = FrameBuilder::default();
        frame.enter_function("f", &mut code);
        frame.allocate_slot("a", 8).unwrap();
        frame.finish(&mut code).unwrap();
        frame.enter_function("g", &mut code);
        assert!(frame.lookup("a").is_none());
        assert_eq!(frame.allocate_slot("b", 8).unwrap().frame_offset, -8);
    }
}
