//! x86-64 instruction encoding
//!
//! Appends canonical byte sequences for a fixed instruction palette to a
//! [`CodeBuffer`]. Every emitter returns the offset of the instruction's first
//! byte. All patching is offset-addressed, so buffer growth never invalidates
//! a pending patch.
//!
//! ## Instruction Format
//!
//! ```text
//! [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```

use std::fmt;

use super::registers::{Cond, Reg64};

/// Growable machine-code buffer; the write cursor is always the end
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Current write offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite four bytes at `offset` with `value`, little-endian
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        assert!(
            offset + 4 <= self.code.len(),
            "patch at {:#x} runs past the end of the buffer",
            offset
        );
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrite one byte at `offset`
    pub fn patch_i8(&mut self, offset: usize, value: i8) {
        assert!(
            offset < self.code.len(),
            "patch at {:#x} runs past the end of the buffer",
            offset
        );
        self.code[offset] = value as u8;
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// REX prefix (`0100WRXB`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 64-bit operand size
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Extends ModR/M.reg
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Extends SIB.index
    pub fn x(mut self) -> Self {
        self.x = true;
        self
    }

    /// Extends ModR/M.rm or SIB.base
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// 64-bit prefix for a `reg`/`rm` operand pair
    fn wide(reg: Reg64, rm: Reg64) -> Self {
        let mut rex = Rex::new().w();
        if reg.needs_rex_ext() {
            rex = rex.r();
        }
        if rm.needs_rex_ext() {
            rex = rex.b();
        }
        rex
    }

    pub fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }
}

/// ModR/M byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRM {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl ModRM {
    pub fn new(mode: u8, reg: u8, rm: u8) -> Self {
        debug_assert!(mode <= 0b11);
        Self {
            mode,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Register-direct form (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self::new(0b11, reg, rm)
    }

    /// Register-direct form with an opcode extension in the reg field
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self::new(0b11, opext, rm)
    }

    pub fn encode(&self) -> u8 {
        (self.mode << 6) | (self.reg << 3) | self.rm
    }
}

/// SIB byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sib {
    scale: u8,
    index: u8,
    base: u8,
}

/// SIB.index value meaning "no index register"
const SIB_NO_INDEX: u8 = 0b100;

impl Sib {
    pub fn new(scale: u8, index: u8, base: u8) -> Self {
        debug_assert!(scale <= 0b11);
        Self {
            scale,
            index: index & 0x07,
            base: base & 0x07,
        }
    }

    /// `[base]` with no index, as needed for RSP/R12 bases
    pub fn base_only(base: Reg64) -> Self {
        Self::new(0, SIB_NO_INDEX, base.encoding())
    }

    pub fn encode(&self) -> u8 {
        (self.scale << 6) | (self.index << 3) | self.base
    }
}

/// Memory operand `[base + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mem {
    pub base: Reg64,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Reg64, disp: i32) -> Self {
        Self { base, disp }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disp {
            0 => write!(f, "[{}]", self.base),
            d if d < 0 => write!(f, "[{}-{:#x}]", self.base, -(d as i64)),
            d => write!(f, "[{}+{:#x}]", self.base, d),
        }
    }
}

// Operand-form helpers. Each emits a complete instruction and returns its start.
impl CodeBuffer {
    /// `REX.W op /r` with both operands in registers
    fn op_rr(&mut self, opcode: &[u8], reg: Reg64, rm: Reg64) -> usize {
        let start = self.offset();
        self.emit(Rex::wide(reg, rm).encode());
        self.emit_bytes(opcode);
        self.emit(ModRM::reg_reg(reg.encoding(), rm.encoding()).encode());
        start
    }

    /// `REX.W op /ext` on a register
    fn op_ext(&mut self, opcode: &[u8], ext: u8, rm: Reg64) -> usize {
        let start = self.offset();
        let mut rex = Rex::new().w();
        if rm.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit_bytes(opcode);
        self.emit(ModRM::reg_opext(ext, rm.encoding()).encode());
        start
    }

    /// `REX.W op /r` with a memory `rm` operand
    fn op_mem(&mut self, opcode: &[u8], reg: Reg64, mem: Mem) -> usize {
        let start = self.offset();
        self.emit(Rex::wide(reg, mem.base).encode());
        self.emit_bytes(opcode);
        self.emit_mem_operand(reg.encoding(), mem);
        start
    }

    /// ModR/M (+SIB) (+disp) for `[base + disp]`
    fn emit_mem_operand(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.encoding();
        // mod=00 with rm=101 means RIP-relative, so RBP/R13 always carry a disp8.
        let mode = if mem.disp == 0 && base != Reg64::RBP.encoding() {
            0b00
        } else if i8::try_from(mem.disp).is_ok() {
            0b01
        } else {
            0b10
        };
        self.emit(ModRM::new(mode, reg, base).encode());
        // rm=100 selects a SIB byte, so RSP/R12 bases need one.
        if base == Reg64::RSP.encoding() {
            self.emit(Sib::base_only(mem.base).encode());
        }
        match mode {
            0b01 => self.emit(mem.disp as i8 as u8),
            0b10 => self.emit_i32(mem.disp),
            _ => {}
        }
    }
}

/// Instruction palette
impl CodeBuffer {
    // ==================== Data Movement ====================

    /// MOV r64, imm64 (movabs)
    pub fn mov_r64_imm64(&mut self, dst: Reg64, imm: i64) -> usize {
        let start = self.offset();
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xB8 + dst.encoding());
        self.emit_u64(imm as u64);
        start
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_r64_imm32(&mut self, dst: Reg64, imm: i32) -> usize {
        let start = self.op_ext(&[0xC7], 0, dst);
        self.emit_i32(imm);
        start
    }

    /// Shortest MOV that loads `imm` into `dst`
    pub fn mov_r64_imm(&mut self, dst: Reg64, imm: i64) -> usize {
        match i32::try_from(imm) {
            Ok(small) => self.mov_r64_imm32(dst, small),
            Err(_) => self.mov_r64_imm64(dst, imm),
        }
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x89], src, dst)
    }

    /// MOV r64, [base + disp]
    pub fn mov_r64_mem(&mut self, dst: Reg64, src: Mem) -> usize {
        self.op_mem(&[0x8B], dst, src)
    }

    /// MOV [base + disp], r64
    pub fn mov_mem_r64(&mut self, dst: Mem, src: Reg64) -> usize {
        self.op_mem(&[0x89], src, dst)
    }

    /// MOVZX r64, r8
    pub fn movzx_r64_r8(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x0F, 0xB6], dst, src)
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x01], src, dst)
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: i32) -> usize {
        let start = self.op_ext(&[0x81], 0, dst);
        self.emit_i32(imm);
        start
    }

    /// SUB r64, r64
    pub fn sub_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x29], src, dst)
    }

    /// SUB r64, imm32 (sign-extended). Always the 4-byte immediate form, so
    /// the immediate can be patched later at `start + 3`.
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: i32) -> usize {
        let start = self.op_ext(&[0x81], 5, dst);
        self.emit_i32(imm);
        start
    }

    /// IMUL r64, r64 (dst = dst * src)
    pub fn imul_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x0F, 0xAF], dst, src)
    }

    /// CQO: sign-extend RAX into RDX:RAX
    pub fn cqo(&mut self) -> usize {
        let start = self.offset();
        self.emit_bytes(&[0x48, 0x99]);
        start
    }

    /// IDIV r64: RDX:RAX / divisor, quotient in RAX, remainder in RDX
    pub fn idiv_r64(&mut self, divisor: Reg64) -> usize {
        self.op_ext(&[0xF7], 7, divisor)
    }

    /// NEG r64
    pub fn neg_r64(&mut self, dst: Reg64) -> usize {
        self.op_ext(&[0xF7], 3, dst)
    }

    // ==================== Bitwise ====================

    /// AND r64, r64
    pub fn and_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x21], src, dst)
    }

    /// OR r64, r64
    pub fn or_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x09], src, dst)
    }

    /// XOR r64, r64
    pub fn xor_r64_r64(&mut self, dst: Reg64, src: Reg64) -> usize {
        self.op_rr(&[0x31], src, dst)
    }

    /// NOT r64
    pub fn not_r64(&mut self, dst: Reg64) -> usize {
        self.op_ext(&[0xF7], 2, dst)
    }

    /// SHL r64, CL
    pub fn shl_r64_cl(&mut self, dst: Reg64) -> usize {
        self.op_ext(&[0xD3], 4, dst)
    }

    /// SAR r64, CL
    pub fn sar_r64_cl(&mut self, dst: Reg64) -> usize {
        self.op_ext(&[0xD3], 7, dst)
    }

    // ==================== Comparison ====================

    /// CMP r64, r64 (flags from left - right)
    pub fn cmp_r64_r64(&mut self, left: Reg64, right: Reg64) -> usize {
        self.op_rr(&[0x39], right, left)
    }

    /// TEST r64, r64
    pub fn test_r64_r64(&mut self, left: Reg64, right: Reg64) -> usize {
        self.op_rr(&[0x85], right, left)
    }

    /// SETcc r8 on the low byte of `dst`
    pub fn setcc(&mut self, cond: Cond, dst: Reg64) -> usize {
        let start = self.offset();
        let mut rex = Rex::new();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        if rex.is_needed() || dst.byte_form_needs_rex() {
            self.emit(rex.encode());
        }
        self.emit_bytes(&[0x0F, 0x90 | cond.code()]);
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        start
    }

    // ==================== Stack ====================

    /// PUSH r64
    pub fn push_r64(&mut self, reg: Reg64) -> usize {
        let start = self.offset();
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x50 + reg.encoding());
        start
    }

    /// POP r64
    pub fn pop_r64(&mut self, reg: Reg64) -> usize {
        let start = self.offset();
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x58 + reg.encoding());
        start
    }

    // ==================== Control Flow ====================
    //
    // The displacement field is always the last part of the instruction, so
    // it sits at `offset() - width` right after emission.

    /// JMP rel32
    pub fn jmp_rel32(&mut self, disp: i32) -> usize {
        let start = self.offset();
        self.emit(0xE9);
        self.emit_i32(disp);
        start
    }

    /// JMP rel8
    pub fn jmp_rel8(&mut self, disp: i8) -> usize {
        let start = self.offset();
        self.emit_bytes(&[0xEB, disp as u8]);
        start
    }

    /// Jcc rel32
    pub fn jcc_rel32(&mut self, cond: Cond, disp: i32) -> usize {
        let start = self.offset();
        self.emit_bytes(&[0x0F, 0x80 | cond.code()]);
        self.emit_i32(disp);
        start
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cond: Cond, disp: i8) -> usize {
        let start = self.offset();
        self.emit_bytes(&[0x70 | cond.code(), disp as u8]);
        start
    }

    /// CALL rel32
    pub fn call_rel32(&mut self, disp: i32) -> usize {
        let start = self.offset();
        self.emit(0xE8);
        self.emit_i32(disp);
        start
    }

    /// RET
    pub fn ret(&mut self) -> usize {
        let start = self.offset();
        self.emit(0xC3);
        start
    }

    // ==================== System ====================

    /// SYSCALL
    pub fn syscall(&mut self) -> usize {
        let start = self.offset();
        self.emit_bytes(&[0x0F, 0x05]);
        start
    }
}
