//! x86-64 register and condition-code definitions
//!
//! The sixteen general-purpose registers in hardware encoding order, plus the
//! condition codes used by `setcc` and `jcc`.

use std::fmt;

/// 64-bit general-purpose register, numbered as the hardware encodes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// Low three bits, as they go into ModR/M and SIB fields
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// True for R8..R15, which need a REX extension bit
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// SPL/BPL/SIL/DIL are only addressable as byte registers with a REX
    /// prefix present; without one the same encodings select AH..BH.
    #[inline]
    pub fn byte_form_needs_rex(self) -> bool {
        (4..8).contains(&(self as u8))
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{}", name)
    }
}

/// Condition code for `setcc`/`jcc`; the discriminant is the low opcode nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    /// ZF=1 (`je`/`jz`)
    Equal = 0x4,
    /// ZF=0 (`jne`/`jnz`)
    NotEqual = 0x5,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl Cond {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            Cond::Equal => "e",
            Cond::NotEqual => "ne",
            Cond::Less => "l",
            Cond::GreaterEqual => "ge",
            Cond::LessEqual => "le",
            Cond::Greater => "g",
        };
        write!(f, "{}", suffix)
    }
}

/// System V AMD64 integer argument registers, in order
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// Every expression leaves its value here
pub const ACCUMULATOR: Reg64 = Reg64::RAX;

/// Left operand of a binary operator after it is popped
pub const SCRATCH: Reg64 = Reg64::RCX;

/// Extra scratch register for operators that need RCX or RDX for themselves
pub const AUX: Reg64 = Reg64::R8;

pub const FRAME_BASE: Reg64 = Reg64::RBP;
pub const STACK_POINTER: Reg64 = Reg64::RSP;
