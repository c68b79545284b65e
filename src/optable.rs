//! Per-opcode properties and the interpreter-fallback interface.
//!
//! The full 68k decode table is precomputed by the enclosing emulator; the
//! translator only needs each opcode's flag-liveness masks and control-flow
//! class, plus an interpreter entry to fall back on. The compiled subset's
//! own properties are registered by `comp::ops::register_props`.

use crate::cpu::{FlagSet, Regs};
use crate::memory::{MemBus, SpecialMem};

/// Control-flow relevant properties of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpProps {
    /// Flags the instruction reads.
    pub use_flags: FlagSet,
    /// Flags the instruction (re)defines.
    pub set_flags: FlagSet,
    /// Add/sub-with-extend family: Z is preserved-if-nonzero, so a dead Z
    /// after the instruction is dead before it.
    pub is_addx: bool,
    /// Ends a block (branch, jump, return, trap...).
    pub is_jump: bool,
    /// Unconditional constant-target jump; evaluates no condition codes.
    pub is_const_jump: bool,
}

impl OpProps {
    /// The conservative default: reads everything, defines nothing, ends
    /// the block. Safe for any opcode the table knows nothing about.
    pub const fn unknown() -> Self {
        Self {
            use_flags: FlagSet::ALL,
            set_flags: FlagSet::empty(),
            is_addx: false,
            is_jump: true,
            is_const_jump: false,
        }
    }
}

/// 64K-entry property table, `table68k` distilled to what the translator
/// consumes.
pub struct OpTable {
    props: Vec<OpProps>,
}

impl OpTable {
    pub fn new() -> Self {
        Self { props: vec![OpProps::unknown(); 0x10000] }
    }

    #[inline]
    pub fn props(&self, opcode: u16) -> &OpProps {
        &self.props[opcode as usize]
    }

    pub fn set(&mut self, opcode: u16, props: OpProps) {
        self.props[opcode as usize] = props;
    }

    /// Whether `opcode` terminates straight-line recording.
    pub fn end_block(&self, opcode: u16) -> bool {
        self.props(opcode).is_jump
    }
}

impl Default for OpTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The guest CPU interpreter the translator falls back on, one opcode at a
/// time. Implementations execute the instruction at `regs.pc_p` (advancing
/// it) and return the cycles consumed.
pub trait Fallback {
    fn op(&mut self, opcode: u16, regs: &mut Regs, bus: &mut dyn MemBus) -> u32;

    /// Special-memory hints observed while interpreting the last opcode.
    fn specmem(&self) -> SpecialMem {
        SpecialMem::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_props_are_conservative() {
        let t = OpTable::new();
        let p = t.props(0x4AFC); // ILLEGAL
        assert_eq!(p.use_flags, FlagSet::ALL);
        assert!(p.set_flags.is_empty());
        assert!(p.is_jump);
    }

    #[test]
    fn test_set_and_end_block() {
        let mut t = OpTable::new();
        t.set(
            0x4E71,
            OpProps {
                use_flags: FlagSet::empty(),
                set_flags: FlagSet::empty(),
                is_addx: false,
                is_jump: false,
                is_const_jump: false,
            },
        );
        assert!(!t.end_block(0x4E71));
        assert!(t.end_block(0x4E75));
    }
}
