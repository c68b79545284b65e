//! Guest-visible 68k state observed by the translator.
//!
//! The JIT does not own this state; it is the interface by which compiled
//! code and the interpreter communicate. Writes back to it happen at every
//! block boundary and at every fallback-to-interpreter call.

use bitflags::bitflags;

/// Number of guest integer registers (D0-D7, A0-A7).
pub const N_GUEST_REGS: usize = 16;
/// Number of guest FP registers.
pub const N_GUEST_FREGS: usize = 8;

/// Longest possible 68k instruction in bytes (opcode + extensions).
pub const LONGEST_68K_INST: u32 = 16;

/// Maximum number of recorded instructions per compiled block.
pub const MAXRUN: usize = 1024;

bitflags! {
    /// Guest condition-code bits, in liveness-mask order.
    ///
    /// The low five bits match the masks used by the opcode property tables
    /// (`use_flags` / `set_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagSet: u8 {
        const C = 1 << 0;
        const V = 1 << 1;
        const Z = 1 << 2;
        const N = 1 << 3;
        const X = 1 << 4;
        /// All of C/Z/N/V (everything except X).
        const CZNV = 0x0f;
        /// All five flags.
        const ALL = 0x1f;
    }
}

bitflags! {
    /// Pending-event bits ("special flags"). Compiled code only ever tests
    /// the word for zero; the interpreter owns the individual meanings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpcFlag: u32 {
        const STOP      = 1 << 0;
        const INT       = 1 << 1;
        const BRK       = 1 << 2;
        const TRACE     = 1 << 3;
        const DOTRACE   = 1 << 4;
        const DOINT     = 1 << 5;
    }
}

/// Condition-code register spill slots.
///
/// `cznv` packs C/V/Z/N in the 68k CCR layout (C=bit0, V=bit1, Z=bit2,
/// N=bit3) so that a plain load-and-test restores host flags identically.
/// X lives in its own word because most operations leave it alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegFlags {
    pub cznv: u32,
    pub x: u32,
}

impl RegFlags {
    /// Assemble the architectural CCR byte (XNZVC).
    pub fn ccr(&self) -> u8 {
        ((self.cznv & 0x0f) as u8) | if self.x != 0 { 0x10 } else { 0 }
    }

    pub fn set_ccr(&mut self, ccr: u8) {
        self.cznv = (ccr & 0x0f) as u32;
        self.x = ((ccr >> 4) & 1) as u32;
    }
}

/// The guest register file and execution context.
#[derive(Debug, Clone)]
pub struct Regs {
    /// D0-D7, A0-A7.
    pub regs: [u32; N_GUEST_REGS],
    /// FP0-FP7.
    pub fp: [f64; N_GUEST_FREGS],
    /// Result of the last FP operation (flag source for FPU compares).
    pub fp_result: f64,
    /// Guest program counter.
    pub pc_p: u32,
    /// Condition-code spill slots.
    pub flags: RegFlags,
    /// Pending-events word. Nonzero forces compiled code to exit.
    pub spcflags: SpcFlag,
    /// Remaining cycle budget for the current slice.
    pub countdown: i32,
}

impl Default for Regs {
    fn default() -> Self {
        Self {
            regs: [0; N_GUEST_REGS],
            fp: [0.0; N_GUEST_FREGS],
            fp_result: 0.0,
            pc_p: 0,
            flags: RegFlags::default(),
            spcflags: SpcFlag::empty(),
            countdown: 0,
        }
    }
}

/// One entry of the PC history recorded by the interpreter: the address of
/// an executed instruction plus the special-memory hints observed while
/// interpreting it.
#[derive(Debug, Clone, Copy)]
pub struct CpuHistoryEnt {
    pub pc: u32,
    pub specmem: u8,
}

/// Scale raw cycle totals the way the cycle counter expects.
///
/// The interpreter records cycles at its internal resolution; compiled
/// blocks charge the countdown in the same units, halved to account for the
/// amortized dispatch the block no longer pays.
#[inline]
pub fn scaled_cycles(totcycles: i32) -> i32 {
    totcycles / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ccr_round_trip() {
        let mut rf = RegFlags::default();
        for ccr in 0u8..0x20 {
            rf.set_ccr(ccr);
            assert_eq!(rf.ccr(), ccr, "CCR round-trip failed for {:#x}", ccr);
        }
    }

    #[test]
    fn test_cznv_packing_matches_flagset() {
        // The spill word and the liveness masks must agree on bit positions.
        let mut rf = RegFlags::default();
        rf.cznv = FlagSet::N.bits() as u32 | FlagSet::C.bits() as u32;
        assert_eq!(rf.ccr() & 0x08, 0x08); // N
        assert_eq!(rf.ccr() & 0x01, 0x01); // C
        assert_eq!(rf.ccr() & 0x04, 0x00); // Z clear
    }

    #[test]
    fn test_spcflags_zero_means_no_exit() {
        let r = Regs::default();
        assert!(r.spcflags.is_empty());
    }
}
