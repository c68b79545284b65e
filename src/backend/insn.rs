//! The portable host instruction encoding.
//!
//! The translator core is written against an abstract instruction-emitter
//! capability; this module is its concrete realization: a little-endian
//! 32-bit host with eight integer registers, eight FP registers and N/Z/V/C
//! condition flags, whose instructions are `[tag][operands...]` byte
//! sequences in the code buffer.
//!
//! Guest state is addressed through symbolic slots ([`GuestLoc`]), block
//! metadata through arena ids, and other code through absolute buffer
//! offsets, so emitted code stays position-independent with respect to the
//! host process while remaining real, checksummable, patchable bytes.

/// Number of host integer registers.
pub const N_REGS: usize = 8;
/// Number of host FP registers.
pub const N_FREGS: usize = 8;

/// Host registers usable at byte width.
pub const CAN_BYTE: &[usize] = &[0, 1, 2, 3];
/// Host registers usable at word width (excludes the stack register).
pub const CAN_WORD: &[usize] = &[0, 1, 2, 3, 5, 6, 7];
/// Host registers permanently reserved (the stack register).
pub const ALWAYS_USED: &[usize] = &[4];
/// Host registers preserved across calls into the runtime.
pub const CALL_SAVED: [bool; N_REGS] = [false, false, false, false, true, false, true, true];

/// Fixed host register used to stage the PC for table dispatch.
pub const REG_PC_TMP: usize = 0;
/// Fixed host registers used by the flag spill/reload sequences.
pub const FLAG_NREG1: isize = 0;
pub const FLAG_NREG2: isize = 0;

/// A guest-state slot addressable from emitted code.
///
/// Encoded as a single byte; the executor maps each slot onto the live
/// `Regs` (or its own scratch array for compiler temporaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLoc {
    /// D0-D7 / A0-A7.
    Reg(u8),
    /// Guest program counter.
    PcP,
    /// The C/V/Z/N spill word.
    FlagCznv,
    /// The X-flag carrier word.
    FlagX,
    /// Pending-events word.
    SpcFlags,
    /// Cycle countdown.
    Countdown,
    /// Compiler scratch slot (eviction home for scratch VREGs).
    Scratch(u8),
    /// FP0-FP7.
    FpReg(u8),
    /// FPU result slot.
    FpResult,
    /// FP compiler scratch slot.
    FpScratch(u8),
}

impl GuestLoc {
    pub fn encode(self) -> u8 {
        match self {
            GuestLoc::Reg(n) => n,
            GuestLoc::PcP => 0x10,
            GuestLoc::FlagCznv => 0x11,
            GuestLoc::FlagX => 0x12,
            GuestLoc::SpcFlags => 0x13,
            GuestLoc::Countdown => 0x14,
            GuestLoc::Scratch(n) => 0x20 + n,
            GuestLoc::FpReg(n) => 0x40 + n,
            GuestLoc::FpResult => 0x4e,
            GuestLoc::FpScratch(n) => 0x50 + n,
        }
    }

    pub fn decode(b: u8) -> GuestLoc {
        match b {
            0x00..=0x0f => GuestLoc::Reg(b),
            0x10 => GuestLoc::PcP,
            0x11 => GuestLoc::FlagCznv,
            0x12 => GuestLoc::FlagX,
            0x13 => GuestLoc::SpcFlags,
            0x14 => GuestLoc::Countdown,
            0x20..=0x3f => GuestLoc::Scratch(b - 0x20),
            0x40..=0x47 => GuestLoc::FpReg(b - 0x40),
            0x4e => GuestLoc::FpResult,
            0x50..=0x5f => GuestLoc::FpScratch(b - 0x50),
            _ => panic!("bad GuestLoc encoding {:#04x}", b),
        }
    }
}

/// The 68k condition encodings, evaluated over host N/Z/V/C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    T = 0,
    F = 1,
    Hi = 2,
    Ls = 3,
    Cc = 4,
    Cs = 5,
    Ne = 6,
    Eq = 7,
    Vc = 8,
    Vs = 9,
    Pl = 10,
    Mi = 11,
    Ge = 12,
    Lt = 13,
    Gt = 14,
    Le = 15,
}

impl Cond {
    pub fn from_code(c: u8) -> Cond {
        assert!(c < 16, "bad condition code {}", c);
        match c {
            0 => Cond::T,
            1 => Cond::F,
            2 => Cond::Hi,
            3 => Cond::Ls,
            4 => Cond::Cc,
            5 => Cond::Cs,
            6 => Cond::Ne,
            7 => Cond::Eq,
            8 => Cond::Vc,
            9 => Cond::Vs,
            10 => Cond::Pl,
            11 => Cond::Mi,
            12 => Cond::Ge,
            13 => Cond::Lt,
            14 => Cond::Gt,
            _ => Cond::Le,
        }
    }

    /// The negated condition (68k cc ^ 1).
    pub fn negate(self) -> Cond {
        Cond::from_code(self as u8 ^ 1)
    }
}

/// Host ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Sub = 1,
    And = 2,
    Or = 3,
    Xor = 4,
    /// Compare: flags of `d - s`, no writeback.
    Cmp = 5,
    /// Test: flags of `d & s`, no writeback.
    Tst = 6,
}

impl AluOp {
    pub fn from_code(c: u8) -> AluOp {
        match c {
            0 => AluOp::Add,
            1 => AluOp::Sub,
            2 => AluOp::And,
            3 => AluOp::Or,
            4 => AluOp::Xor,
            5 => AluOp::Cmp,
            6 => AluOp::Tst,
            _ => panic!("bad ALU op {}", c),
        }
    }
}

/// Host shift operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 0,
    Shr = 1,
    Sar = 2,
}

impl ShiftOp {
    pub fn from_code(c: u8) -> ShiftOp {
        match c {
            0 => ShiftOp::Shl,
            1 => ShiftOp::Shr,
            2 => ShiftOp::Sar,
            _ => panic!("bad shift op {}", c),
        }
    }
}

/// Exit reasons delivered by the `Exit` instruction. Each builtin stub is an
/// emitted code sequence ending in one of these; the dispatcher acts on the
/// reason, the portable equivalent of the pop-registers-and-jump shims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    DoNothing = 0,
    ExecuteNormal = 1,
    ExecNostats = 2,
    CacheMiss = 3,
    RecompileBlock = 4,
    CheckChecksum = 5,
}

impl ExitReason {
    pub fn from_code(c: u8) -> ExitReason {
        match c {
            0 => ExitReason::DoNothing,
            1 => ExitReason::ExecuteNormal,
            2 => ExitReason::ExecNostats,
            3 => ExitReason::CacheMiss,
            4 => ExitReason::RecompileBlock,
            5 => ExitReason::CheckChecksum,
            _ => panic!("bad exit reason {}", c),
        }
    }
}

// Instruction tags. One byte each; operand layout is fixed per tag.
pub const OP_NOP: u8 = 0x00;
pub const OP_EXIT: u8 = 0x01;
pub const OP_MOV_RR: u8 = 0x02;
pub const OP_MOV_RI: u8 = 0x03;
pub const OP_LOAD_SLOT: u8 = 0x04;
pub const OP_STORE_SLOT: u8 = 0x05;
pub const OP_STORE_SLOT_I: u8 = 0x06;
pub const OP_ADD_SLOT_I: u8 = 0x07;
pub const OP_SUB_SLOT_I: u8 = 0x08;
pub const OP_CMP_SLOT_I: u8 = 0x09;
pub const OP_SUB_COUNT: u8 = 0x0a;
pub const OP_LOAD_BLK_PC: u8 = 0x0b;
pub const OP_LEA: u8 = 0x0c;
pub const OP_LEA_IDX: u8 = 0x0d;
pub const OP_BSWAP: u8 = 0x0e;
pub const OP_BSWAP16: u8 = 0x0f;
pub const OP_ZEXT8: u8 = 0x10;
pub const OP_ZEXT16: u8 = 0x11;
pub const OP_SEXT8: u8 = 0x12;
pub const OP_SEXT16: u8 = 0x13;
pub const OP_ALU_RR: u8 = 0x14;
pub const OP_ALU_RI: u8 = 0x15;
pub const OP_SHIFT_RI: u8 = 0x16;
pub const OP_SETCC: u8 = 0x17;
pub const OP_LOAD_DIRECT: u8 = 0x18;
pub const OP_STORE_DIRECT: u8 = 0x19;
pub const OP_BANK_READ: u8 = 0x1a;
pub const OP_BANK_WRITE: u8 = 0x1b;
pub const OP_FLAGS_TO_REG: u8 = 0x1c;
pub const OP_REG_TO_FLAGS: u8 = 0x1d;
pub const OP_JCC: u8 = 0x1e;
pub const OP_JMP: u8 = 0x1f;
pub const OP_JMP_TAGS: u8 = 0x20;
pub const OP_CALL_INTERP: u8 = 0x21;
pub const OP_FLOAD_SLOT: u8 = 0x22;
pub const OP_FSTORE_SLOT: u8 = 0x23;
pub const OP_FSTORE_SLOT_DROP: u8 = 0x24;
pub const OP_FMOV_RR: u8 = 0x25;

/// Total encoded length (tag + operands) for the instruction whose tag byte
/// is `tag`.
pub fn insn_len(tag: u8) -> usize {
    match tag {
        OP_NOP => 1,
        OP_EXIT => 2,
        OP_MOV_RR => 4,
        OP_MOV_RI => 6,
        OP_LOAD_SLOT => 3,
        OP_STORE_SLOT => 4,
        OP_STORE_SLOT_I => 6,
        OP_ADD_SLOT_I => 6,
        OP_SUB_SLOT_I => 6,
        OP_CMP_SLOT_I => 6,
        OP_SUB_COUNT => 5,
        OP_LOAD_BLK_PC => 6,
        OP_LEA => 7,
        OP_LEA_IDX => 9,
        OP_BSWAP => 2,
        OP_BSWAP16 => 2,
        OP_ZEXT8 | OP_ZEXT16 | OP_SEXT8 | OP_SEXT16 => 3,
        OP_ALU_RR => 5,
        OP_ALU_RI => 8,
        OP_SHIFT_RI => 5,
        OP_SETCC => 3,
        OP_LOAD_DIRECT => 4,
        OP_STORE_DIRECT => 4,
        OP_BANK_READ => 5,
        OP_BANK_WRITE => 5,
        OP_FLAGS_TO_REG => 2,
        OP_REG_TO_FLAGS => 2,
        OP_JCC => 6,
        OP_JMP => 5,
        OP_JMP_TAGS => 2,
        OP_CALL_INTERP => 3,
        OP_FLOAD_SLOT => 3,
        OP_FSTORE_SLOT => 3,
        OP_FSTORE_SLOT_DROP => 3,
        OP_FMOV_RR => 3,
        _ => panic!("unknown host instruction tag {:#04x}", tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guestloc_round_trip() {
        let locs = [
            GuestLoc::Reg(0),
            GuestLoc::Reg(15),
            GuestLoc::PcP,
            GuestLoc::FlagCznv,
            GuestLoc::FlagX,
            GuestLoc::SpcFlags,
            GuestLoc::Countdown,
            GuestLoc::Scratch(0),
            GuestLoc::Scratch(11),
            GuestLoc::FpReg(7),
            GuestLoc::FpResult,
            GuestLoc::FpScratch(1),
        ];
        for loc in locs {
            assert_eq!(GuestLoc::decode(loc.encode()), loc);
        }
    }

    #[test]
    fn test_cond_negate_pairs() {
        assert_eq!(Cond::Eq.negate(), Cond::Ne);
        assert_eq!(Cond::Ne.negate(), Cond::Eq);
        assert_eq!(Cond::Lt.negate(), Cond::Ge);
        assert_eq!(Cond::T.negate(), Cond::F);
        for c in 0u8..16 {
            let cond = Cond::from_code(c);
            assert_eq!(cond.negate().negate(), cond);
        }
    }

    #[test]
    fn test_all_tags_have_lengths() {
        for tag in OP_NOP..=OP_FMOV_RR {
            assert!(insn_len(tag) >= 1);
        }
    }

    #[test]
    fn test_capability_tables_consistent() {
        for &r in CAN_BYTE {
            assert!(CAN_WORD.contains(&r), "byte-capable reg {} must be word-capable", r);
        }
        for &r in ALWAYS_USED {
            assert!(!CAN_BYTE.contains(&r));
        }
        assert_eq!(CALL_SAVED.len(), N_REGS);
    }
}
