//! The per-compilation context.
//!
//! `LiveState` is the engine's scratch register map: which virtual (guest)
//! registers live where, what is dirty, where the guest flags currently
//! are. `Comp` bundles it with the assembler and configuration for the
//! duration of one `compile_block`; the allocator, flag, memory-access and
//! per-opcode emit methods hang off it in the sibling modules.

pub mod flags;
pub mod fregalloc;
pub mod matchstate;
pub mod memgen;
pub mod midfunc;
pub mod ops;
pub mod regalloc;

use crate::backend::asm::Assembler;
use crate::backend::buffer::CodeBuffer;
use crate::backend::insn::{Cond, GuestLoc, N_FREGS, N_REGS};
use crate::config::JitConfig;
use crate::memory::{MemBus, SpecialMem};

/// Number of virtual integer register slots: 16 guest registers plus PC,
/// the flag carriers, the next-handler slot and compiler scratches.
pub const VREGS: usize = 28;
/// Number of virtual FP register slots: 8 guest FP registers plus the FPU
/// result and one scratch.
pub const VFREGS: usize = 10;

pub const PC_P: usize = 16;
pub const FLAGX: usize = 17;
pub const FLAGTMP: usize = 18;
pub const NEXT_HANDLER: usize = 19;
pub const S1: usize = 20;
pub const S2: usize = 21;
pub const S3: usize = 22;
pub const S4: usize = 23;

pub const FP_RESULT: usize = 8;
pub const FS1: usize = 9;

/// Virtual-register status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegStatus {
    Undef,
    InMem,
    Clean,
    Dirty,
    IsConst,
}

/// What a flush must do with a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedFlush {
    /// Discard on flush.
    Scratch,
    /// Write back to home memory.
    ToMem,
    /// Special handler slot; never written back.
    Handler,
}

/// Where the guest condition codes currently are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsState {
    Valid,
    Trash,
}

#[derive(Debug, Clone, Copy)]
pub struct VRegInfo {
    pub status: RegStatus,
    /// Host register currently holding this VREG, or -1.
    pub realreg: i8,
    /// Position within that host register's holder list.
    pub realind: u8,
    /// Low-order bytes guaranteed up to date in the host register.
    pub validsize: u8,
    /// Low-order bytes written since the last flush.
    pub dirtysize: u8,
    /// Constant value (ISCONST) or deferred additive offset (in-register).
    pub val: u32,
    pub needflush: NeedFlush,
    /// Guest-state slot this VREG mirrors.
    pub home: GuestLoc,
}

#[derive(Debug, Clone, Copy)]
pub struct NRegInfo {
    pub holds: [i8; VREGS],
    pub nholds: u8,
    pub locked: u8,
    pub touched: u32,
    pub canbyte: bool,
    pub canword: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FVRegInfo {
    pub status: RegStatus,
    pub realreg: i8,
    pub realind: u8,
    pub needflush: NeedFlush,
    pub home: GuestLoc,
}

#[derive(Debug, Clone, Copy)]
pub struct FNRegInfo {
    pub holds: [i8; VFREGS],
    pub nholds: u8,
    pub locked: u8,
    pub touched: u32,
}

/// The full register-map state ("big state"). Cloned wholesale around
/// branch edges.
#[derive(Clone)]
pub struct LiveState {
    pub state: [VRegInfo; VREGS],
    pub nat: [NRegInfo; N_REGS],
    pub fate: [FVRegInfo; VFREGS],
    pub fat: [FNRegInfo; N_FREGS],
    pub flags_in_flags: FlagsState,
    pub flags_on_stack: FlagsState,
    pub flags_are_important: bool,
    /// Monotonic use counter driving LRU eviction.
    pub touchcnt: u32,
}

impl LiveState {
    pub fn new() -> Self {
        Self {
            state: [VRegInfo {
                status: RegStatus::Undef,
                realreg: -1,
                realind: 0,
                validsize: 0,
                dirtysize: 0,
                val: 0,
                needflush: NeedFlush::Scratch,
                home: GuestLoc::Scratch(0),
            }; VREGS],
            nat: [NRegInfo {
                holds: [-1; VREGS],
                nholds: 0,
                locked: 0,
                touched: 0,
                canbyte: false,
                canword: false,
            }; N_REGS],
            fate: [FVRegInfo {
                status: RegStatus::Undef,
                realreg: -1,
                realind: 0,
                needflush: NeedFlush::Scratch,
                home: GuestLoc::FpScratch(0),
            }; VFREGS],
            fat: [FNRegInfo { holds: [-1; VFREGS], nholds: 0, locked: 0, touched: 0 }; N_FREGS],
            flags_in_flags: FlagsState::Trash,
            flags_on_stack: FlagsState::Valid,
            flags_are_important: true,
            touchcnt: 1,
        }
    }

    #[inline]
    pub fn isinreg(&self, r: usize) -> bool {
        matches!(self.state[r].status, RegStatus::Clean | RegStatus::Dirty)
    }

    #[inline]
    pub fn isconst(&self, r: usize) -> bool {
        self.state[r].status == RegStatus::IsConst
    }
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-host-register summary of a register topology ("small state"): the
/// top-of-holder-list VREG and the sizes it is expected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallNat {
    pub holds: i8,
    pub validsize: u8,
    pub dirtysize: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallState {
    pub nat: [SmallNat; N_REGS],
}

impl Default for SmallState {
    fn default() -> Self {
        Self { nat: [SmallNat { holds: -1, validsize: 0, dirtysize: 0 }; N_REGS] }
    }
}

/// A branch recorded by a compile function: both edge targets and the
/// condition selecting the taken edge.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredBranch {
    pub not_taken: u32,
    pub taken: u32,
    pub cc: Cond,
}

/// Everything one `compile_block` invocation emits through.
pub struct Comp<'a> {
    pub live: &'a mut LiveState,
    pub asm: Assembler<'a>,
    pub cfg: &'a JitConfig,
    pub bus: &'a mut dyn MemBus,
    /// Guest PC the PC_P constant is relative to.
    pub comp_pc_p: u32,
    /// Bytes of guest instruction stream consumed but not yet folded into
    /// PC_P.
    pub m68k_pc_offset: u32,
    /// Whether the current instruction's flag effects are observable.
    pub needflags: bool,
    /// Set when the current instruction cannot be translated.
    pub failure: bool,
    /// Special-memory hints for the current instruction.
    pub special_mem: SpecialMem,
    /// Branch registered by a compile function, consumed by the epilogue.
    pub branch: Option<RegisteredBranch>,
    /// Whether the direct-map fast path is available.
    pub canbang: bool,
}

impl<'a> Comp<'a> {
    pub fn new(
        live: &'a mut LiveState,
        buf: &'a mut CodeBuffer,
        cfg: &'a JitConfig,
        bus: &'a mut dyn MemBus,
    ) -> Self {
        let canbang = bus.can_direct();
        Self {
            live,
            asm: Assembler::new(buf),
            cfg,
            bus,
            comp_pc_p: 0,
            m68k_pc_offset: 0,
            needflags: false,
            failure: false,
            special_mem: SpecialMem::empty(),
            branch: None,
            canbang,
        }
    }

    /// Reset the live state for a fresh stretch of compiled code starting
    /// at guest PC `pc`.
    pub fn init_comp(&mut self, pc: u32) {
        let live = &mut *self.live;
        *live = LiveState::new();

        for (i, st) in live.state.iter_mut().enumerate() {
            if i < 16 {
                st.home = GuestLoc::Reg(i as u8);
                st.needflush = NeedFlush::ToMem;
                st.status = RegStatus::InMem;
            } else {
                st.home = GuestLoc::Scratch(i as u8);
            }
        }
        live.state[PC_P].home = GuestLoc::PcP;
        live.state[PC_P].needflush = NeedFlush::ToMem;
        live.state[FLAGX].home = GuestLoc::FlagX;
        live.state[FLAGX].needflush = NeedFlush::ToMem;
        live.state[FLAGX].status = RegStatus::InMem;
        live.state[FLAGTMP].home = GuestLoc::FlagCznv;
        live.state[FLAGTMP].needflush = NeedFlush::ToMem;
        live.state[FLAGTMP].status = RegStatus::InMem;
        live.state[NEXT_HANDLER].needflush = NeedFlush::Handler;

        for (i, f) in live.fate.iter_mut().enumerate() {
            if i < 8 {
                f.home = GuestLoc::FpReg(i as u8);
                f.needflush = NeedFlush::ToMem;
                f.status = RegStatus::InMem;
            } else if i == FP_RESULT {
                f.home = GuestLoc::FpResult;
                f.needflush = NeedFlush::ToMem;
                f.status = RegStatus::InMem;
            } else {
                f.home = GuestLoc::FpScratch(i as u8);
            }
        }

        for (i, n) in live.nat.iter_mut().enumerate() {
            n.canbyte = crate::backend::insn::CAN_BYTE.contains(&i);
            n.canword = crate::backend::insn::CAN_WORD.contains(&i);
            if crate::backend::insn::ALWAYS_USED.contains(&i) {
                n.locked = 1;
            }
        }

        self.comp_pc_p = pc;
        self.m68k_pc_offset = 0;

        // PC is a lazily materialized constant.
        self.set_const(PC_P, pc);
    }

    /// Read an instruction-stream word at `offset` from the PC base.
    pub fn get_iword(&mut self, offset: u32) -> u16 {
        self.bus.code_word(self.comp_pc_p.wrapping_add(offset))
    }

    pub fn get_ilong(&mut self, offset: u32) -> u32 {
        self.bus.code_long(self.comp_pc_p.wrapping_add(offset))
    }

    /// Fold the accumulated instruction-stream offset into the PC.
    pub fn sync_m68k_pc(&mut self) {
        if self.m68k_pc_offset != 0 {
            let off = self.m68k_pc_offset;
            self.add_l_ri(PC_P, off);
            self.comp_pc_p = self.comp_pc_p.wrapping_add(off);
            self.m68k_pc_offset = 0;
        }
    }

    /// Record a two-edge block end; the epilogue turns it into linked
    /// conditional jumps.
    pub fn register_branch(&mut self, not_taken: u32, taken: u32, cc: Cond) {
        self.branch = Some(RegisteredBranch { not_taken, taken, cc });
    }

    // ---- flushing ----

    /// Write everything observable back to guest state. Only do this if you
    /// really mean it: the next call should be to `init_comp`.
    pub fn flush(&mut self, save_regs: bool) {
        self.flush_flags();
        self.sync_m68k_pc();

        if save_regs {
            for i in 0..VFREGS {
                if self.live.fate[i].needflush == NeedFlush::Scratch
                    || self.live.fate[i].status == RegStatus::Clean
                {
                    self.f_disassociate(i);
                }
            }
            for i in 0..VREGS {
                if self.live.state[i].needflush == NeedFlush::ToMem {
                    match self.live.state[i].status {
                        RegStatus::InMem => {
                            if self.live.state[i].val != 0 {
                                let home = self.live.state[i].home;
                                let val = self.live.state[i].val;
                                self.asm.add_mem_imm(home, val);
                                self.live.state[i].val = 0;
                            }
                        }
                        RegStatus::Clean | RegStatus::Dirty => {
                            self.remove_offset(i, -1);
                            self.evict(i);
                        }
                        RegStatus::IsConst => {
                            if i != PC_P {
                                self.writeback_const(i);
                            }
                        }
                        _ => {}
                    }
                    debug_assert!(
                        self.live.state[i].val == 0 || i == PC_P,
                        "register {} still has val {:#x} after flush",
                        i,
                        self.live.state[i].val
                    );
                }
            }
            for i in 0..VFREGS {
                if self.live.fate[i].needflush == NeedFlush::ToMem
                    && self.live.fate[i].status == RegStatus::Dirty
                {
                    self.f_evict(i);
                }
            }
            // Scratches left resident are dead by contract; discard them so
            // no host register keeps holders past the flush.
            for i in 0..VREGS {
                if self.live.isinreg(i) {
                    self.forget_about(i);
                }
            }
        }
        if self.needflags {
            log::warn!("flush with live flag requirements");
        }
    }

    /// Write back every dirty VREG living in a call-clobbered host register
    /// and evict all FP registers.
    pub fn flush_all(&mut self) {
        for i in 0..VREGS {
            if self.live.state[i].status == RegStatus::Dirty {
                let rr = self.live.state[i].realreg as usize;
                if !crate::backend::insn::CALL_SAVED[rr] {
                    self.tomem(i);
                }
            }
        }
        for i in 0..VFREGS {
            if self.f_isinreg(i) {
                self.f_evict(i);
            }
        }
    }

    /// Make sure everything a runtime call could clobber is safe in memory.
    pub fn prepare_for_call_1(&mut self) {
        self.flush_all();
    }

    /// Disassociate everything from call-clobbered host registers; the call
    /// will trash them.
    pub fn prepare_for_call_2(&mut self) {
        for i in 0..N_REGS {
            if !crate::backend::insn::CALL_SAVED[i] && self.live.nat[i].nholds > 0 {
                self.free_nreg(i);
            }
        }
        for i in 0..N_FREGS {
            if self.live.fat[i].nholds > 0 {
                self.f_free_nreg(i);
            }
        }
        // Flags were rescued before the call sequence started.
        self.live.flags_in_flags = FlagsState::Trash;
    }

    /// Drop every scratch VREG at instruction end.
    pub fn freescratch(&mut self) {
        for i in 0..N_REGS {
            if self.live.nat[i].locked > 0 && !crate::backend::insn::ALWAYS_USED.contains(&i) {
                log::warn!("host register {} still locked at instruction end", i);
            }
        }
        for i in 0..VREGS {
            if self.live.state[i].needflush == NeedFlush::Scratch {
                self.forget_about(i);
            }
        }
        for i in 0..VFREGS {
            if self.live.fate[i].needflush == NeedFlush::Scratch {
                self.f_forget_about(i);
            }
        }
    }

    pub fn forget_about(&mut self, r: usize) {
        if self.live.isinreg(r) {
            self.disassociate(r);
        }
        self.live.state[r].val = 0;
        self.set_status(r, RegStatus::Undef);
    }

    pub fn f_forget_about(&mut self, r: usize) {
        if self.f_isinreg(r) {
            self.f_disassociate(r);
        }
        self.live.fate[r].status = RegStatus::Undef;
    }

    /// Downstream instructions overwrite every flag before reading any;
    /// whatever is live can be treated as valid.
    pub fn dont_care_flags(&mut self) {
        self.live.flags_are_important = false;
    }

    pub fn live_flags(&mut self) {
        self.live.flags_are_important = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::memory::FlatBus;

    pub(crate) fn with_comp<R>(f: impl FnOnce(&mut Comp) -> R) -> R {
        let mut live = LiveState::new();
        let mut buf = CodeBuffer::new(1 << 20);
        let cfg = JitConfig::default();
        let mut bus = FlatBus::new(0x10000);
        let mut c = Comp::new(&mut live, &mut buf, &cfg, &mut bus);
        c.init_comp(0x1000);
        f(&mut c)
    }

    #[test]
    fn test_init_comp_maps_guest_registers() {
        with_comp(|c| {
            for i in 0..16 {
                assert_eq!(c.live.state[i].status, RegStatus::InMem);
                assert_eq!(c.live.state[i].needflush, NeedFlush::ToMem);
                assert_eq!(c.live.state[i].home, GuestLoc::Reg(i as u8));
            }
            assert!(c.live.isconst(PC_P));
            assert_eq!(c.live.state[PC_P].val, 0x1000);
            assert_eq!(c.live.state[NEXT_HANDLER].needflush, NeedFlush::Handler);
        });
    }

    #[test]
    fn test_init_comp_host_capabilities() {
        with_comp(|c| {
            assert!(c.live.nat[0].canbyte);
            assert!(!c.live.nat[7].canbyte);
            assert!(c.live.nat[7].canword);
            assert!(c.live.nat[4].locked > 0);
        });
    }

    #[test]
    fn test_sync_pc_folds_offset_into_const() {
        with_comp(|c| {
            c.m68k_pc_offset = 6;
            c.sync_m68k_pc();
            assert_eq!(c.m68k_pc_offset, 0);
            assert_eq!(c.comp_pc_p, 0x1006);
            assert_eq!(c.live.state[PC_P].val, 0x1006);
            assert!(c.live.isconst(PC_P));
        });
    }
}
