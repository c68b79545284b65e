//! Executor for the portable host encoding.
//!
//! Runs translated code (and the stubs) against the guest state, the memory
//! bus, the cache-tag directory and the block arena, maintaining the host
//! register file and N/Z/V/C flags. Control returns to the dispatcher when
//! an `Exit` instruction is reached.
//!
//! Partial-width semantics mirror the sub-register model the allocator is
//! built around: an operation at size 1 or 2 only modifies the low bytes of
//! its destination.

use super::insn::*;
use crate::blocks::{cacheline, BlockArena, CacheTags};
use crate::comp::{VFREGS, VREGS};
use crate::cpu::Regs;
use crate::memory::MemBus;
use crate::optable::Fallback;

/// Execution budget: translated code that runs this many host instructions
/// without exiting is broken.
const MAX_STEPS: u64 = 500_000_000;

/// Host machine state persisted across block-to-block jumps within one
/// dispatcher entry.
pub struct HostVm {
    pub regs: [u32; N_REGS],
    pub fregs: [f64; N_FREGS],
    pub flag_n: bool,
    pub flag_z: bool,
    pub flag_v: bool,
    pub flag_c: bool,
    /// Eviction homes for compiler scratch VREGs.
    pub scratch: [u32; VREGS],
    pub fscratch: [f64; VFREGS],
}

impl HostVm {
    pub fn new() -> Self {
        Self {
            regs: [0; N_REGS],
            fregs: [0.0; N_FREGS],
            flag_n: false,
            flag_z: false,
            flag_v: false,
            flag_c: false,
            scratch: [0; VREGS],
            fscratch: [0.0; VFREGS],
        }
    }

    fn cond_true(&self, cond: Cond) -> bool {
        let (n, z, v, c) = (self.flag_n, self.flag_z, self.flag_v, self.flag_c);
        match cond {
            Cond::T => true,
            Cond::F => false,
            Cond::Hi => !c && !z,
            Cond::Ls => c || z,
            Cond::Cc => !c,
            Cond::Cs => c,
            Cond::Ne => !z,
            Cond::Eq => z,
            Cond::Vc => !v,
            Cond::Vs => v,
            Cond::Pl => !n,
            Cond::Mi => n,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
        }
    }

    fn set_nz(&mut self, result: u32, size: u8) {
        let (mask, sign) = size_masks(size);
        self.flag_n = result & sign != 0;
        self.flag_z = result & mask == 0;
    }

    fn write_reg(&mut self, d: usize, v: u32, size: u8) {
        self.regs[d] = match size {
            1 => (self.regs[d] & !0xff) | (v & 0xff),
            2 => (self.regs[d] & !0xffff) | (v & 0xffff),
            _ => v,
        };
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32, size: u8) -> Option<u32> {
        let (mask, sign) = size_masks(size);
        let am = a & mask;
        let bm = b & mask;
        match op {
            AluOp::Add => {
                let r = am.wrapping_add(bm);
                self.flag_c = (am as u64 + bm as u64) > mask as u64;
                self.flag_v = (am ^ r) & (bm ^ r) & sign != 0;
                self.set_nz(r, size);
                Some(r)
            }
            AluOp::Sub | AluOp::Cmp => {
                let r = am.wrapping_sub(bm);
                self.flag_c = am < bm;
                self.flag_v = (am ^ bm) & (am ^ r) & sign != 0;
                self.set_nz(r, size);
                if op == AluOp::Sub {
                    Some(r)
                } else {
                    None
                }
            }
            AluOp::And | AluOp::Tst => {
                let r = am & bm;
                self.flag_c = false;
                self.flag_v = false;
                self.set_nz(r, size);
                if op == AluOp::And {
                    Some(r)
                } else {
                    None
                }
            }
            AluOp::Or => {
                let r = am | bm;
                self.flag_c = false;
                self.flag_v = false;
                self.set_nz(r, size);
                Some(r)
            }
            AluOp::Xor => {
                let r = am ^ bm;
                self.flag_c = false;
                self.flag_v = false;
                self.set_nz(r, size);
                Some(r)
            }
        }
    }

    fn shift(&mut self, op: ShiftOp, a: u32, amt: u8, size: u8) -> u32 {
        let (mask, sign) = size_masks(size);
        let bits = size as u32 * 8;
        let am = a & mask;
        let amt = amt as u32;
        let r = match op {
            ShiftOp::Shl => {
                if amt > 0 && amt <= bits {
                    self.flag_c = am >> (bits - amt) & 1 != 0;
                }
                am.wrapping_shl(amt)
            }
            ShiftOp::Shr => {
                if amt > 0 && amt <= bits {
                    self.flag_c = am >> (amt - 1) & 1 != 0;
                }
                am.wrapping_shr(amt)
            }
            ShiftOp::Sar => {
                if amt > 0 && amt <= bits {
                    self.flag_c = am >> (amt - 1) & 1 != 0;
                }
                let sext = if am & sign != 0 { (!mask) | am } else { am };
                ((sext as i32) >> amt.min(31)) as u32
            }
        };
        self.flag_v = false;
        self.set_nz(r, size);
        r
    }

    /// Pack N/Z/V/C in the guest CCR layout (C=0, V=1, Z=2, N=3).
    fn pack_flags(&self) -> u32 {
        (self.flag_c as u32)
            | (self.flag_v as u32) << 1
            | (self.flag_z as u32) << 2
            | (self.flag_n as u32) << 3
    }

    fn unpack_flags(&mut self, v: u32) {
        self.flag_c = v & 1 != 0;
        self.flag_v = v & 2 != 0;
        self.flag_z = v & 4 != 0;
        self.flag_n = v & 8 != 0;
    }
}

impl Default for HostVm {
    fn default() -> Self {
        Self::new()
    }
}

fn size_masks(size: u8) -> (u32, u32) {
    match size {
        1 => (0xff, 0x80),
        2 => (0xffff, 0x8000),
        4 => (0xffff_ffff, 0x8000_0000),
        _ => panic!("bad operand size {}", size),
    }
}

fn slot_read(vm: &HostVm, regs: &Regs, loc: GuestLoc) -> u32 {
    match loc {
        GuestLoc::Reg(n) => regs.regs[n as usize],
        GuestLoc::PcP => regs.pc_p,
        GuestLoc::FlagCznv => regs.flags.cznv,
        GuestLoc::FlagX => regs.flags.x,
        GuestLoc::SpcFlags => regs.spcflags.bits(),
        GuestLoc::Countdown => regs.countdown as u32,
        GuestLoc::Scratch(n) => vm.scratch[n as usize],
        _ => panic!("integer read of FP slot {:?}", loc),
    }
}

fn slot_write(vm: &mut HostVm, regs: &mut Regs, loc: GuestLoc, v: u32, size: u8) {
    let merge = |old: u32| match size {
        1 => (old & !0xff) | (v & 0xff),
        2 => (old & !0xffff) | (v & 0xffff),
        _ => v,
    };
    match loc {
        GuestLoc::Reg(n) => regs.regs[n as usize] = merge(regs.regs[n as usize]),
        GuestLoc::PcP => regs.pc_p = merge(regs.pc_p),
        GuestLoc::FlagCznv => regs.flags.cznv = merge(regs.flags.cznv),
        GuestLoc::FlagX => regs.flags.x = merge(regs.flags.x),
        GuestLoc::SpcFlags => {
            regs.spcflags = crate::cpu::SpcFlag::from_bits_retain(merge(regs.spcflags.bits()))
        }
        GuestLoc::Countdown => regs.countdown = merge(regs.countdown as u32) as i32,
        GuestLoc::Scratch(n) => vm.scratch[n as usize] = merge(vm.scratch[n as usize]),
        _ => panic!("integer write of FP slot {:?}", loc),
    }
}

fn fslot_read(vm: &HostVm, regs: &Regs, loc: GuestLoc) -> f64 {
    match loc {
        GuestLoc::FpReg(n) => regs.fp[n as usize],
        GuestLoc::FpResult => regs.fp_result,
        GuestLoc::FpScratch(n) => vm.fscratch[n as usize],
        _ => panic!("FP read of integer slot {:?}", loc),
    }
}

fn fslot_write(vm: &mut HostVm, regs: &mut Regs, loc: GuestLoc, v: f64) {
    match loc {
        GuestLoc::FpReg(n) => regs.fp[n as usize] = v,
        GuestLoc::FpResult => regs.fp_result = v,
        GuestLoc::FpScratch(n) => vm.fscratch[n as usize] = v,
        _ => panic!("FP write of integer slot {:?}", loc),
    }
}

/// Run translated code starting at buffer offset `entry` until an `Exit`.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    code: &[u8],
    entry: u32,
    vm: &mut HostVm,
    regs: &mut Regs,
    bus: &mut dyn MemBus,
    blocks: &mut BlockArena,
    tags: &CacheTags,
    fallback: &mut dyn Fallback,
) -> ExitReason {
    let mut pc = entry as usize;
    let mut steps: u64 = 0;

    macro_rules! b {
        ($off:expr) => {
            code[pc + $off]
        };
    }
    macro_rules! w {
        ($off:expr) => {
            u16::from_le_bytes([code[pc + $off], code[pc + $off + 1]])
        };
    }
    macro_rules! l {
        ($off:expr) => {
            u32::from_le_bytes([
                code[pc + $off],
                code[pc + $off + 1],
                code[pc + $off + 2],
                code[pc + $off + 3],
            ])
        };
    }

    loop {
        steps += 1;
        assert!(steps < MAX_STEPS, "runaway translated code at offset {}", pc);
        let tag = code[pc];
        let len = insn_len(tag);
        let mut next = pc + len;

        match tag {
            OP_NOP => {}
            OP_EXIT => return ExitReason::from_code(b!(1)),
            OP_MOV_RR => {
                let (d, s, size) = (b!(1) as usize, b!(2) as usize, b!(3));
                let v = vm.regs[s];
                vm.write_reg(d, v, size);
            }
            OP_MOV_RI => {
                vm.regs[b!(1) as usize] = l!(2);
            }
            OP_LOAD_SLOT => {
                let d = b!(1) as usize;
                let loc = GuestLoc::decode(b!(2));
                vm.regs[d] = slot_read(vm, regs, loc);
            }
            OP_STORE_SLOT => {
                let loc = GuestLoc::decode(b!(1));
                let v = vm.regs[b!(2) as usize];
                slot_write(vm, regs, loc, v, b!(3));
            }
            OP_STORE_SLOT_I => {
                let loc = GuestLoc::decode(b!(1));
                let v = l!(2);
                slot_write(vm, regs, loc, v, 4);
            }
            OP_ADD_SLOT_I => {
                let loc = GuestLoc::decode(b!(1));
                let v = slot_read(vm, regs, loc).wrapping_add(l!(2));
                slot_write(vm, regs, loc, v, 4);
            }
            OP_SUB_SLOT_I => {
                let loc = GuestLoc::decode(b!(1));
                let old = slot_read(vm, regs, loc);
                let r = vm.alu(AluOp::Sub, old, l!(2), 4).unwrap();
                slot_write(vm, regs, loc, r, 4);
            }
            OP_CMP_SLOT_I => {
                let loc = GuestLoc::decode(b!(1));
                let old = slot_read(vm, regs, loc);
                vm.alu(AluOp::Cmp, old, l!(2), 4);
            }
            OP_SUB_COUNT => {
                let blk = l!(1);
                let bi = blocks.get_mut(blk);
                let r = vm.alu(AluOp::Sub, bi.count as u32, 1, 4).unwrap();
                bi.count = r as i32;
            }
            OP_LOAD_BLK_PC => {
                let d = b!(1) as usize;
                vm.regs[d] = blocks.get(l!(2)).pc_p;
            }
            OP_LEA => {
                let (d, base) = (b!(1) as usize, b!(2) as usize);
                vm.regs[d] = vm.regs[base].wrapping_add(l!(3));
            }
            OP_LEA_IDX => {
                let (d, base, index, scale) = (b!(1) as usize, b!(2) as usize, b!(3) as usize, b!(4));
                let v = vm.regs[base]
                    .wrapping_add(vm.regs[index].wrapping_shl(scale as u32))
                    .wrapping_add(l!(5));
                vm.regs[d] = v;
            }
            OP_BSWAP => {
                let r = b!(1) as usize;
                vm.regs[r] = vm.regs[r].swap_bytes();
            }
            OP_BSWAP16 => {
                let r = b!(1) as usize;
                let v = vm.regs[r];
                vm.regs[r] = (v & 0xffff_0000) | ((v & 0xff) << 8) | ((v >> 8) & 0xff);
            }
            OP_ZEXT8 => {
                let (d, s) = (b!(1) as usize, b!(2) as usize);
                vm.regs[d] = vm.regs[s] & 0xff;
            }
            OP_ZEXT16 => {
                let (d, s) = (b!(1) as usize, b!(2) as usize);
                vm.regs[d] = vm.regs[s] & 0xffff;
            }
            OP_SEXT8 => {
                let (d, s) = (b!(1) as usize, b!(2) as usize);
                vm.regs[d] = vm.regs[s] as u8 as i8 as i32 as u32;
            }
            OP_SEXT16 => {
                let (d, s) = (b!(1) as usize, b!(2) as usize);
                vm.regs[d] = vm.regs[s] as u16 as i16 as i32 as u32;
            }
            OP_ALU_RR => {
                let op = AluOp::from_code(b!(1));
                let (d, s, size) = (b!(2) as usize, b!(3) as usize, b!(4));
                if let Some(r) = vm.alu(op, vm.regs[d], vm.regs[s], size) {
                    vm.write_reg(d, r, size);
                }
            }
            OP_ALU_RI => {
                let op = AluOp::from_code(b!(1));
                let d = b!(2) as usize;
                let imm = l!(3);
                let size = b!(7);
                if let Some(r) = vm.alu(op, vm.regs[d], imm, size) {
                    vm.write_reg(d, r, size);
                }
            }
            OP_SHIFT_RI => {
                let op = ShiftOp::from_code(b!(1));
                let (d, amt, size) = (b!(2) as usize, b!(3), b!(4));
                let r = vm.shift(op, vm.regs[d], amt, size);
                vm.write_reg(d, r, size);
            }
            OP_SETCC => {
                let cond = Cond::from_code(b!(1));
                let d = b!(2) as usize;
                vm.regs[d] = vm.cond_true(cond) as u32;
            }
            OP_LOAD_DIRECT => {
                let (d, a, size) = (b!(1) as usize, b!(2) as usize, b!(3));
                let addr = vm.regs[a] as usize;
                let image = bus.direct().expect("direct access without a direct map");
                let v = match size {
                    1 => image[addr] as u32,
                    2 => u16::from_le_bytes([image[addr], image[addr + 1]]) as u32,
                    _ => u32::from_le_bytes(image[addr..addr + 4].try_into().unwrap()),
                };
                vm.write_reg(d, v, size);
            }
            OP_STORE_DIRECT => {
                let (a, s, size) = (b!(1) as usize, b!(2) as usize, b!(3));
                let addr = vm.regs[a] as usize;
                let v = vm.regs[s];
                let image = bus.direct_mut().expect("direct access without a direct map");
                match size {
                    1 => image[addr] = v as u8,
                    2 => image[addr..addr + 2].copy_from_slice(&(v as u16).to_le_bytes()),
                    _ => image[addr..addr + 4].copy_from_slice(&v.to_le_bytes()),
                }
            }
            OP_BANK_READ => {
                let (d, bank, a, size) = (b!(1) as usize, b!(2) as usize, b!(3) as usize, b!(4));
                let addr = vm.regs[a];
                debug_assert_eq!(vm.regs[bank], addr >> 16, "stale bank index register");
                let v = match size {
                    1 => bus.bget(addr),
                    2 => bus.wget(addr),
                    _ => bus.lget(addr),
                };
                vm.write_reg(d, v, size);
            }
            OP_BANK_WRITE => {
                let (bank, a, s, size) = (b!(1) as usize, b!(2) as usize, b!(3) as usize, b!(4));
                let addr = vm.regs[a];
                debug_assert_eq!(vm.regs[bank], addr >> 16, "stale bank index register");
                let v = vm.regs[s];
                match size {
                    1 => bus.bput(addr, v & 0xff),
                    2 => bus.wput(addr, v & 0xffff),
                    _ => bus.lput(addr, v),
                }
            }
            OP_FLAGS_TO_REG => {
                vm.regs[b!(1) as usize] = vm.pack_flags();
            }
            OP_REG_TO_FLAGS => {
                let v = vm.regs[b!(1) as usize];
                vm.unpack_flags(v);
            }
            OP_JCC => {
                let cond = Cond::from_code(b!(1));
                if vm.cond_true(cond) {
                    next = l!(2) as usize;
                }
            }
            OP_JMP => {
                next = l!(1) as usize;
            }
            OP_JMP_TAGS => {
                // Countdown still non-negative: dispatch through the
                // directory in constant time. Otherwise leave through
                // do-nothing.
                if vm.flag_n {
                    return ExitReason::DoNothing;
                }
                let r = b!(1) as usize;
                let cl = cacheline(vm.regs[r]);
                next = tags.handler(cl) as usize;
            }
            OP_CALL_INTERP => {
                let opcode = w!(1);
                fallback.op(opcode, regs, bus);
            }
            OP_FLOAD_SLOT => {
                let fd = b!(1) as usize;
                let loc = GuestLoc::decode(b!(2));
                vm.fregs[fd] = fslot_read(vm, regs, loc);
            }
            OP_FSTORE_SLOT | OP_FSTORE_SLOT_DROP => {
                let loc = GuestLoc::decode(b!(1));
                let fs = b!(2) as usize;
                fslot_write(vm, regs, loc, vm.fregs[fs]);
            }
            OP_FMOV_RR => {
                vm.fregs[b!(1) as usize] = vm.fregs[b!(2) as usize];
            }
            _ => panic!("undecodable host instruction {:#04x} at offset {}", tag, pc),
        }
        pc = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::asm::Assembler;
    use crate::backend::buffer::CodeBuffer;
    use crate::memory::FlatBus;

    struct NoFallback;
    impl Fallback for NoFallback {
        fn op(&mut self, _opcode: u16, _regs: &mut Regs, _bus: &mut dyn MemBus) -> u32 {
            panic!("unexpected fallback");
        }
    }

    fn run(buf: &CodeBuffer, entry: u32, regs: &mut Regs, bus: &mut FlatBus) -> (HostVm, ExitReason) {
        let mut vm = HostVm::new();
        let mut blocks = BlockArena::new();
        let tags = CacheTags::new(0);
        let exit = execute(
            buf.bytes(),
            entry,
            &mut vm,
            regs,
            bus,
            &mut blocks,
            &tags,
            &mut NoFallback,
        );
        (vm, exit)
    }

    #[test]
    fn test_mov_load_store_round_trip() {
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.load(0, GuestLoc::Reg(3));
        asm.mov_rr(1, 0, 4);
        asm.store(GuestLoc::Reg(4), 1, 4);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        regs.regs[3] = 0xDEADBEEF;
        let mut bus = FlatBus::new(64);
        let (_, exit) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(exit, ExitReason::DoNothing);
        assert_eq!(regs.regs[4], 0xDEADBEEF);
    }

    #[test]
    fn test_partial_write_preserves_upper() {
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.mov_ri(0, 0xAABBCCDD);
        asm.mov_ri(1, 0x11223344);
        asm.mov_rr(0, 1, 1);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        let mut bus = FlatBus::new(64);
        let (vm, _) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[0], 0xAABBCC44);
    }

    #[test]
    fn test_add_overflow_flags() {
        // 0x7F + 0x01 at byte width: N=1, V=1, C=0, Z=0.
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.mov_ri(0, 0x7f);
        asm.mov_ri(1, 0x01);
        asm.alu_rr(AluOp::Add, 0, 1, 1);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        let mut bus = FlatBus::new(64);
        let (vm, _) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[0] & 0xff, 0x80);
        assert!(vm.flag_n);
        assert!(vm.flag_v);
        assert!(!vm.flag_c);
        assert!(!vm.flag_z);
    }

    #[test]
    fn test_flags_pack_round_trip() {
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        // Produce Z+C via a sub of equal values... sub gives Z only; use
        // explicit pack/unpack instead.
        asm.mov_ri(0, 0b0101); // C and Z in CCR layout
        asm.reg_to_flags(0);
        asm.flags_to_reg(1);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        let mut bus = FlatBus::new(64);
        let (vm, _) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[1], 0b0101);
        assert!(vm.flag_c);
        assert!(vm.flag_z);
        assert!(!vm.flag_n);
    }

    #[test]
    fn test_jcc_taken_and_not() {
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.mov_ri(0, 5);
        asm.alu_ri(AluOp::Cmp, 0, 5, 4); // Z set
        let slot = asm.jcc(Cond::Eq);
        asm.mov_ri(1, 0xBAD);
        asm.exit(ExitReason::DoNothing);
        let target = asm.pos();
        asm.mov_ri(1, 0x600D);
        asm.exit(ExitReason::CacheMiss);
        asm.patch_long(slot, target);

        let mut regs = Regs::default();
        let mut bus = FlatBus::new(64);
        let (vm, exit) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[1], 0x600D);
        assert_eq!(exit, ExitReason::CacheMiss);
    }

    #[test]
    fn test_direct_load_bswap_reads_big_endian() {
        let mut bus = FlatBus::new(64);
        bus.put_long(0x10, 0x01020304);
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.mov_ri(0, 0x10);
        asm.load_direct(1, 0, 4);
        asm.bswap(1);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        let (vm, _) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[1], 0x01020304);
    }

    #[test]
    fn test_bank_access_calls_bus() {
        let mut bus = FlatBus::new(0x20000);
        bus.put_word(0x10000, 0x5678);
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        asm.mov_ri(0, 0x10000); // address
        asm.mov_rr(1, 0, 4);
        asm.shift_ri(ShiftOp::Shr, 1, 16, 4); // bank index
        asm.bank_read(2, 1, 0, 2);
        asm.exit(ExitReason::DoNothing);

        let mut regs = Regs::default();
        let (vm, _) = run(&buf, 0, &mut regs, &mut bus);
        assert_eq!(vm.regs[2] & 0xffff, 0x5678);
    }

    #[test]
    fn test_sub_count_sets_negative_flag() {
        let mut buf = CodeBuffer::new(1 << 20);
        buf.align(32);
        buf.stubs_complete();
        let mut blocks = BlockArena::new();
        blocks.alloc_blockinfos(&mut buf, 0, 0);
        let id = 0u32;
        blocks.get_mut(id).count = 0;

        let mut asm = Assembler::new(&mut buf);
        let entry = asm.pos();
        asm.sub_count(id);
        let slot = asm.jcc(Cond::Lt);
        asm.exit(ExitReason::DoNothing);
        let neg = asm.pos();
        asm.exit(ExitReason::RecompileBlock);
        asm.patch_long(slot, neg);

        let mut vm = HostVm::new();
        let mut regs = Regs::default();
        let mut bus = FlatBus::new(64);
        let tags = CacheTags::new(0);
        let exit = execute(
            buf.bytes(),
            entry,
            &mut vm,
            &mut regs,
            &mut bus,
            &mut blocks,
            &tags,
            &mut NoFallback,
        );
        assert_eq!(exit, ExitReason::RecompileBlock);
        assert_eq!(blocks.get(id).count, -1);
    }
}
