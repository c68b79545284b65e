//! The translation engine: owns the code buffer, the cache directory, the
//! block registry and the live register map, and drives compilation,
//! execution and invalidation.
//!
//! Control flow: the dispatcher hashes the guest PC into the directory and
//! executes the installed handler. Stubs exit back here with a reason
//! (compile, profile, re-checksum, re-chain) and the matching method takes
//! over where a trampoline target would.

use crate::backend::asm::Assembler;
use crate::backend::buffer::CodeBuffer;
use crate::backend::insn::{AluOp, Cond, ExitReason, GuestLoc, REG_PC_TMP};
use crate::backend::vm::{self, HostVm};
use crate::blocks::{cacheline, BlockArena, BlockId, BlockStatus, CacheTags, TAGMASK};
use crate::comp::{Comp, LiveState, PC_P};
use crate::config::JitConfig;
use crate::cpu::{scaled_cycles, CpuHistoryEnt, FlagSet, Regs, LONGEST_68K_INST, MAXRUN};
use crate::memory::{MemBus, SpecialMem};
use crate::optable::{Fallback, OpTable};
use crate::Error;

/// Checksums are skipped (and forced to mismatch) past this many covered
/// bytes.
const MAX_CHECKSUM_LEN: i32 = 2048;

/// Buffer offsets of the builtin exit stubs.
#[derive(Debug, Clone, Copy)]
struct Stubs {
    do_nothing: u32,
    execute_normal: u32,
    exec_nostats: u32,
    cache_miss: u32,
    recompile_block: u32,
    check_checksum: u32,
}

/// Why the dispatcher returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The pending-events word went nonzero.
    Pending,
    /// The cycle countdown ran out.
    OutOfCycles,
}

pub struct Jit {
    cfg: JitConfig,
    table: OpTable,
    comptbl: crate::comp::ops::CompTables,
    buf: CodeBuffer,
    tags: CacheTags,
    blocks: BlockArena,
    live: LiveState,
    vm: HostVm,
    stubs: Stubs,
    enabled: bool,
    compile_count: u32,
    soft_flush_count: u32,
    hard_flush_count: u32,
    checksum_count: u32,
}

impl Jit {
    /// Build the translator: merge the compiled subset's properties into
    /// the opcode table, build the compile-function tables, and allocate
    /// the cache.
    pub fn new(cfg: JitConfig, mut table: OpTable) -> Result<Self, Error> {
        if cfg.cachesize != 0 && cfg.cachesize < 256 {
            return Err(Error::CacheTooSmall(cfg.cachesize));
        }
        crate::comp::ops::register_props(&mut table);
        let comptbl = crate::comp::ops::CompTables::build();

        let size = (cfg.cachesize.max(256) as usize) * 1024;
        let mut buf = CodeBuffer::new(size);
        let stubs = Self::create_popalls(&mut buf);
        buf.stubs_complete();
        let tags = CacheTags::new(stubs.execute_normal);

        log::debug!(
            "translation cache: {} KB, stubs end at byte {}",
            cfg.cachesize,
            buf.code_begin()
        );

        Ok(Self {
            cfg,
            table,
            comptbl,
            buf,
            tags,
            blocks: BlockArena::new(),
            live: LiveState::new(),
            vm: HostVm::new(),
            stubs,
            enabled: false,
            compile_count: 0,
            soft_flush_count: 0,
            hard_flush_count: 0,
            checksum_count: 0,
        })
    }

    /// Emit the builtin exit stubs at the start of the buffer. Do-nothing
    /// sits at offset zero so an unpatched link slot degrades safely.
    fn create_popalls(buf: &mut CodeBuffer) -> Stubs {
        let mut asm = Assembler::new(buf);
        let do_nothing = asm.pos();
        asm.exit(ExitReason::DoNothing);
        asm.align(32);
        let execute_normal = asm.pos();
        asm.exit(ExitReason::ExecuteNormal);
        asm.align(32);
        let exec_nostats = asm.pos();
        asm.exit(ExitReason::ExecNostats);
        asm.align(32);
        let cache_miss = asm.pos();
        asm.exit(ExitReason::CacheMiss);
        asm.align(32);
        let recompile_block = asm.pos();
        asm.exit(ExitReason::RecompileBlock);
        asm.align(32);
        let check_checksum = asm.pos();
        asm.exit(ExitReason::CheckChecksum);
        asm.align(32);
        Stubs { do_nothing, execute_normal, exec_nostats, cache_miss, recompile_block, check_checksum }
    }

    /// Reconcile the live configuration with a pending one. Changes that
    /// invalidate translations hard-flush; a cache-size change reallocates.
    pub fn check_prefs_changed(&mut self, pending: &JitConfig) -> bool {
        let mut changed = self.cfg.needs_flush(pending);
        let resize = self.cfg.cachesize != pending.cachesize;
        self.cfg = pending.clone();
        if resize {
            self.alloc_cache();
            changed = true;
        } else if changed {
            self.flush_icache_hard();
        }
        if changed {
            log::debug!(
                "config: cache={} b={:?} w={:?} l={:?} nf={} const={} hard={}",
                self.cfg.cachesize,
                self.cfg.trust_byte,
                self.cfg.trust_word,
                self.cfg.trust_long,
                self.cfg.compnf,
                self.cfg.constjump,
                self.cfg.hardflush
            );
        }
        changed
    }

    /// Re-allocate the code buffer per the current configuration.
    pub fn alloc_cache(&mut self) {
        let size = (self.cfg.cachesize.max(256) as usize) * 1024;
        let mut buf = CodeBuffer::new(size);
        let stubs = Self::create_popalls(&mut buf);
        buf.stubs_complete();
        self.buf = buf;
        self.stubs = stubs;
        self.tags = CacheTags::new(stubs.execute_normal);
        self.blocks.reset();
        self.hard_flush_count += 1;
    }

    pub fn reset(&mut self) {
        self.set_cache_state(false);
    }

    pub fn set_cache_state(&mut self, on: bool) {
        if on != self.enabled {
            self.flush_icache_hard();
        }
        self.enabled = on;
    }

    pub fn cache_state(&self) -> bool {
        self.enabled
    }

    pub fn jitted_size(&self) -> u32 {
        self.buf.jitted_size()
    }

    pub fn compile_count(&self) -> u32 {
        self.compile_count
    }

    pub fn soft_flush_count(&self) -> u32 {
        self.soft_flush_count
    }

    pub fn hard_flush_count(&self) -> u32 {
        self.hard_flush_count
    }

    pub fn checksum_count(&self) -> u32 {
        self.checksum_count
    }

    // ---- invalidation / flushing ----

    /// Hard flush: reset the bump pointer, reinstall execute-normal
    /// everywhere, drop every block.
    pub fn flush_icache_hard(&mut self) {
        self.hard_flush_count += 1;
        self.tags.reset();
        self.blocks.reset();
        self.buf.reset();
    }

    /// Soft flush: keep the code, mark every active block as needing a
    /// checksum pass before its next execution.
    pub fn flush_icache(&mut self) {
        if self.cfg.hardflush {
            self.flush_icache_hard();
            return;
        }
        self.soft_flush_count += 1;
        if self.blocks.active.is_empty() {
            return;
        }
        let active: Vec<BlockId> = std::mem::take(&mut self.blocks.active);
        for &bi in &active {
            let cl = cacheline(self.blocks.get(bi).pc_p);
            let at_head = self.tags.head(cl) == Some(bi);
            if self.blocks.get(bi).handler.is_none() {
                // Invalidated block.
                if at_head {
                    self.tags.set_handler(cl, self.stubs.execute_normal);
                }
                self.blocks.get_mut(bi).handler_to_use = self.stubs.execute_normal;
                let pen = self.blocks.get(bi).direct_pen;
                self.blocks.set_dhtu(bi, pen, &mut self.buf);
            } else {
                if at_head {
                    self.tags.set_handler(cl, self.stubs.check_checksum);
                }
                self.blocks.get_mut(bi).handler_to_use = self.stubs.check_checksum;
                let pcc = self.blocks.get(bi).direct_pcc;
                self.blocks.set_dhtu(bi, pcc, &mut self.buf);
            }
        }
        self.blocks.dormant.extend(active);
    }

    /// After an interpreter step, detect that the handler installed at the
    /// current line is not this PC's block and raise it in the chain.
    pub fn check_for_cache_miss(&mut self, regs: &Regs) -> bool {
        if let Some(bi) = self.blocks.lookup(&self.tags, regs.pc_p) {
            let cl = cacheline(regs.pc_p);
            if self.tags.head(cl) != Some(bi) {
                self.blocks.raise_in_cl_list(&mut self.tags, bi);
                return true;
            }
        }
        false
    }

    fn calc_checksum(min_pcp: u32, blk_len: u32, bus: &mut dyn MemBus) -> (u32, u32) {
        let mut len = blk_len as i32 + (min_pcp & 3) as i32;
        let mut addr = min_pcp & !3;
        if !(0..=MAX_CHECKSUM_LEN).contains(&len) {
            return (0, 0);
        }
        let mut k1: u32 = 0;
        let mut k2: u32 = 0;
        while len > 0 {
            let w = bus.code_long(addr);
            k1 = k1.wrapping_add(w);
            k2 ^= w;
            addr = addr.wrapping_add(4);
            len -= 4;
        }
        (k1, k2)
    }

    // ---- stub handlers ----

    /// Profile or translate the block at the current PC: interpret while
    /// recording the PC history, then hand it to the compiler.
    fn execute_normal(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) {
        let mut hist: Vec<CpuHistoryEnt> = Vec::new();
        let mut totcycles: i32 = 0;
        loop {
            let pc = regs.pc_p;
            let op = bus.code_word(pc);
            let cycles = fallback.op(op, regs, bus);
            hist.push(CpuHistoryEnt { pc, specmem: fallback.specmem().bits() });
            totcycles += cycles as i32;
            regs.countdown -= cycles as i32;
            if self.table.end_block(op)
                || hist.len() >= MAXRUN
                || !regs.spcflags.is_empty()
                || regs.countdown <= 0
            {
                break;
            }
        }
        self.compile_block(&hist, totcycles, bus);
        // Charge the compilation itself.
        regs.countdown -= scaled_cycles(totcycles);
    }

    /// Interpret one block's worth without recording or compiling.
    fn exec_nostats(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) {
        loop {
            let op = bus.code_word(regs.pc_p);
            let cycles = fallback.op(op, regs, bus);
            regs.countdown -= cycles as i32;
            if self.table.end_block(op) || !regs.spcflags.is_empty() || regs.countdown <= 0 {
                return;
            }
        }
    }

    fn cache_miss(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) {
        match self.blocks.lookup(&self.tags, regs.pc_p) {
            None => self.execute_normal(regs, bus, fallback),
            Some(bi) => {
                let cl = cacheline(regs.pc_p);
                let head = self.tags.head(cl);
                assert!(
                    head.is_some() && head != Some(bi),
                    "unexplained cache miss for block at {:#x}",
                    regs.pc_p
                );
                self.blocks.raise_in_cl_list(&mut self.tags, bi);
            }
        }
    }

    /// A block's countdown expired. Make sure execute-normal doesn't read
    /// it as a cache miss, then retranslate.
    fn recompile_block(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) {
        let bi = self
            .blocks
            .lookup(&self.tags, regs.pc_p)
            .expect("recompile for a block that does not exist");
        self.blocks.raise_in_cl_list(&mut self.tags, bi);
        self.execute_normal(regs, bus, fallback);
    }

    /// A dormant block was entered: re-checksum, then reactivate or
    /// invalidate.
    fn check_checksum(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) {
        self.checksum_count += 1;
        let bi = match self.blocks.lookup(&self.tags, regs.pc_p) {
            // The primary target is dormant, but calling it was accidental;
            // just compile the new block.
            None => return self.execute_normal(regs, bus, fallback),
            Some(bi) => bi,
        };
        let cl = cacheline(regs.pc_p);
        if self.tags.head(cl) != Some(bi) {
            // Hit accidentally, but it does exist: cache miss.
            return self.cache_miss(regs, bus, fallback);
        }

        let (c1, c2) = {
            let b = self.blocks.get(bi);
            if b.c1 != 0 || b.c2 != 0 {
                Self::calc_checksum(b.min_pcp, b.len, bus)
            } else {
                (1, 1) // make sure it doesn't match
            }
        };
        let b = self.blocks.get(bi);
        if c1 == b.c1 && c2 == b.c2 {
            // Still OK: reactivate.
            log::trace!("reactivate block at {:#x}", b.pc_p);
            let handler = b.handler.expect("dormant block without a translation");
            let dh = b.direct_handler.unwrap_or(b.direct_pen);
            self.blocks.get_mut(bi).handler_to_use = handler;
            self.blocks.set_dhtu(bi, dh, &mut self.buf);
            self.blocks.remove_from_list(bi);
            self.blocks.add_to_active(bi);
            self.blocks.raise_in_cl_list(&mut self.tags, bi);
        } else {
            // The underlying code changed: invalidate and retranslate.
            log::trace!("discard block at {:#x}", self.blocks.get(bi).pc_p);
            let count0 = self.cfg.optcount[0];
            self.blocks
                .invalidate_block(bi, count0, self.stubs.execute_normal, &mut self.buf);
            self.blocks.raise_in_cl_list(&mut self.tags, bi);
            self.execute_normal(regs, bus, fallback);
        }
    }

    // ---- the dispatcher ----

    /// Run translated and interpreted code until a pending event or cycle
    /// exhaustion.
    pub fn run(&mut self, regs: &mut Regs, bus: &mut dyn MemBus, fallback: &mut dyn Fallback) -> RunExit {
        loop {
            if !regs.spcflags.is_empty() {
                return RunExit::Pending;
            }
            if regs.countdown <= 0 {
                return RunExit::OutOfCycles;
            }
            let cl = cacheline(regs.pc_p);
            let entry = self.tags.handler(cl);
            let exit = {
                let Jit { buf, tags, blocks, vm: host, .. } = self;
                vm::execute(buf.bytes(), entry, host, regs, bus, blocks, tags, fallback)
            };
            match exit {
                ExitReason::DoNothing => {}
                ExitReason::ExecuteNormal => self.execute_normal(regs, bus, fallback),
                ExitReason::ExecNostats => self.exec_nostats(regs, bus, fallback),
                ExitReason::CacheMiss => self.cache_miss(regs, bus, fallback),
                ExitReason::RecompileBlock => self.recompile_block(regs, bus, fallback),
                ExitReason::CheckChecksum => self.check_checksum(regs, bus, fallback),
            }
        }
    }

    // ---- compilation ----

    /// Translate one recorded block of guest instructions.
    pub fn compile_block(&mut self, pc_hist: &[CpuHistoryEnt], totcycles: i32, bus: &mut dyn MemBus) {
        if !self.enabled || self.cfg.cachesize == 0 || self.cfg.cpu_model < 68020 || pc_hist.is_empty()
        {
            return;
        }
        let blocklen = pc_hist.len();
        assert!(blocklen <= MAXRUN);
        self.compile_count += 1;

        if self.buf.near_full() {
            self.flush_icache_hard();
        }
        self.blocks
            .alloc_blockinfos(&mut self.buf, self.stubs.execute_normal, self.stubs.check_checksum);

        let pc0 = pc_hist[0].pc;
        let count0 = self.cfg.optcount[0];
        let bi = self.blocks.get_blockinfo_addr_new(
            &mut self.tags,
            pc0,
            count0,
            self.stubs.execute_normal,
            &mut self.buf,
        );

        if self.blocks.get(bi).handler.is_some() {
            debug_assert_eq!(
                self.tags.head(cacheline(pc0)),
                Some(bi),
                "compiled block is not its chain head"
            );
            debug_assert!(
                self.blocks.get(bi).count == -1
                    || self.blocks.get(bi).status == BlockStatus::Targetted,
                "unexpected recompilation of a live block"
            );
        }

        let mut optlev = self.blocks.get(bi).optlevel;
        if self.blocks.get(bi).count == -1 {
            optlev += 1;
            while self.cfg.optcount[optlev] == 0 {
                optlev += 1;
            }
            self.blocks.get_mut(bi).count = self.cfg.optcount[optlev] - 1;
        }
        self.blocks.remove_deps(bi); // about to create new code
        self.blocks.get_mut(bi).optlevel = optlev;
        self.blocks.get_mut(bi).pc_p = pc0;

        // Backward flag-liveness pass.
        let mut liveflags = vec![0u8; blocklen + 1];
        liveflags[blocklen] = FlagSet::ALL.bits(); // all flags needed afterwards
        let mut opcodes = vec![0u16; blocklen];
        let mut min_pcp = pc0;
        let mut max_pcp = pc0;
        for i in (0..blocklen).rev() {
            let pc = pc_hist[i].pc;
            min_pcp = min_pcp.min(pc);
            max_pcp = max_pcp.max(pc);
            let op = bus.code_word(pc);
            opcodes[i] = op;
            if self.cfg.compnf {
                let p = self.table.props(op);
                let mut lf = (liveflags[i + 1] & !p.set_flags.bits()) | p.use_flags.bits();
                if p.is_addx && liveflags[i + 1] & FlagSet::Z.bits() == 0 {
                    // Add-with-extend preserves Z only if nonzero; a dead Z
                    // after the instruction is dead before it.
                    lf &= !FlagSet::Z.bits();
                }
                liveflags[i] = lf;
            } else {
                liveflags[i] = FlagSet::ALL.bits();
            }
        }
        self.blocks.get_mut(bi).needed_flags = liveflags[0];

        let scaled = scaled_cycles(totcycles) as u32;
        let max_compile_start = self.buf.max_compile_start();
        let mut branch_end: Option<u32> = None;

        {
            let Jit { buf, tags, blocks, live, cfg, comptbl, table, stubs, .. } = self;
            let stubs = *stubs;
            let mut c = Comp::new(live, buf, &*cfg, bus);

            // Verifying prologue at n*32 + 16, so the body lands on the
            // next 32-byte boundary.
            c.asm.align(32);
            c.asm.nop();
            c.asm.align(16);
            let handler = c.asm.pos();
            blocks.get_mut(bi).handler = Some(handler);
            blocks.get_mut(bi).handler_to_use = handler;
            c.asm.cmp_mem_imm(GuestLoc::PcP, pc0);
            c.asm.jcc_to(Cond::Ne, stubs.cache_miss);

            // Materialize the block's entry environment.
            c.init_comp(pc0);
            let env = blocks.get(bi).env;
            c.match_states(&env);
            let mut was_comp = true;

            let dh = c.asm.pos();
            blocks.get_mut(bi).direct_handler = Some(dh);
            blocks.set_dhtu(bi, dh, c.asm.buf_mut());

            if blocks.get(bi).count >= 0 {
                // Countdown toward the next recompilation.
                c.asm.store_imm(GuestLoc::PcP, pc0);
                c.asm.sub_count(bi);
                c.asm.jcc_to(Cond::Lt, stubs.recompile_block);
            }

            if optlev == 0 {
                // Not worth translating yet: execute normally, no stats.
                c.asm.store_imm(GuestLoc::PcP, pc0);
                c.asm.jmp_to(stubs.exec_nostats);
            } else {
                for i in 0..blocklen {
                    if c.asm.pos() >= max_compile_start {
                        break;
                    }
                    let op = opcodes[i];
                    c.special_mem = SpecialMem::from_bits_truncate(pc_hist[i].specmem);
                    let needed = liveflags[i + 1] & table.props(op).set_flags.bits();
                    let use_nf = needed == 0 && cfg.compnf;
                    let func =
                        if use_nf { comptbl.nf[op as usize] } else { comptbl.ff[op as usize] };
                    c.needflags = needed != 0;

                    let mut failure = false;
                    match func {
                        Some(f) if optlev > 1 => {
                            if !was_comp {
                                c.init_comp(pc_hist[i].pc);
                                was_comp = true;
                            }
                            c.failure = false;
                            f(&mut c, op);
                            failure = c.failure;
                            if !failure {
                                c.freescratch();
                                if liveflags[i + 1] & FlagSet::CZNV.bits() == 0 {
                                    // We can forget about flags.
                                    c.dont_care_flags();
                                }
                            }
                        }
                        _ => failure = true,
                    }

                    if failure {
                        // Fall back to the interpreter for this one opcode.
                        if was_comp {
                            c.flush(true);
                            was_comp = false;
                        }
                        c.asm.store_imm(GuestLoc::PcP, pc_hist[i].pc);
                        c.asm.call_interp(op);
                        if i < blocklen - 1 {
                            // A pending event forces an exit mid-block.
                            c.asm.load(0, GuestLoc::SpcFlags);
                            c.asm.alu_rr(AluOp::Tst, 0, 0, 4);
                            let skip = c.asm.jcc(Cond::Eq);
                            c.asm.sub_mem_imm(GuestLoc::Countdown, scaled);
                            c.asm.jmp_to(stubs.do_nothing);
                            let here = c.asm.pos();
                            c.asm.patch_long(skip, here);
                        }
                    }
                }

                if let Some(br) = c.branch.take() {
                    branch_end = Some(br.not_taken);
                    // Both edges known. Backward branches are predicted
                    // taken: the predicted edge becomes the fall-through.
                    let (t1, t2, cc) = if br.taken < br.not_taken {
                        (br.taken, br.not_taken, br.cc.negate())
                    } else {
                        (br.not_taken, br.taken, br.cc)
                    };

                    let saved = c.live.clone(); // ouch, this is big
                    let branchadd = c.asm.jcc(cc);

                    // Predicted outcome.
                    Self::emit_edge(&mut c, blocks, tags, bi, 0, t1, count0, scaled, stubs);

                    c.asm.align(16);
                    let here = c.asm.pos();
                    c.asm.patch_long(branchadd, here);
                    *c.live = saved;

                    // Not-predicted outcome.
                    Self::emit_edge(&mut c, blocks, tags, bi, 1, t2, count0, scaled, stubs);
                } else {
                    if was_comp {
                        c.flush(true);
                    }
                    if was_comp && c.live.isconst(PC_P) {
                        // The PC is a known constant: single-edge direct
                        // link.
                        let v = c.live.state[PC_P].val;
                        Self::emit_edge(&mut c, blocks, tags, bi, 0, v, count0, scaled, stubs);
                    } else {
                        // Computed PC: constant-time dispatch through the
                        // directory.
                        c.asm.load(REG_PC_TMP as u8, GuestLoc::PcP);
                        c.asm.alu_ri(AluOp::And, REG_PC_TMP as u8, TAGMASK, 4);
                        c.asm.sub_mem_imm(GuestLoc::Countdown, scaled);
                        c.asm.jmp_tags(REG_PC_TMP as u8);
                    }
                }
            }
            c.asm.align(32);
        }

        // Byte extent covered by the block, for invalidation. The recorded
        // end PC is extended by the longest possible instruction.
        let next_pc = branch_end.unwrap_or(0);
        if next_pc >= max_pcp && next_pc < max_pcp + LONGEST_68K_INST {
            max_pcp = next_pc;
        } else {
            max_pcp += LONGEST_68K_INST;
        }
        self.blocks.get_mut(bi).len = max_pcp - min_pcp;
        self.blocks.get_mut(bi).min_pcp = min_pcp;

        self.blocks.remove_from_list(bi);
        if bus.is_rom(min_pcp) && bus.is_rom(max_pcp) {
            // No need to checksum ROM; please don't start changing ROMs in
            // flight.
            self.blocks.get_mut(bi).c1 = 0;
            self.blocks.get_mut(bi).c2 = 0;
            self.blocks.add_to_dormant(bi);
        } else {
            let (c1, c2) = Self::calc_checksum(min_pcp, max_pcp - min_pcp, bus);
            self.blocks.get_mut(bi).c1 = c1;
            self.blocks.get_mut(bi).c2 = c2;
            self.blocks.add_to_active(bi);
        }

        self.blocks.raise_in_cl_list(&mut self.tags, bi);

        // We will flush soon anyway, so do it now.
        if self.buf.near_full() {
            self.flush_icache_hard();
        }
    }

    /// Emit one outgoing edge: match the target's entry environment, charge
    /// cycles, and link straight to its current direct handler with a
    /// recorded dependency; exhausted cycles store the PC and leave.
    #[allow(clippy::too_many_arguments)]
    fn emit_edge(
        c: &mut Comp,
        blocks: &mut BlockArena,
        tags: &mut CacheTags,
        bi: BlockId,
        slot: usize,
        target_pc: u32,
        count0: i32,
        scaled: u32,
        stubs: Stubs,
    ) {
        let tbi = blocks.get_blockinfo_addr_new(
            tags,
            target_pc,
            count0,
            stubs.execute_normal,
            c.asm.buf_mut(),
        );
        if !blocks.get(tbi).havestate {
            let env = c.big_to_small_state();
            blocks.attached_state(tbi, env, c.asm.buf_mut());
        }
        let env = blocks.get(tbi).env;
        c.match_states(&env);

        c.asm.sub_mem_imm(GuestLoc::Countdown, scaled);
        let tba = c.asm.jcc(Cond::Pl);
        let dh = blocks.get(tbi).direct_handler_to_use;
        c.asm.patch_long(tba, dh);
        blocks.create_jmpdep(bi, slot, tba, tbi);

        c.asm.store_imm(GuestLoc::PcP, target_pc);
        c.asm.jmp_to(stubs.do_nothing);
    }
}
