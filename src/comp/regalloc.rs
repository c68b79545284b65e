//! Virtual-to-native integer register allocation.
//!
//! Every guest-operand access goes through `readreg`/`writereg`/`rmw` (or
//! their `_specific` variants that pin a host register). The allocator
//! tracks partial widths per VREG, constants, and deferred additive
//! offsets, and evicts by least-recently-touched host register.
//!
//! Invariants (checked with assertions; violations are programming errors):
//! a VREG in a register appears in exactly one holder list at its recorded
//! index; `dirtysize > 0` iff the VREG is DIRTY; a non-zero deferred offset
//! coexists with in-register state only while `validsize == 4`.

use super::{Comp, NeedFlush, RegStatus, VREGS};
use crate::backend::insn::N_REGS;

impl<'a> Comp<'a> {
    #[inline]
    pub(crate) fn set_status(&mut self, r: usize, status: RegStatus) {
        self.live.state[r].status = status;
    }

    /// Fold a deferred offset into the host register with a lea.
    fn adjust_nreg(&mut self, rr: usize, val: u32) {
        if val == 0 {
            return;
        }
        self.asm.lea(rr as u8, rr as u8, val);
    }

    /// Write a dirty VREG back to its home slot; the store is exactly
    /// `dirtysize` bytes.
    pub(crate) fn tomem(&mut self, r: usize) {
        let rr = self.live.state[r].realreg;

        if self.live.isinreg(r) {
            let rr = rr as usize;
            if self.live.state[r].val != 0
                && self.live.nat[rr].nholds == 1
                && self.live.nat[rr].locked == 0
            {
                let val = self.live.state[r].val;
                self.adjust_nreg(rr, val);
                self.live.state[r].val = 0;
                self.live.state[r].dirtysize = 4;
                self.set_status(r, RegStatus::Dirty);
            }
        }

        if self.live.state[r].status == RegStatus::Dirty {
            let size = self.live.state[r].dirtysize;
            assert!(matches!(size, 1 | 2 | 4), "bad dirtysize {} for vreg {}", size, r);
            let home = self.live.state[r].home;
            self.asm.store(home, rr as u8, size);
            self.set_status(r, RegStatus::Clean);
            self.live.state[r].dirtysize = 0;
        }
    }

    /// Write a constant VREG's value to its home slot.
    pub(crate) fn writeback_const(&mut self, r: usize) {
        if !self.live.isconst(r) {
            return;
        }
        assert!(
            self.live.state[r].needflush != NeedFlush::Handler,
            "trying to write back constant NF_HANDLER"
        );
        let home = self.live.state[r].home;
        let val = self.live.state[r].val;
        self.asm.store_imm(home, val);
        self.live.state[r].val = 0;
        self.set_status(r, RegStatus::InMem);
    }

    /// Push `r` out of its host register (writing back first if dirty),
    /// compacting the holder list.
    pub(crate) fn evict(&mut self, r: usize) {
        if !self.live.isinreg(r) {
            return;
        }
        self.tomem(r);
        let rr = self.live.state[r].realreg as usize;

        assert!(
            !(self.live.nat[rr].locked > 0 && self.live.nat[rr].nholds == 1),
            "vreg {} in locked nreg {}",
            r,
            rr
        );

        self.live.nat[rr].nholds -= 1;
        let nholds = self.live.nat[rr].nholds;
        if nholds != self.live.state[r].realind {
            // Was not last: move the top holder into the vacated slot.
            let topreg = self.live.nat[rr].holds[nholds as usize] as usize;
            let thisind = self.live.state[r].realind;
            self.live.nat[rr].holds[thisind as usize] = topreg as i8;
            self.live.state[topreg].realind = thisind;
        }
        self.live.nat[rr].holds[nholds as usize] = -1;
        self.live.state[r].realreg = -1;
        self.set_status(r, RegStatus::InMem);
    }

    /// Evict every holder of host register `n`.
    pub(crate) fn free_nreg(&mut self, n: usize) {
        let mut i = self.live.nat[n].nholds;
        while i > 0 {
            i -= 1;
            let vr = self.live.nat[n].holds[i as usize] as usize;
            self.evict(vr);
        }
        assert!(self.live.nat[n].nholds == 0, "failed to free nreg {}", n);
    }

    /// Use with care: declares whatever is in the register to be the full,
    /// clean value.
    pub(crate) fn isclean(&mut self, r: usize) {
        if !self.live.isinreg(r) {
            return;
        }
        self.live.state[r].validsize = 4;
        self.live.state[r].dirtysize = 0;
        self.live.state[r].val = 0;
        self.set_status(r, RegStatus::Clean);
    }

    pub(crate) fn disassociate(&mut self, r: usize) {
        self.isclean(r);
        self.evict(r);
    }

    /// Record `r` as the constant `val`, detaching any live register.
    pub fn set_const(&mut self, r: usize, val: u32) {
        self.disassociate(r);
        self.live.state[r].val = val;
        self.set_status(r, RegStatus::IsConst);
    }

    pub fn get_const(&mut self, r: usize) -> u32 {
        assert!(self.live.isconst(r), "register {} should be constant, but isn't", r);
        self.live.state[r].val
    }

    /// The pending deferred offset (or constant) recorded for `r`.
    pub fn get_offset(&self, r: usize) -> u32 {
        self.live.state[r].val
    }

    /// Pick (and clear out) a host register for `r`, preferring the hint,
    /// then empty registers, then least-recently-touched.
    pub(crate) fn alloc_reg_hinted(
        &mut self,
        r: usize,
        size: u8,
        willclobber: bool,
        hint: isize,
    ) -> usize {
        let mut bestreg: isize = -1;
        let mut when = i64::MAX;

        for i in (0..N_REGS).rev() {
            let mut badness = self.live.nat[i].touched as i64;
            if self.live.nat[i].nholds == 0 {
                badness = 0;
            }
            if i as isize == hint {
                badness -= 200_000_000;
            }
            if self.live.nat[i].locked == 0 && badness < when {
                let fits = match size {
                    1 => self.live.nat[i].canbyte,
                    2 => self.live.nat[i].canword,
                    4 => true,
                    _ => panic!("bad allocation size {}", size),
                };
                if fits {
                    bestreg = i as isize;
                    when = badness;
                    if self.live.nat[i].nholds == 0 && hint < 0 {
                        break;
                    }
                    if i as isize == hint {
                        break;
                    }
                }
            }
        }
        assert!(bestreg >= 0, "no allocatable host register at size {}", size);
        let bestreg = bestreg as usize;

        if self.live.nat[bestreg].nholds > 0 {
            self.free_nreg(bestreg);
        }
        if self.live.isinreg(r) {
            let rr = self.live.state[r].realreg as usize;
            // Reading a partially valid register at a bigger size.
            assert!(
                !willclobber && self.live.state[r].validsize < size,
                "unexpected re-allocation of in-register vreg {}",
                r
            );
            assert!(self.live.nat[rr].nholds == 1, "partial vreg {} is not exclusive", r);
            if size == 4 && self.live.state[r].validsize == 2 {
                // Merge the missing high half from home memory. Guest slots
                // are big-endian images, so the reload swaps, masks and
                // swaps back before the add.
                let home = self.live.state[r].home;
                self.asm.load(bestreg as u8, home);
                self.asm.bswap(bestreg as u8);
                self.asm.zext16(rr as u8, rr as u8);
                self.asm.zext16(bestreg as u8, bestreg as u8);
                self.asm.bswap(bestreg as u8);
                self.asm.lea_idx(rr as u8, rr as u8, bestreg as u8, 0, 0);
                self.live.state[r].validsize = 4;
                self.live.nat[rr].touched = self.live.touchcnt;
                self.live.touchcnt += 1;
                return rr;
            }
            self.evict(r);
        }

        if !willclobber {
            if self.live.state[r].status != RegStatus::Undef {
                if self.live.isconst(r) {
                    let val = self.live.state[r].val;
                    self.asm.mov_ri(bestreg as u8, val);
                    self.live.state[r].val = 0;
                    self.live.state[r].dirtysize = 4;
                    self.set_status(r, RegStatus::Dirty);
                } else {
                    let home = self.live.state[r].home;
                    self.asm.load(bestreg as u8, home);
                    self.live.state[r].dirtysize = 0;
                    self.set_status(r, RegStatus::Clean);
                }
            } else {
                self.live.state[r].val = 0;
                self.live.state[r].dirtysize = 0;
                self.set_status(r, RegStatus::Clean);
            }
            self.live.state[r].validsize = 4;
        } else {
            // Will be clobbered: no load needed, but constants narrower
            // than the write still have to be materialized.
            if !self.live.isconst(r) || size == 4 {
                self.live.state[r].validsize = size;
                self.live.state[r].dirtysize = size;
                self.live.state[r].val = 0;
                self.set_status(r, RegStatus::Dirty);
            } else {
                if self.live.state[r].status != RegStatus::Undef {
                    let val = self.live.state[r].val;
                    self.asm.mov_ri(bestreg as u8, val);
                }
                self.live.state[r].val = 0;
                self.live.state[r].validsize = 4;
                self.live.state[r].dirtysize = 4;
                self.set_status(r, RegStatus::Dirty);
            }
        }
        self.live.state[r].realreg = bestreg as i8;
        self.live.state[r].realind = self.live.nat[bestreg].nholds;
        self.live.nat[bestreg].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        let n = self.live.nat[bestreg].nholds as usize;
        self.live.nat[bestreg].holds[n] = r as i8;
        self.live.nat[bestreg].nholds += 1;

        bestreg
    }

    /// Release a lock taken by readreg/writereg/rmw.
    pub fn unlock2(&mut self, n: usize) {
        assert!(self.live.nat[n].locked > 0, "unlock of unlocked nreg {}", n);
        self.live.nat[n].locked -= 1;
    }

    pub fn setlock(&mut self, n: usize) {
        self.live.nat[n].locked += 1;
    }

    /// Move every holder of host register `s` into `d` (clearing `d`
    /// first), fixing up the aliases.
    pub(crate) fn mov_nregs(&mut self, d: usize, s: usize) {
        if s == d {
            return;
        }
        if self.live.nat[d].nholds > 0 {
            self.free_nreg(d);
        }
        self.asm.mov_rr(d as u8, s as u8, 4);

        for i in 0..self.live.nat[s].nholds as usize {
            let vs = self.live.nat[s].holds[i] as usize;
            self.live.state[vs].realreg = d as i8;
            self.live.state[vs].realind = i as u8;
            self.live.nat[d].holds[i] = vs as i8;
        }
        self.live.nat[d].nholds = self.live.nat[s].nholds;
        self.live.nat[s].nholds = 0;
    }

    /// Make `r` the sole holder of its host register before a write. If the
    /// other aliases are all clean the register is kept; otherwise `r` is
    /// copied out into a fresh register.
    pub(crate) fn make_exclusive(&mut self, r: usize, size: u8, spec: isize) {
        if !self.live.isinreg(r) {
            return;
        }
        let rr = self.live.state[r].realreg as usize;
        if self.live.nat[rr].nholds == 1 {
            return;
        }

        let mut ndirt = 0;
        for i in 0..self.live.nat[rr].nholds as usize {
            let vr = self.live.nat[rr].holds[i] as usize;
            if vr != r && (self.live.state[vr].status == RegStatus::Dirty || self.live.state[vr].val != 0)
            {
                ndirt += 1;
            }
        }
        if ndirt == 0 && size < self.live.state[r].validsize && self.live.nat[rr].locked == 0 {
            // Everything else is clean, so keep this register.
            let mut i = 0;
            while i < self.live.nat[rr].nholds as usize {
                let vr = self.live.nat[rr].holds[i] as usize;
                if vr != r {
                    self.evict(vr);
                    // Try that index again; eviction compacted the list.
                } else {
                    i += 1;
                }
            }
            assert!(
                self.live.nat[rr].nholds == 1,
                "nreg {} still holds {} vregs, {} not exclusive",
                rr,
                self.live.nat[rr].nholds,
                r
            );
            return;
        }

        // Split: copy r out into a register of its own.
        let oldstate = self.live.state[r];
        self.setlock(rr);
        self.disassociate(r);
        let nr = if oldstate.status == RegStatus::Dirty {
            // A narrow dirty value needs a register that can store at the
            // eventual smaller size.
            self.alloc_reg_hinted(r, oldstate.dirtysize, true, spec)
        } else {
            self.alloc_reg_hinted(r, 4, true, spec)
        };
        let nind = self.live.state[r].realind;
        self.live.state[r] = oldstate;
        self.live.state[r].realreg = nr as i8;
        self.live.state[r].realind = nind;

        if size < self.live.state[r].validsize {
            if self.live.state[r].val != 0 {
                // Might as well fold the offset during the copy.
                self.asm.lea(nr as u8, rr as u8, oldstate.val);
                self.live.state[r].val = 0;
                self.live.state[r].dirtysize = 4;
                self.set_status(r, RegStatus::Dirty);
            } else {
                self.asm.mov_rr(nr as u8, rr as u8, 4);
            }
        }
        self.unlock2(rr);
    }

    /// Defer an additive immediate: record it in `val` without emitting
    /// code. Only legal while the full width is valid.
    pub(crate) fn add_offset(&mut self, r: usize, off: u32) {
        self.live.state[r].val = self.live.state[r].val.wrapping_add(off);
    }

    /// Collapse a deferred offset into the host register.
    pub(crate) fn remove_offset(&mut self, r: usize, spec: isize) {
        if self.live.isconst(r) {
            return;
        }
        if self.live.state[r].val == 0 {
            return;
        }
        if self.live.isinreg(r) && self.live.state[r].validsize < 4 {
            self.evict(r);
        }
        if !self.live.isinreg(r) {
            self.alloc_reg_hinted(r, 4, false, spec);
        }
        assert!(
            self.live.state[r].validsize == 4,
            "validsize {} in remove_offset",
            self.live.state[r].validsize
        );
        self.make_exclusive(r, 0, -1);
        // make_exclusive might have folded the offset already.
        if self.live.state[r].val == 0 {
            return;
        }
        let rr = self.live.state[r].realreg as usize;
        assert!(self.live.nat[rr].nholds == 1, "failed to make vreg {} exclusive", r);
        let val = self.live.state[r].val;
        self.adjust_nreg(rr, val);
        self.live.state[r].dirtysize = 4;
        self.live.state[r].val = 0;
        self.set_status(r, RegStatus::Dirty);
    }

    fn readreg_general(&mut self, r: usize, size: u8, spec: isize, can_offset: bool) -> usize {
        if self.live.state[r].status == RegStatus::Undef {
            log::warn!("unexpected read of undefined register {}", r);
        }
        if !can_offset {
            self.remove_offset(r, spec);
        }

        let mut answer: isize = -1;
        if self.live.isinreg(r) && self.live.state[r].validsize >= size {
            let n = self.live.state[r].realreg as usize;
            let usable = match size {
                1 => self.live.nat[n].canbyte || spec >= 0,
                2 => self.live.nat[n].canword || spec >= 0,
                4 => true,
                _ => panic!("bad read size {}", size),
            };
            if usable {
                answer = n as isize;
            } else {
                self.evict(r);
            }
        }
        // Either the value started in memory, or it was evicted and is in
        // memory now.
        if answer < 0 {
            answer = self.alloc_reg_hinted(r, if spec >= 0 { 4 } else { size }, false, spec) as isize;
        }
        let mut answer = answer as usize;

        if spec >= 0 && spec as usize != answer {
            self.mov_nregs(spec as usize, answer);
            answer = spec as usize;
        }
        self.live.nat[answer].locked += 1;
        self.live.nat[answer].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        answer
    }

    /// Host register holding `r`, valid to at least `size` bytes, locked.
    pub fn readreg(&mut self, r: usize, size: u8) -> usize {
        self.readreg_general(r, size, -1, false)
    }

    /// Like `readreg`, pinned to host register `spec`.
    pub fn readreg_specific(&mut self, r: usize, size: u8, spec: isize) -> usize {
        self.readreg_general(r, size, spec, false)
    }

    /// Like `readreg`, but a deferred offset may stay pending.
    pub fn readreg_offset(&mut self, r: usize, size: u8) -> usize {
        self.readreg_general(r, size, -1, true)
    }

    fn writereg_general(&mut self, r: usize, size: u8, spec: isize) -> usize {
        if size < 4 {
            self.remove_offset(r, spec);
        }
        self.make_exclusive(r, size, spec);

        let mut answer: isize = -1;
        if self.live.isinreg(r) {
            let nvsize = self.live.state[r].validsize.max(size);
            let ndsize = self.live.state[r].dirtysize.max(size);
            let n = self.live.state[r].realreg as usize;
            assert!(self.live.nat[n].nholds == 1, "write target {} not exclusive", r);
            let usable = match size {
                1 => self.live.nat[n].canbyte || spec >= 0,
                2 => self.live.nat[n].canword || spec >= 0,
                4 => true,
                _ => panic!("bad write size {}", size),
            };
            if usable {
                self.live.state[r].dirtysize = ndsize;
                self.live.state[r].validsize = nvsize;
                answer = n as isize;
            } else {
                self.evict(r);
            }
        }
        if answer < 0 {
            answer = self.alloc_reg_hinted(r, size, true, spec) as isize;
        }
        let mut answer = answer as usize;
        if spec >= 0 && spec as usize != answer {
            self.mov_nregs(spec as usize, answer);
            answer = spec as usize;
        }
        if self.live.state[r].status == RegStatus::Undef {
            self.live.state[r].validsize = 4;
        }
        self.live.state[r].dirtysize = self.live.state[r].dirtysize.max(size);
        self.live.state[r].validsize = self.live.state[r].validsize.max(size);

        self.live.nat[answer].locked += 1;
        self.live.nat[answer].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        if size == 4 {
            self.live.state[r].val = 0;
        } else {
            assert!(self.live.state[r].val == 0, "narrow write with pending offset on {}", r);
        }
        self.set_status(r, RegStatus::Dirty);
        answer
    }

    /// Host register for writing `size` bytes of `r`; `r` becomes the sole
    /// holder and is marked dirty.
    pub fn writereg(&mut self, r: usize, size: u8) -> usize {
        self.writereg_general(r, size, -1)
    }

    pub fn writereg_specific(&mut self, r: usize, size: u8, spec: isize) -> usize {
        self.writereg_general(r, size, spec)
    }

    fn rmw_general(&mut self, r: usize, wsize: u8, rsize: u8, spec: isize) -> usize {
        if self.live.state[r].status == RegStatus::Undef {
            log::warn!("unexpected read of undefined register {}", r);
        }
        self.remove_offset(r, spec);
        self.make_exclusive(r, 0, spec);

        assert!(wsize >= rsize, "cannot handle wsize < rsize in rmw");

        let mut answer: isize = -1;
        if self.live.isinreg(r) && self.live.state[r].validsize >= rsize {
            let n = self.live.state[r].realreg as usize;
            assert!(self.live.nat[n].nholds == 1, "rmw target {} not exclusive", r);
            let usable = match rsize {
                1 => self.live.nat[n].canbyte || spec >= 0,
                2 => self.live.nat[n].canword || spec >= 0,
                4 => true,
                _ => panic!("bad rmw size {}", rsize),
            };
            if usable {
                answer = n as isize;
            } else {
                self.evict(r);
            }
        }
        if answer < 0 {
            answer = self.alloc_reg_hinted(r, if spec >= 0 { 4 } else { rsize }, false, spec) as isize;
        }
        let mut answer = answer as usize;
        if spec >= 0 && spec as usize != answer {
            self.mov_nregs(spec as usize, answer);
            answer = spec as usize;
        }
        self.live.state[r].dirtysize = self.live.state[r].dirtysize.max(wsize);
        self.live.state[r].validsize = self.live.state[r].validsize.max(wsize);
        self.set_status(r, RegStatus::Dirty);

        self.live.nat[answer].locked += 1;
        self.live.nat[answer].touched = self.live.touchcnt;
        self.live.touchcnt += 1;

        assert!(self.live.state[r].val == 0, "rmw with pending offset on {}", r);
        answer
    }

    /// Read `r` at `rsize`, then promote to dirty at `wsize`.
    pub fn rmw(&mut self, r: usize, wsize: u8, rsize: u8) -> usize {
        self.rmw_general(r, wsize, rsize, -1)
    }

    pub fn rmw_specific(&mut self, r: usize, wsize: u8, rsize: u8, spec: isize) -> usize {
        self.rmw_general(r, wsize, rsize, spec)
    }

    /// Check the holder-list invariants; cheap enough to run in tests and
    /// after full flushes.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        for r in 0..VREGS {
            let st = &self.live.state[r];
            if self.live.isinreg(r) {
                let rr = st.realreg as usize;
                assert_eq!(
                    self.live.nat[rr].holds[st.realind as usize], r as i8,
                    "vreg {} not at its recorded holder position",
                    r
                );
                assert!((st.dirtysize > 0) == (st.status == RegStatus::Dirty));
            } else {
                assert_eq!(st.realreg, -1, "vreg {} has stale realreg", r);
            }
        }
        for n in 0..N_REGS {
            let nat = &self.live.nat[n];
            for i in 0..nat.nholds as usize {
                let vr = nat.holds[i] as usize;
                assert_eq!(self.live.state[vr].realreg, n as i8);
                assert_eq!(self.live.state[vr].realind as usize, i);
            }
        }
    }
}
