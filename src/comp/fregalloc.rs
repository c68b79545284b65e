//! FP register allocation: the same shape as the integer allocator, minus
//! partial widths, offsets and sub-register constraints.
//!
//! Flushing a dirty FP register emits either a store-and-keep or a
//! store-and-pop depending on whether the value is the last holder, matching
//! the host FPU's stack discipline.

use super::{Comp, RegStatus, VFREGS};
use crate::backend::insn::N_FREGS;

impl<'a> Comp<'a> {
    #[inline]
    pub(crate) fn f_isinreg(&self, r: usize) -> bool {
        matches!(self.live.fate[r].status, RegStatus::Clean | RegStatus::Dirty)
    }

    /// Store and keep.
    pub(crate) fn f_tomem(&mut self, r: usize) {
        if self.live.fate[r].status == RegStatus::Dirty {
            let home = self.live.fate[r].home;
            let rr = self.live.fate[r].realreg as u8;
            self.asm.fstore(home, rr);
            self.live.fate[r].status = RegStatus::Clean;
        }
    }

    /// Store and pop.
    pub(crate) fn f_tomem_drop(&mut self, r: usize) {
        if self.live.fate[r].status == RegStatus::Dirty {
            let home = self.live.fate[r].home;
            let rr = self.live.fate[r].realreg as u8;
            self.asm.fstore_drop(home, rr);
            self.live.fate[r].status = RegStatus::InMem;
        }
    }

    pub(crate) fn f_evict(&mut self, r: usize) {
        if !self.f_isinreg(r) {
            return;
        }
        let rr = self.live.fate[r].realreg as usize;
        if self.live.fat[rr].nholds == 1 {
            self.f_tomem_drop(r);
        } else {
            self.f_tomem(r);
        }

        assert!(
            !(self.live.fat[rr].locked > 0 && self.live.fat[rr].nholds == 1),
            "FP vreg {} in locked freg {}",
            r,
            rr
        );

        self.live.fat[rr].nholds -= 1;
        let nholds = self.live.fat[rr].nholds;
        if nholds != self.live.fate[r].realind {
            let topreg = self.live.fat[rr].holds[nholds as usize] as usize;
            let thisind = self.live.fate[r].realind;
            self.live.fat[rr].holds[thisind as usize] = topreg as i8;
            self.live.fate[topreg].realind = thisind;
        }
        self.live.fat[rr].holds[nholds as usize] = -1;
        self.live.fate[r].status = RegStatus::InMem;
        self.live.fate[r].realreg = -1;
    }

    pub(crate) fn f_free_nreg(&mut self, n: usize) {
        let mut i = self.live.fat[n].nholds;
        while i > 0 {
            i -= 1;
            let vr = self.live.fat[n].holds[i as usize] as usize;
            self.f_evict(vr);
        }
        assert!(self.live.fat[n].nholds == 0, "failed to free freg {}", n);
    }

    pub(crate) fn f_isclean(&mut self, r: usize) {
        if self.f_isinreg(r) {
            self.live.fate[r].status = RegStatus::Clean;
        }
    }

    pub(crate) fn f_disassociate(&mut self, r: usize) {
        self.f_isclean(r);
        self.f_evict(r);
    }

    fn f_alloc_reg(&mut self, r: usize, willclobber: bool) -> usize {
        let mut bestreg: isize = -1;
        let mut when = i64::MAX;
        for i in (0..N_FREGS).rev() {
            let mut badness = self.live.fat[i].touched as i64;
            if self.live.fat[i].nholds == 0 {
                badness = 0;
            }
            if self.live.fat[i].locked == 0 && badness < when {
                bestreg = i as isize;
                when = badness;
                if self.live.fat[i].nholds == 0 {
                    break;
                }
            }
        }
        assert!(bestreg >= 0, "no allocatable FP register");
        let bestreg = bestreg as usize;

        if self.live.fat[bestreg].nholds > 0 {
            self.f_free_nreg(bestreg);
        }
        if self.f_isinreg(r) {
            self.f_evict(r);
        }

        if !willclobber {
            if self.live.fate[r].status != RegStatus::Undef {
                let home = self.live.fate[r].home;
                self.asm.fload(bestreg as u8, home);
            }
            self.live.fate[r].status = RegStatus::Clean;
        } else {
            self.live.fate[r].status = RegStatus::Dirty;
        }
        self.live.fate[r].realreg = bestreg as i8;
        self.live.fate[r].realind = self.live.fat[bestreg].nholds;
        self.live.fat[bestreg].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        let n = self.live.fat[bestreg].nholds as usize;
        self.live.fat[bestreg].holds[n] = r as i8;
        self.live.fat[bestreg].nholds += 1;

        bestreg
    }

    pub fn f_unlock(&mut self, n: usize) {
        assert!(self.live.fat[n].locked > 0, "unlock of unlocked freg {}", n);
        self.live.fat[n].locked -= 1;
    }

    pub fn f_setlock(&mut self, n: usize) {
        self.live.fat[n].locked += 1;
    }

    pub fn f_readreg(&mut self, r: usize) -> usize {
        let answer = if self.f_isinreg(r) {
            self.live.fate[r].realreg as usize
        } else {
            self.f_alloc_reg(r, false)
        };
        self.live.fat[answer].locked += 1;
        self.live.fat[answer].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        answer
    }

    fn f_make_exclusive(&mut self, r: usize, clobber: bool) {
        if !self.f_isinreg(r) {
            return;
        }
        let rr = self.live.fate[r].realreg as usize;
        if self.live.fat[rr].nholds == 1 {
            return;
        }
        let mut ndirt = 0;
        for i in 0..self.live.fat[rr].nholds as usize {
            let vr = self.live.fat[rr].holds[i] as usize;
            if vr != r && self.live.fate[vr].status == RegStatus::Dirty {
                ndirt += 1;
            }
        }
        if ndirt == 0 && self.live.fat[rr].locked == 0 {
            // Everything else is clean, keep this register.
            let mut i = 0;
            while i < self.live.fat[rr].nholds as usize {
                let vr = self.live.fat[rr].holds[i] as usize;
                if vr != r {
                    self.f_evict(vr);
                } else {
                    i += 1;
                }
            }
            assert!(self.live.fat[rr].nholds == 1, "freg {} not exclusive for {}", rr, r);
            return;
        }

        let oldstate = self.live.fate[r];
        self.f_setlock(rr);
        self.f_disassociate(r);
        let nr = self.f_alloc_reg(r, true);
        let nind = self.live.fate[r].realind;
        if !clobber {
            self.asm.fmov_rr(nr as u8, rr as u8);
        }
        self.live.fate[r] = oldstate;
        self.live.fate[r].realreg = nr as i8;
        self.live.fate[r].realind = nind;
        self.f_unlock(rr);
    }

    pub fn f_writereg(&mut self, r: usize) -> usize {
        self.f_make_exclusive(r, true);
        let answer = if self.f_isinreg(r) {
            self.live.fate[r].realreg as usize
        } else {
            self.f_alloc_reg(r, true)
        };
        self.live.fate[r].status = RegStatus::Dirty;
        self.live.fat[answer].locked += 1;
        self.live.fat[answer].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        answer
    }

    pub fn f_rmw(&mut self, r: usize) -> usize {
        self.f_make_exclusive(r, false);
        let n = if self.f_isinreg(r) {
            self.live.fate[r].realreg as usize
        } else {
            self.f_alloc_reg(r, false)
        };
        self.live.fate[r].status = RegStatus::Dirty;
        self.live.fat[n].locked += 1;
        self.live.fat[n].touched = self.live.touchcnt;
        self.live.touchcnt += 1;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::with_comp;
    use super::*;

    #[test]
    fn test_f_readreg_loads_clean() {
        with_comp(|c| {
            let n = c.f_readreg(2);
            assert_eq!(c.live.fate[2].status, RegStatus::Clean);
            assert_eq!(c.live.fate[2].realreg, n as i8);
            c.f_unlock(n);
        });
    }

    #[test]
    fn test_f_writereg_dirty_then_flush_drops() {
        with_comp(|c| {
            let n = c.f_writereg(1);
            c.f_unlock(n);
            assert_eq!(c.live.fate[1].status, RegStatus::Dirty);
            c.f_evict(1);
            // Sole holder: evict used the store-and-pop form, ending INMEM.
            assert_eq!(c.live.fate[1].status, RegStatus::InMem);
            assert_eq!(c.live.fate[1].realreg, -1);
        });
    }

    #[test]
    fn test_f_pressure_evicts() {
        with_comp(|c| {
            for r in 0..VFREGS - 1 {
                let n = c.f_readreg(r);
                c.f_unlock(n);
            }
            let n = c.f_readreg(VFREGS - 1);
            c.f_unlock(n);
            // Every guest FP vreg is still tracked, some in memory.
            for r in 0..VFREGS {
                assert_ne!(c.live.fate[r].status, RegStatus::Undef);
            }
        });
    }
}
