//! Block-edge register-state matching.
//!
//! A linked jump enters the target block's code directly, so the register
//! topology at the jump site must equal the one the target was compiled
//! against. `big_to_small_state` captures the per-host-register summary;
//! `match_states` emits the spills, shuffles and loads that transform the
//! current live state into a captured one. The shuffle itself (`vinton`)
//! recurses at most `N_REGS` deep; a cycle in the wanted permutation is
//! broken because `mov_nregs` evicts the destination's holders first.

use super::{Comp, RegStatus, SmallState, PC_P, VFREGS, VREGS};
use crate::backend::insn::N_REGS;
use crate::comp::NeedFlush;

impl<'a> Comp<'a> {
    /// Summarize the live topology: for each host register, its top holder
    /// and the sizes that holder is valid/dirty at.
    ///
    /// Dirty tracking across edges is intentionally conservative: the
    /// capture zeroes every dirtysize, so edges always write dirty values
    /// back before jumping.
    pub fn big_to_small_state(&self) -> SmallState {
        let mut s = SmallState::default();
        for i in 0..N_REGS {
            if self.live.nat[i].nholds > 0 {
                let index = self.live.nat[i].nholds as usize - 1;
                let r = self.live.nat[i].holds[index] as usize;
                s.nat[i].holds = r as i8;
                s.nat[i].validsize = self.live.state[r].validsize;
                s.nat[i].dirtysize = 0;
            }
        }
        s
    }

    /// Route VREG `i` into its wanted host register, first recursively
    /// displacing whatever occupies it.
    fn vinton(&mut self, i: usize, vton: &[i8; VREGS], depth: usize) {
        assert!(vton[i] != -1, "asked to shuffle register {}, but nowhere to go", i);
        let n = vton[i] as usize;
        assert!(
            self.live.nat[n].nholds <= 1,
            "shuffle target nreg {} is not exclusive",
            n
        );
        if self.live.nat[n].nholds > 0 && depth < N_REGS {
            let occupant = self.live.nat[n].holds[0] as usize;
            self.vinton(occupant, vton, depth + 1);
        }
        if !self.live.isinreg(i) {
            // Displaced by the recursive calls.
            return;
        }
        let rr = self.live.state[i].realreg as usize;
        if rr != n {
            self.mov_nregs(n, rr);
        }
    }

    /// Emit whatever is needed to make the live state match `s`, an
    /// elaborate cousin of `flush`.
    pub fn match_states(&mut self, s: &SmallState) {
        let mut vton = [-1i8; VREGS];
        for i in 0..N_REGS {
            if s.nat[i].validsize > 0 {
                vton[s.nat[i].holds as usize] = i as i8;
            }
        }

        self.flush_flags();
        self.sync_m68k_pc();

        // FP registers carry no state across edges.
        for i in 0..VFREGS {
            if self.live.fate[i].needflush == NeedFlush::Scratch
                || self.live.fate[i].status == RegStatus::Clean
            {
                self.f_disassociate(i);
            }
        }
        for i in 0..VFREGS {
            if self.live.fate[i].needflush == NeedFlush::ToMem
                && self.live.fate[i].status == RegStatus::Dirty
            {
                self.f_evict(i);
            }
        }

        // All deferred offsets collapse first.
        for i in 0..VREGS {
            if !self.live.isconst(i) && self.live.state[i].val != 0 {
                self.remove_offset(i, -1);
            }
        }

        // Evict what does not end up in registers, write back overly dirty
        // values, write back constants.
        for i in 0..VREGS {
            match self.live.state[i].status {
                RegStatus::IsConst => {
                    if i != PC_P {
                        self.writeback_const(i);
                    }
                }
                RegStatus::Dirty => {
                    let n = vton[i];
                    if n == -1 {
                        self.evict(i);
                        continue;
                    }
                    if self.live.state[i].dirtysize > s.nat[n as usize].dirtysize {
                        self.tomem(i);
                    }
                    self.keep_or_evict(i, &vton, s);
                }
                RegStatus::Clean => {
                    self.keep_or_evict(i, &vton, s);
                }
                RegStatus::InMem | RegStatus::Undef => {}
            }
        }

        // Consistency: everything still in a register is exclusive and
        // wanted.
        for i in 0..VREGS {
            if self.live.isinreg(i) {
                let n = self.live.state[i].realreg as usize;
                assert!(self.live.nat[n].nholds == 1, "register {} isn't alone in nreg {}", i, n);
                assert!(vton[i] != -1, "register {} is still in a register, shouldn't be", i);
            }
        }

        // Shuffle into the wanted host registers.
        for i in 0..VREGS {
            if self.live.isinreg(i) && vton[i] != self.live.state[i].realreg {
                self.vinton(i, &vton, 0);
            }
        }

        // Load the rest from memory.
        for i in 0..VREGS {
            let n = vton[i];
            if n == -1 {
                assert!(!self.live.isinreg(i), "register {} unexpectedly still resident", i);
                continue;
            }
            let n = n as usize;
            match self.live.state[i].status {
                RegStatus::Clean | RegStatus::Dirty => {
                    assert_eq!(self.live.state[i].realreg, n as i8);
                }
                RegStatus::InMem => {
                    assert!(
                        self.live.nat[n].nholds == 0,
                        "nreg {} holds {} vregs, should be empty",
                        n,
                        self.live.nat[n].nholds
                    );
                    let home = self.live.state[i].home;
                    self.asm.load(n as u8, home);
                    self.live.state[i].validsize = 4;
                    self.live.state[i].dirtysize = 0;
                    self.live.state[i].realreg = n as i8;
                    self.live.state[i].realind = 0;
                    self.live.state[i].val = 0;
                    self.live.nat[n].nholds = 1;
                    self.live.nat[n].holds[0] = i as i8;
                    self.set_status(i, RegStatus::Clean);
                }
                RegStatus::IsConst => {
                    assert!(i == PC_P, "got constant in matchstate for reg {}", i);
                }
                RegStatus::Undef => {}
            }
        }

        // Final adjustment of sizes to the captured ones.
        for i in 0..VREGS {
            let n = vton[i];
            match self.live.state[i].status {
                RegStatus::InMem => assert!(n == -1),
                RegStatus::IsConst => assert!(i == PC_P),
                RegStatus::Clean | RegStatus::Dirty => {
                    let n = n as usize;
                    assert!(self.live.state[i].dirtysize <= s.nat[n].dirtysize);
                    assert!(self.live.state[i].validsize >= s.nat[n].validsize);
                    self.live.state[i].dirtysize = s.nat[n].dirtysize;
                    self.live.state[i].validsize = s.nat[n].validsize;
                    if self.live.state[i].dirtysize > 0 {
                        self.set_status(i, RegStatus::Dirty);
                    }
                }
                RegStatus::Undef => {}
            }
            if n != -1 {
                self.live.nat[n as usize].touched = self.live.touchcnt;
                self.live.touchcnt += 1;
            }
        }
    }

    /// The shared tail of the Clean/Dirty cases: keep the register when the
    /// captured state wants it at no more width than we have, else evict.
    fn keep_or_evict(&mut self, i: usize, vton: &[i8; VREGS], s: &SmallState) {
        let n = vton[i];
        if n == -1 || self.live.state[i].validsize < s.nat[n as usize].validsize {
            self.evict(i);
        } else {
            self.make_exclusive(i, 0, -1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::with_comp;
    use super::*;

    #[test]
    fn test_empty_state_match_is_full_flush() {
        with_comp(|c| {
            let n = c.writereg(3, 4);
            c.unlock2(n);
            c.match_states(&SmallState::default());
            for i in 0..16 {
                assert!(!c.live.isinreg(i));
            }
            for n in 0..N_REGS {
                assert_eq!(c.live.nat[n].nholds, 0);
            }
        });
    }

    #[test]
    fn test_round_trip_capture_match_capture() {
        // big_to_small_state(b); match_states(s) starting from b yields a
        // topology whose capture is s again (modulo sizes).
        with_comp(|c| {
            let n = c.readreg(2, 4);
            c.unlock2(n);
            let n = c.readreg(5, 4);
            c.unlock2(n);
            let s = c.big_to_small_state();
            c.match_states(&s);
            let s2 = c.big_to_small_state();
            for i in 0..N_REGS {
                assert_eq!(s.nat[i].holds, s2.nat[i].holds, "holder mismatch in nreg {}", i);
                assert!(s2.nat[i].validsize >= s.nat[i].validsize);
            }
            c.check_consistency();
        });
    }

    #[test]
    fn test_match_states_shuffles_into_wanted_regs() {
        with_comp(|c| {
            // Build a topology, capture it, then scramble and re-match.
            let n = c.readreg(1, 4);
            c.unlock2(n);
            let n = c.readreg(2, 4);
            c.unlock2(n);
            let want = c.big_to_small_state();

            // Scramble: flush everything, then load the vregs into
            // different registers (opposite order biases the LRU choice).
            c.flush(true);
            let n = c.readreg(2, 4);
            c.unlock2(n);
            let n = c.readreg(1, 4);
            c.unlock2(n);

            c.match_states(&want);
            let got = c.big_to_small_state();
            for i in 0..N_REGS {
                if want.nat[i].validsize > 0 {
                    assert_eq!(got.nat[i].holds, want.nat[i].holds, "nreg {} holds wrong vreg", i);
                }
            }
            c.check_consistency();
        });
    }

    #[test]
    fn test_match_states_loads_from_memory() {
        with_comp(|c| {
            let n = c.readreg(7, 4);
            c.unlock2(n);
            let want = c.big_to_small_state();
            c.flush(true);
            assert!(!c.live.isinreg(7));
            let before = c.asm.pos();
            c.match_states(&want);
            assert!(c.asm.pos() > before, "reload must emit a load");
            assert!(c.live.isinreg(7));
            assert_eq!(c.live.state[7].status, RegStatus::Clean);
        });
    }
}
