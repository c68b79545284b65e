//! Mid-level emit helpers: operations on virtual registers that combine
//! allocation, flag bookkeeping and host-op emission. The per-opcode
//! compile functions are written almost entirely in terms of these.

use super::{Comp, FLAGX, S2};
use crate::backend::insn::{AluOp, Cond, ShiftOp};

impl<'a> Comp<'a> {
    // ---- moves ----

    /// `d <- imm` as a recorded constant; no code emitted.
    pub fn mov_l_ri(&mut self, d: usize, imm: u32) {
        self.set_const(d, imm);
    }

    /// Full-width register move. Constants fold; otherwise `d` becomes an
    /// alias of `s`'s host register, sharing any deferred offset.
    pub fn mov_l_rr(&mut self, d: usize, s: usize) {
        if d == s {
            return;
        }
        if self.live.isconst(s) {
            let v = self.live.state[s].val;
            self.mov_l_ri(d, v);
            return;
        }
        self.disassociate(d);
        let rs = self.readreg_offset(s, 4);
        self.live.state[d].realreg = rs as i8;
        self.live.state[d].realind = self.live.nat[rs].nholds;
        self.live.state[d].val = self.live.state[s].val;
        self.live.state[d].validsize = 4;
        self.live.state[d].dirtysize = 4;
        self.set_status(d, super::RegStatus::Dirty);
        let n = self.live.nat[rs].nholds as usize;
        self.live.nat[rs].holds[n] = d as i8;
        self.live.nat[rs].nholds += 1;
        self.unlock2(rs);
    }

    /// Partial-width copy; upper bytes of `d` are preserved.
    pub fn mov_w_rr(&mut self, d: usize, s: usize) {
        let rs = self.readreg(s, 2);
        let rd = self.writereg(d, 2);
        self.asm.mov_rr(rd as u8, rs as u8, 2);
        self.unlock2(rd);
        self.unlock2(rs);
    }

    pub fn mov_b_rr(&mut self, d: usize, s: usize) {
        let rs = self.readreg(s, 1);
        let rd = self.writereg(d, 1);
        self.asm.mov_rr(rd as u8, rs as u8, 1);
        self.unlock2(rd);
        self.unlock2(rs);
    }

    /// Add an immediate without flag effects. Folds into constants or the
    /// deferred offset; no code is emitted until materialization.
    pub fn add_l_ri(&mut self, d: usize, imm: u32) {
        if self.live.isconst(d) {
            let v = self.live.state[d].val.wrapping_add(imm);
            self.live.state[d].val = v;
            return;
        }
        self.add_offset(d, imm);
    }

    // ---- arithmetic with guest flag semantics ----

    /// `d op= s` at `size`, generating guest flags when the instruction's
    /// flag effects are observable. `set_x` additionally copies the carry
    /// into the X carrier (the add/sub families).
    pub fn alu_rr_f(&mut self, op: AluOp, size: u8, d: usize, s: usize, set_x: bool) {
        if !self.needflags && matches!(op, AluOp::Cmp | AluOp::Tst) {
            return;
        }
        self.clobber_flags();
        let rs = self.readreg(s, size);
        let rd = if matches!(op, AluOp::Cmp | AluOp::Tst) {
            self.readreg(d, size)
        } else {
            self.rmw(d, size, size)
        };
        self.asm.alu_rr(op, rd as u8, rs as u8, size);
        self.unlock2(rd);
        self.unlock2(rs);
        if self.needflags {
            self.flags_are_in_flags();
            if set_x {
                self.duplicate_carry();
            }
        }
    }

    /// `d op= imm` at `size`, with the same flag contract.
    pub fn alu_ri_f(&mut self, op: AluOp, size: u8, d: usize, imm: u32, set_x: bool) {
        if !self.needflags && matches!(op, AluOp::Cmp | AluOp::Tst) {
            return;
        }
        self.clobber_flags();
        let rd = if matches!(op, AluOp::Cmp | AluOp::Tst) {
            self.readreg(d, size)
        } else {
            self.rmw(d, size, size)
        };
        self.asm.alu_ri(op, rd as u8, imm, size);
        self.unlock2(rd);
        if self.needflags {
            self.flags_are_in_flags();
            if set_x {
                self.duplicate_carry();
            }
        }
    }

    /// Copy the just-produced carry into FLAGX.
    fn duplicate_carry(&mut self) {
        let xr = self.writereg(FLAGX, 4);
        self.asm.setcc(Cond::Cs, xr as u8);
        self.unlock2(xr);
    }

    /// Move with CCR update (N/Z from the value, V/C cleared).
    pub fn mov_f(&mut self, size: u8, d: usize, s: usize) {
        if !self.needflags {
            if size == 4 {
                self.mov_l_rr(d, s);
            } else if size == 2 {
                self.mov_w_rr(d, s);
            } else {
                self.mov_b_rr(d, s);
            }
            return;
        }
        self.clobber_flags();
        let rs = self.readreg(s, size);
        let rd = self.writereg(d, size);
        self.asm.mov_rr(rd as u8, rs as u8, size);
        self.asm.alu_rr(AluOp::Tst, rd as u8, rd as u8, size);
        self.unlock2(rd);
        self.unlock2(rs);
        self.flags_are_in_flags();
    }

    /// Immediate move with CCR update.
    pub fn mov_ri_f(&mut self, size: u8, d: usize, imm: u32) {
        if !self.needflags && size == 4 {
            self.mov_l_ri(d, imm);
            return;
        }
        self.clobber_flags();
        if size == 4 {
            let rd = self.writereg(d, 4);
            self.asm.mov_ri(rd as u8, imm);
            if self.needflags {
                self.asm.alu_rr(AluOp::Tst, rd as u8, rd as u8, 4);
            }
            self.unlock2(rd);
        } else {
            // Partial immediate write goes through AND/OR to preserve the
            // upper bytes.
            let rd = self.rmw(d, size, size);
            let mask = if size == 1 { 0xffff_ff00u32 } else { 0xffff_0000u32 };
            self.asm.alu_ri(AluOp::And, rd as u8, mask, 4);
            self.asm.alu_ri(AluOp::Or, rd as u8, imm & !mask, 4);
            if self.needflags {
                self.asm.alu_rr(AluOp::Tst, rd as u8, rd as u8, size);
            }
            self.unlock2(rd);
        }
        if self.needflags {
            self.flags_are_in_flags();
        }
    }

    /// TST: flags from the value, nothing written.
    pub fn tst_f(&mut self, size: u8, s: usize) {
        if !self.needflags {
            return;
        }
        self.clobber_flags();
        let rs = self.readreg(s, size);
        self.asm.alu_rr(AluOp::Tst, rs as u8, rs as u8, size);
        self.unlock2(rs);
        self.flags_are_in_flags();
    }

    /// CLR: zero at `size` (upper bytes preserved), Z set, N/V/C clear.
    pub fn clr_f(&mut self, size: u8, d: usize) {
        self.clobber_flags();
        let rd = self.writereg(d, size);
        self.asm.alu_ri(AluOp::And, rd as u8, 0, size);
        self.unlock2(rd);
        if self.needflags {
            self.flags_are_in_flags();
        }
    }

    /// NOT: complement at `size`, N/Z from result, V/C clear.
    pub fn not_f(&mut self, size: u8, d: usize) {
        self.clobber_flags();
        let rd = self.rmw(d, size, size);
        self.asm.alu_ri(AluOp::Xor, rd as u8, 0xffff_ffff, size);
        self.unlock2(rd);
        if self.needflags {
            self.flags_are_in_flags();
        }
    }

    /// EXT.W: sign-extend the low byte into the low word.
    pub fn ext_w_f(&mut self, d: usize) {
        self.clobber_flags();
        let rd = self.rmw(d, 2, 1);
        let t = self.writereg(S2, 4);
        self.asm.sext8(t as u8, rd as u8);
        self.asm.mov_rr(rd as u8, t as u8, 2);
        if self.needflags {
            self.asm.alu_rr(AluOp::Tst, t as u8, t as u8, 2);
        }
        self.unlock2(t);
        self.unlock2(rd);
        if self.needflags {
            self.flags_are_in_flags();
        }
    }

    /// EXT.L: sign-extend the low word into the full register.
    pub fn ext_l_f(&mut self, d: usize) {
        self.clobber_flags();
        let rd = self.rmw(d, 4, 2);
        self.asm.sext16(rd as u8, rd as u8);
        if self.needflags {
            self.asm.alu_rr(AluOp::Tst, rd as u8, rd as u8, 4);
        }
        self.unlock2(rd);
        if self.needflags {
            self.flags_are_in_flags();
        }
    }

    // ---- address arithmetic (no guest flag effects) ----

    /// `d <- s + disp`, via constant folding or alias-plus-offset.
    pub fn lea_l_brr(&mut self, d: usize, s: usize, disp: u32) {
        if self.live.isconst(s) {
            let v = self.live.state[s].val.wrapping_add(disp);
            self.mov_l_ri(d, v);
            return;
        }
        self.mov_l_rr(d, s);
        self.add_l_ri(d, disp);
    }

    /// `d <- base + (index << scale) + disp`.
    pub fn lea_l_brr_indexed(&mut self, d: usize, base: usize, index: usize, scale: u8, disp: u32) {
        let rb = self.readreg(base, 4);
        let ri = self.readreg(index, 4);
        let rd = self.writereg(d, 4);
        self.asm.lea_idx(rd as u8, rb as u8, ri as u8, scale, disp);
        self.unlock2(rd);
        self.unlock2(ri);
        self.unlock2(rb);
    }

    /// `d += s`, clobbering flags (address math, not guest ADD).
    pub fn add_l(&mut self, d: usize, s: usize) {
        self.clobber_flags();
        let rs = self.readreg(s, 4);
        let rd = self.rmw(d, 4, 4);
        self.asm.alu_rr(AluOp::Add, rd as u8, rs as u8, 4);
        self.unlock2(rd);
        self.unlock2(rs);
    }

    pub fn and_l_ri(&mut self, d: usize, imm: u32) {
        self.clobber_flags();
        let rd = self.rmw(d, 4, 4);
        self.asm.alu_ri(AluOp::And, rd as u8, imm, 4);
        self.unlock2(rd);
    }

    pub fn shrl_l_ri(&mut self, d: usize, amt: u8) {
        self.clobber_flags();
        let rd = self.rmw(d, 4, 4);
        self.asm.shift_ri(ShiftOp::Shr, rd as u8, amt, 4);
        self.unlock2(rd);
    }

    pub fn shll_l_ri(&mut self, d: usize, amt: u8) {
        self.clobber_flags();
        let rd = self.rmw(d, 4, 4);
        self.asm.shift_ri(ShiftOp::Shl, rd as u8, amt, 4);
        self.unlock2(rd);
    }

    pub fn sign_extend_16_rr(&mut self, d: usize, s: usize) {
        let rs = self.readreg(s, 2);
        let rd = self.writereg(d, 4);
        self.asm.sext16(rd as u8, rs as u8);
        self.unlock2(rd);
        self.unlock2(rs);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::with_comp;
    use super::*;
    use crate::comp::RegStatus;

    #[test]
    fn test_mov_l_rr_aliases() {
        with_comp(|c| {
            c.mov_l_rr(1, 0);
            let r0 = c.live.state[0].realreg;
            assert_eq!(c.live.state[1].realreg, r0);
            assert_eq!(c.live.nat[r0 as usize].nholds, 2);
            assert_eq!(c.live.state[1].status, RegStatus::Dirty);
            c.check_consistency();
        });
    }

    #[test]
    fn test_mov_const_folds() {
        with_comp(|c| {
            c.mov_l_ri(0, 77);
            c.mov_l_rr(1, 0);
            assert!(c.live.isconst(1));
            assert_eq!(c.live.state[1].val, 77);
        });
    }

    #[test]
    fn test_add_l_ri_defers() {
        with_comp(|c| {
            let n = c.readreg_offset(2, 4);
            c.unlock2(n);
            let before = c.asm.pos();
            c.add_l_ri(2, 8);
            assert_eq!(c.asm.pos(), before, "deferred add must not emit");
            assert_eq!(c.live.state[2].val, 8);
        });
    }

    #[test]
    fn test_alu_sets_flag_state() {
        with_comp(|c| {
            c.needflags = true;
            c.alu_rr_f(AluOp::Add, 4, 0, 1, true);
            assert_eq!(c.live.flags_in_flags, crate::comp::FlagsState::Valid);
            // FLAGX captured the carry.
            assert_eq!(c.live.state[FLAGX].status, RegStatus::Dirty);
            c.check_consistency();
        });
    }

    #[test]
    fn test_cmp_without_needflags_is_dead() {
        with_comp(|c| {
            c.needflags = false;
            let before = c.asm.pos();
            c.alu_rr_f(AluOp::Cmp, 4, 0, 1, false);
            assert_eq!(c.asm.pos(), before);
        });
    }

    #[test]
    fn test_lea_const_folds() {
        with_comp(|c| {
            c.mov_l_ri(8, 0x2000);
            c.lea_l_brr(9, 8, 0x10);
            assert!(c.live.isconst(9));
            assert_eq!(c.live.state[9].val, 0x2010);
        });
    }
}
