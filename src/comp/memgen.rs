//! Guest load/store code generation.
//!
//! Two shapes per access width: the *real* path (direct-map, one inline
//! access plus a byte swap for the multi-byte widths) and the
//! *bank-dispatch* path (shift the address right by 16, index the bank
//! table, call the per-size handler). Selection is per call, from the trust
//! configuration and the instruction's special-memory hints.

use super::Comp;
use crate::config::Trust;
use crate::memory::SpecialMem;

impl<'a> Comp<'a> {
    // ---- bank-dispatch helpers ----

    /// Stage the bank index (address >> 16) in the tmp VREG, rescue
    /// call-clobbered state, then call the per-size read handler.
    fn readmem(&mut self, address: usize, dest: usize, size: u8, tmp: usize) {
        let f = tmp;
        self.mov_l_rr(f, address);
        self.shrl_l_ri(f, 16);
        self.clobber_flags();
        self.prepare_for_call_1();
        self.prepare_for_call_2();
        let ra = self.readreg(address, 4);
        let rf = self.readreg(f, 4);
        let rd = self.writereg(dest, size);
        self.asm.bank_read(rd as u8, rf as u8, ra as u8, size);
        self.unlock2(rd);
        self.unlock2(rf);
        self.unlock2(ra);
        self.forget_about(tmp);
    }

    fn writemem(&mut self, address: usize, source: usize, size: u8, tmp: usize) {
        let f = tmp;
        self.mov_l_rr(f, address);
        self.shrl_l_ri(f, 16);
        self.clobber_flags();
        self.prepare_for_call_1();
        self.prepare_for_call_2();
        let ra = self.readreg(address, 4);
        let rs = self.readreg(source, size);
        let rf = self.readreg(f, 4);
        self.asm.bank_write(rf as u8, ra as u8, rs as u8, size);
        self.unlock2(rf);
        self.unlock2(rs);
        self.unlock2(ra);
        self.forget_about(tmp);
    }

    // ---- direct-map helpers ----

    /// Straight go-for-it store: assumes the address really is ordinary
    /// memory. `clobber` sacrifices the source VREG to save the copy.
    fn writemem_real(&mut self, address: usize, source: usize, size: u8, tmp: usize, clobber: bool) {
        match size {
            1 => {
                let ra = self.readreg(address, 4);
                let rs = self.readreg(source, 1);
                self.asm.store_direct(ra as u8, rs as u8, 1);
                self.unlock2(rs);
                self.unlock2(ra);
            }
            _ => {
                let f = if clobber { source } else { tmp };
                if !clobber {
                    if size == 2 {
                        self.mov_w_rr(f, source);
                    } else {
                        self.mov_l_rr(f, source);
                    }
                }
                let ra = self.readreg(address, 4);
                let rf = self.rmw(f, size, size);
                if size == 2 {
                    self.asm.bswap16(rf as u8);
                } else {
                    self.asm.bswap(rf as u8);
                }
                self.asm.store_direct(ra as u8, rf as u8, size);
                self.unlock2(rf);
                self.unlock2(ra);
                self.forget_about(f);
            }
        }
        self.forget_about(tmp);
    }

    fn readmem_real(&mut self, address: usize, dest: usize, size: u8, tmp: usize) {
        let ra = self.readreg(address, 4);
        let rd = self.writereg(dest, size);
        self.asm.load_direct(rd as u8, ra as u8, size);
        if size == 2 {
            self.asm.bswap16(rd as u8);
        } else if size == 4 {
            self.asm.bswap(rd as u8);
        }
        self.unlock2(rd);
        self.unlock2(ra);
        self.forget_about(tmp);
    }

    // ---- public per-width entry points ----

    pub fn readbyte(&mut self, address: usize, dest: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::READ)
            || self.cfg.trust_byte == Trust::Indirect
            || !self.canbang
        {
            self.readmem(address, dest, 1, tmp);
        } else {
            self.readmem_real(address, dest, 1, tmp);
        }
    }

    pub fn readword(&mut self, address: usize, dest: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::READ)
            || self.cfg.trust_word == Trust::Indirect
            || !self.canbang
        {
            self.readmem(address, dest, 2, tmp);
        } else {
            self.readmem_real(address, dest, 2, tmp);
        }
    }

    pub fn readlong(&mut self, address: usize, dest: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::READ)
            || self.cfg.trust_long == Trust::Indirect
            || !self.canbang
        {
            self.readmem(address, dest, 4, tmp);
        } else {
            self.readmem_real(address, dest, 4, tmp);
        }
    }

    pub fn writebyte(&mut self, address: usize, source: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::WRITE)
            || self.cfg.trust_byte == Trust::Indirect
            || !self.canbang
        {
            self.writemem(address, source, 1, tmp);
        } else {
            self.writemem_real(address, source, 1, tmp, false);
        }
    }

    pub fn writeword(&mut self, address: usize, source: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::WRITE)
            || self.cfg.trust_word == Trust::Indirect
            || !self.canbang
        {
            self.writemem(address, source, 2, tmp);
        } else {
            self.writemem_real(address, source, 2, tmp, false);
        }
    }

    pub fn writeword_clobber(&mut self, address: usize, source: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::WRITE)
            || self.cfg.trust_word == Trust::Indirect
            || !self.canbang
        {
            self.writemem(address, source, 2, tmp);
        } else {
            self.writemem_real(address, source, 2, tmp, true);
        }
    }

    pub fn writelong(&mut self, address: usize, source: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::WRITE)
            || self.cfg.trust_long == Trust::Indirect
            || !self.canbang
        {
            self.writemem(address, source, 4, tmp);
        } else {
            self.writemem_real(address, source, 4, tmp, false);
        }
    }

    pub fn writelong_clobber(&mut self, address: usize, source: usize, tmp: usize) {
        if self.special_mem.contains(SpecialMem::WRITE)
            || self.cfg.trust_long == Trust::Indirect
            || !self.canbang
        {
            self.writemem(address, source, 4, tmp);
        } else {
            self.writemem_real(address, source, 4, tmp, true);
        }
    }

    /// Compute the "native" address of a guest location. The portable host
    /// addresses guest memory by guest address, so this is an aliasing
    /// move; the trust plumbing stays so MMIO-heavy embedders can hook it.
    pub fn get_n_addr(&mut self, address: usize, dest: usize, tmp: usize) {
        self.mov_l_rr(dest, address);
        self.forget_about(tmp);
    }

    /// Jump-target variant: also strips the low bit, since guest code is
    /// 16-bit aligned.
    pub fn get_n_addr_jmp(&mut self, address: usize, dest: usize, tmp: usize) {
        if dest != address {
            self.mov_l_rr(dest, address);
        }
        self.and_l_ri(dest, !1);
        self.forget_about(tmp);
    }

    /// Full 68020 extension-word effective address: base displacement,
    /// scaled index, memory indirection and outer displacement. Indirect
    /// reads go through the bank dispatch path since the pointer target is
    /// typically not ordinary memory.
    ///
    /// `base` and `target` are VREGs; `dp` is the extension word.
    pub fn calc_disp_ea_020(&mut self, base: usize, dp: u32, target: usize, tmp: usize) {
        let reg = ((dp >> 12) & 15) as usize;
        let regd_shift = ((dp >> 9) & 3) as u8;

        if dp & 0x100 != 0 {
            // Full extension word.
            let ignorebase = (dp & 0x80) != 0;
            let ignorereg = (dp & 0x40) != 0;
            let mut addbase: u32 = 0;
            let mut outer: u32 = 0;

            if (dp & 0x30) == 0x20 {
                self.m68k_pc_offset += 2;
                let off = self.m68k_pc_offset - 2;
                addbase = self.get_iword(off) as i16 as i32 as u32;
            }
            if (dp & 0x30) == 0x30 {
                self.m68k_pc_offset += 4;
                let off = self.m68k_pc_offset - 4;
                addbase = self.get_ilong(off);
            }
            if (dp & 0x3) == 0x2 {
                self.m68k_pc_offset += 2;
                let off = self.m68k_pc_offset - 2;
                outer = self.get_iword(off) as i16 as i32 as u32;
            }
            if (dp & 0x3) == 0x3 {
                self.m68k_pc_offset += 4;
                let off = self.m68k_pc_offset - 4;
                outer = self.get_ilong(off);
            }

            if (dp & 0x4) == 0 {
                // Add the index register before the indirection.
                if !ignorereg {
                    if (dp & 0x800) == 0 {
                        self.sign_extend_16_rr(target, reg);
                    } else {
                        self.mov_l_rr(target, reg);
                    }
                    self.shll_l_ri(target, regd_shift);
                } else {
                    self.mov_l_ri(target, 0);
                }
                if !ignorebase {
                    self.add_l(target, base);
                }
                self.add_l_ri(target, addbase);
                if dp & 0x03 != 0 {
                    self.readlong(target, target, tmp);
                }
            } else {
                // Indirect first, index after.
                if !ignorebase {
                    self.mov_l_rr(target, base);
                    self.add_l_ri(target, addbase);
                } else {
                    self.mov_l_ri(target, addbase);
                }
                if dp & 0x03 != 0 {
                    self.readlong(target, target, tmp);
                }
                if !ignorereg {
                    if (dp & 0x800) == 0 {
                        self.sign_extend_16_rr(tmp, reg);
                    } else {
                        self.mov_l_rr(tmp, reg);
                    }
                    self.shll_l_ri(tmp, regd_shift);
                    self.add_l(target, tmp);
                }
            }
            self.add_l_ri(target, outer);
        } else {
            // Brief extension word (68000 form).
            let disp = dp as u8 as i8 as i32 as u32;
            if (dp & 0x800) == 0 {
                self.sign_extend_16_rr(target, reg);
                let idx = target;
                self.lea_l_brr_indexed(target, base, idx, regd_shift, disp);
            } else {
                self.lea_l_brr_indexed(target, base, reg, regd_shift, disp);
            }
        }
        self.forget_about(tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::with_comp;
    use super::super::{S1, S3};
    use super::*;
    use crate::backend::insn::{insn_len, OP_BANK_READ, OP_BANK_WRITE, OP_BSWAP, OP_LEA_IDX, OP_LOAD_DIRECT, OP_STORE_DIRECT};

    fn emitted_tags(c: &mut crate::comp::Comp) -> Vec<u8> {
        let end = c.asm.pos() as usize;
        let bytes = c.asm.buf_mut().bytes()[..end].to_vec();
        let mut tags = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            tags.push(bytes[i]);
            i += insn_len(bytes[i]);
        }
        tags
    }

    #[test]
    fn test_readlong_direct_path_swaps() {
        with_comp(|c| {
            c.readlong(8, 0, S1);
            let tags = emitted_tags(c);
            assert!(tags.contains(&OP_LOAD_DIRECT));
            assert!(tags.contains(&OP_BSWAP));
            assert!(!tags.contains(&OP_BANK_READ));
        });
    }

    #[test]
    fn test_special_mem_forces_bank_path() {
        with_comp(|c| {
            c.special_mem = SpecialMem::READ;
            c.readlong(8, 0, S1);
            let tags = emitted_tags(c);
            assert!(tags.contains(&OP_BANK_READ));
            assert!(!tags.contains(&OP_LOAD_DIRECT));
        });
    }

    #[test]
    fn test_trust_indirect_suppresses_real_path() {
        let mut live = crate::comp::LiveState::new();
        let mut buf = crate::backend::buffer::CodeBuffer::new(1 << 20);
        let mut cfg = crate::config::JitConfig::default();
        cfg.trust_long = Trust::Indirect;
        let mut bus = crate::memory::FlatBus::new(0x10000);
        let mut c = crate::comp::Comp::new(&mut live, &mut buf, &cfg, &mut bus);
        c.init_comp(0x1000);
        c.writelong(8, 0, S1);
        let tags = {
            let end = c.asm.pos() as usize;
            let bytes = c.asm.buf_mut().bytes()[..end].to_vec();
            let mut tags = Vec::new();
            let mut i = 0;
            while i < bytes.len() {
                tags.push(bytes[i]);
                i += insn_len(bytes[i]);
            }
            tags
        };
        assert!(tags.contains(&OP_BANK_WRITE));
        assert!(!tags.contains(&OP_STORE_DIRECT));
    }

    #[test]
    fn test_write_store_swaps_source_copy() {
        with_comp(|c| {
            c.writelong(8, 0, S1);
            let tags = emitted_tags(c);
            let swap_pos = tags.iter().position(|&t| t == OP_BSWAP);
            let store_pos = tags.iter().position(|&t| t == OP_STORE_DIRECT);
            assert!(swap_pos.unwrap() < store_pos.unwrap(), "swap must precede the store");
        });
    }

    #[test]
    fn test_brief_extension_word_lea() {
        with_comp(|c| {
            // dp: index in D1, word-sized, scale 2, displacement 0x10.
            let dp = (1 << 12) | (2 << 9) | 0x10;
            c.calc_disp_ea_020(8, dp, S3, S1);
            let tags = emitted_tags(c);
            assert!(tags.contains(&OP_LEA_IDX));
        });
    }

    #[test]
    fn test_full_extension_word_indirect_reads_banked() {
        with_comp(|c| {
            // Full format: word base displacement, memory indirection with
            // word outer displacement, index added after the fetch.
            let dp = 0x100 | 0x20 | 0x04 | 0x02 | (2 << 12);
            c.calc_disp_ea_020(8, dp, S3, S1);
            let tags = emitted_tags(c);
            assert!(tags.contains(&OP_BANK_READ));
        });
    }
}
