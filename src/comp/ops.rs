//! Per-opcode compile functions and the tables keyed by opcode.
//!
//! Register-direct data movement, the common arithmetic families, and the
//! block-ending jumps are translated; everything else reaches the
//! interpreter through the fallback path. `classify` is the single source
//! of truth: the compile-function tables and the property registration both
//! derive from it.

use super::{Comp, PC_P, S1};
use crate::backend::insn::{AluOp, Cond};
use crate::cpu::FlagSet;
use crate::optable::{OpProps, OpTable};

pub type CompFn = fn(&mut Comp, u16);

/// Compile-function tables: the flag-generating variants and the no-flags
/// variants selected when every produced flag is dead.
pub struct CompTables {
    pub ff: Vec<Option<CompFn>>,
    pub nf: Vec<Option<CompFn>>,
}

impl CompTables {
    pub fn build() -> Self {
        let mut ff: Vec<Option<CompFn>> = vec![None; 0x10000];
        let mut nf: Vec<Option<CompFn>> = vec![None; 0x10000];
        for op in 0..=0xffffu16 {
            if let Some((f, _)) = classify(op) {
                ff[op as usize] = Some(f);
                nf[op as usize] = Some(f);
            }
        }
        Self { ff, nf }
    }
}

/// Register the compiled subset's flag properties into the embedder's
/// table.
pub fn register_props(table: &mut OpTable) {
    for op in 0..=0xffffu16 {
        if let Some((_, props)) = classify(op) {
            table.set(op, props);
        }
    }
}

/// Flags a 68k condition code reads.
fn cond_use_flags(cc: u8) -> FlagSet {
    match cc {
        0 | 1 => FlagSet::empty(),
        2 | 3 => FlagSet::C | FlagSet::Z,
        4 | 5 => FlagSet::C,
        6 | 7 => FlagSet::Z,
        8 | 9 => FlagSet::V,
        10 | 11 => FlagSet::N,
        12 | 13 => FlagSet::N | FlagSet::V,
        _ => FlagSet::N | FlagSet::Z | FlagSet::V,
    }
}

fn props(set: FlagSet, use_: FlagSet, jump: bool, cjump: bool) -> OpProps {
    OpProps { use_flags: use_, set_flags: set, is_addx: false, is_jump: jump, is_const_jump: cjump }
}

/// Decide whether (and how) `op` is translated.
pub fn classify(op: u16) -> Option<(CompFn, OpProps)> {
    // MOVEQ
    if op & 0xf100 == 0x7000 {
        return Some((comp_moveq, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
    }

    // MOVE / MOVEA: register-direct modes, plus plain (An) loads into Dn
    // and register stores to (An)
    if let 0x1000 | 0x2000 | 0x3000 = op & 0xf000 {
        let size = match op >> 12 {
            1 => 1,
            3 => 2,
            _ => 4,
        };
        let dst_mode = (op >> 6) & 7;
        let src_mode = (op >> 3) & 7;
        let ok = (dst_mode <= 1 && src_mode <= 1)
            || (dst_mode == 2 && src_mode <= 1)
            || (dst_mode == 0 && src_mode == 2);
        if ok {
            if size == 1 && (dst_mode == 1 || src_mode == 1) {
                return None; // byte accesses never touch address registers
            }
            let p = if dst_mode == 1 {
                props(FlagSet::empty(), FlagSet::empty(), false, false)
            } else {
                props(FlagSet::CZNV, FlagSet::empty(), false, false)
            };
            return Some((comp_move, p));
        }
        return None;
    }

    // ADD / SUB, <ea> source, Dn destination
    if matches!(op & 0xf000, 0x9000 | 0xd000) {
        let opmode = (op >> 6) & 7;
        let src_mode = (op >> 3) & 7;
        if opmode <= 2 && src_mode <= 1 {
            if opmode == 0 && src_mode == 1 {
                return None; // byte add with An source
            }
            return Some((comp_addsub, props(FlagSet::ALL, FlagSet::empty(), false, false)));
        }
        return None;
    }

    // CMP (Dn destination) and EOR (Dn ea)
    if op & 0xf000 == 0xb000 {
        let opmode = (op >> 6) & 7;
        let src_mode = (op >> 3) & 7;
        if opmode <= 2 && src_mode <= 1 {
            if opmode == 0 && src_mode == 1 {
                return None;
            }
            return Some((comp_cmp, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
        }
        if (4..=6).contains(&opmode) && src_mode == 0 {
            return Some((comp_eor, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
        }
        return None;
    }

    // AND / OR, Dn source and destination
    if matches!(op & 0xf000, 0x8000 | 0xc000) {
        let opmode = (op >> 6) & 7;
        let src_mode = (op >> 3) & 7;
        if opmode <= 2 && src_mode == 0 {
            return Some((comp_logic, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
        }
        return None;
    }

    // ADDQ / SUBQ on Dn or An
    if op & 0xf000 == 0x5000 && (op >> 6) & 3 != 3 {
        let mode = (op >> 3) & 7;
        let size = (op >> 6) & 3;
        if mode == 0 {
            return Some((comp_addsubq, props(FlagSet::ALL, FlagSet::empty(), false, false)));
        }
        if mode == 1 && size != 0 {
            return Some((comp_addsubq, props(FlagSet::empty(), FlagSet::empty(), false, false)));
        }
        return None;
    }

    // CLR / NOT / TST on Dn
    if matches!(op & 0xff00, 0x4200 | 0x4600 | 0x4a00) {
        let size = (op >> 6) & 3;
        let mode = (op >> 3) & 7;
        if size != 3 && mode == 0 {
            return Some((comp_single, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
        }
        return None;
    }

    // EXT
    if op & 0xfff8 == 0x4880 || op & 0xfff8 == 0x48c0 {
        return Some((comp_ext, props(FlagSet::CZNV, FlagSet::empty(), false, false)));
    }

    // LEA with (An), (d16,An), (d8,An,Xn) sources
    if op & 0xf1c0 == 0x41c0 {
        let mode = (op >> 3) & 7;
        if matches!(mode, 2 | 5 | 6) {
            return Some((comp_lea, props(FlagSet::empty(), FlagSet::empty(), false, false)));
        }
        return None;
    }

    // BRA / Bcc (BSR falls back)
    if op & 0xf000 == 0x6000 {
        let cc = ((op >> 8) & 0xf) as u8;
        if cc == 1 {
            return None;
        }
        if cc == 0 {
            return Some((comp_bcc, props(FlagSet::empty(), FlagSet::empty(), true, true)));
        }
        return Some((comp_bcc, props(FlagSet::empty(), cond_use_flags(cc), true, false)));
    }

    // DBRA; the general DBcc is left to the interpreter
    if op & 0xfff8 == 0x51c8 {
        return Some((comp_dbra, props(FlagSet::empty(), FlagSet::empty(), true, false)));
    }

    // JMP (An)
    if op & 0xfff8 == 0x4ed0 {
        return Some((comp_jmp_ind, props(FlagSet::empty(), FlagSet::empty(), true, false)));
    }

    if op == 0x4e75 {
        return Some((comp_rts, props(FlagSet::empty(), FlagSet::empty(), true, false)));
    }

    if op == 0x4e71 {
        return Some((comp_nop, props(FlagSet::empty(), FlagSet::empty(), false, false)));
    }

    None
}

// ---------------------------------------------------------------------------
// Compile functions
// ---------------------------------------------------------------------------

fn size_bits(op: u16) -> u8 {
    match (op >> 6) & 3 {
        0 => 1,
        1 => 2,
        _ => 4,
    }
}

/// Source/destination VREG for a register-direct effective address.
fn ea_vreg(mode: u16, reg: u16) -> usize {
    if mode == 0 {
        reg as usize
    } else {
        8 + reg as usize
    }
}

fn comp_moveq(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let d = ((op >> 9) & 7) as usize;
    let v = op as u8 as i8 as i32 as u32;
    c.mov_ri_f(4, d, v);
}

fn comp_move(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = match op >> 12 {
        1 => 1,
        3 => 2,
        _ => 4,
    };
    let src_mode = (op >> 3) & 7;
    let dst_mode = (op >> 6) & 7;
    let dst_reg = ((op >> 9) & 7) as usize;

    if src_mode == 2 {
        // MOVE (An),Dn: a guest load, then flags from the value.
        let an = 8 + (op & 7) as usize;
        match size {
            1 => c.readbyte(an, dst_reg, S1),
            2 => c.readword(an, dst_reg, S1),
            _ => c.readlong(an, dst_reg, S1),
        }
        c.tst_f(size, dst_reg);
        return;
    }

    let src = ea_vreg(src_mode, op & 7);
    if dst_mode == 2 {
        // MOVE Dn,(An): a guest store; flags come from the source.
        let an = 8 + dst_reg;
        match size {
            1 => c.writebyte(an, src, S1),
            2 => c.writeword(an, src, S1),
            _ => c.writelong(an, src, S1),
        }
        c.tst_f(size, src);
    } else if dst_mode == 1 {
        // MOVEA: no CCR effect, word source sign-extends.
        let dst = 8 + dst_reg;
        if size == 2 {
            c.sign_extend_16_rr(dst, src);
        } else {
            c.mov_l_rr(dst, src);
        }
    } else {
        c.mov_f(size, dst_reg, src);
    }
}

fn comp_addsub(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = size_bits(op);
    let dst = ((op >> 9) & 7) as usize;
    let src = ea_vreg((op >> 3) & 7, op & 7);
    let alu = if op & 0xf000 == 0xd000 { AluOp::Add } else { AluOp::Sub };
    c.alu_rr_f(alu, size, dst, src, true);
}

fn comp_cmp(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = size_bits(op);
    let dst = ((op >> 9) & 7) as usize;
    let src = ea_vreg((op >> 3) & 7, op & 7);
    c.alu_rr_f(AluOp::Cmp, size, dst, src, false);
}

fn comp_eor(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = match (op >> 6) & 7 {
        4 => 1,
        5 => 2,
        _ => 4,
    };
    let src = ((op >> 9) & 7) as usize;
    let dst = (op & 7) as usize;
    c.alu_rr_f(AluOp::Xor, size, dst, src, false);
}

fn comp_logic(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = size_bits(op);
    let dst = ((op >> 9) & 7) as usize;
    let src = (op & 7) as usize;
    let alu = if op & 0xf000 == 0xc000 { AluOp::And } else { AluOp::Or };
    c.alu_rr_f(alu, size, dst, src, false);
}

fn comp_addsubq(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let mut q = ((op >> 9) & 7) as u32;
    if q == 0 {
        q = 8;
    }
    let sub = op & 0x100 != 0;
    let mode = (op >> 3) & 7;
    let reg = (op & 7) as usize;
    if mode == 1 {
        // Address registers: full-width, no CCR effect, folds into the
        // deferred offset.
        let delta = if sub { q.wrapping_neg() } else { q };
        c.add_l_ri(8 + reg, delta);
    } else {
        let size = size_bits(op);
        let alu = if sub { AluOp::Sub } else { AluOp::Add };
        c.alu_ri_f(alu, size, reg, q, true);
    }
}

fn comp_single(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let size = size_bits(op);
    let reg = (op & 7) as usize;
    match op & 0xff00 {
        0x4200 => c.clr_f(size, reg),
        0x4600 => c.not_f(size, reg),
        _ => c.tst_f(size, reg),
    }
}

fn comp_ext(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let reg = (op & 7) as usize;
    if op & 0x0040 == 0 {
        c.ext_w_f(reg);
    } else {
        c.ext_l_f(reg);
    }
}

fn comp_lea(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let dst = 8 + ((op >> 9) & 7) as usize;
    let base = 8 + (op & 7) as usize;
    match (op >> 3) & 7 {
        2 => c.lea_l_brr(dst, base, 0),
        5 => {
            c.m68k_pc_offset += 2;
            let off = c.m68k_pc_offset - 2;
            let disp = c.get_iword(off) as i16 as i32 as u32;
            c.lea_l_brr(dst, base, disp);
        }
        _ => {
            c.m68k_pc_offset += 2;
            let off = c.m68k_pc_offset - 2;
            let dp = c.get_iword(off) as u32;
            c.calc_disp_ea_020(base, dp, dst, S1);
        }
    }
}

fn comp_bcc(c: &mut Comp, op: u16) {
    let opc_off = c.m68k_pc_offset;
    c.m68k_pc_offset += 2;
    let cc = ((op >> 8) & 0xf) as u8;
    let disp8 = op as u8;
    let disp: u32 = match disp8 {
        0 => {
            c.m68k_pc_offset += 2;
            c.get_iword(opc_off + 2) as i16 as i32 as u32
        }
        0xff => {
            c.m68k_pc_offset += 4;
            c.get_ilong(opc_off + 2)
        }
        d => d as i8 as i32 as u32,
    };
    let taken = c.comp_pc_p.wrapping_add(opc_off).wrapping_add(2).wrapping_add(disp);
    let not_taken = c.comp_pc_p.wrapping_add(c.m68k_pc_offset);

    if cc == 0 {
        // BRA: the PC becomes a known constant; the epilogue links it.
        c.set_const(PC_P, taken);
        c.comp_pc_p = taken;
        c.m68k_pc_offset = 0;
    } else {
        c.make_flags_live();
        c.register_branch(not_taken, taken, Cond::from_code(cc));
    }
}

fn comp_dbra(c: &mut Comp, op: u16) {
    let opc_off = c.m68k_pc_offset;
    c.m68k_pc_offset += 4;
    let disp = c.get_iword(opc_off + 2) as i16 as i32 as u32;
    let taken = c.comp_pc_p.wrapping_add(opc_off).wrapping_add(2).wrapping_add(disp);
    let not_taken = c.comp_pc_p.wrapping_add(opc_off).wrapping_add(4);

    let dn = (op & 7) as usize;
    // The counter decrement must not disturb the guest CCR (DBF never
    // touches it), so rescue whatever is live first.
    c.clobber_flags();
    let r = c.rmw(dn, 2, 2);
    c.asm.alu_ri(AluOp::Sub, r as u8, 1, 2);
    c.unlock2(r);
    // Loop while the word counter did not wrap past -1 (no borrow).
    c.register_branch(not_taken, taken, Cond::Cc);
}

fn comp_jmp_ind(c: &mut Comp, op: u16) {
    c.m68k_pc_offset += 2;
    let an = 8 + (op & 7) as usize;
    c.get_n_addr_jmp(an, PC_P, S1);
}

fn comp_rts(c: &mut Comp, _op: u16) {
    c.m68k_pc_offset += 2;
    // pc = (A7); A7 += 4
    c.readlong(15, PC_P, S1);
    c.add_l_ri(15, 4);
}

fn comp_nop(c: &mut Comp, _op: u16) {
    c.m68k_pc_offset += 2;
}
