//! Assembler: the emit-method surface the compiler writes against.
//!
//! Thin layer over [`CodeBuffer`] producing the portable host encoding.
//! Branch emitters return the buffer offset of their 32-bit target slot so
//! callers can patch it once the destination is known; linked cross-block
//! jumps record the same offset in a jump dependency.

use super::buffer::CodeBuffer;
use super::insn::*;

pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn pos(&self) -> u32 {
        self.buf.pos()
    }

    pub fn buf_mut(&mut self) -> &mut CodeBuffer {
        &mut *self.buf
    }

    pub fn align(&mut self, a: u32) {
        self.buf.align(a);
    }

    pub fn nop(&mut self) {
        self.buf.emit_byte(OP_NOP);
    }

    pub fn patch_long(&mut self, off: u32, val: u32) {
        self.buf.patch_long(off, val);
    }

    pub fn near_full(&self) -> bool {
        self.buf.near_full()
    }

    // ---- data movement ----

    /// `d <- s`, writing only the low `size` bytes of `d`.
    pub fn mov_rr(&mut self, d: u8, s: u8, size: u8) {
        self.buf.emit_byte(OP_MOV_RR);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
        self.buf.emit_byte(size);
    }

    /// `d <- imm` (full width).
    pub fn mov_ri(&mut self, d: u8, imm: u32) {
        self.buf.emit_byte(OP_MOV_RI);
        self.buf.emit_byte(d);
        self.buf.emit_long(imm);
    }

    /// `d <- [slot]` (full width).
    pub fn load(&mut self, d: u8, slot: GuestLoc) {
        self.buf.emit_byte(OP_LOAD_SLOT);
        self.buf.emit_byte(d);
        self.buf.emit_byte(slot.encode());
    }

    /// `[slot] <- s`, writing only the low `size` bytes of the slot.
    pub fn store(&mut self, slot: GuestLoc, s: u8, size: u8) {
        self.buf.emit_byte(OP_STORE_SLOT);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_byte(s);
        self.buf.emit_byte(size);
    }

    /// `[slot] <- imm` (full width).
    pub fn store_imm(&mut self, slot: GuestLoc, imm: u32) {
        self.buf.emit_byte(OP_STORE_SLOT_I);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_long(imm);
    }

    /// `[slot] += imm` without touching flags (deferred-offset writeback).
    pub fn add_mem_imm(&mut self, slot: GuestLoc, imm: u32) {
        self.buf.emit_byte(OP_ADD_SLOT_I);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_long(imm);
    }

    /// `[slot] -= imm`, setting flags (the cycle countdown path).
    pub fn sub_mem_imm(&mut self, slot: GuestLoc, imm: u32) {
        self.buf.emit_byte(OP_SUB_SLOT_I);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_long(imm);
    }

    /// Compare `[slot]` with `imm`, setting flags.
    pub fn cmp_mem_imm(&mut self, slot: GuestLoc, imm: u32) {
        self.buf.emit_byte(OP_CMP_SLOT_I);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_long(imm);
    }

    /// Decrement block `blk`'s countdown field, setting flags.
    pub fn sub_count(&mut self, blk: u32) {
        self.buf.emit_byte(OP_SUB_COUNT);
        self.buf.emit_long(blk);
    }

    /// `d <- blocks[blk].pc_p` (read at execution time, the pen/pcc stubs).
    pub fn load_blk_pc(&mut self, d: u8, blk: u32) {
        self.buf.emit_byte(OP_LOAD_BLK_PC);
        self.buf.emit_byte(d);
        self.buf.emit_long(blk);
    }

    /// `d <- base + disp`, flags untouched.
    pub fn lea(&mut self, d: u8, base: u8, disp: u32) {
        self.buf.emit_byte(OP_LEA);
        self.buf.emit_byte(d);
        self.buf.emit_byte(base);
        self.buf.emit_long(disp);
    }

    /// `d <- base + (index << scale) + disp`, flags untouched.
    pub fn lea_idx(&mut self, d: u8, base: u8, index: u8, scale: u8, disp: u32) {
        self.buf.emit_byte(OP_LEA_IDX);
        self.buf.emit_byte(d);
        self.buf.emit_byte(base);
        self.buf.emit_byte(index);
        self.buf.emit_byte(scale);
        self.buf.emit_long(disp);
    }

    // ---- bit manipulation ----

    pub fn bswap(&mut self, r: u8) {
        self.buf.emit_byte(OP_BSWAP);
        self.buf.emit_byte(r);
    }

    /// Swap the two bytes of the low word, upper half untouched.
    pub fn bswap16(&mut self, r: u8) {
        self.buf.emit_byte(OP_BSWAP16);
        self.buf.emit_byte(r);
    }

    pub fn zext8(&mut self, d: u8, s: u8) {
        self.buf.emit_byte(OP_ZEXT8);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
    }

    pub fn zext16(&mut self, d: u8, s: u8) {
        self.buf.emit_byte(OP_ZEXT16);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
    }

    pub fn sext8(&mut self, d: u8, s: u8) {
        self.buf.emit_byte(OP_SEXT8);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
    }

    pub fn sext16(&mut self, d: u8, s: u8) {
        self.buf.emit_byte(OP_SEXT16);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
    }

    // ---- arithmetic ----

    pub fn alu_rr(&mut self, op: AluOp, d: u8, s: u8, size: u8) {
        self.buf.emit_byte(OP_ALU_RR);
        self.buf.emit_byte(op as u8);
        self.buf.emit_byte(d);
        self.buf.emit_byte(s);
        self.buf.emit_byte(size);
    }

    pub fn alu_ri(&mut self, op: AluOp, d: u8, imm: u32, size: u8) {
        self.buf.emit_byte(OP_ALU_RI);
        self.buf.emit_byte(op as u8);
        self.buf.emit_byte(d);
        self.buf.emit_long(imm);
        self.buf.emit_byte(size);
    }

    pub fn shift_ri(&mut self, op: ShiftOp, d: u8, amt: u8, size: u8) {
        self.buf.emit_byte(OP_SHIFT_RI);
        self.buf.emit_byte(op as u8);
        self.buf.emit_byte(d);
        self.buf.emit_byte(amt);
        self.buf.emit_byte(size);
    }

    /// `d <- cond ? 1 : 0` (full width).
    pub fn setcc(&mut self, cond: Cond, d: u8) {
        self.buf.emit_byte(OP_SETCC);
        self.buf.emit_byte(cond as u8);
        self.buf.emit_byte(d);
    }

    // ---- guest memory ----

    /// Direct-map load: `d <- image[a]`, raw little-endian, low `size`
    /// bytes only.
    pub fn load_direct(&mut self, d: u8, a: u8, size: u8) {
        self.buf.emit_byte(OP_LOAD_DIRECT);
        self.buf.emit_byte(d);
        self.buf.emit_byte(a);
        self.buf.emit_byte(size);
    }

    /// Direct-map store: `image[a] <- s`, raw little-endian.
    pub fn store_direct(&mut self, a: u8, s: u8, size: u8) {
        self.buf.emit_byte(OP_STORE_DIRECT);
        self.buf.emit_byte(a);
        self.buf.emit_byte(s);
        self.buf.emit_byte(size);
    }

    /// Bank-dispatch read: `d <- bank[bank_reg].get(a)`. `bank_reg` holds
    /// the bank index (address >> 16) computed by the preceding shift.
    pub fn bank_read(&mut self, d: u8, bank: u8, a: u8, size: u8) {
        self.buf.emit_byte(OP_BANK_READ);
        self.buf.emit_byte(d);
        self.buf.emit_byte(bank);
        self.buf.emit_byte(a);
        self.buf.emit_byte(size);
    }

    /// Bank-dispatch write: `bank[bank_reg].put(a, s)`.
    pub fn bank_write(&mut self, bank: u8, a: u8, s: u8, size: u8) {
        self.buf.emit_byte(OP_BANK_WRITE);
        self.buf.emit_byte(bank);
        self.buf.emit_byte(a);
        self.buf.emit_byte(s);
        self.buf.emit_byte(size);
    }

    // ---- flags ----

    /// Pack host N/Z/V/C into `r` in the guest CCR layout.
    pub fn flags_to_reg(&mut self, r: u8) {
        self.buf.emit_byte(OP_FLAGS_TO_REG);
        self.buf.emit_byte(r);
    }

    /// Restore host flags from the CCR packing in `r` (load-and-test).
    pub fn reg_to_flags(&mut self, r: u8) {
        self.buf.emit_byte(OP_REG_TO_FLAGS);
        self.buf.emit_byte(r);
    }

    // ---- control flow ----

    /// Conditional jump. Returns the offset of the 32-bit target slot.
    pub fn jcc(&mut self, cond: Cond) -> u32 {
        self.buf.emit_byte(OP_JCC);
        self.buf.emit_byte(cond as u8);
        let slot = self.buf.pos();
        self.buf.emit_long(0);
        slot
    }

    /// Conditional jump to a known target.
    pub fn jcc_to(&mut self, cond: Cond, target: u32) {
        let slot = self.jcc(cond);
        self.buf.patch_long(slot, target);
    }

    /// Unconditional jump. Returns the offset of the 32-bit target slot.
    pub fn jmp(&mut self) -> u32 {
        self.buf.emit_byte(OP_JMP);
        let slot = self.buf.pos();
        self.buf.emit_long(0);
        slot
    }

    pub fn jmp_to(&mut self, target: u32) {
        let slot = self.jmp();
        self.buf.patch_long(slot, target);
    }

    /// Constant-time dispatch through the cache-tag directory: if the cycle
    /// countdown is still non-negative, continue at the handler installed
    /// for the (masked) PC in `r`; otherwise exit through do-nothing.
    pub fn jmp_tags(&mut self, r: u8) {
        self.buf.emit_byte(OP_JMP_TAGS);
        self.buf.emit_byte(r);
    }

    /// Call the interpreter for a single guest opcode.
    pub fn call_interp(&mut self, opcode: u16) {
        self.buf.emit_byte(OP_CALL_INTERP);
        self.buf.emit_word(opcode);
    }

    /// Exit to the dispatcher with `reason`.
    pub fn exit(&mut self, reason: ExitReason) {
        self.buf.emit_byte(OP_EXIT);
        self.buf.emit_byte(reason as u8);
    }

    // ---- FPU ----

    pub fn fload(&mut self, fd: u8, slot: GuestLoc) {
        self.buf.emit_byte(OP_FLOAD_SLOT);
        self.buf.emit_byte(fd);
        self.buf.emit_byte(slot.encode());
    }

    /// Store and keep.
    pub fn fstore(&mut self, slot: GuestLoc, fs: u8) {
        self.buf.emit_byte(OP_FSTORE_SLOT);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_byte(fs);
    }

    /// Store and pop (host FPU stack discipline).
    pub fn fstore_drop(&mut self, slot: GuestLoc, fs: u8) {
        self.buf.emit_byte(OP_FSTORE_SLOT_DROP);
        self.buf.emit_byte(slot.encode());
        self.buf.emit_byte(fs);
    }

    pub fn fmov_rr(&mut self, fd: u8, fs: u8) {
        self.buf.emit_byte(OP_FMOV_RR);
        self.buf.emit_byte(fd);
        self.buf.emit_byte(fs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jcc_returns_patchable_slot() {
        let mut buf = CodeBuffer::new(64);
        let mut asm = Assembler::new(&mut buf);
        let slot = asm.jcc(Cond::Ne);
        assert_eq!(slot, 2); // tag + cond byte
        asm.patch_long(slot, 0x1234);
        assert_eq!(buf.read_long(2), 0x1234);
    }

    #[test]
    fn test_encoded_lengths_match_table() {
        let mut buf = CodeBuffer::new(256);
        let mut asm = Assembler::new(&mut buf);
        let start = asm.pos();
        asm.mov_rr(1, 2, 4);
        assert_eq!(asm.pos() - start, insn_len(OP_MOV_RR) as u32);
        let p = asm.pos();
        asm.lea_idx(1, 2, 3, 2, 0x10);
        assert_eq!(asm.pos() - p, insn_len(OP_LEA_IDX) as u32);
        let p = asm.pos();
        asm.store(GuestLoc::Reg(3), 1, 2);
        assert_eq!(asm.pos() - p, insn_len(OP_STORE_SLOT) as u32);
    }

    #[test]
    fn test_alignment_emits_nops() {
        let mut buf = CodeBuffer::new(64);
        let mut asm = Assembler::new(&mut buf);
        asm.exit(ExitReason::DoNothing);
        asm.align(16);
        assert_eq!(asm.pos(), 16);
        assert_eq!(buf.bytes()[2], OP_NOP);
    }
}
