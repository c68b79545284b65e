//! Guest flag materialization.
//!
//! The guest condition codes live in one of two places: directly in the
//! host's flags because the last emitted operation produced them, or
//! spilled to the FLAGTMP virtual register whose home is the `cznv` word.
//! X travels separately in FLAGX since most operations leave it alone.
//!
//! The spill packs C/V/Z/N in the guest CCR layout, so restoring is a plain
//! load-and-test of the spill word.

use super::{Comp, FlagsState, FLAGTMP};
use crate::backend::insn::{FLAG_NREG1, FLAG_NREG2};

impl<'a> Comp<'a> {
    /// Bring the guest flags into the host flags. Calling this with both
    /// locations trashed is a programming error.
    pub fn make_flags_live(&mut self) {
        if self.live.flags_in_flags == FlagsState::Valid {
            return;
        }
        assert!(
            self.live.flags_on_stack == FlagsState::Valid,
            "want flags, got something on stack, but it is TRASH"
        );
        let tmp = self.readreg_specific(FLAGTMP, 4, FLAG_NREG2);
        self.asm.reg_to_flags(tmp as u8);
        self.unlock2(tmp);
        self.live.flags_in_flags = FlagsState::Valid;
    }

    /// Spill the host flags into FLAGTMP.
    pub fn flags_to_stack(&mut self) {
        if self.live.flags_on_stack == FlagsState::Valid {
            return;
        }
        if !self.live.flags_are_important {
            self.live.flags_on_stack = FlagsState::Valid;
            return;
        }
        assert!(
            self.live.flags_in_flags == FlagsState::Valid,
            "flags_to_stack with nothing to spill"
        );
        let tmp = self.writereg_specific(FLAGTMP, 4, FLAG_NREG1);
        self.asm.flags_to_reg(tmp as u8);
        self.unlock2(tmp);
        self.live.flags_on_stack = FlagsState::Valid;
    }

    /// About to emit something that trashes the host flags: save them first
    /// if they are the only valid copy.
    pub fn clobber_flags(&mut self) {
        if self.live.flags_in_flags == FlagsState::Valid
            && self.live.flags_on_stack != FlagsState::Valid
        {
            self.flags_to_stack();
        }
        self.live.flags_in_flags = FlagsState::Trash;
    }

    /// Force the flags to the spill slot; used before leaving compiled
    /// code.
    pub fn flush_flags(&mut self) {
        self.flags_to_stack();
    }

    /// The last emitted operation produced the guest flags natively.
    pub fn flags_are_in_flags(&mut self) {
        self.live.flags_in_flags = FlagsState::Valid;
        self.live.flags_on_stack = FlagsState::Trash;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::with_comp;
    use super::*;
    use crate::comp::RegStatus;

    #[test]
    fn test_make_live_from_stack() {
        with_comp(|c| {
            // Fresh state: flags on stack (in memory), not in host flags.
            assert_eq!(c.live.flags_on_stack, FlagsState::Valid);
            assert_eq!(c.live.flags_in_flags, FlagsState::Trash);
            let before = c.asm.pos();
            c.make_flags_live();
            assert!(c.asm.pos() > before, "reload must emit code");
            assert_eq!(c.live.flags_in_flags, FlagsState::Valid);
            // Again: no-op.
            let p = c.asm.pos();
            c.make_flags_live();
            assert_eq!(c.asm.pos(), p);
        });
    }

    #[test]
    fn test_clobber_spills_once() {
        with_comp(|c| {
            c.make_flags_live();
            // Simulate an op that generated fresh flags: in-flags valid,
            // stack stale.
            c.flags_are_in_flags();
            c.clobber_flags();
            assert_eq!(c.live.flags_in_flags, FlagsState::Trash);
            assert_eq!(c.live.flags_on_stack, FlagsState::Valid);
            // FLAGTMP is now dirty and will be written back on flush.
            assert_eq!(c.live.state[FLAGTMP].status, RegStatus::Dirty);
        });
    }

    #[test]
    fn test_unimportant_flags_skip_spill() {
        with_comp(|c| {
            c.flags_are_in_flags();
            c.dont_care_flags();
            let before = c.asm.pos();
            c.clobber_flags();
            // Nothing emitted: the spill was suppressed.
            assert_eq!(c.asm.pos(), before);
            assert_eq!(c.live.flags_on_stack, FlagsState::Valid);
        });
    }

    #[test]
    #[should_panic(expected = "TRASH")]
    fn test_make_live_with_trash_panics() {
        with_comp(|c| {
            c.flags_are_in_flags();
            c.dont_care_flags();
            // Deliberately corrupt: nothing valid anywhere.
            c.live.flags_in_flags = FlagsState::Trash;
            c.live.flags_on_stack = FlagsState::Trash;
            c.make_flags_live();
        });
    }
}
