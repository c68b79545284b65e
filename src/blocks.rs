//! Compiled-block metadata: the hash-indexed cache directory, the block
//! arena with its active/dormant lists and hold pool, and the cross-block
//! jump dependency records.
//!
//! Handlers are absolute code-buffer offsets ("tagged entries" in the sense
//! that the well-known stub offsets are themselves emitted code). Retargeting
//! a block's direct handler rewrites every recorded patch site that links to
//! it.

use crate::backend::buffer::CodeBuffer;
use crate::comp::SmallState;

/// Number of conceptual directory entries. Guest code is 16-bit aligned, so
/// only even PC bits feed the hash; even entries hold the installed handler
/// and odd entries the head of the same-bucket chain. We store each
/// even/odd pair as one [`Tag`].
pub const TAGSIZE: usize = 1 << 16;

/// PC bits that participate in the hash (used by the table-dispatch mask).
pub const TAGMASK: u32 = ((TAGSIZE as u32 / 2) - 1) << 1;

/// Directory index for a guest PC.
#[inline]
pub fn cacheline(pc: u32) -> usize {
    ((pc >> 1) as usize) & (TAGSIZE / 2 - 1)
}

pub type BlockId = u32;

/// One directory pair: the installed handler (even slot) and the chain head
/// (odd slot).
#[derive(Clone, Copy)]
pub struct Tag {
    pub handler: u32,
    pub head: Option<BlockId>,
}

pub struct CacheTags {
    tags: Vec<Tag>,
    /// Handler installed when no block is at the line (the execute-normal
    /// stub).
    default_handler: u32,
}

impl CacheTags {
    pub fn new(default_handler: u32) -> Self {
        Self {
            tags: vec![Tag { handler: default_handler, head: None }; TAGSIZE / 2],
            default_handler,
        }
    }

    #[inline]
    pub fn handler(&self, cl: usize) -> u32 {
        self.tags[cl].handler
    }

    #[inline]
    pub fn head(&self, cl: usize) -> Option<BlockId> {
        self.tags[cl].head
    }

    /// Reinstall the default handler everywhere and empty every chain.
    pub fn reset(&mut self) {
        for t in &mut self.tags {
            t.handler = self.default_handler;
            t.head = None;
        }
    }

    pub fn default_handler(&self) -> u32 {
        self.default_handler
    }

    pub fn set_handler(&mut self, cl: usize, handler: u32) {
        self.tags[cl].handler = handler;
    }

    pub fn set_head(&mut self, cl: usize, head: Option<BlockId>) {
        self.tags[cl].head = head;
    }
}

/// Lifecycle status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    New,
    /// Some other block links to this one; its entry environment is pinned.
    Targetted,
}

/// One outgoing jump-link record: the patch site in this block's code and
/// the block it links to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dep {
    pub jmp_off: Option<u32>,
    pub target: Option<BlockId>,
}

/// Metadata for one discovered guest-PC entry point.
pub struct BlockInfo {
    /// Starting guest PC.
    pub pc_p: u32,
    /// Extent of guest bytes covered, for invalidation.
    pub len: u32,
    pub min_pcp: u32,
    /// Additive / XOR checksums over the covered guest bytes.
    pub c1: u32,
    pub c2: u32,
    /// Verifying native entry (None while uncompiled).
    pub handler: Option<u32>,
    /// Entry for same-environment linked jumps.
    pub direct_handler: Option<u32>,
    /// Currently installed handlers.
    pub handler_to_use: u32,
    pub direct_handler_to_use: u32,
    /// Pre-emitted per-block trampolines: needs-translation and
    /// needs-checksum-recheck.
    pub direct_pen: u32,
    pub direct_pcc: u32,
    /// Executions remaining before the next recompilation attempt.
    pub count: i32,
    pub optlevel: usize,
    /// Flags callers care about at entry; 0xff = unknown/conservative.
    pub needed_flags: u8,
    pub status: BlockStatus,
    /// Register environment expected at the direct entry.
    pub env: SmallState,
    pub havestate: bool,
    /// Outgoing jump links.
    pub dep: [Dep; 2],
    /// Incoming jump links: (owner block, dep slot index).
    pub deplist: Vec<(BlockId, usize)>,
    /// Same-bucket chain link.
    pub next_same_cl: Option<BlockId>,
}

/// Maximum number of pre-initialized blocks kept in the hold pool.
pub const MAX_HOLD_BI: usize = 128;

/// Arena of block metadata plus the registry lists threaded over it.
pub struct BlockArena {
    blocks: Vec<BlockInfo>,
    /// Free pool of prepared blocks, refilled in batches before compilation.
    hold: Vec<BlockId>,
    pub active: Vec<BlockId>,
    pub dormant: Vec<BlockId>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self { blocks: Vec::new(), hold: Vec::new(), active: Vec::new(), dormant: Vec::new() }
    }

    #[inline]
    pub fn get(&self, id: BlockId) -> &BlockInfo {
        &self.blocks[id as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockInfo {
        &mut self.blocks[id as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn hold_len(&self) -> usize {
        self.hold.len()
    }

    /// Drop every block and list. Used by the hard flush; the per-block
    /// trampolines died with the code buffer, so blocks cannot be reused.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.hold.clear();
        self.active.clear();
        self.dormant.clear();
    }

    /// Refill the hold pool in batches, emitting the per-block trampolines
    /// for each fresh block. One compilation can consume the block itself
    /// plus two link targets, so the pool never runs that low.
    pub fn alloc_blockinfos(&mut self, buf: &mut CodeBuffer, execute_normal: u32, check_checksum: u32) {
        if self.hold.len() >= 4 {
            return;
        }
        for _ in 0..MAX_HOLD_BI {
            let id = self.blocks.len() as BlockId;
            let (pen, pcc) = Self::prepare_block(id, buf, execute_normal, check_checksum);
            self.blocks.push(BlockInfo {
                pc_p: 0,
                len: 0,
                min_pcp: 0,
                c1: 0,
                c2: 0,
                handler: None,
                direct_handler: None,
                handler_to_use: execute_normal,
                direct_handler_to_use: pen,
                direct_pen: pen,
                direct_pcc: pcc,
                count: 0,
                optlevel: 0,
                needed_flags: 0xff,
                status: BlockStatus::New,
                env: SmallState::default(),
                havestate: false,
                dep: [Dep::default(); 2],
                deplist: Vec::new(),
                next_same_cl: None,
            });
            self.hold.push(id);
        }
    }

    /// Emit the two per-block trampolines: "store my PC and go translate"
    /// and "store my PC and go re-checksum". The PC is read from the block
    /// record at execution time, so the trampolines survive re-adoption.
    fn prepare_block(id: BlockId, buf: &mut CodeBuffer, execute_normal: u32, check_checksum: u32) -> (u32, u32) {
        use crate::backend::asm::Assembler;
        use crate::backend::insn::GuestLoc;

        let mut asm = Assembler::new(buf);
        asm.align(32);
        let pen = asm.pos();
        asm.load_blk_pc(0, id);
        asm.store(GuestLoc::PcP, 0, 4);
        asm.jmp_to(execute_normal);

        asm.align(32);
        let pcc = asm.pos();
        asm.load_blk_pc(0, id);
        asm.store(GuestLoc::PcP, 0, 4);
        asm.jmp_to(check_checksum);

        asm.align(32);
        (pen, pcc)
    }

    // ---- directory chains ----

    /// Walk the chain at `pc`'s line; return the block whose `pc_p` matches.
    pub fn lookup(&self, tags: &CacheTags, pc: u32) -> Option<BlockId> {
        let mut cur = tags.head(cacheline(pc));
        while let Some(id) = cur {
            let bi = self.get(id);
            if bi.pc_p == pc {
                return Some(id);
            }
            cur = bi.next_same_cl;
        }
        None
    }

    pub fn add_to_cl_list(&mut self, tags: &mut CacheTags, id: BlockId) {
        let cl = cacheline(self.get(id).pc_p);
        let old_head = tags.head(cl);
        self.get_mut(id).next_same_cl = old_head;
        tags.set_head(cl, Some(id));
        tags.set_handler(cl, self.get(id).handler_to_use);
    }

    pub fn remove_from_cl_list(&mut self, tags: &mut CacheTags, id: BlockId) {
        let cl = cacheline(self.get(id).pc_p);
        let mut cur = tags.head(cl);
        if cur == Some(id) {
            tags.set_head(cl, self.get(id).next_same_cl);
        } else {
            while let Some(p) = cur {
                let next = self.get(p).next_same_cl;
                if next == Some(id) {
                    self.get_mut(p).next_same_cl = self.get(id).next_same_cl;
                    break;
                }
                cur = next;
            }
        }
        self.get_mut(id).next_same_cl = None;
        // The installed handler follows the (possibly new) chain head.
        match tags.head(cl) {
            Some(h) => {
                let handler = self.get(h).handler_to_use;
                tags.set_handler(cl, handler);
            }
            None => tags.set_handler(cl, tags.default_handler()),
        }
    }

    /// MRU bias: move `id` to the head of its chain so its handler becomes
    /// the one installed at the line.
    pub fn raise_in_cl_list(&mut self, tags: &mut CacheTags, id: BlockId) {
        self.remove_from_cl_list(tags, id);
        self.add_to_cl_list(tags, id);
    }

    // ---- registry lists ----

    pub fn add_to_active(&mut self, id: BlockId) {
        self.active.push(id);
    }

    pub fn add_to_dormant(&mut self, id: BlockId) {
        self.dormant.push(id);
    }

    pub fn remove_from_list(&mut self, id: BlockId) {
        self.active.retain(|&b| b != id);
        self.dormant.retain(|&b| b != id);
    }

    // ---- jump dependencies ----

    /// Record that `from`'s dep slot `i` patches the slot at `jmp_off` to
    /// follow `target`'s direct handler.
    pub fn create_jmpdep(&mut self, from: BlockId, i: usize, jmp_off: u32, target: BlockId) {
        assert!(i < 2);
        self.get_mut(from).dep[i] = Dep { jmp_off: Some(jmp_off), target: Some(target) };
        self.get_mut(target).deplist.push((from, i));
    }

    fn remove_dep(&mut self, owner: BlockId, i: usize) {
        let dep = self.get(owner).dep[i];
        if let Some(target) = dep.target {
            self.get_mut(target).deplist.retain(|&(b, s)| !(b == owner && s == i));
        }
        self.get_mut(owner).dep[i] = Dep::default();
    }

    /// This block's code is about to be thrown away; it no longer depends
    /// on anything else.
    pub fn remove_deps(&mut self, id: BlockId) {
        self.remove_dep(id, 0);
        self.remove_dep(id, 1);
    }

    /// Install a new direct handler and rewrite every incoming patch site.
    pub fn set_dhtu(&mut self, id: BlockId, dh: u32, buf: &mut CodeBuffer) {
        if dh == self.get(id).direct_handler_to_use {
            return;
        }
        let deps: Vec<(BlockId, usize)> = self.get(id).deplist.clone();
        for (owner, i) in deps {
            if let Some(off) = self.get(owner).dep[i].jmp_off {
                buf.patch_long(off, dh);
            }
        }
        self.get_mut(id).direct_handler_to_use = dh;
    }

    /// Reset a block to its untranslated state: handlers back to the
    /// trampolines, countdown restarted, outgoing links dropped.
    pub fn invalidate_block(&mut self, id: BlockId, count0: i32, execute_normal: u32, buf: &mut CodeBuffer) {
        let pen = self.get(id).direct_pen;
        {
            let bi = self.get_mut(id);
            bi.optlevel = 0;
            bi.count = count0 - 1;
            bi.handler = None;
            bi.handler_to_use = execute_normal;
            bi.direct_handler = None;
            bi.needed_flags = 0xff;
        }
        self.set_dhtu(id, pen, buf);
        self.remove_deps(id);
    }

    /// Look up `pc`, else adopt a block from the hold pool: initialize it,
    /// push it on the chain and the active list.
    ///
    /// Panics when the pool is dry; `alloc_blockinfos` must have run.
    pub fn get_blockinfo_addr_new(
        &mut self,
        tags: &mut CacheTags,
        pc: u32,
        count0: i32,
        execute_normal: u32,
        buf: &mut CodeBuffer,
    ) -> BlockId {
        if let Some(id) = self.lookup(tags, pc) {
            return id;
        }
        let id = self.hold.pop().expect("looking for blockinfo, can't find free one");
        self.get_mut(id).pc_p = pc;
        self.invalidate_block(id, count0, execute_normal, buf);
        self.add_to_active(id);
        self.add_to_cl_list(tags, id);
        id
    }

    /// Pin the block's entry environment: from now on, linked jumps assume
    /// the captured register topology, so the current translation (if any)
    /// must be redone through the needs-translation trampoline.
    pub fn attached_state(&mut self, id: BlockId, env: SmallState, buf: &mut CodeBuffer) {
        let pen = self.get(id).direct_pen;
        if !self.get(id).havestate {
            self.get_mut(id).env = env;
            self.get_mut(id).havestate = true;
        }
        if Some(self.get(id).direct_handler_to_use) == self.get(id).direct_handler {
            self.set_dhtu(id, pen, buf);
        }
        self.get_mut(id).direct_handler = Some(pen);
        self.get_mut(id).status = BlockStatus::Targetted;
    }
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (BlockArena, CacheTags, CodeBuffer) {
        let mut buf = CodeBuffer::new(1 << 20);
        // Fake stub offsets at the buffer start.
        let exec_normal = 0u32;
        let check_csum = 8u32;
        buf.align(32);
        buf.stubs_complete();
        let mut arena = BlockArena::new();
        arena.alloc_blockinfos(&mut buf, exec_normal, check_csum);
        (arena, CacheTags::new(exec_normal), buf)
    }

    #[test]
    fn test_adopt_and_lookup() {
        let (mut arena, mut tags, mut buf) = setup();
        let id = arena.get_blockinfo_addr_new(&mut tags, 0x1000, 10, 0, &mut buf);
        assert_eq!(arena.lookup(&tags, 0x1000), Some(id));
        assert_eq!(arena.lookup(&tags, 0x2000), None);
        assert!(arena.active.contains(&id));
        // Adopting again returns the same block.
        let id2 = arena.get_blockinfo_addr_new(&mut tags, 0x1000, 10, 0, &mut buf);
        assert_eq!(id, id2);
    }

    #[test]
    fn test_directory_invariant_lookup_self() {
        let (mut arena, mut tags, mut buf) = setup();
        // Two PCs hashing to the same line: they differ only above the
        // hashed bits.
        let pc1 = 0x1000;
        let pc2 = 0x1000 + (TAGSIZE as u32);
        assert_eq!(cacheline(pc1), cacheline(pc2));
        let a = arena.get_blockinfo_addr_new(&mut tags, pc1, 10, 0, &mut buf);
        let b = arena.get_blockinfo_addr_new(&mut tags, pc2, 10, 0, &mut buf);
        assert_eq!(arena.lookup(&tags, pc1), Some(a));
        assert_eq!(arena.lookup(&tags, pc2), Some(b));
    }

    #[test]
    fn test_raise_in_cl_list_installs_handler() {
        let (mut arena, mut tags, mut buf) = setup();
        let pc1 = 0x1000;
        let pc2 = 0x1000 + (TAGSIZE as u32);
        let a = arena.get_blockinfo_addr_new(&mut tags, pc1, 10, 0, &mut buf);
        let b = arena.get_blockinfo_addr_new(&mut tags, pc2, 10, 0, &mut buf);
        let cl = cacheline(pc1);
        // b was adopted last, so it heads the chain.
        assert_eq!(tags.head(cl), Some(b));
        arena.get_mut(a).handler_to_use = 0x1234;
        arena.raise_in_cl_list(&mut tags, a);
        assert_eq!(tags.head(cl), Some(a));
        assert_eq!(tags.handler(cl), 0x1234);
    }

    #[test]
    fn test_jmpdep_patching() {
        let (mut arena, mut tags, mut buf) = setup();
        let from = arena.get_blockinfo_addr_new(&mut tags, 0x100, 10, 0, &mut buf);
        let target = arena.get_blockinfo_addr_new(&mut tags, 0x200, 10, 0, &mut buf);

        // Emit a jump whose slot links to the target's current handler.
        use crate::backend::asm::Assembler;
        let mut asm = Assembler::new(&mut buf);
        let slot = asm.jmp();
        let dh = arena.get(target).direct_handler_to_use;
        buf.patch_long(slot, dh);
        arena.create_jmpdep(from, 0, slot, target);

        // Retargeting rewrites the patch site.
        arena.set_dhtu(target, 0xBEEF, &mut buf);
        assert_eq!(buf.read_long(slot), 0xBEEF);
        assert_eq!(arena.get(target).direct_handler_to_use, 0xBEEF);
    }

    #[test]
    fn test_remove_deps_detaches_from_target() {
        let (mut arena, mut tags, mut buf) = setup();
        let from = arena.get_blockinfo_addr_new(&mut tags, 0x100, 10, 0, &mut buf);
        let target = arena.get_blockinfo_addr_new(&mut tags, 0x200, 10, 0, &mut buf);
        arena.create_jmpdep(from, 0, 64, target);
        assert_eq!(arena.get(target).deplist.len(), 1);
        arena.remove_deps(from);
        assert!(arena.get(target).deplist.is_empty());
        // Retargeting now rewrites nothing.
        arena.set_dhtu(target, 0xAAAA, &mut buf);
        assert_ne!(buf.read_long(64), 0xAAAA);
    }

    #[test]
    fn test_invalidate_block_resets_handlers() {
        let (mut arena, mut tags, mut buf) = setup();
        let id = arena.get_blockinfo_addr_new(&mut tags, 0x100, 10, 0, &mut buf);
        arena.get_mut(id).handler = Some(0x4000);
        arena.get_mut(id).handler_to_use = 0x4000;
        arena.invalidate_block(id, 10, 0, &mut buf);
        let bi = arena.get(id);
        assert_eq!(bi.handler, None);
        assert_eq!(bi.count, 9);
        assert_eq!(bi.needed_flags, 0xff);
        assert_eq!(bi.direct_handler_to_use, bi.direct_pen);
    }

    #[test]
    fn test_remove_from_cl_list_restores_default() {
        let (mut arena, mut tags, mut buf) = setup();
        let id = arena.get_blockinfo_addr_new(&mut tags, 0x100, 10, 0, &mut buf);
        let cl = cacheline(0x100);
        arena.remove_from_cl_list(&mut tags, id);
        assert_eq!(tags.head(cl), None);
        assert_eq!(tags.handler(cl), tags.default_handler());
    }
}
