//! End-to-end translation scenarios: guest programs are assembled into a
//! flat bus, warmed through the profile/translate ladder, and their
//! guest-visible effects compared against pure interpretation.

mod common;

use common::MiniCpu;
use m68k_jit::{FlatBus, Jit, JitConfig, MemBus, OpTable, Regs};
use pretty_assertions::assert_eq;

/// A schedule that translates on the second execution.
fn quick_cfg() -> JitConfig {
    JitConfig {
        cachesize: 1024,
        optcount: [2, 0, 0, 0, 0, 0, -1, -1, -1, -1],
        ..JitConfig::default()
    }
}

fn mk_jit(enabled: bool) -> Jit {
    let mut jit = Jit::new(quick_cfg(), OpTable::new()).unwrap();
    jit.set_cache_state(enabled);
    jit
}

/// Run until the program halts (unknown opcode raises a pending event).
fn run_to_halt(
    jit: &mut Jit,
    bus: &mut FlatBus,
    cpu: &mut MiniCpu,
    setup: impl Fn(&mut Regs),
) -> Regs {
    let mut regs = Regs::default();
    setup(&mut regs);
    regs.countdown = 4000;
    jit.run(&mut regs, bus, cpu);
    regs
}

#[test]
fn test_move_l_rts_runs_natively() {
    let mut bus = FlatBus::new(0x10000);
    bus.put_word(0x1000, 0x2200); // move.l d0,d1
    bus.put_word(0x1002, 0x4e75); // rts
    bus.put_word(0x2000, 0x4afc); // halt
    bus.put_long(0x8000, 0x2000); // return address on the stack

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();

    let setup = |r: &mut Regs| {
        r.regs[0] = 0xDEADBEEF;
        r.regs[15] = 0x8000;
        r.pc_p = 0x1000;
    };

    for _ in 0..6 {
        let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(regs.regs[1], 0xDEADBEEF);
        assert_eq!(regs.pc_p, 0x2000, "RTS must pop the return address");
        assert_eq!(regs.regs[15], 0x8004);
    }
    assert!(jit.compile_count() >= 2, "block never reached translation");
    assert!(jit.jitted_size() > 0);

    // Prove the body runs natively now: the fallback only ever sees the
    // halt opcode.
    cpu.trace.clear();
    run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    assert!(!cpu.trace.is_empty());
    assert!(
        cpu.trace.iter().all(|&op| op == 0x4afc),
        "translated opcodes still reach the interpreter: {:04x?}",
        cpu.trace
    );
}

#[test]
fn test_dbra_loop_matches_interpretation() {
    let program = |bus: &mut FlatBus| {
        bus.put_word(0x400, 0x7005); // moveq #5,d0
        bus.put_word(0x402, 0x5241); // addq.w #1,d1
        bus.put_word(0x404, 0x51c8); // dbra d0,...
        bus.put_word(0x406, 0xfffc); // ... back to 0x402
        bus.put_word(0x408, 0x4afc); // halt
    };
    let setup = |r: &mut Regs| r.pc_p = 0x400;

    // Oracle: pure interpretation.
    let mut oracle_bus = FlatBus::new(0x10000);
    program(&mut oracle_bus);
    let mut oracle_jit = mk_jit(false);
    let mut oracle_cpu = MiniCpu::new();
    let want = run_to_halt(&mut oracle_jit, &mut oracle_bus, &mut oracle_cpu, setup);
    assert_eq!(want.regs[1], 6, "loop body runs counter+1 times");
    assert_eq!(want.regs[0] & 0xffff, 0xffff);

    // Translated: warm through profile, countdown expiry and relinking.
    let mut bus = FlatBus::new(0x10000);
    program(&mut bus);
    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    for _ in 0..8 {
        let got = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(got.regs[0], want.regs[0]);
        assert_eq!(got.regs[1], want.regs[1]);
        assert_eq!(got.pc_p, want.pc_p);
    }
    assert!(jit.compile_count() >= 2);
}

#[test]
fn test_add_b_overflow_flags() {
    // add.b with 0x7F + 0x01: result 0x80, N=1 V=1 C=0 Z=0 X=0.
    let mut bus = FlatBus::new(0x10000);
    bus.put_word(0x500, 0x707f); // moveq #0x7f,d0
    bus.put_word(0x502, 0x7201); // moveq #1,d1
    bus.put_word(0x504, 0xd001); // add.b d1,d0
    bus.put_word(0x506, 0x4afc); // halt

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    let setup = |r: &mut Regs| r.pc_p = 0x500;

    for _ in 0..6 {
        let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(regs.regs[0] & 0xff, 0x80);
        let ccr = regs.flags.ccr();
        assert_eq!(ccr & 0x08, 0x08, "N set");
        assert_eq!(ccr & 0x02, 0x02, "V set");
        assert_eq!(ccr & 0x01, 0x00, "C clear");
        assert_eq!(ccr & 0x04, 0x00, "Z clear");
        assert_eq!(regs.flags.x, 0, "X clear");
    }
    assert!(jit.compile_count() >= 2);
}

#[test]
fn test_arith_mix_matches_interpretation() {
    let program = |bus: &mut FlatBus| {
        bus.put_word(0x600, 0x7011); // moveq #0x11,d0
        bus.put_word(0x602, 0x7477); // moveq #0x77,d2
        bus.put_word(0x604, 0x3002); // move.w d2,d0
        bus.put_word(0x606, 0xd442); // add.w d2,d2
        bus.put_word(0x608, 0x9042); // sub.w d2,d0
        bus.put_word(0x60a, 0xc440); // and.w d0,d2
        bus.put_word(0x60c, 0x4600); // not.b d0
        bus.put_word(0x60e, 0x4880); // ext.w d0
        bus.put_word(0x610, 0xb442); // cmp.w d2,d2
        bus.put_word(0x612, 0x4afc); // halt
    };
    let setup = |r: &mut Regs| r.pc_p = 0x600;

    let mut oracle_bus = FlatBus::new(0x10000);
    program(&mut oracle_bus);
    let mut oracle_jit = mk_jit(false);
    let want = run_to_halt(&mut oracle_jit, &mut oracle_bus, &mut MiniCpu::new(), setup);

    let mut bus = FlatBus::new(0x10000);
    program(&mut bus);
    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    for _ in 0..6 {
        let got = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(got.regs[0], want.regs[0]);
        assert_eq!(got.regs[2], want.regs[2]);
        assert_eq!(got.flags.ccr(), want.flags.ccr(), "CCR trajectory must match");
    }
}

#[test]
fn test_forward_branch_matches_interpretation() {
    let program = |bus: &mut FlatBus| {
        bus.put_word(0x700, 0x7001); // moveq #1,d0
        bus.put_word(0x702, 0xb240); // cmp.w d0,d1
        bus.put_word(0x704, 0x6704); // beq.s +4 (to 0x70a)
        bus.put_word(0x706, 0x7402); // moveq #2,d2
        bus.put_word(0x708, 0x4afc); // halt (not-taken path)
        bus.put_word(0x70a, 0x7403); // moveq #3,d2
        bus.put_word(0x70c, 0x4afc); // halt (taken path)
    };

    for d1 in [0u32, 1u32] {
        let setup = |r: &mut Regs| {
            r.pc_p = 0x700;
            r.regs[1] = d1;
        };
        let mut oracle_bus = FlatBus::new(0x10000);
        program(&mut oracle_bus);
        let mut oracle = mk_jit(false);
        let want = run_to_halt(&mut oracle, &mut oracle_bus, &mut MiniCpu::new(), setup);

        let mut bus = FlatBus::new(0x10000);
        program(&mut bus);
        let mut jit = mk_jit(true);
        let mut cpu = MiniCpu::new();
        for _ in 0..6 {
            let got = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
            assert_eq!(got.regs[2], want.regs[2], "wrong edge taken for d1={}", d1);
            assert_eq!(got.pc_p, want.pc_p);
        }
    }
}

#[test]
fn test_memory_moves_through_direct_map() {
    // Stores byte-swap into the big-endian image; loads swap back.
    let program = |bus: &mut FlatBus| {
        bus.put_word(0x780, 0x2080); // move.l d0,(a0)
        bus.put_word(0x782, 0x2410); // move.l (a0),d2
        bus.put_word(0x784, 0x3280); // move.w d0,(a1)
        bus.put_word(0x786, 0x3611); // move.w (a1),d3
        bus.put_word(0x788, 0x4afc); // halt
    };
    let setup = |r: &mut Regs| {
        r.pc_p = 0x780;
        r.regs[0] = 0xCAFE1234;
        r.regs[8] = 0x6000; // a0
        r.regs[9] = 0x6100; // a1
    };

    let mut oracle_bus = FlatBus::new(0x10000);
    program(&mut oracle_bus);
    let mut oracle = mk_jit(false);
    let want = run_to_halt(&mut oracle, &mut oracle_bus, &mut MiniCpu::new(), setup);
    assert_eq!(want.regs[2], 0xCAFE1234);

    let mut bus = FlatBus::new(0x10000);
    program(&mut bus);
    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    for _ in 0..6 {
        let got = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(got.regs[2], want.regs[2]);
        assert_eq!(got.regs[3], want.regs[3]);
        assert_eq!(got.flags.ccr(), want.flags.ccr());
        // The image itself holds guest byte order.
        assert_eq!(bus.lget(0x6000), 0xCAFE1234);
        assert_eq!(bus.direct().unwrap()[0x6000], 0xCA);
    }
    assert!(jit.compile_count() >= 2);
}

#[test]
fn test_self_modifying_code_detected_by_soft_flush() {
    let mut bus = FlatBus::new(0x10000);
    bus.put_word(0x800, 0x7001); // moveq #1,d0
    bus.put_word(0x802, 0x4afc);

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    let setup = |r: &mut Regs| r.pc_p = 0x800;

    for _ in 0..5 {
        let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(regs.regs[0], 1);
    }
    assert!(jit.compile_count() >= 2);

    // The guest rewrites its own code; a soft flush forces the checksum
    // path on next entry.
    bus.put_word(0x800, 0x7002); // moveq #2,d0
    jit.flush_icache();
    let compiles = jit.compile_count();
    let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    assert_eq!(regs.regs[0], 2, "stale translation survived a code change");
    assert!(jit.compile_count() > compiles, "changed block must retranslate");
}

#[test]
fn test_soft_flush_reactivates_unchanged_block() {
    let mut bus = FlatBus::new(0x10000);
    bus.put_word(0x900, 0x7007);
    bus.put_word(0x902, 0x4afc);

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    let setup = |r: &mut Regs| r.pc_p = 0x900;

    for _ in 0..5 {
        run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    }
    let compiles = jit.compile_count();
    let size = jit.jitted_size();

    jit.flush_icache();
    let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    assert_eq!(regs.regs[0], 7);
    // Checksums matched: same translation, no new code.
    assert_eq!(jit.compile_count(), compiles);
    assert_eq!(jit.jitted_size(), size);
}

#[test]
fn test_hard_flush_recompiles_equivalently() {
    let mut bus = FlatBus::new(0x10000);
    bus.put_word(0xa00, 0x7004);
    bus.put_word(0xa02, 0x5240); // addq.w #1,d0
    bus.put_word(0xa04, 0x4afc);

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    let setup = |r: &mut Regs| r.pc_p = 0xa00;

    let mut before = Regs::default();
    for _ in 0..5 {
        before = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    }
    jit.flush_icache_hard();
    assert_eq!(jit.jitted_size(), 0);

    let mut after = Regs::default();
    for _ in 0..5 {
        after = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    }
    assert_eq!(after.regs[0], before.regs[0]);
    assert_eq!(after.flags.ccr(), before.flags.ccr());
}

#[test]
fn test_rom_blocks_skip_checksums() {
    let mut bus = FlatBus::new(0x10000).with_rom_at(0x4000);
    bus.put_word(0x4100, 0x700a);
    bus.put_word(0x4102, 0x4afc);

    let mut jit = mk_jit(true);
    let mut cpu = MiniCpu::new();
    let setup = |r: &mut Regs| r.pc_p = 0x4100;

    for _ in 0..5 {
        let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
        assert_eq!(regs.regs[0], 0x0a);
    }
    let compiles = jit.compile_count();
    // A soft flush does not demote ROM blocks (they are dormant already);
    // re-execution reuses the translation without a checksum pass.
    jit.flush_icache();
    let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, setup);
    assert_eq!(regs.regs[0], 0x0a);
    assert_eq!(jit.compile_count(), compiles);
}

#[test]
fn test_cache_pressure_hard_flushes_and_recovers() {
    // Fill a small cache with many distinct blocks; the engine must hard
    // flush when the buffer nears capacity and keep translating correctly.
    let mut bus = FlatBus::new(0x40000);
    let mut jit = Jit::new(
        JitConfig { cachesize: 256, optcount: [2, 0, 0, 0, 0, 0, -1, -1, -1, -1], ..JitConfig::default() },
        OpTable::new(),
    )
    .unwrap();
    jit.set_cache_state(true);
    let mut cpu = MiniCpu::new();

    let n_blocks = 600u32;
    for i in 0..n_blocks {
        let base = 0x1000 + i * 8;
        bus.put_word(base, 0x7000 | ((i & 0x7f) as u16)); // moveq #k,d0
        bus.put_word(base + 2, 0x4afc);
    }
    for round in 0..3 {
        for i in 0..n_blocks {
            let base = 0x1000 + i * 8;
            let regs = run_to_halt(&mut jit, &mut bus, &mut cpu, |r| r.pc_p = base);
            assert_eq!(regs.regs[0], (i & 0x7f) as u32, "round {} block {}", round, i);
        }
    }
    assert!(jit.jitted_size() > 0);
}
