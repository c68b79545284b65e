//! Dynamic binary translator core for a 68k-family emulator.
//!
//! Observes sequences of guest instructions at runtime, translates hot
//! blocks into code for a portable host encoding, caches the translations
//! in a hash-indexed directory, and links blocks to each other with
//! patchable jumps. Self-modifying code is caught by checksums over the
//! covered guest bytes; a soft flush demotes blocks to a dormant list that
//! re-verifies before reuse.
//!
//! The enclosing emulator supplies guest memory ([`memory::MemBus`]), the
//! opcode property table ([`optable::OpTable`]) and a one-instruction
//! interpreter ([`optable::Fallback`]); the engine ([`jit::Jit`]) owns
//! everything else. A self-contained 29F010 flash-ROM command decoder
//! ([`flash::Flash`]) rides along.

pub mod backend;
pub mod blocks;
pub mod comp;
pub mod config;
pub mod cpu;
pub mod flash;
pub mod jit;
pub mod memory;
pub mod optable;

pub use config::{JitConfig, Trust};
pub use cpu::{CpuHistoryEnt, FlagSet, Regs, SpcFlag};
pub use flash::Flash;
pub use jit::{Jit, RunExit};
pub use memory::{FlatBus, MemBus, SpecialMem};
pub use optable::{Fallback, OpProps, OpTable};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("translation cache too small: {0} KB")]
    CacheTooSmall(u32),
}
