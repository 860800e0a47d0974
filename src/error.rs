//! Supervisor-wide error taxonomy.
//!
//! Every fatal path in this system (spec.md §7) is a `SupervisorError`
//! variant. Guest-visible DOS errors (invalid handle, read/write fault) are
//! *not* represented here — they never leave `dos::dispatch`; they're
//! written into the guest's `RegisterSnapshot` and the guest is resumed, as
//! spec.md §7 kind 2 requires.

use thiserror::Error;

use crate::kvm::KvmError;

/// The exit code used for every fatal supervisor error (spec.md §7, §6).
pub const FATAL_EXIT_CODE: u8 = 252;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Fewer than one guest-image argument was given on the command line.
    #[error("usage: {0} <guest-image> [<dos-arg> ...]")]
    Usage(String),

    /// The guest image file could not be opened.
    #[error("cannot open guest image {path}: {source}")]
    OpenImage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The guest image file could not be read.
    #[error("cannot read guest image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The guest image is too large to fit in the memory available after
    /// the PSP (spec.md §4.3, §8 boundary case).
    #[error("guest image is {size} bytes, but only {available} bytes are available")]
    ImageTooLarge { size: u64, available: u64 },

    /// The DOS command-line tail built from the host arguments does not fit
    /// in the PSP's command-tail field, offsets 0x80-0xFF: a 1-byte length,
    /// up to 126 content bytes, and a trailing `\r` (spec.md §4.3, §7 kind
    /// 5, §8 boundary case).
    #[error("DOS command line too long: {len} bytes (max 126)")]
    CommandLineTooLong { len: usize },

    /// A KVM primitive failed (spec.md §7 kind 1).
    #[error(transparent)]
    Kvm(#[from] KvmError),

    /// A structural VCPU exit the dispatch loop cannot recover from, or an
    /// unsupported/unknown DOS service (spec.md §7 kinds 3 and 4).
    #[error("{0}")]
    FatalExit(String),
}
