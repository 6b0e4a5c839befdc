//! Bit-packed k-mer position index (edition 2024).
//!
//! Maps fixed-width mers to every corpus position they occur at, with memory
//! proportional to the number of *distinct* mers:
//! - each mer splits into a table address and a check value that together
//!   rebuild it exactly, so only the check is stored
//! - two-pass counting-sort build from any replayable [`KeySource`]
//! - exact lookups plus bounded-substitution lookups that re-verify every hit
//! - one-file save/load, with a metadata-only load for quick inspection
//!
//! A built [`PositionDb`] is `Sync`; lookups take `&self` and a caller-owned
//! output buffer. [`PositionDb::filter`] takes `&mut self`.

/// Log at info when `$loud`, else at debug.
macro_rules! progress {
    ($loud:expr, $($arg:tt)+) => {
        if $loud {
            log::info!($($arg)+)
        } else {
            log::debug!($($arg)+)
        }
    };
}

mod bits;
mod builder;
pub mod codec;
pub mod encode;
mod index;
mod io;
mod mismatch;
mod radix;
mod stream;

pub use builder::{BuildConfig, MAX_TABLE_BITS, SizingPlan, build_position_db, plan_table};
pub use codec::{KeyCodec, MAX_MER_SIZE};
pub use encode::{base_mismatches, canonical, decode_kmer, encode_kmer, revcomp};
pub use index::{IndexError, MerCounts, PositionDb};
pub use io::{FileHeader, HEADER_BYTES, POSDB_MAGIC, POSDB_VERSION};
pub use mismatch::{MismatchMatcher, PATTERN_BUDGET_FLOOR};
pub use stream::{CountAuthority, KeySet, KeySource, MerPosition, SeqMerStream, SeqMers};
