//! Append-only, content-addressed, signed DAG log.
//!
//! Every [`Entry`] names its causal predecessors by hash, carries a Lamport
//! clock and is signed by its writer. A [`Log`] holds the entries it has
//! accepted together with its current heads and projects them into a
//! deterministic total order with [`Log::list`].
//!
//! Remote entries arrive through [`Log::merge`]: missing ancestors are pulled
//! through an [`EntryFetcher`], each entry is checked (hash, signature,
//! access, decryption) and accepted entries are installed in causal order.
//! Descendants of a rejected entry are never linked in.

mod cache;
mod entry;
mod error;
mod fetch;
mod oplog;
mod merge;

#[cfg(test)]
mod tests;

pub use cache::{HeadCache, HeadStore};
pub use entry::{Entry, OpKind, Operation, Record};
pub use error::{LogError, Result};
pub use fetch::{EntryFetcher, StoreFetcher};
pub use oplog::{Amount, Direction, ListOptions, Log, LogContext};
pub use merge::{FetchedEntry, MergeReport, Rejection, ResolvedBatch, Verdict};
