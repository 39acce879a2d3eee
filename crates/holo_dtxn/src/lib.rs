//! Deterministic transaction ordering core.
//!
//! Sites replicate partitions by running the same transactions in the same
//! global order. Initiators stamp work with ordered ids, sites admit it only
//! once no older id can still arrive, and multipartition work is coordinated
//! through fragment dependencies. Callers supply an `ExecutionEngine`, a
//! `Mailbox` and a `SiteTracker`.

pub mod dtxn;
