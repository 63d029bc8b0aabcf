//! End-to-end scenarios over a formatted device
//!
//! `scenarios` walks the format/mount, snapshot, copy-on-write, archive,
//! crash-recovery, and reclamation stories; `properties` checks the
//! quantified invariants with sweeps and a randomized reference model.

mod properties;
mod scenarios;
mod util;
