//! Flashlog storage engine
//!
//! A log-structured store for erasable media. Every change is appended to a
//! journal; a copy-on-write B-tree index maps keys to node locations and is
//! written out by periodic commits, after which the master record points at
//! the new index root.
//!
//! ## Layers
//!
//! - [`node`] and [`key`] - the on-media node codec and the index key space
//! - [`io`] - the [`io::Device`] abstraction with memory and file backends
//! - [`scan`] - unit scanning, padding and torn-tail handling
//! - [`ledger`] - per-unit space accounting, categorization and its on-media tree
//! - [`budget`] - admission control so that admitted changes can always be committed
//! - [`tnc`] - the in-memory shadow of the index
//! - [`log`], [`journal`] - the reference log and the journal heads
//! - [`master`], [`orphan`] - the root of trust and the orphan area
//! - [`replay`] - rebuilding state after an unclean shutdown
//! - [`store`], [`ops`], [`commit`], [`gc`], [`background`] - the mounted volume
//!
//! ## On-media layout
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬──────────┬──────────────────────────┐
//! │ master  │   log   │  ledger  │ orphans  │   main: journal + index  │
//! │ 2 units │ ≥2 units│ ≥2 units │ 2 units  │                          │
//! └─────────┴─────────┴──────────┴──────────┴──────────────────────────┘
//! ```

pub mod background;
pub mod budget;
pub mod commit;
pub mod config;
pub mod error;
pub mod gc;
pub mod io;
pub mod journal;
pub mod key;
pub mod ledger;
pub mod log;
pub mod master;
pub mod node;
pub mod ops;
pub mod orphan;
pub mod replay;
pub mod scan;
pub mod store;
pub mod tnc;
