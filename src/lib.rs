//! Batch tooling for pulling course data out of a PrairieLearn-style REST
//! API: a range-bounded log fetcher (`logdump`), a one-shot course snapshot
//! (`snapshot`), and a spreadsheet cross-referencer (`crossref`).

pub mod api;
pub mod archive;
pub mod config;
pub mod crossref;
pub mod fetch;
pub mod search;
pub mod snapshot;
pub mod store;
