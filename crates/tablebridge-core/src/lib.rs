//! Core engines for moving tables between a remote tabular service and Arrow.
//!
//! This crate provides the foundational pieces for `tablebridge`:
//!
//! - Capability traits for the remote service and an in-process
//!   implementation of them (`remote` module).
//! - Session lifecycle: credential resolution, keep-alive, scoped use and
//!   process-wide cleanup (`session` module).
//! - Paginated reads of remote tables into `RecordBatch`es or CSV files
//!   (`table` module).
//! - Two-pass schema inference and chunked upload of local tables
//!   (`push` module).
//! - Out-of-band registration of large Parquet artifacts (`registration`
//!   module).
//! - Reads of plain CSV files attached to the service (`raw_file` module).
//!
//! Higher-level crates (for example a notebook binding or a CLI) are expected
//! to depend on the `tablebridge` facade rather than on these module paths.
#![deny(missing_docs)]
pub mod columns;
pub mod config;
pub mod entity;
pub mod progress;
pub mod push;
pub mod raw_file;
pub mod registration;
pub mod remote;
pub mod session;
pub mod storage;
pub mod table;
