//! Wrapper prelude.
//!
//! The `tablebridge` crate is the supported public entry point. Downstream
//! code should prefer importing from this prelude instead of depending on
//! internal core module paths.

pub use crate::registration;
pub use crate::{
    BatchSource, CsvSource, EntityKind, EntityRef, FetchedTable, NoProgress, ProgressSink,
    PushError, ReadOptions, Session, SessionError, TableError, TableId, TableSource,
    UploadRequest, Uploaded, download_table, read_table, upload_table,
};
