//! On-disk storage for the embedded engine.
//!
//! Provides:
//! - Storage scope naming (`<base>/<component>/<schema-version>-<caller id>`)
//! - Lockable `data[N]` candidate selection shared safely between processes

pub mod locator;

pub use locator::{
    LocateError, StorageLease, StorageLocator, StorageScope, CANDIDATE_LIMIT, DATA_DIR_NAME,
    LOCK_FILE_NAME,
};
