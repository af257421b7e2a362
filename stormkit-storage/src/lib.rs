//! Shared infrastructure for the Stormkit edge and runner: the KV client
//! (strings, sorted sets, lists, pub/sub, distributed locks) and the object
//! store adapter over S3-compatible and local filesystem backends.

pub mod kv;
pub mod objectstore;

pub use kv::{Kv, KvError, KvLock};
pub use objectstore::{
    DeleteArtifactsArgs, FileContent, GetFileArgs, ObjectStore, StoreError, UploadArgs,
    UploadOverview, UploadResult, content_type_for, headers_size,
};
