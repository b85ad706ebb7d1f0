//! gravity-client: native sync agent for gravity notes.
//!
//! Wires the sync core to a real environment: file-backed key-value
//! storage, an HTTP transport against the gravity backend, and a
//! background service that flushes and pulls on an interval.

pub mod file_kv;
pub mod http;
pub mod service;
pub mod session;

pub use file_kv::FileKv;
pub use http::HttpTransport;
pub use service::{ServiceConfig, SyncService};
pub use session::StaticSession;
