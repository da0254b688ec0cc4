pub mod hash;
pub mod redaction;
pub mod sql;

pub use hash::{content_hash, sha256_hex};
pub use redaction::redact_fields;
