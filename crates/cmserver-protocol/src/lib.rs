//! Framing and message types for the build-configuration server protocol.
//!
//! The backend speaks JSON objects wrapped between literal markers over a
//! local pipe. Every object carries a `type` discriminator; requests carry a
//! client-chosen `cookie` that the backend echoes on the matching reply or
//! error.
//!
//! # Example
//!
//! ```rust
//! use cmserver_protocol::{Envelope, MessageFramer, Request, RequestEnvelope, encode_message};
//!
//! let bytes = encode_message(&RequestEnvelope::new("1", Request::Compute)).unwrap();
//! let mut framer = MessageFramer::new();
//! let payloads = framer.feed(&bytes).unwrap();
//! let decoded = RequestEnvelope::decode(&payloads[0]).unwrap();
//! assert_eq!(decoded.request, Request::Compute);
//!
//! let hello = Envelope::decode(r#"{"type":"hello","supportedProtocolVersions":[]}"#).unwrap();
//! assert_eq!(hello.kind(), "hello");
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{MessageFramer, encode_message};
pub use types::{
    BuildFiles, CacheContent, CacheEntry, CmakeInputs, CodeModel, CodeModelConfiguration,
    CodeModelFileGroup, CodeModelProject, CodeModelTarget, Envelope, ErrorReply,
    GlobalSettings, GlobalSettingsUpdate, HandshakeParameters, Hello, IncludePath,
    MessageNotice, Progress, ProtocolVersion, Reply, ReplyContent, Request, RequestEnvelope,
    Signal, VersionRequest,
};

/// Name embedded in both framing markers.
pub const PROTOCOL_NAME: &str = "CMake Server";

/// Marker preceding every payload.
pub const OPEN_MARKER: &str = "[== \"CMake Server\" ==[";

/// Marker following every payload.
pub const CLOSE_MARKER: &str = "]== \"CMake Server\" ==]";

/// Default bound on bytes buffered by a [`MessageFramer`] (64 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;
