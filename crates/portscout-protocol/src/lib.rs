//! Wire types and stream codec for the pluggable port-discovery protocol.
//!
//! A discovery is a child process that enumerates communication ports on
//! behalf of a host tool. The two peers talk over the child's stdio: the
//! host writes text commands (`HELLO`, `START`, `LIST`, `START_SYNC`,
//! `STOP`, `QUIT`), the discovery answers with pretty-printed JSON
//! documents and, in event mode, asynchronous `add`/`remove` port events.
//!
//! This crate holds the pieces shared by both sides:
//!
//! - [`Port`]: descriptor for a discovered port
//! - [`Message`]: the single JSON record used for every reply and event
//! - [`MessageDecoder`]: incremental decoder for the discovery's output
//!   stream (a sequence of concatenated JSON values, not line-delimited)

pub mod decode;
pub mod message;
pub mod port;

pub use decode::{DecodeError, MessageDecoder};
pub use message::{Message, PortEventKind};
pub use port::Port;
