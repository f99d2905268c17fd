//! Protocol state machine for pluggable port-discovery executables.
//!
//! A discovery executable links this crate, implements the [`Discovery`]
//! trait with its enumeration logic, and hands its stdio to
//! [`Server::run`]. The server owns everything protocol-related: command
//! framing, the HELLO handshake, the lifecycle state machine, and the
//! JSON serialization of replies and asynchronous port events.
//!
//! # Example
//!
//! ```no_run
//! use portscout_server::{Discovery, DiscoveryError, ErrorCallback, EventCallback, Server};
//!
//! struct MyDiscovery;
//!
//! impl Discovery for MyDiscovery {
//!     fn hello(&mut self, _user_agent: &str, _protocol_version: i32) -> Result<(), DiscoveryError> {
//!         Ok(())
//!     }
//!     fn start_sync(
//!         &mut self,
//!         _events: EventCallback,
//!         _errors: ErrorCallback,
//!     ) -> Result<(), DiscoveryError> {
//!         // Begin watching for ports and report them through `events`.
//!         Ok(())
//!     }
//!     fn stop(&mut self) -> Result<(), DiscoveryError> {
//!         Ok(())
//!     }
//!     fn quit(&mut self) {}
//! }
//!
//! # async fn example() -> Result<(), portscout_server::ServerError> {
//! let mut server = Server::new(MyDiscovery);
//! server.run(tokio::io::stdin(), tokio::io::stdout()).await
//! # }
//! ```

mod discovery;
mod server;

pub use discovery::{Discovery, DiscoveryError, ErrorCallback, EventCallback};
pub use server::{Server, ServerError};

pub use portscout_protocol::{Message, Port, PortEventKind};
