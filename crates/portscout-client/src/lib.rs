//! Host-side supervisor for pluggable port-discovery executables.
//!
//! A [`Client`] spawns a discovery executable, performs the `HELLO`
//! handshake on its stdio, and then exposes the protocol commands as
//! async methods. Replies are demultiplexed from asynchronous port
//! events by a background decode task: replies answer the in-flight
//! command, while `add`/`remove` events flow to the channel returned by
//! [`Client::start_sync`].
//!
//! # Example
//!
//! ```no_run
//! use portscout_client::{Client, Event};
//!
//! # async fn example() -> Result<(), portscout_client::ClientError> {
//! let mut client = Client::new("builtin", ["serial-discovery"]);
//! client.run().await?;
//!
//! let mut events = client.start_sync(16).await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Add { port, .. } => println!("new port: {port}"),
//!         Event::Remove { port, .. } => println!("gone: {port}"),
//!         Event::Stop { .. } => break,
//!     }
//! }
//!
//! client.quit().await;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::{Client, ClientError, Event};

pub use portscout_protocol::{Message, Port};
