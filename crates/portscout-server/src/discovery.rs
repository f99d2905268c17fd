use portscout_protocol::{Port, PortEventKind};

/// Error type returned by [`Discovery`] implementations.
///
/// The server only needs the message text to build the failed reply, so
/// implementations keep whatever error types they already use.
pub type DiscoveryError = Box<dyn std::error::Error + Send + Sync>;

/// Callback used to report a port appearing or disappearing while the
/// discovery is running. May be invoked from any task or thread.
pub type EventCallback = Box<dyn Fn(PortEventKind, Port) + Send + Sync>;

/// Callback used to signal an unrecoverable condition while the discovery
/// is running. Once invoked, no more port events will be delivered until
/// the client performs a STOP + START_SYNC cycle.
pub type ErrorCallback = Box<dyn Fn(String) + Send + Sync>;

/// Business logic a pluggable discovery must implement.
///
/// The communication protocol is handled entirely by [`Server`]; these
/// four operations are all a discovery executable has to provide.
///
/// [`Server`]: crate::Server
pub trait Discovery {
    /// Called once at startup with the client's user agent and the
    /// negotiated protocol version.
    fn hello(&mut self, user_agent: &str, protocol_version: i32) -> Result<(), DiscoveryError>;

    /// Begin watching for ports. Implementations report changes through
    /// `events` (typically from a background task of their own) and may
    /// use `errors` to signal an unrecoverable condition.
    ///
    /// The server calls this for both the polling (`START`) and event
    /// (`START_SYNC`) modes; the difference lives entirely in the
    /// callbacks it installs.
    fn start_sync(
        &mut self,
        events: EventCallback,
        errors: ErrorCallback,
    ) -> Result<(), DiscoveryError>;

    /// Stop watching for ports and release the callbacks installed by
    /// [`start_sync`](Discovery::start_sync).
    fn stop(&mut self) -> Result<(), DiscoveryError>;

    /// Called just before the server terminates, as a last chance to
    /// release resources.
    fn quit(&mut self);
}
