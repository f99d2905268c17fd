use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use portscout_protocol::{Message, MessageDecoder, Port};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, error};

/// How long to wait for the reply to a regular command.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for the reply to `QUIT` before tearing down anyway.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by the discovery client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("timeout waiting for message from {0}")]
    Timeout(String),

    #[error("event out of sync, expected '{expected}', received '{actual}'")]
    OutOfSync {
        expected: &'static str,
        actual: String,
    },

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("communication out of sync, expected 'OK', received '{0}'")]
    NotOk(String),

    #[error("protocol version not supported: requested 1, got {0}")]
    UnsupportedVersion(i32),

    #[error("connection closed")]
    Disconnected,

    #[error("decoder stopped: {0}")]
    DecoderStopped(String),
}

/// A port event delivered on the channel returned by
/// [`Client::start_sync`].
///
/// `Stop` is a synthetic marker pushed by the client itself right before
/// the channel closes, so consumers that do not watch for channel
/// closure can still tell a graceful end of the stream from a crash.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Add { port: Port, discovery_id: String },
    Remove { port: Port, discovery_id: String },
    Stop { discovery_id: String },
}

impl Event {
    /// Identifier of the discovery that produced this event.
    #[must_use]
    pub fn discovery_id(&self) -> &str {
        match self {
            Event::Add { discovery_id, .. }
            | Event::Remove { discovery_id, .. }
            | Event::Stop { discovery_id } => discovery_id,
        }
    }
}

/// State shared between the client and its decode task.
#[derive(Default)]
struct State {
    process: Option<Child>,
    decode_failure: Option<String>,
    events: Option<mpsc::Sender<Event>>,
}

struct Shared {
    id: String,
    state: Mutex<State>,
}

impl Shared {
    /// Close the active event channel, if any: push the synthetic `Stop`
    /// marker, then drop the sender so the channel closes.
    ///
    /// The slot is cleared under the lock before the marker is sent, so
    /// nothing can enqueue behind the marker; the send itself happens
    /// with the lock released because a full channel waits for the
    /// consumer.
    async fn stop_sync(&self) {
        let sender = self.state.lock().unwrap().events.take();
        if let Some(sender) = sender {
            let _ = sender
                .send(Event::Stop {
                    discovery_id: self.id.clone(),
                })
                .await;
        }
    }

    /// Kill and reap the child process. Errors are logged, never
    /// propagated.
    async fn kill_process(&self) {
        let child = self.state.lock().unwrap().process.take();
        if let Some(mut child) = child {
            debug!(id = %self.id, "killing discovery process");
            if let Err(e) = child.kill().await {
                error!(id = %self.id, "killing discovery process: {e}");
            }
        }
    }
}

/// Supervisor for one discovery executable.
///
/// Commands map one-to-one onto the wire protocol; each waits for its
/// reply with a timeout and validates it before returning. If the child
/// crashes or emits garbage, the decode task kills the process, closes
/// the event channel and fails every pending and future wait.
pub struct Client {
    id: String,
    process_args: Vec<String>,
    user_agent: String,
    outgoing: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    incoming: Option<mpsc::UnboundedReceiver<Message>>,
    shared: Arc<Shared>,
}

impl Client {
    /// Create a client for the given discovery command line. Nothing is
    /// spawned until [`Client::run`].
    pub fn new<I, S>(id: impl Into<String>, process_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        Self {
            id: id.clone(),
            process_args: process_args.into_iter().map(Into::into).collect(),
            user_agent: "portscout".to_string(),
            outgoing: None,
            incoming: None,
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Identifier of this discovery.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the user agent embedded in the `HELLO` payload.
    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = user_agent.into();
    }

    /// Whether the discovery process is currently running.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.shared.state.lock().unwrap().process.is_some()
    }

    /// Spawn the discovery executable and perform the `HELLO` handshake.
    /// If the handshake fails for any reason the child is killed before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Spawn or pipe failures, plus every reply-validation error of the
    /// handshake (wrong event type, `error` flag, non-`OK` message, or a
    /// protocol version greater than 1).
    pub async fn run(&mut self) -> Result<(), ClientError> {
        self.run_process().await?;
        if let Err(e) = self.handshake().await {
            self.shared.kill_process().await;
            return Err(e);
        }
        Ok(())
    }

    /// Enter polling mode. Must be called before [`Client::list`].
    ///
    /// # Errors
    ///
    /// Pipe, timeout and reply-validation errors.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        self.send_command("START\n").await?;
        let msg = self.wait_message(REPLY_TIMEOUT).await?;
        check_reply(&msg, "start")?;
        check_ok(&msg)
    }

    /// Leave polling or event mode. Closes the event channel handed out
    /// by [`Client::start_sync`], if one is active.
    ///
    /// # Errors
    ///
    /// Pipe, timeout and reply-validation errors.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        self.send_command("STOP\n").await?;
        let msg = self.wait_message(REPLY_TIMEOUT).await?;
        check_reply(&msg, "stop")?;
        check_ok(&msg)?;
        self.shared.stop_sync().await;
        Ok(())
    }

    /// Enumerate the ports currently known to the discovery. Only valid
    /// in polling mode.
    ///
    /// # Errors
    ///
    /// Pipe, timeout and reply-validation errors.
    pub async fn list(&mut self) -> Result<Vec<Port>, ClientError> {
        self.send_command("LIST\n").await?;
        let msg = self.wait_message(REPLY_TIMEOUT).await?;
        check_reply(&msg, "list")?;
        Ok(msg.ports.unwrap_or_default())
    }

    /// Enter event mode and return the channel port events will be
    /// delivered on. An initial burst of `add` events reporting the
    /// already-known ports may arrive right away.
    ///
    /// The channel holds up to `buffer` events (at least one); once it
    /// is full the decode task waits for the consumer, so a consumer
    /// that stops reading stalls event processing for this discovery.
    /// The channel is closed, after a final [`Event::Stop`] marker, by
    /// [`Client::stop`], [`Client::quit`], or the child terminating.
    ///
    /// # Errors
    ///
    /// Pipe, timeout and reply-validation errors.
    pub async fn start_sync(&mut self, buffer: usize) -> Result<mpsc::Receiver<Event>, ClientError> {
        self.send_command("START_SYNC\n").await?;
        let msg = self.wait_message(REPLY_TIMEOUT).await?;
        check_reply(&msg, "start_sync")?;
        check_ok(&msg)?;

        // Close any event channel left over from a previous session
        // before installing the new one.
        self.shared.stop_sync().await;
        let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
        self.shared.state.lock().unwrap().events = Some(events_tx);
        Ok(events_rx)
    }

    /// Terminate the discovery: send `QUIT`, wait briefly for the
    /// acknowledgement, then close the event channel and kill the
    /// process unconditionally.
    pub async fn quit(&mut self) {
        let _ = self.send_command("QUIT\n").await;
        if let Err(e) = self.wait_message(QUIT_TIMEOUT).await {
            error!(id = %self.id, "quitting discovery: {e}");
        }
        self.shared.stop_sync().await;
        self.shared.kill_process().await;
    }

    async fn handshake(&mut self) -> Result<(), ClientError> {
        self.send_command(&format!("HELLO 1 \"arduino-cli {}\"\n", self.user_agent))
            .await?;
        let msg = self.wait_message(REPLY_TIMEOUT).await?;
        check_reply(&msg, "hello")?;
        check_ok(&msg)?;
        let version = msg.protocol_version.unwrap_or(0);
        if version > 1 {
            return Err(ClientError::UnsupportedVersion(version));
        }
        Ok(())
    }

    async fn run_process(&mut self) -> Result<(), ClientError> {
        debug!(id = %self.id, "starting discovery process");
        let (program, args) = self
            .process_args
            .split_first()
            .ok_or_else(|| ClientError::Process("empty discovery command line".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Process("failed to get stdout handle".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Process("failed to get stdin handle".to_string()))?;

        // The decoder is attached before the handle is published so the
        // child's earliest output is already covered.
        self.outgoing = Some(Box::new(stdin));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.incoming = Some(reply_rx);
        tokio::spawn(decode_loop(Arc::clone(&self.shared), stdout, reply_tx));

        self.shared.state.lock().unwrap().process = Some(child);
        debug!(id = %self.id, "discovery process started");
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<(), ClientError> {
        debug!(id = %self.id, command = command.trim_end(), "sending command");
        let out = self
            .outgoing
            .as_mut()
            .ok_or_else(|| ClientError::Process("discovery process not started".to_string()))?;
        out.write_all(command.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    /// Wait for the next non-event message from the discovery.
    ///
    /// Once the decode task has terminated, every call reports the
    /// stored decode failure, or [`ClientError::Disconnected`] after a
    /// clean EOF.
    async fn wait_message(&mut self, limit: Duration) -> Result<Message, ClientError> {
        let incoming = self
            .incoming
            .as_mut()
            .ok_or_else(|| ClientError::Process("discovery process not started".to_string()))?;
        match timeout(limit, incoming.recv()).await {
            Err(_) => Err(ClientError::Timeout(self.id.clone())),
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => {
                let failure = self.shared.state.lock().unwrap().decode_failure.clone();
                match failure {
                    Some(e) => Err(ClientError::DecoderStopped(e)),
                    None => Err(ClientError::Disconnected),
                }
            }
        }
    }
}

impl std::fmt::Display for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

fn check_reply(msg: &Message, expected: &'static str) -> Result<(), ClientError> {
    if msg.event_type != expected {
        return Err(ClientError::OutOfSync {
            expected,
            actual: msg.event_type.clone(),
        });
    }
    if msg.error {
        return Err(ClientError::CommandFailed(
            msg.message.clone().unwrap_or_default(),
        ));
    }
    Ok(())
}

fn check_ok(msg: &Message) -> Result<(), ClientError> {
    let text = msg.message.as_deref().unwrap_or("");
    if text.eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(ClientError::NotOk(text.to_string()))
    }
}

/// Consume the discovery's output stream until EOF or a decode failure.
///
/// `add`/`remove` events are forwarded to the active event channel (or
/// dropped when none is installed); every other message answers the
/// in-flight command. On termination the failure is recorded, the event
/// channel is closed, the child is killed and the reply queue is closed,
/// so every pending and future wait unblocks.
async fn decode_loop<R>(shared: Arc<Shared>, stdout: R, replies: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stdout, MessageDecoder::new());
    let failure = loop {
        match frames.next().await {
            None => break None,
            Some(Err(e)) => break Some(e.to_string()),
            Some(Ok(msg)) => {
                debug!(id = %shared.id, event_type = %msg.event_type, "received message");
                match msg.event_type.as_str() {
                    kind @ ("add" | "remove") => {
                        let Some(port) = msg.port else {
                            break Some(format!("invalid '{kind}' message: missing port"));
                        };
                        // Clone the sender under the lock, send without it:
                        // a full channel waits for the consumer and must not
                        // hold up quit/stop taking the lock.
                        let sender = shared.state.lock().unwrap().events.clone();
                        if let Some(sender) = sender {
                            let discovery_id = shared.id.clone();
                            let event = if kind == "add" {
                                Event::Add { port, discovery_id }
                            } else {
                                Event::Remove { port, discovery_id }
                            };
                            let _ = sender.send(event).await;
                        }
                    }
                    _ => {
                        if replies.send(msg).is_err() {
                            // Client side dropped; nobody left to serve.
                            break None;
                        }
                    }
                }
            }
        }
    };

    match &failure {
        Some(e) => error!(id = %shared.id, "stopped decode loop: {e}"),
        None => debug!(id = %shared.id, "stopped decode loop"),
    }
    shared.state.lock().unwrap().decode_failure = failure;
    shared.stop_sync().await;
    shared.kill_process().await;
    // Dropping `replies` closes the reply queue.
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wire a client to in-memory streams instead of a child process.
    fn attach<R, W>(client: &mut Client, discovery_output: R, command_sink: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        client.outgoing = Some(Box::new(command_sink));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        client.incoming = Some(reply_rx);
        tokio::spawn(decode_loop(
            Arc::clone(&client.shared),
            discovery_output,
            reply_tx,
        ));
    }

    fn test_client() -> (Client, tokio::io::DuplexStream) {
        let mut client = Client::new("test", Vec::<String>::new());
        let (feed, stream) = tokio::io::duplex(1024);
        attach(&mut client, stream, tokio::io::sink());
        (client, feed)
    }

    fn install_event_channel(client: &Client, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer);
        client.shared.state.lock().unwrap().events = Some(tx);
        rx
    }

    const SHORT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_tolerates_fragmented_json() {
        let (mut client, mut feed) = test_client();

        feed.write_all(br#"{ "eventType":"#).await.unwrap();
        let res = client.wait_message(SHORT).await;
        assert!(matches!(res, Err(ClientError::Timeout(_))), "{res:?}");

        // Complete the first value and open a second one.
        feed.write_all(br#""ev1" }{ "#).await.unwrap();
        let msg = client.wait_message(SHORT).await.unwrap();
        assert_eq!(msg.event_type, "ev1");
        let res = client.wait_message(SHORT).await;
        assert!(matches!(res, Err(ClientError::Timeout(_))), "{res:?}");

        feed.write_all(br#""eventType":"ev2" }"#).await.unwrap();
        let msg = client.wait_message(SHORT).await.unwrap();
        assert_eq!(msg.event_type, "ev2");
    }

    #[tokio::test]
    async fn test_event_channel_closes_promptly_on_eof() {
        let (mut client, mut feed) = test_client();
        let mut events = install_event_channel(&client, 10);

        feed.write_all(br#"{"eventType":"add","port":{"address":"1","protocol":"dummy"}}"#)
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Add { ref port, .. } if port.address == "1"));
        assert_eq!(event.discovery_id(), "test");

        // Child "crashes": its stdout reaches EOF. The channel must
        // deliver the synthetic stop marker and close within a second.
        drop(feed);
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("stop marker within a second")
            .unwrap();
        assert_eq!(event, Event::Stop { discovery_id: "test".to_string() });
        assert!(timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("channel closed within a second")
            .is_none());

        // A clean EOF leaves no stored failure behind.
        let res = client.wait_message(SHORT).await;
        assert!(matches!(res, Err(ClientError::Disconnected)), "{res:?}");
    }

    #[tokio::test]
    async fn test_add_event_without_port_stops_decoder() {
        let (mut client, mut feed) = test_client();
        let mut events = install_event_channel(&client, 10);

        feed.write_all(br#"{"eventType":"add"}"#).await.unwrap();

        let res = client.wait_message(Duration::from_secs(1)).await;
        match res {
            Err(ClientError::DecoderStopped(msg)) => {
                assert_eq!(msg, "invalid 'add' message: missing port");
            }
            other => panic!("expected DecoderStopped, got {other:?}"),
        }
        // The event channel is torn down like on any other decoder death.
        assert!(matches!(events.recv().await, Some(Event::Stop { .. })));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_input_stops_decoder_with_error() {
        let (mut client, mut feed) = test_client();
        feed.write_all(b"this is not json").await.unwrap();

        let res = client.wait_message(Duration::from_secs(1)).await;
        match res {
            Err(ClientError::DecoderStopped(msg)) => assert!(msg.contains("JSON error")),
            other => panic!("expected DecoderStopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_without_active_channel_are_dropped() {
        let (mut client, mut feed) = test_client();

        feed.write_all(
            br#"{"eventType":"add","port":{"address":"9"}}{"eventType":"list","ports":[]}"#,
        )
        .await
        .unwrap();

        // The add event vanished; the list reply is the next message.
        let msg = client.wait_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.event_type, "list");
    }

    #[tokio::test]
    async fn test_events_and_replies_are_demultiplexed() {
        let (mut client, mut feed) = test_client();
        let mut events = install_event_channel(&client, 10);

        feed.write_all(
            br#"{"eventType":"add","port":{"address":"1"}}{"eventType":"stop","message":"OK"}{"eventType":"remove","port":{"address":"1"}}"#,
        )
        .await
        .unwrap();

        let msg = client.wait_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.event_type, "stop");
        assert!(matches!(events.recv().await.unwrap(), Event::Add { .. }));
        assert!(matches!(events.recv().await.unwrap(), Event::Remove { .. }));
    }

    #[tokio::test]
    async fn test_stop_closes_event_channel_after_reply() {
        let (mut client, mut feed) = test_client();
        let mut events = install_event_channel(&client, 10);

        feed.write_all(br#"{"eventType":"stop","message":"OK"}"#)
            .await
            .unwrap();
        client.stop().await.unwrap();

        assert!(matches!(events.recv().await, Some(Event::Stop { .. })));
        assert!(events.recv().await.is_none());
        // The slot is free again.
        assert!(client.shared.state.lock().unwrap().events.is_none());
    }

    #[tokio::test]
    async fn test_reply_validation() {
        let (mut client, mut feed) = test_client();

        feed.write_all(br#"{"eventType":"list","ports":[]}"#)
            .await
            .unwrap();
        let res = client.start().await;
        assert!(
            matches!(
                res,
                Err(ClientError::OutOfSync {
                    expected: "start",
                    ref actual
                }) if actual == "list"
            ),
            "{res:?}"
        );

        feed.write_all(br#"{"eventType":"start","message":"Cannot START: busy","error":true}"#)
            .await
            .unwrap();
        let res = client.start().await;
        assert!(
            matches!(res, Err(ClientError::CommandFailed(ref msg)) if msg == "Cannot START: busy"),
            "{res:?}"
        );

        feed.write_all(br#"{"eventType":"start","message":"maybe"}"#)
            .await
            .unwrap();
        let res = client.start().await;
        assert!(
            matches!(res, Err(ClientError::NotOk(ref msg)) if msg == "maybe"),
            "{res:?}"
        );

        // "Ok" in any case is accepted.
        feed.write_all(br#"{"eventType":"start","message":"ok"}"#)
            .await
            .unwrap();
        client.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_newer_protocol() {
        let (mut client, mut feed) = test_client();

        feed.write_all(br#"{"eventType":"hello","protocolVersion":2,"message":"OK"}"#)
            .await
            .unwrap();
        let res = client.handshake().await;
        assert!(matches!(res, Err(ClientError::UnsupportedVersion(2))), "{res:?}");
    }

    #[tokio::test]
    async fn test_list_returns_ports() {
        let (mut client, mut feed) = test_client();

        feed.write_all(
            br#"{"eventType":"list","ports":[{"address":"a"},{"address":"b","protocol":"serial"}]}"#,
        )
        .await
        .unwrap();
        let ports = client.list().await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].address, "a");
        assert_eq!(ports[1].protocol.as_deref(), Some("serial"));
    }

    #[tokio::test]
    async fn test_commands_without_process_fail_cleanly() {
        let mut client = Client::new("test", Vec::<String>::new());
        let res = client.start().await;
        assert!(matches!(res, Err(ClientError::Process(_))), "{res:?}");
        assert!(!client.alive());
    }

    #[tokio::test]
    async fn test_run_fails_on_empty_command_line() {
        let mut client = Client::new("test", Vec::<String>::new());
        let res = client.run().await;
        assert!(matches!(res, Err(ClientError::Process(_))), "{res:?}");
    }
}
