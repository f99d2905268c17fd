use std::collections::HashMap;
use std::io;
use std::sync::{Arc, LazyLock, Mutex};

use portscout_protocol::{Message, Port, PortEventKind};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::discovery::{Discovery, ErrorCallback, EventCallback};

/// The only protocol version supported so far. The server answers with
/// this version regardless of what the client requested.
const PROTOCOL_VERSION: i32 = 1;

static HELLO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(\d+) "([^"]+)"$"#).expect("hello pattern is valid"));

/// Errors terminating a protocol session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("input stream error: {0}")]
    Input(#[source] io::Error),

    #[error("input stream closed")]
    InputClosed,

    #[error("output stream error: {0}")]
    Output(#[source] io::Error),
}

/// Work items for the output writer task.
enum OutputEvent {
    Message(Message),
    Flush(oneshot::Sender<()>),
}

/// Port snapshot maintained while the session is in polling mode.
///
/// Mutated by the callbacks handed to the implementation, which may run
/// on any task, so it lives behind a mutex shared with the command loop.
#[derive(Default)]
struct PollCache {
    ports: HashMap<String, Port>,
    err: Option<String>,
}

/// Protocol handler driving a [`Discovery`] implementation.
///
/// Created with [`Server::new`]; [`Server::run`] blocks until `QUIT` is
/// received or the input stream fails.
pub struct Server<D> {
    discovery: D,
    user_agent: String,
    req_protocol_version: i32,
    initialized: bool,
    started: bool,
    sync_started: bool,
    cache: Arc<Mutex<PollCache>>,
    out: Option<mpsc::UnboundedSender<OutputEvent>>,
    write_failure: Arc<Mutex<Option<io::Error>>>,
}

impl<D: Discovery> Server<D> {
    /// Create a server backed by the given discovery implementation.
    pub fn new(discovery: D) -> Self {
        Self {
            discovery,
            user_agent: String::new(),
            req_protocol_version: 0,
            initialized: false,
            started: false,
            sync_started: false,
            cache: Arc::new(Mutex::new(PollCache::default())),
            out: None,
            write_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// User agent announced by the client, available after the handshake.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Protocol version the client asked for, available after the
    /// handshake. The negotiated version is always [`PROTOCOL_VERSION`].
    pub fn requested_protocol_version(&self) -> i32 {
        self.req_protocol_version
    }

    /// Run the protocol loop on the given streams, usually stdin and
    /// stdout. Blocks until `QUIT` is received (returns `Ok`) or the
    /// input or output stream fails (returns the stream error).
    ///
    /// All output, including event-callback emissions from the
    /// implementation's own tasks, is serialized through a single writer
    /// so no two documents ever interleave.
    ///
    /// # Errors
    ///
    /// [`ServerError::InputClosed`] or [`ServerError::Input`] when the
    /// command stream ends or fails, [`ServerError::Output`] when a reply
    /// cannot be written. The protocol framing is unrecoverable after a
    /// failed write, so the session always aborts in that case.
    pub async fn run<R, W>(&mut self, input: R, output: W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.out = Some(out_tx.clone());
        let writer = tokio::spawn(output_loop(
            out_rx,
            output,
            Arc::clone(&self.write_failure),
        ));

        let mut lines = BufReader::new(input).lines();
        let result = loop {
            if out_tx.is_closed() {
                break Err(self.take_write_failure());
            }

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let err = ServerError::InputClosed;
                    self.emit(Message::error("command_error", err.to_string()));
                    break Err(err);
                }
                Err(e) => {
                    self.emit(Message::error("command_error", e.to_string()));
                    break Err(ServerError::Input(e));
                }
            };

            let line = line.trim();
            let cmd = line
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_uppercase();
            debug!(command = %cmd, "received command");

            if !self.initialized && cmd != "HELLO" && cmd != "QUIT" {
                self.emit(Message::error(
                    "command_error",
                    format!("First command must be HELLO, but got '{cmd}'"),
                ));
                continue;
            }

            match cmd.as_str() {
                "HELLO" => self.hello(line.get(6..).unwrap_or("")),
                "START" => self.start(),
                "LIST" => self.list(),
                "START_SYNC" => self.start_sync(),
                "STOP" => self.stop(),
                "QUIT" => {
                    self.discovery.quit();
                    self.emit(Message::ok("quit"));
                    break Ok(());
                }
                _ => self.emit(Message::error(
                    "command_error",
                    format!("Command {cmd} not supported"),
                )),
            }
        };

        // Wait for everything queued so far to reach the wire before
        // returning; the writer itself stays alive as long as the
        // implementation still holds event callbacks.
        self.out = None;
        let (ack_tx, ack_rx) = oneshot::channel();
        if out_tx.send(OutputEvent::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        drop(out_tx);
        drop(writer);

        match result {
            Ok(()) if self.write_failure.lock().unwrap().is_some() => {
                Err(self.take_write_failure())
            }
            other => other,
        }
    }

    fn emit(&self, msg: Message) {
        if let Some(out) = &self.out {
            let _ = out.send(OutputEvent::Message(msg));
        }
    }

    fn take_write_failure(&self) -> ServerError {
        let e = self
            .write_failure
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| io::Error::other("output writer terminated"));
        ServerError::Output(e)
    }

    fn hello(&mut self, payload: &str) {
        if self.initialized {
            self.emit(Message::error("hello", "HELLO already called"));
            return;
        }
        let Some(captures) = HELLO_RE.captures(payload) else {
            self.emit(Message::error("hello", "Invalid HELLO command"));
            return;
        };
        let agent = captures[2].to_string();
        let Ok(version) = captures[1].parse::<i32>() else {
            // The wire format reports the agent string here, not the
            // numeric token.
            self.emit(Message::error(
                "hello",
                format!("Invalid protocol version: {agent}"),
            ));
            return;
        };
        self.user_agent = agent;
        self.req_protocol_version = version;
        if let Err(e) = self.discovery.hello(&self.user_agent, PROTOCOL_VERSION) {
            self.emit(Message::error("hello", e.to_string()));
            return;
        }
        self.emit(Message {
            protocol_version: Some(PROTOCOL_VERSION),
            ..Message::ok("hello")
        });
        self.initialized = true;
    }

    fn start(&mut self) {
        if self.started {
            self.emit(Message::error("start", "Discovery already STARTed"));
            return;
        }
        if self.sync_started {
            self.emit(Message::error(
                "start",
                "Discovery already START_SYNCed, cannot START",
            ));
            return;
        }

        // Reset before installing the callbacks: the implementation may
        // report the initial port burst from inside start_sync.
        {
            let mut cache = self.cache.lock().unwrap();
            cache.ports.clear();
            cache.err = None;
        }

        let cache = Arc::clone(&self.cache);
        let events: EventCallback = Box::new(move |kind, port| {
            let mut cache = cache.lock().unwrap();
            match kind {
                PortEventKind::Add => {
                    cache.ports.insert(port.key(), port);
                }
                PortEventKind::Remove => {
                    cache.ports.remove(&port.key());
                }
            }
        });
        let cache = Arc::clone(&self.cache);
        let errors: ErrorCallback = Box::new(move |msg| {
            cache.lock().unwrap().err = Some(msg);
        });

        if let Err(e) = self.discovery.start_sync(events, errors) {
            self.emit(Message::error("start", format!("Cannot START: {e}")));
            return;
        }
        self.started = true;
        self.emit(Message::ok("start"));
    }

    fn list(&mut self) {
        if !self.started {
            self.emit(Message::error("list", "Discovery not STARTed"));
            return;
        }
        if self.sync_started {
            self.emit(Message::error(
                "list",
                "discovery already START_SYNCed, LIST not allowed",
            ));
            return;
        }
        let reply = {
            let cache = self.cache.lock().unwrap();
            match &cache.err {
                Some(err) => Message::error("list", err.clone()),
                None => Message::port_list(cache.ports.values().cloned().collect()),
            }
        };
        self.emit(reply);
    }

    fn start_sync(&mut self) {
        if self.sync_started {
            self.emit(Message::error(
                "start_sync",
                "Discovery already START_SYNCed",
            ));
            return;
        }
        if self.started {
            self.emit(Message::error(
                "start_sync",
                "Discovery already STARTed, cannot START_SYNC",
            ));
            return;
        }

        let out = self.out.clone();
        let events: EventCallback = Box::new(move |kind, port| {
            if let Some(out) = &out {
                let _ = out.send(OutputEvent::Message(Message::port_event(kind, port)));
            }
        });
        let out = self.out.clone();
        let errors: ErrorCallback = Box::new(move |msg| {
            if let Some(out) = &out {
                let _ = out.send(OutputEvent::Message(Message::error("start_sync", msg)));
            }
        });

        if let Err(e) = self.discovery.start_sync(events, errors) {
            self.emit(Message::error(
                "start_sync",
                format!("Cannot START_SYNC: {e}"),
            ));
            return;
        }
        self.sync_started = true;
        self.emit(Message::ok("start_sync"));
    }

    fn stop(&mut self) {
        if !self.sync_started && !self.started {
            self.emit(Message::error("stop", "Discovery already STOPped"));
            return;
        }
        if let Err(e) = self.discovery.stop() {
            self.emit(Message::error("stop", format!("Cannot STOP: {e}")));
            return;
        }
        self.started = false;
        self.sync_started = false;
        self.emit(Message::ok("stop"));
    }
}

/// Drain the output queue onto the wire, one pretty-printed document per
/// message, each followed by a newline.
///
/// A failed write is fatal: the error is stashed for the command loop
/// and the task exits, which closes the queue and aborts the session.
async fn output_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutputEvent>,
    mut out: W,
    failure: Arc<Mutex<Option<io::Error>>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        match event {
            OutputEvent::Message(msg) => {
                let json = serde_json::to_string_pretty(&msg).unwrap_or_else(|e| {
                    // The fallback is a strings-only message, which
                    // always marshals.
                    serde_json::to_string_pretty(&Message::error("command_error", e.to_string()))
                        .unwrap_or_default()
                });
                let mut data = json.into_bytes();
                data.push(b'\n');
                if let Err(e) = out.write_all(&data).await {
                    error!("writing to output stream: {e}");
                    *failure.lock().unwrap() = Some(e);
                    return;
                }
                if let Err(e) = out.flush().await {
                    error!("flushing output stream: {e}");
                    *failure.lock().unwrap() = Some(e);
                    return;
                }
            }
            OutputEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
