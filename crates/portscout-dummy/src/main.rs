//! Reference discovery executable.
//!
//! Speaks the pluggable discovery protocol on stdin/stdout and reports
//! deterministically generated fake ports, so hosts and tests have a
//! discovery with fully predictable behavior. Logs go to stderr only;
//! stdout belongs to the protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use indexmap::IndexMap;
use portscout_protocol::{Port, PortEventKind};
use portscout_server::{Discovery, DiscoveryError, ErrorCallback, EventCallback, Server};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Pause between scripted port events.
const EVENT_INTERVAL: Duration = Duration::from_secs(2);

/// Dummy discovery for the pluggable discovery protocol
#[derive(Parser, Debug)]
#[command(name = "portscout-dummy")]
struct Args {
    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Exit abruptly about one second after startup (crash injection
    /// for tests)
    #[arg(short = 'k', long = "kill")]
    kill: bool,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    if args.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.kill {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            warn!("crash flag set, terminating");
            std::process::exit(1);
        });
    }

    let mut server = Server::new(DummyDiscovery::default());
    server
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("protocol session failed")?;
    Ok(())
}

/// Simulated discovery implementation.
///
/// Generates connected ports deterministically, which also makes it
/// usable as a test fixture: the event script and the every-5th
/// `start_sync` failure are part of its contract.
#[derive(Default)]
struct DummyDiscovery {
    start_sync_count: u32,
    counter: Arc<AtomicU64>,
    cancel: Option<CancellationToken>,
}

impl DummyDiscovery {
    fn cancel_emitter(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl Discovery for DummyDiscovery {
    fn hello(&mut self, user_agent: &str, protocol_version: i32) -> Result<(), DiscoveryError> {
        debug!(user_agent, protocol_version, "client connected");
        Ok(())
    }

    fn start_sync(
        &mut self,
        events: EventCallback,
        errors: ErrorCallback,
    ) -> Result<(), DiscoveryError> {
        self.start_sync_count += 1;
        if self.start_sync_count % 5 == 0 {
            return Err("could not start_sync every 5 times".into());
        }

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        tokio::spawn(emit_events(
            events,
            errors,
            cancel,
            Arc::clone(&self.counter),
        ));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DiscoveryError> {
        self.cancel_emitter();
        Ok(())
    }

    fn quit(&mut self) {
        self.cancel_emitter();
    }
}

/// Scripted event stream: the currently "connected" ports right away,
/// then two add/remove cycles, then an unrecoverable error.
async fn emit_events(
    events: EventCallback,
    errors: ErrorCallback,
    cancel: CancellationToken,
    counter: Arc<AtomicU64>,
) {
    let next = |counter: &AtomicU64| counter.fetch_add(1, Ordering::SeqCst) + 1;

    events(PortEventKind::Add, dummy_port(next(&counter)));
    events(PortEventKind::Add, dummy_port(next(&counter)));

    for _ in 0..2 {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(EVENT_INTERVAL) => {}
        }
        let port = dummy_port(next(&counter));
        let stub = Port {
            protocol: port.protocol.clone(),
            ..Port::new(port.address.clone())
        };
        events(PortEventKind::Add, port);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(EVENT_INTERVAL) => {}
        }
        events(PortEventKind::Remove, stub);
    }

    errors("unrecoverable error, cannot send more events".to_string());
}

/// Fake port number `n` as reported by this discovery.
fn dummy_port(n: u64) -> Port {
    Port {
        address: n.to_string(),
        address_label: Some("Dummy upload port".to_string()),
        protocol: Some("dummy".to_string()),
        protocol_label: Some("Dummy protocol".to_string()),
        properties: Some(IndexMap::from([
            ("vid".to_string(), "0x2341".to_string()),
            ("pid".to_string(), "0x0041".to_string()),
            ("mac".to_string(), (n * 73622384782).to_string()),
        ])),
        hardware_id: None,
    }
}
