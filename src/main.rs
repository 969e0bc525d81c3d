use std::future::Future;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{format, time::ChronoLocal};

mod bus;
mod cli;
mod config;
mod demux;
mod error;
mod frame;
mod output;
mod pool;
mod port;
mod proto;
mod retry;
mod stats;
mod worker;

use bus::SerialBus;
use config::Settings;
use demux::Demux;
use output::{ConsoleSink, OutputSink, Severity};
use pool::{Endpoint, fetch_endpoint};
use port::open_port;
use worker::{CLIENT_TAG, DeviceWorker, MinerState};

/// How long fatal startup errors stay on screen before exiting.
const FATAL_GRACE: Duration = Duration::from_secs(5);

fn init_log(debug: bool) {
    let format = format::format()
        .with_level(true)
        .with_target(false)
        .with_timer(ChronoLocal::new("[%m-%d %H:%M:%S%.3f]".to_string()))
        .compact();
    let default = if debug { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(format)
        .init();
}

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    match args.cmd {
        cli::Cmd::Mine(opts) => {
            init_log(opts.debug);
            mine(opts)
        }
        cli::Cmd::Scan(opts) => {
            init_log(false);
            scan(opts)
        }
    }
}

fn scan(opts: cli::ScanOpts) -> Result<()> {
    let port = open_port(&opts.ser, Duration::from_millis(opts.read_timeout))?;
    let bus = SerialBus::new(Box::new(port), Demux::new(&[], 0));
    let listing = bus.scan().context("scan failed")?;
    if listing.is_empty() {
        println!("no devices answered on {}", opts.ser.dev);
    } else {
        println!("{listing}");
    }
    Ok(())
}

fn fatal(sink: &dyn OutputSink, msg: &str) {
    sink.pretty_print("sys0", msg, Severity::Error);
    thread::sleep(FATAL_GRACE);
}

fn mine(opts: cli::MineOpts) -> Result<()> {
    let sink: Arc<dyn OutputSink> = Arc::new(ConsoleSink::new());
    spawn_shutdown_listener(sink.clone(), tokio::signal::ctrl_c(), || {
        std::process::exit(0);
    })?;
    sink.pretty_print("sys0", &format!("{CLIENT_TAG} starting"), Severity::Info);

    let settings = match Settings::from_opts(opts) {
        Ok(settings) => settings,
        Err(e) => {
            fatal(sink.as_ref(), &format!("Invalid configuration: {e:#}"));
            return Err(e);
        }
    };
    info!(?settings, "configuration loaded");

    let port = match open_port(&settings.serial, settings.read_timeout) {
        Ok(port) => port,
        Err(e) => {
            fatal(
                sink.as_ref(),
                &format!(
                    "Could not open the gateway on {} ({e:#}). Check the cable, the --dev setting and that no other program holds the port",
                    settings.serial.dev
                ),
            );
            return Err(e);
        }
    };
    sink.pretty_print(
        "sys0",
        &format!("Gateway port {} is open", settings.serial.dev),
        Severity::Success,
    );

    let demux = Demux::new(&settings.addresses, settings.expected_fields());
    let bus = SerialBus::new(Box::new(port), demux);

    let endpoint = match &settings.pool {
        Some(fixed) => Endpoint::parse(fixed)?,
        None => fetch_endpoint(&settings.pool_directory, sink.as_ref()),
    };

    let state = Arc::new(MinerState::new(settings, bus, sink));
    spawn_workers(&state, &endpoint)?;

    // workers run until the shutdown listener ends the process
    loop {
        thread::park();
    }
}

/// Starts one thread per board, `delay_start` apart.
fn spawn_workers(state: &Arc<MinerState>, endpoint: &Endpoint) -> Result<()> {
    let addresses = state.settings.addresses.clone();
    let delay = state.settings.delay_start;
    let total = addresses.len();

    for (id, addr) in addresses.into_iter().enumerate() {
        let worker = DeviceWorker::new(id, addr, state.clone(), endpoint.clone());
        thread::Builder::new()
            .name(format!("avr{addr}"))
            .spawn(move || worker.run())
            .with_context(|| format!("spawn worker for board {addr}"))?;

        let started = id + 1;
        if started < total {
            state.sink.pretty_print(
                "sys0",
                &format!(
                    "Started {started}/{total} worker(s). Next starts in {}s",
                    delay.as_secs()
                ),
                Severity::Info,
            );
            thread::sleep(delay);
        }
    }
    state.sink.pretty_print(
        "sys0",
        &format!("All {total}/{total} worker(s) started"),
        Severity::Success,
    );
    Ok(())
}

/// Waits for `signal` on its own thread, then says goodbye and calls `exit`.
///
/// Installed before anything that can block for long, so an interrupt during
/// node lookup or the staggered start still gets the goodbye line.
fn spawn_shutdown_listener<S, X>(
    sink: Arc<dyn OutputSink>,
    signal: S,
    exit: X,
) -> io::Result<JoinHandle<()>>
where
    S: Future<Output = io::Result<()>> + Send + 'static,
    X: FnOnce() + Send + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new().name("shutdown".into()).spawn(move || {
        match rt.block_on(signal) {
            Ok(()) => {
                sink.pretty_print(
                    "sys0",
                    "SIGINT detected - Goodbye, see you soon!",
                    Severity::Warning,
                );
                exit();
            }
            Err(e) => warn!("cannot listen for ctrl-c: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::RecordingSink;
    use std::sync::mpsc;

    #[test]
    fn interrupt_prints_goodbye_then_exits() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel();
        let handle = spawn_shutdown_listener(sink.clone(), std::future::ready(Ok(())), move || {
            tx.send(()).unwrap();
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, "sys0");
        assert!(lines[0].1.contains("Goodbye"));
    }

    #[test]
    fn failed_listener_never_exits() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel::<()>();
        let handle = spawn_shutdown_listener(
            sink.clone(),
            std::future::ready(Err(io::Error::other("no signals here"))),
            move || {
                tx.send(()).unwrap();
            },
        )
        .unwrap();

        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(sink.lines.lock().unwrap().is_empty());
    }
}
