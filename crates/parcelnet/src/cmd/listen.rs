use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parcelnet_conn::{ConnError, Engine, Server, TransmissionEventKind};

use crate::cmd::{cli_codec, install_ctrlc_handler, Forward, ListenArgs};
use crate::exit::{conn_error, io_error, CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let params = args.connection.parameters()?;
    let engine = Engine::start().map_err(|err| conn_error("engine start failed", err))?;
    let (tx, rx) = mpsc::channel();

    let mut server = Server::bind(&engine, args.addr.as_str())
        .map_err(|err| conn_error("bind failed", err))?
        .with_parameters(params)
        .with_codec(cli_codec()?)
        .with_listener(Arc::new(Forward::new(tx.clone())));
    if let Some(max) = args.max_connections {
        server = server.with_max_connections(max);
    }
    tracing::info!(addr = %server.local_addr(), "listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let accept_engine = engine.clone();
    thread::Builder::new()
        .name("parcelnet-accept".to_string())
        .spawn(move || accept_loop(&server, &accept_engine, &tx))
        .map_err(|err| io_error("acceptor thread failed", err))?;

    let mut received = 0usize;
    while running.load(Ordering::SeqCst) {
        let report = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(report) => report,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        print_report(&report, format);
        if counts_as_received(&report) {
            received = received.saturating_add(1);
            if args.count.is_some_and(|count| received >= count) {
                break;
            }
        }
    }

    if !engine.shutdown(SHUTDOWN_TIMEOUT) {
        tracing::warn!("connections did not close in time");
    }
    Ok(SUCCESS)
}

fn accept_loop(server: &Server, engine: &Engine, tx: &mpsc::Sender<Report>) {
    loop {
        match server.accept() {
            Ok(conn) => {
                tracing::info!(conn = conn.short_id(), peer = ?conn.peer_addr(), "peer accepted");
                if tx.send(Report::Accepted { peer: conn.peer_addr() }).is_err() {
                    return;
                }
            }
            Err(_) if engine.is_shut_down() => return,
            Err(err @ ConnError::Transport(_)) => {
                tracing::error!(error = %err, "accept failed");
                return;
            }
            Err(err) => tracing::warn!(error = %err, "peer not accepted"),
        }
    }
}

fn counts_as_received(report: &Report) -> bool {
    match report {
        Report::Object { .. } => true,
        Report::Transfer(event) => event.kind == TransmissionEventKind::FileReceived,
        _ => false,
    }
}
