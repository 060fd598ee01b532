use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parcelnet_conn::{Client, Connection, Engine, TransmissionEvent, TransmissionEventKind};

use crate::cmd::{cli_codec, parse_duration, Forward, SendArgs};
use crate::exit::{conn_error, CliError, CliResult, SUCCESS, TIMEOUT, TRANSFER_FAILED, USAGE};
use crate::output::{print_report, OutputFormat, Report};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let params = args.connection.parameters()?;
    let engine = Engine::start().map_err(|err| conn_error("engine start failed", err))?;
    let (tx, rx) = mpsc::channel();

    let conn = Client::new(&engine)
        .with_parameters(params)
        .with_codec(cli_codec()?)
        .with_listener(Arc::new(Forward::new(tx)))
        .with_connect_timeout(wait_timeout)
        .connect(args.addr.as_str())
        .map_err(|err| conn_error("connect failed", err))?;

    let result = deliver(&conn, &args, &rx, format, wait_timeout);

    conn.close();
    if !conn.wait_closed(wait_timeout) {
        tracing::warn!(conn = conn.short_id(), "close did not complete in time");
        conn.abort();
    }
    engine.shutdown(wait_timeout);
    result
}

fn deliver(
    conn: &Connection,
    args: &SendArgs,
    rx: &Receiver<Report>,
    format: OutputFormat,
    wait_timeout: Duration,
) -> CliResult<i32> {
    if let Some(json) = &args.json {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        let object_id = conn
            .send_with_priority(value, args.priority)
            .map_err(|err| conn_error("send failed", err))?;
        tracing::info!(conn = conn.short_id(), object_id, "object queued");
        return Ok(SUCCESS);
    }
    if let Some(data) = &args.data {
        let object_id = conn
            .send_with_priority(data.clone(), args.priority)
            .map_err(|err| conn_error("send failed", err))?;
        tracing::info!(conn = conn.short_id(), object_id, "object queued");
        return Ok(SUCCESS);
    }
    if let Some(path) = &args.file {
        let file_id = conn
            .send_file_with_priority(path, args.remote_path.as_deref(), args.priority)
            .map_err(|err| conn_error("send failed", err))?;
        let event = wait_for_outcome(rx, file_id, wait_timeout)?;
        print_report(&Report::Transfer(event.clone()), format);
        return match event.kind {
            TransmissionEventKind::FileConfirmed => Ok(SUCCESS),
            _ => Err(CliError::new(
                TRANSFER_FAILED,
                match &event.error {
                    Some(err) => format!("transfer failed: {err}"),
                    None => format!("transfer failed: {}", event.kind),
                },
            )),
        };
    }
    Err(CliError::new(USAGE, "nothing to send"))
}

/// Wait for the final event of an outgoing transfer.
fn wait_for_outcome(
    rx: &Receiver<Report>,
    file_id: u64,
    timeout: Duration,
) -> CliResult<TransmissionEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Report::Transfer(event)) if event.object_id == file_id && is_final(event.kind) => {
                return Ok(event);
            }
            Ok(Report::Closed(reason)) => {
                return Err(CliError::new(
                    TRANSFER_FAILED,
                    format!("connection closed before confirmation (code {})", reason.code),
                ));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no confirmation within {timeout:?}"),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(TRANSFER_FAILED, "connection went away"));
            }
        }
    }
}

fn is_final(kind: TransmissionEventKind) -> bool {
    matches!(
        kind,
        TransmissionEventKind::FileConfirmed
            | TransmissionEventKind::FileFailed
            | TransmissionEventKind::FileAborted
    )
}
