use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parcelnet_conn::{Client, Engine, PingEcho};

use crate::cmd::{cli_codec, parse_duration, Forward, PingArgs};
use crate::exit::{conn_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_report, OutputFormat, Report};

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let interval = parse_duration(&args.interval)?;
    let timeout = parse_duration(&args.timeout)?;
    let params = args.connection.parameters()?;
    let engine = Engine::start().map_err(|err| conn_error("engine start failed", err))?;
    let (tx, rx) = mpsc::channel();

    let conn = Client::new(&engine)
        .with_parameters(params)
        .with_codec(cli_codec()?)
        .with_listener(Arc::new(Forward::new(tx)))
        .with_connect_timeout(timeout)
        .connect(args.addr.as_str())
        .map_err(|err| conn_error("connect failed", err))?;

    let mut answered = 0u32;
    let mut outcome = Ok(());
    for round in 0..args.count {
        if round > 0 {
            thread::sleep(interval);
        }
        let ping_id = match conn.send_ping() {
            Ok(id) => id,
            Err(err) => {
                outcome = Err(conn_error("ping failed", err));
                break;
            }
        };
        match wait_for_echo(&rx, ping_id, timeout) {
            Ok(echo) => {
                answered += 1;
                print_report(&Report::Echo(echo), format);
            }
            Err(err) if err.code == TIMEOUT => {
                tracing::warn!(ping_id, "no echo within {timeout:?}");
            }
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }

    conn.close();
    conn.wait_closed(timeout);
    engine.shutdown(timeout);
    outcome?;

    if answered == args.count {
        Ok(SUCCESS)
    } else {
        Err(CliError::new(
            FAILURE,
            format!("{answered} of {} pings answered", args.count),
        ))
    }
}

fn wait_for_echo(rx: &Receiver<Report>, ping_id: u64, timeout: Duration) -> Result<PingEcho, CliError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Report::Echo(echo)) if echo.ping_id == ping_id => return Ok(echo),
            Ok(Report::Closed(reason)) => {
                return Err(CliError::new(
                    FAILURE,
                    format!("connection closed (code {})", reason.code),
                ));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err(CliError::new(TIMEOUT, "echo timed out"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(FAILURE, "connection went away"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn late_echo_of_an_earlier_ping_is_ignored() {
        let (tx, rx) = mpsc::channel();
        for ping_id in [1, 2] {
            tx.send(Report::Echo(PingEcho {
                ping_id,
                sent_at: SystemTime::now(),
                duration: Duration::from_millis(3),
            }))
            .unwrap();
        }
        let echo = wait_for_echo(&rx, 2, Duration::from_secs(1)).expect("echo should match");
        assert_eq!(echo.ping_id, 2);
    }
}
