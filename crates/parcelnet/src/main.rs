mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "parcelnet", version, about = "Object and file transfer over TCP")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use parcelnet_conn::Priority;

    use super::*;

    #[test]
    fn parses_send_file_subcommand() {
        let cli = Cli::try_parse_from([
            "parcelnet",
            "send",
            "127.0.0.1:7400",
            "--file",
            "/tmp/data.bin",
            "--remote-path",
            "in/data.bin",
            "--priority",
            "high",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.priority, Priority::High);
                assert_eq!(args.remote_path.as_deref(), Some("in/data.bin"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "parcelnet",
            "send",
            "127.0.0.1:7400",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn send_requires_a_payload() {
        let err = Cli::try_parse_from(["parcelnet", "send", "127.0.0.1:7400"])
            .expect_err("missing payload should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn remote_path_needs_a_file() {
        let err = Cli::try_parse_from([
            "parcelnet",
            "send",
            "127.0.0.1:7400",
            "--data",
            "x",
            "--remote-path",
            "a.txt",
        ])
        .expect_err("remote path without file should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_listen_with_connection_flags() {
        let cli = Cli::try_parse_from([
            "parcelnet",
            "listen",
            "127.0.0.1:0",
            "--count",
            "2",
            "--alive-period",
            "0",
            "--root-dir",
            "/srv/in",
        ])
        .expect("listen args should parse");

        match cli.command {
            Command::Listen(args) => {
                assert_eq!(args.count, Some(2));
                let params = args
                    .connection
                    .parameters()
                    .expect("parameters should validate");
                assert!(params.alive_period.is_zero());
                assert_eq!(params.root_dir, Some("/srv/in".into()));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_ping_subcommand() {
        let cli = Cli::try_parse_from(["parcelnet", "ping", "127.0.0.1:7400", "-n", "2"])
            .expect("ping args should parse");
        assert!(matches!(cli.command, Command::Ping(ref args) if args.count == 2));
    }
}
