use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand};
use parcelnet_conn::{
    CloseReason, ConnectionListener, ConnectionParameters, JsonCodec, Object, PingEcho, Priority,
    Tempo, TransmissionEvent,
};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::{OutputFormat, Report};

pub mod listen;
pub mod ping;
pub mod send;
pub mod version;

/// Wire tag of free-form JSON objects.
pub const JSON_TAG: &str = "json";
/// Wire tag of plain text objects.
pub const TEXT_TAG: &str = "text";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept peers and print received objects and file transfers.
    Listen(ListenArgs),
    /// Send one object or file to a listening peer.
    Send(SendArgs),
    /// Measure round trips to a listening peer.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Ping(args) => ping::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Connection parameters shared by every networked command.
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// ALIVE interval (e.g. 10s, 500ms); 0 disables the heartbeat.
    #[arg(long, default_value = "10s")]
    pub alive_period: String,
    /// Grace period for heartbeat echoes and file confirmations.
    #[arg(long, default_value = "30s")]
    pub confirm_timeout: String,
    /// Payload bytes per parcel.
    #[arg(long, default_value_t = 32 * 1024)]
    pub parcel_size: usize,
    /// Transmit speed limit in bytes per second.
    #[arg(long)]
    pub tempo: Option<u32>,
    /// Base directory for incoming files that name a target path.
    #[arg(long, env = "PARCELNET_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,
    /// Staging directory for incoming files.
    #[arg(long, env = "PARCELNET_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,
}

impl ConnectionArgs {
    pub fn parameters(&self) -> CliResult<ConnectionParameters> {
        let params = ConnectionParameters {
            alive_period: parse_period(&self.alive_period)?,
            confirm_timeout: parse_duration(&self.confirm_timeout)?,
            parcel_size: self.parcel_size,
            tempo: self.tempo.map_or(Tempo::Unlimited, Tempo::Limited),
            root_dir: self.root_dir.clone(),
            temp_dir: self.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
            ..ConnectionParameters::default()
        };
        params
            .validate()
            .map_err(|err| CliError::new(USAGE, err.to_string()))?;
        Ok(params)
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind (e.g. 127.0.0.1:7400).
    pub addr: String,
    /// Exit after receiving N objects or files.
    #[arg(long)]
    pub count: Option<usize>,
    /// Refuse peers beyond this many live connections.
    #[arg(long)]
    pub max_connections: Option<usize>,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("payload").required(true).args(["json", "data", "file"])))]
pub struct SendArgs {
    /// Address to connect to.
    pub addr: String,
    /// JSON object payload.
    #[arg(long)]
    pub json: Option<String>,
    /// Text payload.
    #[arg(long)]
    pub data: Option<String>,
    /// File to transfer.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Target path of the file relative to the receiver's root directory.
    #[arg(long, requires = "file")]
    pub remote_path: Option<String>,
    /// Send priority (bottom, low, normal, high, top).
    #[arg(long, default_value = "normal")]
    pub priority: Priority,
    /// Maximum time to wait for a file confirmation and for the close.
    #[arg(long, default_value = "30s")]
    pub wait_timeout: String,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Address to connect to.
    pub addr: String,
    /// Number of pings.
    #[arg(long, short = 'n', default_value_t = 4)]
    pub count: u32,
    /// Pause between pings.
    #[arg(long, default_value = "1s")]
    pub interval: String,
    /// Maximum time to wait for each echo.
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show protocol and build details.
    #[arg(long)]
    pub extended: bool,
}

/// Codec shared by all commands: free JSON values and plain text.
pub fn cli_codec() -> CliResult<JsonCodec> {
    let codec = JsonCodec::new()
        .with_type::<serde_json::Value>(JSON_TAG)
        .and_then(|codec| codec.with_type::<String>(TEXT_TAG))
        .map_err(|err| CliError::new(INTERNAL, format!("codec setup failed: {err}")))?;
    Ok(codec)
}

/// Forwards connection callbacks to the command's main thread.
pub struct Forward {
    tx: Sender<Report>,
}

impl Forward {
    pub fn new(tx: Sender<Report>) -> Self {
        Self { tx }
    }

    /// The receiving side may already be gone while a connection winds down.
    fn report(&self, report: Report) {
        let _ = self.tx.send(report);
    }
}

impl ConnectionListener for Forward {
    fn closed(&self, reason: &CloseReason) {
        self.report(Report::Closed(reason.clone()));
    }

    fn object_received(&self, object_id: u64, object: &Object) {
        let payload = if let Some(value) = object.downcast_ref::<serde_json::Value>() {
            value.to_string()
        } else if let Some(text) = object.downcast_ref::<String>() {
            text.clone()
        } else {
            "<unknown>".to_string()
        };
        self.report(Report::Object { object_id, payload });
    }

    fn ping_echo_received(&self, echo: &PingEcho) {
        self.report(Report::Echo(echo.clone()));
    }

    fn transmission_event(&self, event: &TransmissionEvent) {
        self.report(Report::Transfer(event.clone()));
    }
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Like [`parse_duration`], but `0` is allowed and means disabled.
pub fn parse_period(input: &str) -> CliResult<Duration> {
    if input.trim().trim_end_matches("ms").trim_end_matches('s') == "0" {
        return Ok(Duration::ZERO);
    }
    parse_duration(input)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
