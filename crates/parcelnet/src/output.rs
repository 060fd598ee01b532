use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use parcelnet_conn::{CloseReason, PingEcho, TransmissionEvent};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Something worth printing that happened on a connection.
#[derive(Debug, Clone)]
pub enum Report {
    Accepted { peer: Option<SocketAddr> },
    Object { object_id: u64, payload: String },
    Transfer(TransmissionEvent),
    Echo(PingEcho),
    Closed(CloseReason),
}

#[derive(Serialize, Default)]
struct ReportOutput {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    detail: String,
    timestamp: String,
}

impl ReportOutput {
    fn from_report(report: &Report) -> Self {
        let timestamp = now_unix_seconds();
        match report {
            Report::Accepted { peer } => Self {
                kind: "ACCEPTED".to_string(),
                detail: peer.map(|p| p.to_string()).unwrap_or_default(),
                timestamp,
                ..Self::default()
            },
            Report::Object { object_id, payload } => Self {
                kind: "OBJECT".to_string(),
                id: Some(*object_id),
                size: Some(payload.len() as u64),
                detail: payload.clone(),
                timestamp,
                ..Self::default()
            },
            Report::Transfer(event) => Self {
                kind: event.kind.to_string(),
                id: Some(event.object_id),
                size: Some(event.transmission_length),
                duration_ms: Some(millis(event.duration)),
                detail: transfer_detail(event),
                timestamp,
            },
            Report::Echo(echo) => Self {
                kind: "ECHO".to_string(),
                id: Some(echo.ping_id),
                duration_ms: Some(millis(echo.duration)),
                timestamp,
                ..Self::default()
            },
            Report::Closed(reason) => Self {
                kind: "CLOSED".to_string(),
                detail: format!(
                    "code={} remote={}{}",
                    reason.code,
                    reason.remote,
                    reason
                        .message
                        .as_deref()
                        .map(|m| format!(" message={m}"))
                        .unwrap_or_default()
                ),
                timestamp,
                ..Self::default()
            },
        }
    }
}

pub fn print_report(report: &Report, format: OutputFormat) {
    let out = ReportOutput::from_report(report);
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "ID", "SIZE", "MS", "DETAIL"])
                .add_row(vec![
                    out.kind,
                    optional(out.id),
                    optional(out.size),
                    optional(out.duration_ms),
                    out.detail,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let mut line = out.kind;
            if let Some(id) = out.id {
                line.push_str(&format!(" id={id}"));
            }
            if let Some(size) = out.size {
                line.push_str(&format!(" size={size}"));
            }
            if let Some(ms) = out.duration_ms {
                line.push_str(&format!(" ms={ms}"));
            }
            if !out.detail.is_empty() {
                line.push_str(&format!(" {}", out.detail));
            }
            println!("{line}");
        }
    }
}

fn transfer_detail(event: &TransmissionEvent) -> String {
    let mut parts = vec![format!("direction={}", event.direction.name())];
    if let Some(path) = &event.path {
        parts.push(format!("path={}", path.display()));
    }
    if let Some(remote) = &event.remote_path {
        parts.push(format!("remote_path={remote}"));
    }
    if let Some(err) = &event.error {
        parts.push(format!("error={err}"));
    }
    parts.join(" ")
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
