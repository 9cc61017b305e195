use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tagwire_frame::Frame;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

#[derive(Serialize)]
struct FrameOutput {
    msg_type: u32,
    msg_type_hex: String,
    sequence: u32,
    payload_size: usize,
    payload: String,
    peer: Option<String>,
    timestamp: String,
}

pub fn print_frame(frame: &Frame, peer: Option<SocketAddr>, format: OutputFormat) {
    let peer = peer.map(|addr| addr.to_string());
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                msg_type: frame.msg_type,
                msg_type_hex: format!("{:#x}", frame.msg_type),
                sequence: frame.sequence,
                payload_size: frame.payload.len(),
                payload: payload_preview(frame.payload()),
                peer,
                timestamp: now_unix_seconds(),
            };
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
                .set_header(vec!["TYPE", "SEQ", "SIZE", "PEER", "PAYLOAD"])
                .add_row(vec![
                    format!("{:#x}", frame.msg_type),
                    frame.sequence.to_string(),
                    frame.payload.len().to_string(),
                    peer.unwrap_or_else(|| "-".to_string()),
                    payload_preview(frame.payload()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "type={:#x} seq={} size={} peer={} payload={}",
                frame.msg_type,
                frame.sequence,
                frame.payload.len(),
                peer.as_deref().unwrap_or("-"),
                payload_preview(frame.payload())
            );
        }
        OutputFormat::Raw => {
            print_raw(frame.payload());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
