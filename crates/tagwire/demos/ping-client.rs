//! Demo client: sends a few pings, then a few requests, against `ping-server`.
//!
//! Run with:
//!   cargo run --example ping-client

use std::time::Duration;

use tagwire::frame::Frame;
use tagwire::peer::{Client, ClientConfig, ClientHandler, PeerError};

const PING: u32 = 0x55;
const ECHO_REQUEST: u32 = 0x122;

struct PingClient;

impl ClientHandler for PingClient {
    fn on_connected(&self, client: &Client) {
        eprintln!(
            "connected: local {:?}, remote {:?}",
            client.local_addr(),
            client.remote_addr()
        );
    }

    fn on_message(&self, frame: Frame, _client: &Client) {
        eprintln!(
            "recv type {:#x}: {}",
            frame.msg_type,
            String::from_utf8_lossy(frame.payload())
        );
    }

    fn on_error(&self, err: &PeerError, _client: &Client) {
        eprintln!("error: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(ClientConfig::default(), PingClient);
    client.connect_sync("127.0.0.1:50051").await?;

    for i in 0..5u32 {
        client.send(PING, i, format!("hello num: {i}")).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for j in 0..3u32 {
        let reply = client
            .request(ECHO_REQUEST, j, format!("Request num: {j}"))
            .await?;
        let frame = reply.await?;
        eprintln!("reply: {}", String::from_utf8_lossy(frame.payload()));
    }

    client.close();
    Ok(())
}
