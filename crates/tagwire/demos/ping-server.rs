//! Demo server: answers "hello num: N" pings and echoes 0x122 requests.
//!
//! Run with:
//!   cargo run --example ping-server
//!
//! Then start `ping-client` in another terminal.

use tagwire::frame::Frame;
use tagwire::peer::{ClientStub, PeerError, Server, ServerConfig, ServerHandler};

const PING: u32 = 0x55;
const PONG: u32 = 0x65;
const ECHO_REQUEST: u32 = 0x122;

struct PingServer;

impl ServerHandler for PingServer {
    fn on_new_client(&self, stub: &ClientStub) {
        eprintln!(
            "client {} connected: local {:?}, remote {:?}",
            stub.id(),
            stub.local_addr(),
            stub.remote_addr()
        );
    }

    fn on_message(&self, frame: Frame, stub: &ClientStub) {
        let text = String::from_utf8_lossy(frame.payload()).into_owned();
        eprintln!("client {}: type {:#x} payload {text:?}", stub.id(), frame.msg_type);

        let outcome = match frame.msg_type {
            PING => {
                let num: i64 = text
                    .rsplit_once(": ")
                    .and_then(|(_, n)| n.parse().ok())
                    .unwrap_or_default();
                stub.try_send(PONG, frame.sequence, format!("hi num: {}", -num))
            }
            ECHO_REQUEST => stub.try_reply(ECHO_REQUEST, frame.sequence, frame.payload),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            eprintln!("client {}: answer failed: {err}", stub.id());
        }
    }

    fn on_error(&self, err: &PeerError, stub: &ClientStub) {
        eprintln!("client {} gone: {err}", stub.id());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::start("127.0.0.1:50051", ServerConfig::default(), PingServer).await?;
    eprintln!("Listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    server.stopped().await;
    Ok(())
}
