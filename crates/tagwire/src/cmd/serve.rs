use std::net::SocketAddr;

use tagwire_frame::Frame;
use tagwire_peer::{ClientStub, PeerError, Server, ServerConfig, ServerHandler};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

/// Answers requests by echoing the payload back as the reply.
struct ServeHandler {
    reply_to: Option<Vec<u32>>,
    received: mpsc::UnboundedSender<(Frame, Option<SocketAddr>)>,
}

impl ServeHandler {
    fn answers(&self, msg_type: u32) -> bool {
        self.reply_to
            .as_ref()
            .is_none_or(|types| types.contains(&msg_type))
    }
}

impl ServerHandler for ServeHandler {
    fn on_new_client(&self, stub: &ClientStub) {
        info!(
            id = stub.id(),
            local = ?stub.local_addr(),
            remote = ?stub.remote_addr(),
            "client connected"
        );
    }

    fn on_message(&self, frame: Frame, stub: &ClientStub) {
        if self.answers(frame.msg_type) {
            if let Err(err) = stub.try_reply(frame.msg_type, frame.sequence, frame.payload.clone()) {
                warn!(id = stub.id(), error = %err, "reply failed");
            }
        }
        let _ = self.received.send((frame, stub.remote_addr()));
    }

    fn on_error(&self, err: &PeerError, stub: &ClientStub) {
        warn!(id = stub.id(), error = %err, "client error");
    }
}

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let server = Server::bind(&args.address, ServerConfig::default())
        .await
        .map_err(|err| peer_error("bind failed", err))?;

    let (received_tx, mut received) = mpsc::unbounded_channel();
    let handle = server.serve(ServeHandler {
        reply_to: args.reply_to,
        received: received_tx,
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut printed = 0usize;

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.map_err(|err| io_error("signal handler setup failed", err))?;
                info!("interrupted");
                break;
            }
            next = received.recv() => {
                let Some((frame, peer)) = next else { break };
                print_frame(&frame, peer, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
        }
    }

    handle.shutdown();
    handle.stopped().await;
    Ok(SUCCESS)
}
