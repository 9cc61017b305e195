use std::time::Duration;

use tagwire_frame::Frame;
use tagwire_peer::{Client, ClientConfig, ClientHandler};
use tokio::sync::mpsc;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_frame, OutputFormat};

/// Forwards unsolicited frames to the command.
struct Forward {
    frames: mpsc::UnboundedSender<Frame>,
}

impl ClientHandler for Forward {
    fn on_message(&self, frame: Frame, _client: &Client) {
        let _ = self.frames.send(frame);
    }
}

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = args.payload.resolve()?;

    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let client = Client::new(ClientConfig::default(), Forward { frames: frames_tx });
    client
        .connect_sync(&args.address)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    client
        .send(args.msg_type, args.payload.seq, payload)
        .await
        .map_err(|err| peer_error("send failed", err))?;
    client
        .flush()
        .await
        .map_err(|err| peer_error("send failed", err))?;

    if args.wait {
        let frame = wait_for_frame(&mut frames, wait_timeout).await?;
        print_frame(&frame, client.remote_addr(), format);
    }

    client.close();
    Ok(SUCCESS)
}

async fn wait_for_frame(
    frames: &mut mpsc::UnboundedReceiver<Frame>,
    timeout: Duration,
) -> CliResult<Frame> {
    match tokio::time::timeout(timeout, frames.recv()).await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(CliError::new(
            FAILURE,
            "connection closed before a frame arrived",
        )),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no frame received within {timeout:?}"),
        )),
    }
}
