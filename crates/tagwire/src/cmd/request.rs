use tagwire_frame::Frame;
use tagwire_peer::{ChannelConfig, Client, ClientConfig, ClientHandler};
use tracing::debug;

use crate::cmd::{parse_duration, RequestArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

/// Logs frames that arrive outside the request.
struct Unsolicited;

impl ClientHandler for Unsolicited {
    fn on_message(&self, frame: Frame, _client: &Client) {
        debug!(
            msg_type = frame.msg_type,
            sequence = frame.sequence,
            "ignoring unsolicited frame"
        );
    }
}

pub async fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let request_timeout = parse_duration(&args.timeout)?;
    let connect_timeout = args
        .connect_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    let payload = args.payload.resolve()?;

    let config = ClientConfig {
        channel: ChannelConfig {
            request_timeout,
            ..ChannelConfig::default()
        },
        connect_timeout,
        ..ClientConfig::default()
    };
    let client = Client::new(config, Unsolicited);
    client
        .connect_sync(&args.address)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let reply = client
        .request(args.msg_type, args.payload.seq, payload)
        .await
        .map_err(|err| peer_error("request failed", err))?;
    let outcome = reply.await;
    let remote = client.remote_addr();
    client.close();

    let frame = outcome.map_err(|err| peer_error("request failed", err))?;
    print_frame(&frame, remote, format);
    Ok(SUCCESS)
}
