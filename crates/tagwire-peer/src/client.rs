//! Client connection manager.
//!
//! A [`Client`] keeps one channel to a target address alive. After an
//! established connection drops it waits [`ClientConfig::reconnect_backoff`]
//! and redials; a failed dial is reported and ends the loop. All send and
//! request methods go through whichever channel is current and fail with
//! [`PeerError::NotConnected`] between connections.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tagwire_frame::Frame;
use tagwire_transport::TcpTransport;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::DuplexChannel;
use crate::config::ClientConfig;
use crate::correlator::ReplyFuture;
use crate::error::{PeerError, Result};
use crate::handler::{ChannelHandler, ClientHandler};

/// Connection lifecycle as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No target, or the last dial failed.
    Disconnected,
    /// Dialing, or waiting out the backoff before a redial.
    Connecting,
    /// A channel is live.
    Connected,
    /// `close` was called.
    Closed,
}

/// Connection manager handle. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
}

#[derive(Default)]
struct Session {
    address: Option<String>,
    channel: Option<DuplexChannel>,
    connect_loop: Option<CancellationToken>,
    /// Bumped on every retarget and close; a connect loop only acts while
    /// its generation is current.
    generation: u64,
}

impl Client {
    /// Create an idle client; nothing is dialed until a connect call.
    pub fn new<H: ClientHandler>(config: ClientConfig, handler: H) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                handler: Arc::new(handler),
                session: Mutex::new(Session::default()),
                state,
            }),
        }
    }

    /// Start connecting to `address` in the background.
    ///
    /// A different address replaces the current target and closes any live
    /// channel. Calling again with the current target while its loop is
    /// running does nothing.
    pub fn connect_async(&self, address: &str) {
        if let Some((generation, token)) = self.retarget(address) {
            tokio::spawn(connect_loop(
                self.clone(),
                address.to_string(),
                generation,
                token,
                None,
            ));
        }
    }

    /// Connect to `address` and wait for the first connection.
    ///
    /// Returns the dial error if the first dial fails.
    pub async fn connect_sync(&self, address: &str) -> Result<()> {
        let Some((generation, token)) = self.retarget(address) else {
            return self.wait_settled().await;
        };
        let (tx, rx) = oneshot::channel();
        tokio::spawn(connect_loop(
            self.clone(),
            address.to_string(),
            generation,
            token,
            Some(tx),
        ));
        rx.await.unwrap_or(Err(PeerError::Closed))
    }

    /// Queue a complete frame on the current connection.
    pub async fn send_msg(&self, frame: Frame) -> Result<()> {
        self.channel()?.send(frame).await
    }

    /// Queue a frame built from its parts.
    pub async fn send(&self, msg_type: u32, sequence: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.channel()?
            .send(Frame::new(msg_type, sequence, payload))
            .await
    }

    /// Queue a frame with a caller-declared payload length.
    ///
    /// Fails with [`tagwire_frame::FrameError::LengthMismatch`] before
    /// touching the connection when `length` disagrees with the payload.
    pub async fn send_with_length(
        &self,
        msg_type: u32,
        length: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let frame = Frame::with_length(msg_type, length, sequence, payload)?;
        self.channel()?.send(frame).await
    }

    /// Queue a frame without waiting for queue space.
    pub fn try_send(&self, msg_type: u32, sequence: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.channel()?
            .try_send(Frame::new(msg_type, sequence, payload))
    }

    /// Wait until every frame queued so far has been written.
    pub async fn flush(&self) -> Result<()> {
        self.channel()?.flush().await
    }

    /// Send a request; the returned future resolves to its reply.
    pub async fn request(
        &self,
        msg_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<ReplyFuture> {
        self.channel()?.request(msg_type, sequence, payload).await
    }

    /// Send a request and hand the outcome to `callback`.
    pub async fn request_with<F>(
        &self,
        msg_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Frame>) + Send + 'static,
    {
        self.channel()?
            .request_with(msg_type, sequence, payload, callback)
            .await
    }

    /// Answer a request from the server.
    pub async fn reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.channel()?
            .reply(request_type, sequence, payload)
            .await
    }

    /// Answer a request without waiting; usable from a handler.
    pub fn try_reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.channel()?.try_reply(request_type, sequence, payload)
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Returns true if a connection or connect loop was stopped.
    pub fn close(&self) -> bool {
        let (connect_loop, channel) = {
            let mut session = self.inner.lock();
            session.generation += 1;
            self.inner.state.send_replace(ConnectionState::Closed);
            (session.connect_loop.take(), session.channel.take())
        };
        let stopped_loop = connect_loop.map(|token| token.cancel()).is_some();
        let closed_channel = channel.is_some_and(|channel| channel.close());
        if stopped_loop || closed_channel {
            debug!(address = ?self.address(), "client closed");
        }
        stopped_loop || closed_channel
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Current target address.
    pub fn address(&self) -> Option<String> {
        self.inner.lock().address.clone()
    }

    /// Local address of the live connection, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().channel.as_ref().and_then(|c| c.local_addr())
    }

    /// Peer address of the live connection, if any.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().channel.as_ref().and_then(|c| c.remote_addr())
    }

    /// Configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn channel(&self) -> Result<DuplexChannel> {
        self.inner
            .lock()
            .channel
            .clone()
            .ok_or(PeerError::NotConnected)
    }

    /// Make `address` the target. Returns the new loop's generation and
    /// token, or `None` when a loop for that address is already running.
    fn retarget(&self, address: &str) -> Option<(u64, CancellationToken)> {
        let (old_loop, old_channel, generation, token) = {
            let mut session = self.inner.lock();
            if session.address.as_deref() == Some(address) && session.connect_loop.is_some() {
                return None;
            }
            session.generation += 1;
            session.address = Some(address.to_string());
            let token = CancellationToken::new();
            let old_loop = session.connect_loop.replace(token.clone());
            // Must be visible before the lock drops; `connect_sync` on the
            // same target waits on it.
            self.inner.state.send_replace(ConnectionState::Connecting);
            (old_loop, session.channel.take(), session.generation, token)
        };
        if let Some(old_loop) = old_loop {
            old_loop.cancel();
        }
        if let Some(old_channel) = old_channel {
            old_channel.close();
        }
        Some((generation, token))
    }

    /// Wait for a running connect loop to connect or give up.
    async fn wait_settled(&self) -> Result<()> {
        let mut state = self.subscribe();
        let settled = state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state);
        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(ConnectionState::Closed) => Err(PeerError::Closed),
            _ => Err(PeerError::NotConnected),
        }
    }

    /// Apply `state` if `generation` is still current.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let session = self.inner.lock();
        if session.generation != generation {
            return false;
        }
        self.inner.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        true
    }

    fn install(&self, generation: u64, channel: &DuplexChannel) -> bool {
        let mut session = self.inner.lock();
        if session.generation != generation {
            return false;
        }
        session.channel = Some(channel.clone());
        self.inner.state.send_replace(ConnectionState::Connected);
        true
    }

    fn uninstall(&self, channel: &DuplexChannel) {
        let mut session = self.inner.lock();
        if session
            .channel
            .as_ref()
            .is_some_and(|current| current.same_channel(channel))
        {
            session.channel = None;
        }
    }

    fn finish_loop(&self, generation: u64, state: ConnectionState) {
        let mut session = self.inner.lock();
        if session.generation == generation {
            session.connect_loop = None;
            self.inner.state.send_replace(state);
        }
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

async fn connect_loop(
    client: Client,
    address: String,
    generation: u64,
    token: CancellationToken,
    mut first: Option<oneshot::Sender<Result<()>>>,
) {
    let config = client.inner.config.clone();

    loop {
        if !client.set_state(generation, ConnectionState::Connecting) {
            return;
        }
        debug!(%address, "dialing");
        let dialed = tokio::select! {
            _ = token.cancelled() => return,
            dialed = TcpTransport::connect_timeout(&address, config.connect_timeout) => dialed,
        };

        let connection = match dialed {
            Ok(connection) => connection,
            Err(err) => {
                let err = PeerError::from(err);
                error!(%address, error = %err, "dial failed");
                client.finish_loop(generation, ConnectionState::Disconnected);
                match first.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => client.inner.handler.on_error(&err, &client),
                }
                return;
            }
        };

        let channel = DuplexChannel::new(connection, config.channel.clone());
        if !client.install(generation, &channel) {
            channel.close();
            return;
        }
        info!(%address, local = ?channel.local_addr(), "connected");
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        client.inner.handler.on_connected(&client);

        let dispatch = ClientDispatch {
            client: client.clone(),
        };
        if let Err(err) = channel.start(&dispatch).await {
            debug!(%address, error = %err, "channel closed before it started");
        }
        client.uninstall(&channel);

        if token.is_cancelled() || !client.set_state(generation, ConnectionState::Connecting) {
            return;
        }
        warn!(%address, backoff = ?config.reconnect_backoff, "connection lost, reconnecting");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_backoff) => {}
        }
    }
}

/// Routes channel callbacks to the client handler.
struct ClientDispatch {
    client: Client,
}

impl ChannelHandler for ClientDispatch {
    fn on_message(&self, frame: Frame) {
        self.client.inner.handler.on_message(frame, &self.client);
    }

    fn on_error(&self, err: &PeerError) {
        warn!(address = ?self.client.address(), error = %err, "channel error");
        self.client.inner.handler.on_error(err, &self.client);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tagwire_transport::Connection;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use super::*;
    use crate::config::ChannelConfig;

    /// Records lifecycle callbacks as strings and forwards frames.
    struct Recorder {
        events: UnboundedSender<String>,
        frames: UnboundedSender<Frame>,
    }

    impl ClientHandler for Recorder {
        fn on_connected(&self, _client: &Client) {
            let _ = self.events.send("connected".to_string());
        }

        fn on_message(&self, frame: Frame, _client: &Client) {
            let _ = self.frames.send(frame);
        }

        fn on_error(&self, err: &PeerError, _client: &Client) {
            let _ = self.events.send(format!("error: {err}"));
        }
    }

    fn client(config: ClientConfig) -> (Client, UnboundedReceiver<String>, UnboundedReceiver<Frame>) {
        let (events_tx, events) = unbounded_channel();
        let (frames_tx, frames) = unbounded_channel();
        let handler = Recorder {
            events: events_tx,
            frames: frames_tx,
        };
        (Client::new(config, handler), events, frames)
    }

    fn fast_backoff() -> ClientConfig {
        ClientConfig {
            reconnect_backoff: Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    /// Echoes every frame back as a reply.
    struct Echo(DuplexChannel);

    impl ChannelHandler for Echo {
        fn on_message(&self, frame: Frame) {
            let _ = self.0.try_reply(frame.msg_type, frame.sequence, frame.payload);
        }
    }

    fn serve_echo(connection: Connection) -> DuplexChannel {
        let channel = DuplexChannel::new(connection, ChannelConfig::default());
        let runner = channel.clone();
        tokio::spawn(async move {
            let echo = Echo(runner.clone());
            runner.start(&echo).await
        });
        channel
    }

    async fn unused_address() -> String {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().to_string()
    }

    #[tokio::test]
    async fn connect_sync_then_request() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let accepted = tokio::spawn(async move { serve_echo(listener.accept().await.unwrap()) });

        let (client, mut events, _frames) = client(ClientConfig::default());
        client.connect_sync(&address).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(events.recv().await.unwrap(), "connected");
        assert_eq!(client.address().as_deref(), Some(address.as_str()));
        assert!(client.local_addr().is_some());
        let _server = accepted.await.unwrap();

        let reply = client.request(0x122, 9, "hi").await.unwrap();
        let frame = reply.await.unwrap();
        assert_eq!(frame.msg_type, 0x123);
        assert_eq!(frame.sequence, 9);

        assert!(client.close());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send(1, 0, "x").await,
            Err(PeerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_sync_returns_dial_error() {
        let address = unused_address().await;
        let (client, mut events, _frames) = client(ClientConfig::default());

        let err = client.connect_sync(&address).await.unwrap_err();
        assert!(err.is_dial_failure(), "{err}");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // Reported through the result, not the handler.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_async_reports_dial_error_to_handler() {
        let address = unused_address().await;
        let (client, mut events, _frames) = client(ClientConfig::default());

        client.connect_async(&address);
        let event = events.recv().await.unwrap();
        assert!(event.starts_with("error: transport error"), "{event}");

        let mut state = client.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_server_drops_connection() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let (client, mut events, mut frames) = client(fast_backoff());

        client.connect_async(&address);
        let first = listener.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "connected");
        drop(first);

        let event = events.recv().await.unwrap();
        assert!(event.contains("connection closed"), "{event}");

        let second = serve_echo(listener.accept().await.unwrap());
        assert_eq!(events.recv().await.unwrap(), "connected");
        assert_eq!(client.state(), ConnectionState::Connected);

        second.send(Frame::new(0x55, 1, "after")).await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.payload(), b"after");
        client.close();
    }

    #[tokio::test]
    async fn close_during_backoff_stops_reconnecting() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let config = ClientConfig {
            reconnect_backoff: Duration::from_secs(60),
            ..ClientConfig::default()
        };
        let (client, mut events, _frames) = client(config);

        client.connect_sync(&address).await.unwrap();
        let first = listener.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "connected");
        drop(first);
        assert!(events.recv().await.unwrap().starts_with("error"));

        let mut state = client.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();
        assert!(client.close());
        assert_eq!(client.state(), ConnectionState::Closed);

        let redial = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(redial.is_err(), "client redialed after close");
        assert!(!client.close());
    }

    #[tokio::test]
    async fn same_target_is_not_dialed_twice() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let (client, mut events, _frames) = client(ClientConfig::default());

        client.connect_sync(&address).await.unwrap();
        client.connect_async(&address);
        client.connect_sync(&address).await.unwrap();

        let _only = listener.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "connected");
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "duplicate connect loop");
        client.close();
    }

    #[tokio::test]
    async fn connect_sync_waits_for_loop_started_by_connect_async() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (client, _events, _frames) = client(ClientConfig::default());

        client.connect_async(&address);
        assert_eq!(client.state(), ConnectionState::Connecting);
        client.connect_sync(&address).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        let _server_side = accepted.await.unwrap();
        client.close();
    }

    #[tokio::test]
    async fn reconnect_after_close_waits_for_new_loop() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let (client, _events, _frames) = client(ClientConfig::default());

        client.connect_sync(&address).await.unwrap();
        let _first = listener.accept().await.unwrap();
        assert!(client.close());
        assert_eq!(client.state(), ConnectionState::Closed);

        client.connect_async(&address);
        client.connect_sync(&address).await.unwrap();
        let _second = listener.accept().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close();
    }

    #[tokio::test]
    async fn send_with_length_rejects_mismatch() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().to_string();
        let accepted = tokio::spawn(async move { serve_echo(listener.accept().await.unwrap()) });
        let (client, _events, mut frames) = client(ClientConfig::default());
        client.connect_sync(&address).await.unwrap();
        let _server = accepted.await.unwrap();

        let err = client.send_with_length(0x122, 3, 1, "hi").await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Frame(tagwire_frame::FrameError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        ));

        client.send_with_length(0x122, 2, 5, "hi").await.unwrap();
        let echoed = frames.recv().await.unwrap();
        assert_eq!(echoed.msg_type, 0x123);
        assert_eq!(echoed.sequence, 5);
        client.close();
    }

    #[tokio::test]
    async fn retarget_closes_previous_connection() {
        let old = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let new = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let (client, _events, _frames) = client(fast_backoff());

        client
            .connect_sync(&old.local_addr().to_string())
            .await
            .unwrap();
        let mut old_side = old.accept().await.unwrap();

        client
            .connect_sync(&new.local_addr().to_string())
            .await
            .unwrap();
        let _new_side = new.accept().await.unwrap();
        assert_eq!(client.remote_addr(), Some(new.local_addr()));

        // The old connection is closed from the client side.
        let mut buf = [0u8; 1];
        let read = tokio::io::AsyncReadExt::read(&mut old_side, &mut buf)
            .await
            .unwrap();
        assert_eq!(read, 0);
        client.close();
    }

    #[tokio::test]
    async fn operations_without_connection_fail() {
        let (client, _events, _frames) = client(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.try_send(1, 0, "x"),
            Err(PeerError::NotConnected)
        ));
        assert!(matches!(
            client.request(1, 0, "x").await,
            Err(PeerError::NotConnected)
        ));
        assert!(client.local_addr().is_none());
        assert!(!client.close());
    }
}
