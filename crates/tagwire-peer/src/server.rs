//! Accept loop and client stub registry.
//!
//! Every accepted connection becomes a [`ClientStub`] with its own channel.
//! The set of live stubs is owned by a single coordinating task; the accept
//! loop and the per-stub serving tasks only ever talk to it through a bounded
//! event queue.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tagwire_frame::Frame;
use tagwire_transport::TcpTransport;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::DuplexChannel;
use crate::config::{ChannelConfig, ServerConfig};
use crate::error::{PeerError, Result};
use crate::handler::{ChannelHandler, ServerHandler};
use crate::stub::ClientStub;

/// Pause after a failed accept so a persistent failure does not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

enum RegistryEvent {
    Added(ClientStub),
    Removed(u64),
    Snapshot(oneshot::Sender<Vec<ClientStub>>),
}

/// A bound, not yet serving, listener.
pub struct Server {
    transport: TcpTransport,
    config: ServerConfig,
}

impl Server {
    /// Bind to `address` (for example `127.0.0.1:7000`, or port 0 for an
    /// ephemeral port). Bind failures are returned, never retried.
    pub async fn bind(address: &str, config: ServerConfig) -> Result<Self> {
        let transport = TcpTransport::bind(address).await?;
        Ok(Self { transport, config })
    }

    /// Bind, then start serving with `handler`.
    pub async fn start<H: ServerHandler>(
        address: &str,
        config: ServerConfig,
        handler: H,
    ) -> Result<ServerHandle> {
        Ok(Self::bind(address, config).await?.serve(handler))
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Spawn the coordinating loop and the accept loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn serve<H: ServerHandler>(self, handler: H) -> ServerHandle {
        let local_addr = self.local_addr();
        let (events_tx, events_rx) = mpsc::channel(self.config.registry_capacity.max(1));
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();

        tokio::spawn(run_registry(
            Arc::new(handler),
            events_rx,
            events_tx.clone(),
            shutdown.clone(),
            stopped.clone(),
        ));
        tokio::spawn(accept_loop(
            self.transport,
            self.config.channel,
            events_tx.clone(),
            shutdown.clone(),
        ));
        info!(%local_addr, "server listening");

        ServerHandle {
            local_addr,
            events: events_tx,
            shutdown,
            stopped,
        }
    }
}

/// Control handle for a serving [`Server`]. Cloning shares the same server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: mpsc::Sender<RegistryEvent>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Currently registered clients, ordered by id. Empty once shut down.
    pub async fn clients(&self) -> Vec<ClientStub> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(RegistryEvent::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients().await.len()
    }

    /// Stop accepting and close every registered client.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until shutdown has closed every client.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

async fn accept_loop(
    transport: TcpTransport,
    config: ChannelConfig,
    events: mpsc::Sender<RegistryEvent>,
    shutdown: CancellationToken,
) {
    let mut next_id: u64 = 1;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = transport.accept() => accepted,
        };
        let connection = match accepted {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                continue;
            }
        };

        let id = next_id;
        next_id += 1;
        let stub = ClientStub::new(id, DuplexChannel::new(connection, config.clone()));
        info!(id, remote = ?stub.remote_addr(), "client connected");

        tokio::select! {
            _ = shutdown.cancelled() => {
                stub.close();
                break;
            }
            sent = events.send(RegistryEvent::Added(stub.clone())) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(local_addr = %transport.local_addr(), "accept loop stopped");
}

async fn run_registry<H: ServerHandler>(
    handler: Arc<H>,
    mut events: mpsc::Receiver<RegistryEvent>,
    events_tx: mpsc::Sender<RegistryEvent>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) {
    let mut clients: BTreeMap<u64, ClientStub> = BTreeMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            RegistryEvent::Added(stub) => {
                clients.insert(stub.id(), stub.clone());
                debug!(id = stub.id(), clients = clients.len(), "client registered");
                handler.on_new_client(&stub);
                tokio::spawn(serve_stub(stub, Arc::clone(&handler), events_tx.clone()));
            }
            RegistryEvent::Removed(id) => {
                if clients.remove(&id).is_some() {
                    debug!(id, clients = clients.len(), "client removed");
                }
            }
            RegistryEvent::Snapshot(reply) => {
                let _ = reply.send(clients.values().cloned().collect());
            }
        }
    }

    let count = clients.len();
    for stub in clients.into_values() {
        stub.close();
    }
    info!(closed = count, "server stopped");
    stopped.cancel();
}

async fn serve_stub<H: ServerHandler>(
    stub: ClientStub,
    handler: Arc<H>,
    events: mpsc::Sender<RegistryEvent>,
) {
    let dispatch = StubDispatch {
        stub: stub.clone(),
        handler,
    };
    if let Err(err) = stub.channel().start(&dispatch).await {
        warn!(id = stub.id(), error = %err, "client channel did not start");
    }
    stub.close();
    info!(id = stub.id(), "client disconnected");
    let _ = events.send(RegistryEvent::Removed(stub.id())).await;
}

/// Routes one stub's channel callbacks to the server handler.
struct StubDispatch<H> {
    stub: ClientStub,
    handler: Arc<H>,
}

impl<H: ServerHandler> ChannelHandler for StubDispatch<H> {
    fn on_message(&self, frame: Frame) {
        self.handler.on_message(frame, &self.stub);
    }

    fn on_error(&self, err: &PeerError) {
        debug!(id = self.stub.id(), error = %err, "client channel failed");
        self.handler.on_error(err, &self.stub);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;

    use super::*;

    /// Answers type 0x55 with 0x66 and records lifecycle events.
    struct Ping {
        events: UnboundedSender<String>,
    }

    impl Ping {
        fn new() -> (Self, UnboundedReceiver<String>) {
            let (tx, rx) = unbounded_channel();
            (Self { events: tx }, rx)
        }

        fn record(&self, event: String) {
            let _ = self.events.send(event);
        }
    }

    impl ServerHandler for Ping {
        fn on_new_client(&self, stub: &ClientStub) {
            self.record(format!("new {}", stub.id()));
        }

        fn on_message(&self, frame: Frame, stub: &ClientStub) {
            if frame.msg_type == 0x55 {
                stub.try_send(0x66, frame.sequence, frame.payload).unwrap();
            }
        }

        fn on_error(&self, _err: &PeerError, stub: &ClientStub) {
            self.record(format!("error {}", stub.id()));
        }
    }

    struct Forward(UnboundedSender<Frame>);

    impl ChannelHandler for Forward {
        fn on_message(&self, frame: Frame) {
            let _ = self.0.send(frame);
        }
    }

    async fn dial(addr: SocketAddr) -> (DuplexChannel, UnboundedReceiver<Frame>, JoinHandle<()>) {
        let connection = TcpTransport::connect(&addr.to_string()).await.unwrap();
        let channel = DuplexChannel::new(connection, ChannelConfig::default());
        let (tx, rx) = unbounded_channel();
        let runner = channel.clone();
        let task = tokio::spawn(async move {
            runner.start(&Forward(tx)).await.unwrap();
        });
        (channel, rx, task)
    }

    async fn wait_for_count(server: &ServerHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.client_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("client count never reached {expected}"));
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_sequence() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();

        let (client, mut frames, _task) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 1");

        client.send(Frame::new(0x55, 7, "ping")).await.unwrap();
        let pong = frames.recv().await.unwrap();
        assert_eq!(pong.msg_type, 0x66);
        assert_eq!(pong.sequence, 7);
        assert_eq!(pong.payload(), b"ping");

        server.shutdown();
    }

    #[tokio::test]
    async fn dropped_client_is_deregistered() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();

        let (first, _f1, first_task) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 1");
        let (_second, _f2, _t2) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 2");
        wait_for_count(&server, 2).await;

        first.close();
        first_task.await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "error 1");
        wait_for_count(&server, 1).await;

        let remaining = server.clients().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn server_can_request_from_client() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();
        let (client, mut frames, _task) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 1");

        let stub = server.clients().await.remove(0);
        let reply = stub.request(0x200, 4, "status?").await.unwrap();

        let request = frames.recv().await.unwrap();
        assert_eq!(request.msg_type, 0x200);
        client.reply(0x200, request.sequence, "ok").await.unwrap();

        let answer = reply.await.unwrap();
        assert_eq!(answer.msg_type, 0x201);
        assert_eq!(answer.sequence, 4);
        assert_eq!(answer.payload(), b"ok");
        server.shutdown();
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_listener() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();
        let (client, _frames, task) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 1");

        server.shutdown();
        server.stopped().await;

        task.await.unwrap();
        assert!(client.is_closed());
        assert!(server.clients().await.is_empty());
    }

    #[tokio::test]
    async fn every_accepted_client_is_registered_and_closed_on_shutdown() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();

        let mut clients = Vec::new();
        for expected in 1..=3 {
            clients.push(dial(server.local_addr()).await);
            assert_eq!(events.recv().await.unwrap(), format!("new {expected}"));
        }
        let ids: Vec<u64> = server.clients().await.iter().map(ClientStub::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        server.shutdown();
        server.stopped().await;
        for (client, _frames, task) in clients {
            task.await.unwrap();
            assert!(client.is_closed());
        }
    }

    #[tokio::test]
    async fn stub_send_with_length_checks_declared_length() {
        let (handler, mut events) = Ping::new();
        let server = Server::start("127.0.0.1:0", ServerConfig::default(), handler)
            .await
            .unwrap();
        let (client, mut frames, _task) = dial(server.local_addr()).await;
        assert_eq!(events.recv().await.unwrap(), "new 1");
        let stub = server.clients().await.remove(0);

        let err = stub.send_with_length(0x70, 9, 1, "four").await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Frame(tagwire_frame::FrameError::LengthMismatch {
                declared: 9,
                actual: 4
            })
        ));
        stub.send_with_length(0x70, 4, 2, "four").await.unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.msg_type, 0x70);
        assert_eq!(frame.sequence, 2);
        assert_eq!(frame.payload(), b"four");
        client.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let first = Server::bind("127.0.0.1:0", ServerConfig::default())
            .await
            .unwrap();
        let taken = first.local_addr().to_string();

        let err = Server::bind(&taken, ServerConfig::default())
            .await
            .unwrap_err();
        assert!(format!("{first:?}").contains(&taken));
        assert!(matches!(
            err,
            PeerError::Transport(tagwire_transport::TransportError::Bind { .. })
        ));
    }
}
