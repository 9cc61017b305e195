//! Duplex per-connection channel.
//!
//! A [`DuplexChannel`] owns one connection and, once
//! [`start`](DuplexChannel::start)ed, runs three activities:
//!
//! - a read task turning bytes into frames and queueing them inbound,
//! - a write task draining the outbound queue onto the wire,
//! - the dispatch loop (on the caller of `start`), which offers each
//!   inbound frame to the [`RequestCorrelator`] and passes unclaimed frames
//!   to the [`ChannelHandler`].
//!
//! The first read or write failure is reported once through
//! [`ChannelHandler::on_error`] and tears the whole channel down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tagwire_frame::{reply_type, Frame, FrameCodec, FrameError};
use tagwire_transport::Connection;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::correlator::{ReplyFuture, RequestCorrelator};
use crate::error::{PeerError, Result};
use crate::handler::ChannelHandler;

/// Depth of the error signal: one slot each for the read and write task.
const ERROR_SIGNAL_CAPACITY: usize = 2;

/// Handle to one live connection. Cloning shares the same channel.
#[derive(Clone)]
pub struct DuplexChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    outbound: mpsc::Sender<Outbound>,
    parts: Mutex<Option<ChannelParts>>,
    correlator: RequestCorrelator,
    closed: AtomicBool,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    config: ChannelConfig,
}

/// What `start` takes ownership of.
struct ChannelParts {
    connection: Connection,
    outbound_rx: mpsc::Receiver<Outbound>,
}

/// Items on the outbound queue.
enum Outbound {
    Frame(Frame),
    /// Acknowledged once every earlier item has been written.
    Flush(oneshot::Sender<()>),
}

impl DuplexChannel {
    /// Wrap a connection. Nothing is read or written until `start`.
    pub fn new(connection: Connection, config: ChannelConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let local_addr = connection.local_addr();
        let remote_addr = connection.remote_addr();
        Self {
            inner: Arc::new(ChannelInner {
                outbound,
                parts: Mutex::new(Some(ChannelParts {
                    connection,
                    outbound_rx,
                })),
                correlator: RequestCorrelator::new(config.request_timeout),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                local_addr,
                remote_addr,
                config,
            }),
        }
    }

    /// Run the channel until it terminates.
    ///
    /// Spawns the read and write tasks and runs the dispatch loop on the
    /// calling task. Returns once the channel has failed or been closed; any
    /// request still pending at that point fails with
    /// [`PeerError::Disconnected`].
    pub async fn start<H>(&self, handler: &H) -> Result<()>
    where
        H: ChannelHandler + ?Sized,
    {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let parts = self
            .inner
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PeerError::AlreadyStarted)?;

        let config = &self.inner.config;
        let codec = FrameCodec::with_config(config.frame.clone());
        let (read_half, write_half) = tokio::io::split(parts.connection);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (error_tx, mut error_rx) = mpsc::channel(ERROR_SIGNAL_CAPACITY);
        let shutdown = self.inner.shutdown.clone();

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, codec.clone()),
            inbound_tx,
            error_tx.clone(),
            shutdown.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec),
            parts.outbound_rx,
            error_tx,
            shutdown.clone(),
        ));
        debug!(remote = ?self.inner.remote_addr, "channel started");

        loop {
            tokio::select! {
                // Frames already read are dispatched before a pending error or close.
                biased;
                Some(frame) = inbound_rx.recv() => {
                    if let Some(frame) = self.inner.correlator.filter_message(frame) {
                        handler.on_message(frame);
                    }
                }
                Some(err) = error_rx.recv() => {
                    debug!(remote = ?self.inner.remote_addr, error = %err, "channel failed");
                    handler.on_error(&err);
                    break;
                }
                _ = shutdown.cancelled() => break,
                else => break,
            }
        }

        self.close();
        self.inner.correlator.fail_all("channel closed");
        let _ = reader.await;
        let _ = writer.await;
        debug!(remote = ?self.inner.remote_addr, "channel terminated");
        Ok(())
    }

    /// Queue a frame for transmission, waiting while the outbound queue is full.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.check_sendable(&frame)?;
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(PeerError::Closed),
            sent = self.inner.outbound.send(Outbound::Frame(frame)) => {
                sent.map_err(|_| PeerError::Closed)
            }
        }
    }

    /// Wait until every frame queued before this call has been written.
    pub async fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(PeerError::Closed),
            sent = self.inner.outbound.send(Outbound::Flush(tx)) => {
                sent.map_err(|_| PeerError::Closed)?;
            }
        }
        rx.await.map_err(|_| PeerError::Closed)
    }

    /// Queue a frame without waiting. Fails with [`PeerError::QueueFull`]
    /// when the outbound queue has no room.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.check_sendable(&frame)?;
        self.inner
            .outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|err| match err {
                TrySendError::Full(_) => PeerError::QueueFull,
                TrySendError::Closed(_) => PeerError::Closed,
            })
    }

    /// Send a request and register for its reply (type `msg_type + 1`).
    ///
    /// The registration happens before the frame is queued, so a fast reply
    /// cannot be missed.
    pub async fn request(
        &self,
        msg_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<ReplyFuture> {
        let expected = reply_type(msg_type);
        let (id, reply) = self.inner.correlator.add_request(expected)?;
        if let Err(err) = self.send(Frame::new(msg_type, sequence, payload)).await {
            self.inner.correlator.cancel(expected, id);
            return Err(err);
        }
        Ok(reply)
    }

    /// Like [`request`](Self::request), but hands the outcome to `callback`.
    ///
    /// The callback runs exactly once on a spawned task, with the reply, a
    /// timeout, or a disconnect error.
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
        let reply = self.request(msg_type, sequence, payload).await?;
        tokio::spawn(async move { callback(reply.await) });
        Ok(())
    }

    /// Answer a request of type `request_type`; the frame carries `request_type + 1`.
    pub async fn reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(Frame::new(reply_type(request_type), sequence, payload))
            .await
    }

    /// Non-waiting [`reply`](Self::reply), usable from inside a handler.
    pub fn try_reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.try_send(Frame::new(reply_type(request_type), sequence, payload))
    }

    /// Close the channel.
    ///
    /// Idempotent and safe to race: only the first call closes (and returns
    /// `true`). The read and write tasks stop, and the connection is dropped
    /// once both have released their halves.
    pub fn close(&self) -> bool {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.shutdown.cancel();
        // Never started: release the connection here.
        let unstarted = self
            .inner
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(unstarted);
        debug!(remote = ?self.inner.remote_addr, "channel closed");
        true
    }

    /// Returns true once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Local endpoint address, if the connection has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Remote endpoint address, if the connection has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// The channel's request table.
    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Returns true if both handles refer to the same channel.
    pub fn same_channel(&self, other: &DuplexChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_sendable(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let max = self.inner.config.frame.max_payload_size;
        if frame.payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max,
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    inbound: mpsc::Sender<Frame>,
    errors: mpsc::Sender<PeerError>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                report(&errors, err.into());
                return;
            }
            None => {
                report(&errors, FrameError::ConnectionClosed.into());
                return;
            }
        };
        trace!(
            msg_type = frame.msg_type,
            sequence = frame.sequence,
            len = frame.payload.len(),
            "frame received"
        );

        // A full inbound queue stalls reading until dispatch catches up.
        tokio::select! {
            _ = shutdown.cancelled() => return,
            sent = inbound.send(frame) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Outbound>,
    errors: mpsc::Sender<PeerError>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => return,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Flush(done) => {
                // Each frame is flushed as it is sent, so everything earlier is out.
                let _ = done.send(());
                continue;
            }
        };
        trace!(
            msg_type = frame.msg_type,
            sequence = frame.sequence,
            len = frame.payload.len(),
            "frame sent"
        );

        let written = tokio::select! {
            _ = shutdown.cancelled() => return,
            written = frames.send(frame) => written,
        };
        if let Err(err) = written {
            report(&errors, err.into());
            return;
        }
    }
}

fn report(errors: &mpsc::Sender<PeerError>, err: PeerError) {
    if let Err(TrySendError::Full(err)) = errors.try_send(err) {
        warn!(error = %err, "error signal full, dropping error");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;

    use super::*;

    struct Collect {
        frames: UnboundedSender<Frame>,
        errors: UnboundedSender<String>,
    }

    impl ChannelHandler for Collect {
        fn on_message(&self, frame: Frame) {
            let _ = self.frames.send(frame);
        }

        fn on_error(&self, err: &PeerError) {
            let _ = self.errors.send(err.to_string());
        }
    }

    struct Observed {
        frames: UnboundedReceiver<Frame>,
        errors: UnboundedReceiver<String>,
        task: JoinHandle<Result<()>>,
    }

    fn run(channel: &DuplexChannel) -> Observed {
        let (frames_tx, frames) = unbounded_channel();
        let (errors_tx, errors) = unbounded_channel();
        let handler = Collect {
            frames: frames_tx,
            errors: errors_tx,
        };
        let channel = channel.clone();
        let task = tokio::spawn(async move { channel.start(&handler).await });
        Observed {
            frames,
            errors,
            task,
        }
    }

    /// Replies to every request by echoing its payload.
    struct Echo {
        channel: DuplexChannel,
    }

    impl ChannelHandler for Echo {
        fn on_message(&self, frame: Frame) {
            self.channel
                .try_reply(frame.msg_type, frame.sequence, frame.payload)
                .unwrap();
        }
    }

    fn pair(max_buf_size: usize, config: ChannelConfig) -> (DuplexChannel, DuplexChannel) {
        let (left, right) = Connection::pair(max_buf_size);
        (
            DuplexChannel::new(left, config.clone()),
            DuplexChannel::new(right, config),
        )
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let _a = run(&a);
        let mut observed = run(&b);

        for seq in 0..50u32 {
            a.send(Frame::new(0x55, seq, format!("msg-{seq}")))
                .await
                .unwrap();
        }

        for seq in 0..50u32 {
            let frame = observed.frames.recv().await.unwrap();
            assert_eq!(frame.sequence, seq);
            assert_eq!(frame.payload(), format!("msg-{seq}").as_bytes());
        }
    }

    #[tokio::test]
    async fn flush_waits_for_queued_frames() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let _a = run(&a);
        let mut observed = run(&b);

        a.try_send(Frame::new(1, 0, "one")).unwrap();
        a.try_send(Frame::new(1, 1, "two")).unwrap();
        a.flush().await.unwrap();
        a.close();

        assert_eq!(observed.frames.recv().await.unwrap().payload(), b"one");
        assert_eq!(observed.frames.recv().await.unwrap().payload(), b"two");
        assert!(matches!(a.flush().await, Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn one_byte_transport_reassembles_frames() {
        let (a, b) = pair(1, ChannelConfig::default());
        let _a = run(&a);
        let mut observed = run(&b);

        let sizes = [0usize, 1, 15, 16, 17, 1000];
        for (seq, size) in sizes.iter().enumerate() {
            a.send(Frame::new(9, seq as u32, vec![seq as u8; *size]))
                .await
                .unwrap();
        }

        for (seq, size) in sizes.iter().enumerate() {
            let frame = observed.frames.recv().await.unwrap();
            assert_eq!(frame.sequence, seq as u32);
            assert_eq!(frame.payload(), vec![seq as u8; *size].as_slice());
        }
    }

    #[tokio::test]
    async fn request_gets_reply_not_general_handler() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let mut client = run(&a);
        let echo = Echo { channel: b.clone() };
        let server = b.clone();
        tokio::spawn(async move { server.start(&echo).await });

        let reply = a.request(0x122, 3, "ask").await.unwrap();
        assert_eq!(reply.expected_type(), 0x123);

        let frame = reply.await.unwrap();
        assert_eq!(frame.msg_type, 0x123);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.payload(), b"ask");
        assert_eq!(a.pending_requests(), 0);

        a.close();
        client.task.await.unwrap().unwrap();
        assert!(client.frames.try_recv().is_err(), "reply leaked to handler");
    }

    #[tokio::test]
    async fn request_with_invokes_callback_once() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let _client = run(&a);
        let echo = Echo { channel: b.clone() };
        tokio::spawn(async move { b.start(&echo).await });

        let (tx, mut rx) = unbounded_channel();
        a.request_with(0x10, 1, "cb", move |outcome| {
            let _ = tx.send(outcome.map(|frame| frame.payload));
        })
        .await
        .unwrap();

        let payload = rx.recv().await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"cb");
        assert!(rx.recv().await.is_none(), "callback fired twice");
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_late_reply_is_unsolicited() {
        let config = ChannelConfig {
            request_timeout: Duration::from_millis(50),
            ..ChannelConfig::default()
        };
        let (a, b) = pair(4096, config);
        let mut client = run(&a);
        let _server = run(&b);

        let reply = a.request(0x122, 1, "ask").await.unwrap();
        let err = reply.await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(a.pending_requests(), 0);

        b.reply(0x122, 1, "late").await.unwrap();
        let late = client.frames.recv().await.unwrap();
        assert_eq!(late.msg_type, 0x123);
        assert_eq!(late.payload(), b"late");
    }

    #[tokio::test]
    async fn concurrent_close_closes_once() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let client = run(&a);
        let mut server = run(&b);

        let closers: Vec<_> = (0..16)
            .map(|_| {
                let a = a.clone();
                tokio::spawn(async move { a.close() })
            })
            .collect();

        let mut winners = 0;
        for closer in closers {
            if closer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!a.close());

        client.task.await.unwrap().unwrap();
        // The other side observes exactly one disconnect.
        let err = server.errors.recv().await.unwrap();
        assert!(err.contains("connection closed"), "{err}");
        server.task.await.unwrap().unwrap();
        assert!(server.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_drop_fails_pending_requests() {
        let (a, b) = pair(4096, ChannelConfig::default());
        let mut client = run(&a);

        let reply = a.request(0x40, 0, "never").await.unwrap();
        b.close();

        assert!(matches!(reply.await, Err(PeerError::Disconnected(_))));
        let err = client.errors.recv().await.unwrap();
        assert!(err.contains("connection closed"), "{err}");
        client.task.await.unwrap().unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn invalid_magic_tears_down_channel() {
        let (left, mut raw) = Connection::pair(4096);
        let channel = DuplexChannel::new(left, ChannelConfig::default());
        let mut observed = run(&channel);

        raw.write_all(&[0xDE, 0xAD, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = observed.errors.recv().await.unwrap();
        assert!(err.contains("invalid frame magic"), "{err}");
        observed.task.await.unwrap().unwrap();
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (a, _b) = pair(64, ChannelConfig::default());
        assert!(a.close());

        let err = a.send(Frame::new(1, 0, "x")).await.unwrap_err();
        assert!(matches!(err, PeerError::Closed));
        assert!(matches!(
            a.try_send(Frame::new(1, 0, "x")),
            Err(PeerError::Closed)
        ));
        assert!(matches!(a.request(1, 0, "x").await, Err(PeerError::Closed)));
        assert_eq!(a.pending_requests(), 0);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (a, _b) = pair(64, ChannelConfig::default());
        let _running = run(&a);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let (tx, _rx) = unbounded_channel();
        let (etx, _erx) = unbounded_channel();
        let handler = Collect {
            frames: tx,
            errors: etx,
        };
        assert!(matches!(
            a.start(&handler).await,
            Err(PeerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let config = ChannelConfig {
            outbound_capacity: 1,
            ..ChannelConfig::default()
        };
        let (a, _b) = pair(64, config);

        a.try_send(Frame::new(1, 0, "first")).unwrap();
        assert!(matches!(
            a.try_send(Frame::new(1, 1, "second")),
            Err(PeerError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_rejected_before_queueing() {
        let mut config = ChannelConfig::default();
        config.frame.max_payload_size = 4;
        let (a, _b) = pair(64, config);

        let err = a.send(Frame::new(1, 0, "too long")).await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Frame(FrameError::PayloadTooLarge { .. })
        ));
        assert!(!a.is_closed());
    }
}
