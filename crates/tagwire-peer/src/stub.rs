use std::net::SocketAddr;

use bytes::Bytes;
use tagwire_frame::Frame;

use crate::channel::DuplexChannel;
use crate::correlator::ReplyFuture;
use crate::error::Result;

/// Server-side handle for one accepted client.
///
/// Cheap to clone; every clone talks over the same channel.
#[derive(Clone)]
pub struct ClientStub {
    id: u64,
    channel: DuplexChannel,
}

impl ClientStub {
    pub(crate) fn new(id: u64, channel: DuplexChannel) -> Self {
        Self { id, channel }
    }

    /// Registry id, unique within one server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a complete frame.
    pub async fn send_msg(&self, frame: Frame) -> Result<()> {
        self.channel.send(frame).await
    }

    /// Queue a frame built from its parts.
    pub async fn send(&self, msg_type: u32, sequence: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.channel
            .send(Frame::new(msg_type, sequence, payload))
            .await
    }

    /// Queue a frame with a caller-declared payload length.
    ///
    /// Fails with [`tagwire_frame::FrameError::LengthMismatch`] when `length`
    /// disagrees with the payload.
    pub async fn send_with_length(
        &self,
        msg_type: u32,
        length: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let frame = Frame::with_length(msg_type, length, sequence, payload)?;
        self.channel.send(frame).await
    }

    /// Queue a frame without waiting for queue space.
    pub fn try_send(&self, msg_type: u32, sequence: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.channel.try_send(Frame::new(msg_type, sequence, payload))
    }

    /// Wait until every frame queued so far has been written.
    pub async fn flush(&self) -> Result<()> {
        self.channel.flush().await
    }

    /// Send a request to the client and register for its reply.
    pub async fn request(
        &self,
        msg_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<ReplyFuture> {
        self.channel.request(msg_type, sequence, payload).await
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
        self.channel
            .request_with(msg_type, sequence, payload, callback)
            .await
    }

    /// Answer a request from the client.
    pub async fn reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.channel.reply(request_type, sequence, payload).await
    }

    /// Answer a request without waiting; usable from a handler.
    pub fn try_reply(
        &self,
        request_type: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.channel.try_reply(request_type, sequence, payload)
    }

    /// Close the connection. Returns true for the call that closed it.
    pub fn close(&self) -> bool {
        self.channel.close()
    }

    /// Whether the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Server-side address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.local_addr()
    }

    /// Client's address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    pub(crate) fn channel(&self) -> &DuplexChannel {
        &self.channel
    }
}

impl std::fmt::Debug for ClientStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStub")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}
