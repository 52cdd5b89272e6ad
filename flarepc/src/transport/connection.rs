use std::{io::IoSlice, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

use super::Channel;
use crate::{
    Error, ErrorKind, Result, TaskSupervisor,
    config::TransportConfig,
    meta::Address,
    protocol::{Frame, FrameDecoder, heartbeat_frame},
};

/// Receives the events of a connection. Called from the connection's read task, so
/// implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_active(&self, _channel: &Arc<Channel>) {}

    /// # Errors
    ///
    /// An error closes the connection.
    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()>;

    fn on_inactive(&self, _channel: &Arc<Channel>) {}
}

/// Which idle timers a connection runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdlePolicy {
    /// Send a heartbeat after this long without writes.
    pub writer_idle: Option<Duration>,
    /// Close the connection after this long without reads.
    pub reader_idle: Option<Duration>,
}

impl IdlePolicy {
    /// Connections we dial keep themselves alive.
    #[must_use]
    pub fn dialer(config: &TransportConfig) -> Self {
        Self {
            writer_idle: Some(config.writer_idle),
            reader_idle: None,
        }
    }

    /// Connections we accept are dropped once the peer goes quiet.
    #[must_use]
    pub fn acceptor(config: &TransportConfig) -> Self {
        Self {
            writer_idle: None,
            reader_idle: Some(config.reader_idle),
        }
    }
}

/// Opens a TCP connection to `address` within `timeout`.
///
/// # Errors
///
/// Returns `TcpConnectFailed` on refusal, resolution failure or timeout.
pub async fn dial(address: &Address, timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((address.host.as_str(), address.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::new(
            ErrorKind::TcpConnectFailed,
            format!("connect {address}: {e}"),
        )),
        Err(_) => Err(Error::new(
            ErrorKind::TcpConnectFailed,
            format!("connect {address}: timed out after {timeout:?}"),
        )),
    }
}

/// Wraps an established stream into a [`Channel`] and spawns its send and receive loops
/// under `supervisor`.
///
/// `handler.on_active` runs before the first frame is read; `handler.on_inactive` runs once
/// the receive loop ends for any reason other than supervisor shutdown.
///
/// # Errors
///
/// Returns `TcpConnectFailed` if the peer address of `stream` is unavailable.
pub fn start_channel(
    stream: TcpStream,
    handler: Arc<dyn FrameHandler>,
    supervisor: &TaskSupervisor,
    config: &TransportConfig,
    idle: IdlePolicy,
) -> Result<Arc<Channel>> {
    let remote = stream
        .peer_addr()
        .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
    let _ = stream.set_nodelay(true);
    let (recv_stream, send_stream) = stream.into_split();
    let (sender, receiver) = mpsc::channel(config.write_queue.max(1));
    let channel = Channel::new(remote, sender);

    handler.on_active(&channel);

    supervisor.spawn("send loop", {
        let channel = channel.clone();
        async move {
            tokio::select! {
                () = channel.closed() => {}
                r = send_loop(send_stream, receiver, idle.writer_idle) => {
                    if let Err(e) = r {
                        tracing::error!("send loop for {remote} failed: {e}");
                    }
                }
            }
            channel.close();
        }
    });

    let max_frame_size = config.max_frame_size;
    supervisor.spawn("recv loop", {
        let channel = channel.clone();
        async move {
            tokio::select! {
                () = channel.closed() => {}
                r = recv_loop(recv_stream, &channel, handler.as_ref(), max_frame_size, idle.reader_idle) => {
                    match r {
                        Ok(()) => tracing::debug!("{remote} closed the connection"),
                        Err(e) => tracing::error!("recv loop for {remote} failed: {e}"),
                    }
                }
            }
            channel.close();
            handler.on_inactive(&channel);
        }
    });

    Ok(channel)
}

async fn recv_loop(
    mut recv_stream: OwnedReadHalf,
    channel: &Arc<Channel>,
    handler: &dyn FrameHandler,
    max_frame_size: usize,
    reader_idle: Option<Duration>,
) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(64 << 10);
    let mut decoder = FrameDecoder::new(max_frame_size);
    loop {
        while let Some(frame) = decoder.decode(&mut buffer)? {
            handler.on_frame(channel, frame)?;
        }

        let read = recv_stream.read_buf(&mut buffer);
        let n = match reader_idle {
            Some(idle) => tokio::time::timeout(idle, read).await.map_err(|_| {
                Error::new(
                    ErrorKind::TcpRecvMsgFailed,
                    format!("reader idle for {idle:?}"),
                )
            })?,
            None => read.await,
        }
        .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))?;
        if n == 0 {
            return Ok(());
        }
    }
}

async fn send_loop(
    mut send_stream: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Bytes>,
    writer_idle: Option<Duration>,
) -> Result<()> {
    const LIMIT: usize = 64;
    let mut msgs = Vec::with_capacity(LIMIT);
    loop {
        let mut bufs = [IoSlice::new(&[]); LIMIT];

        let n = match writer_idle {
            Some(idle) => {
                match tokio::time::timeout(idle, receiver.recv_many(&mut msgs, LIMIT)).await {
                    Ok(n) => n,
                    Err(_) => {
                        msgs.push(heartbeat_frame());
                        1
                    }
                }
            }
            None => receiver.recv_many(&mut msgs, LIMIT).await,
        };
        if n == 0 {
            return Ok(());
        }

        for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
            *io_slice = IoSlice::new(msg);
        }

        let mut slices = &mut bufs[..msgs.len()];
        while !slices.is_empty() {
            let n = send_stream
                .write_vectored(slices)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))?;
            IoSlice::advance_slices(&mut slices, n);
        }
        msgs.clear();
    }
}
