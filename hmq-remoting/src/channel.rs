//! A framed TCP connection driven by one reader and one writer task.

use crate::error::RemotingError;
use bytes::BytesMut;
use hmq_protocol::{Command, Decoder, Encoder};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

/// Bytes reserved in the read buffer before each socket read.
const READ_RESERVE: usize = 8 * 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Receives everything a channel reads.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called on the reader task for every decoded command.
    fn on_command(&self, channel: &Arc<Channel>, command: Command);

    /// Called exactly once, after the channel has stopped reading.
    fn on_close(&self, channel: &Arc<Channel>);

    /// Called when reading or decoding fails, before the channel closes.
    fn on_exception(&self, _channel: &Arc<Channel>, _error: &RemotingError) {}
}

struct Outbound {
    frame: BytesMut,
    done: oneshot::Sender<io::Result<()>>,
}

/// Resolves once a queued frame has been written, or failed to be.
pub struct WriteCompletion {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl WriteCompletion {
    /// Waits for the write. The error carries the failure cause.
    pub async fn wait(self) -> Result<(), String> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connection closed".to_string()),
        }
    }
}

/// A live connection to a peer.
pub struct Channel {
    id: u64,
    remote_addr: SocketAddr,
    encoder: Encoder,
    outbound: mpsc::UnboundedSender<Outbound>,
    active: AtomicBool,
    closed: watch::Sender<bool>,
    created: Instant,
    last_activity_ms: AtomicU64,
}

impl Channel {
    /// Wraps a connected stream and starts its reader and writer tasks.
    pub fn spawn(
        stream: TcpStream,
        handler: Arc<dyn InboundHandler>,
        max_frame_size: u32,
    ) -> io::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            encoder: Encoder::with_max_frame_size(max_frame_size),
            outbound,
            active: AtomicBool::new(true),
            closed,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });

        // Subscribed before any other owner can close the channel
        let writer_closed = channel.closed.subscribe();
        let reader_closed = channel.closed.subscribe();

        tokio::spawn(write_loop(
            channel.clone(),
            write_half,
            outbound_rx,
            writer_closed,
        ));
        tokio::spawn(read_loop(
            channel.clone(),
            read_half,
            handler,
            Decoder::with_max_frame_size(max_frame_size),
            reader_closed,
        ));

        tracing::debug!("Channel {} opened to {}", channel.id, remote_addr);
        Ok(channel)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Encodes and queues a command for writing.
    ///
    /// Fails only if the command cannot be encoded; write failures are
    /// reported through the returned completion.
    pub fn write_command(&self, command: &Command) -> Result<WriteCompletion, RemotingError> {
        let frame = self.encoder.encode(command)?;
        let (done, rx) = oneshot::channel();
        if self.is_active() {
            // A closed writer drops `done`, which resolves the completion as failed
            let _ = self.outbound.send(Outbound { frame, done });
        }
        Ok(WriteCompletion { rx })
    }

    /// Closes the channel. Safe to call more than once.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::debug!("Closing channel {} to {}", self.id, self.remote_addr);
            self.closed.send_replace(true);
        }
    }

    /// Time since the last successful read or write.
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn write_loop(
    channel: Arc<Channel>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(Outbound { frame, done }) = next else { break };
                let result = writer.write_all(&frame).await;
                let failed = result.is_err();
                match &result {
                    Ok(()) => channel.touch(),
                    Err(e) => tracing::debug!("Write to {} failed: {}", channel.remote_addr, e),
                }
                let _ = done.send(result);
                if failed {
                    channel.close();
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    channel: Arc<Channel>,
    mut reader: OwnedReadHalf,
    handler: Arc<dyn InboundHandler>,
    mut decoder: Decoder,
    mut closed: watch::Receiver<bool>,
) {
    'read: loop {
        decoder.buffer_mut().reserve(READ_RESERVE);
        tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("Channel {} closed by {}", channel.id, channel.remote_addr);
                        break 'read;
                    }
                    Ok(_) => channel.touch(),
                    Err(e) => {
                        tracing::debug!("Read from {} failed: {}", channel.remote_addr, e);
                        handler.on_exception(&channel, &RemotingError::Io(e));
                        break 'read;
                    }
                }
                loop {
                    match decoder.decode_command() {
                        Ok(Some(command)) => handler.on_command(&channel, command),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Decode error from {}: {}", channel.remote_addr, e);
                            handler.on_exception(&channel, &RemotingError::Protocol(e));
                            break 'read;
                        }
                    }
                }
            }
            _ = closed.changed() => break 'read,
        }
    }
    channel.close();
    handler.on_close(&channel);
}
