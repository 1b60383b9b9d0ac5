//! TCP transport.
//!
//! A [`Transport`] owns one socket. Writes go through [`Transport::send`];
//! reads happen on a background task that reassembles packets with a
//! [`PacketBuffer`] and hands every complete packet to a [`PacketSink`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use brickwire_protocol::{Packet, PacketBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, ClientResult};

const READ_CHUNK_SIZE: usize = 1024;

/// Receives packets decoded by the read loop.
///
/// Called on the read task; implementations must not block.
pub trait PacketSink: Send + Sync + 'static {
    fn deliver(&self, packet: Packet);
}

/// Something packets can be written to.
pub trait PacketWriter: Send + Sync {
    fn send(&self, packet: &Packet) -> impl Future<Output = ClientResult<()>> + Send;
}

/// Why the read loop stopped.
#[derive(Debug)]
pub enum ReadLoopExit {
    /// [`Transport::disconnect`] was called.
    Shutdown,
    /// The peer closed the connection.
    Eof,
    /// Reading from the socket failed.
    Error(io::Error),
}

/// One open connection to a daemon.
pub struct Transport {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Kept outside `writer` so it stays readable while a write is blocked.
    last_write: StdMutex<Instant>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Opens a TCP connection and starts the read loop.
    ///
    /// Returns the transport and the read loop handle; the handle resolves
    /// once the loop stops.
    pub async fn connect<S: PacketSink>(
        host: &str,
        port: u16,
        timeout: Duration,
        sink: Arc<S>,
    ) -> ClientResult<(Self, JoinHandle<ReadLoopExit>)> {
        let address = format!("{host}:{port}");
        debug!(address = %address, "connecting");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ClientError::Connect {
                address: address.clone(),
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {}ms", timeout.as_millis()),
                ),
            })?
            .map_err(|source| ClientError::Connect {
                address: address.clone(),
                source,
            })?;

        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(read_loop(read_half, sink, shutdown_rx));

        debug!(peer = %peer, "connected");

        Ok((
            Self {
                peer,
                writer: Mutex::new(Some(write_half)),
                last_write: StdMutex::new(Instant::now()),
                shutdown,
            },
            reader,
        ))
    }

    /// Address of the connected peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one packet.
    ///
    /// A write blocked on a full socket buffer is abandoned with
    /// [`ClientError::NotConnected`] once [`Transport::disconnect`] runs.
    pub async fn send(&self, packet: &Packet) -> ClientResult<()> {
        let bytes = packet.encode();
        let mut shutdown = self.shutdown.subscribe();

        let write = async {
            let mut writer = self.writer.lock().await;
            let half = writer.as_mut().ok_or(ClientError::NotConnected)?;
            half.write_all(&bytes).await?;
            Ok::<_, ClientError>(())
        };

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return Err(ClientError::NotConnected),
            written = write => written?,
        }
        *self.last_write_slot() = Instant::now();

        trace!(
            uid = packet.uid(),
            function_id = packet.function_id(),
            sequence_number = packet.sequence_number(),
            length = bytes.len(),
            "packet sent"
        );
        Ok(())
    }

    /// Time since the last successful write.
    pub fn idle_for(&self) -> Duration {
        self.last_write_slot().elapsed()
    }

    /// Closes the socket and stops the read loop.
    ///
    /// Pending writes are cancelled first, so this never waits on a peer
    /// that stopped reading. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);

        let half = self.writer.lock().await.take();
        if let Some(mut half) = half {
            if let Err(e) = half.shutdown().await {
                debug!(error = %e, "socket shutdown failed");
            }
            debug!(peer = %self.peer, "transport closed");
        }
    }

    fn last_write_slot(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PacketWriter for Transport {
    fn send(&self, packet: &Packet) -> impl Future<Output = ClientResult<()>> + Send {
        Transport::send(self, packet)
    }
}

async fn read_loop<S: PacketSink>(
    mut reader: OwnedReadHalf,
    sink: Arc<S>,
    mut shutdown: watch::Receiver<bool>,
) -> ReadLoopExit {
    let mut buffer = PacketBuffer::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return ReadLoopExit::Shutdown,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => return ReadLoopExit::Eof,
            Ok(n) => {
                buffer.extend(&chunk[..n]);
                loop {
                    match buffer.next_packet() {
                        Ok(Some(packet)) => {
                            trace!(
                                uid = packet.uid(),
                                function_id = packet.function_id(),
                                sequence_number = packet.sequence_number(),
                                "packet received"
                            );
                            sink.deliver(packet);
                        }
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "dropping malformed packet"),
                    }
                }
            }
            Err(e) => return ReadLoopExit::Error(e),
        }
    }
}
