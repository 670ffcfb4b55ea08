//! Packet framing over an opaque byte-stream transport
//!
//! Every packet is a 3-byte little-endian payload length, a 1-byte sequence
//! number and the payload. Payloads of `MAX_PACKET_SIZE` bytes or more are
//! split across several packets and joined again on read.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use super::buffer::WireWriter;
use crate::error::{DriverError, DriverResult};

/// Largest payload a single packet can carry
pub const MAX_PACKET_SIZE: usize = 0xFF_FFFF;
const HEADER_SIZE: usize = 4;

/// Byte-stream capability the packet stream reads from and writes to
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Whether bytes on this transport are already encrypted
    fn is_encrypted(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

/// Marks a stream whose traffic is already encrypted (TLS, tunnel, ...)
#[derive(Debug)]
pub struct Encrypted<S>(pub S);

impl<S: AsyncRead + Unpin> AsyncRead for Encrypted<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Encrypted<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for Encrypted<S> {
    fn is_encrypted(&self) -> bool {
        true
    }
}

/// Packet-level reader/writer over one physical connection
pub struct PacketStream<T> {
    transport: T,
    sequence: u8,
    out: WireWriter,
    socket_timeout: Option<Duration>,
    max_allowed_packet: Option<usize>,
}

impl<T: Transport> PacketStream<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            sequence: 0,
            out: WireWriter::new(),
            socket_timeout: None,
            max_allowed_packet: None,
        }
    }

    /// Bound every read and write by `timeout`
    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Reject outgoing payloads larger than the server accepts
    pub fn set_max_allowed_packet(&mut self, max: Option<usize>) {
        self.max_allowed_packet = max;
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Sequence number the next packet (read or written) must carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Expect sequence 0 next, as at the start of every command
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Begin a new outgoing packet with the given sequence number
    pub fn start_packet(&mut self, sequence: u8) {
        self.sequence = sequence;
        self.out.clear();
    }

    /// Append raw bytes to the packet being built
    pub fn write(&mut self, bytes: &[u8]) {
        self.out.write_bytes(bytes);
    }

    /// Codec access to the packet being built
    pub fn writer(&mut self) -> &mut WireWriter {
        &mut self.out
    }

    /// Send the accumulated packet
    pub async fn flush(&mut self) -> DriverResult<()> {
        let payload = std::mem::take(&mut self.out).freeze();
        self.send(&payload).await
    }

    /// Send a zero-length packet with the given sequence number
    pub async fn write_empty_packet(&mut self, sequence: u8) -> DriverResult<()> {
        self.start_packet(sequence);
        self.send(&[]).await
    }

    /// Send one logical payload, splitting it into as many packets as needed
    pub async fn send(&mut self, payload: &[u8]) -> DriverResult<()> {
        if let Some(max) = self.max_allowed_packet {
            if payload.len() > max {
                return Err(DriverError::protocol(format!(
                    "packet of {} bytes exceeds max_allowed_packet ({} bytes)",
                    payload.len(),
                    max
                )));
            }
        }

        let timeout = self.socket_timeout;
        with_timeout(timeout, "packet write", self.send_unbounded(payload)).await
    }

    async fn send_unbounded(&mut self, payload: &[u8]) -> DriverResult<()> {
        let mut offset = 0;
        loop {
            let end = (offset + MAX_PACKET_SIZE).min(payload.len());
            let chunk = &payload[offset..end];

            let len = chunk.len() as u32;
            let header = [
                (len & 0xFF) as u8,
                ((len >> 8) & 0xFF) as u8,
                ((len >> 16) & 0xFF) as u8,
                self.sequence,
            ];
            trace!(len = chunk.len(), sequence = self.sequence, "writing packet");
            self.transport.write_all(&header).await?;
            self.transport.write_all(chunk).await?;
            self.sequence = self.sequence.wrapping_add(1);

            offset = end;
            // a full-size chunk is always followed by another packet, possibly empty
            if chunk.len() < MAX_PACKET_SIZE {
                break;
            }
        }
        self.transport.flush().await?;
        Ok(())
    }

    /// Read exactly one logical packet, joining continuation packets
    pub async fn get_packet(&mut self) -> DriverResult<Bytes> {
        let timeout = self.socket_timeout;
        with_timeout(timeout, "packet read", self.read_logical_packet()).await
    }

    async fn read_logical_packet(&mut self) -> DriverResult<Bytes> {
        let mut joined: Option<BytesMut> = None;
        loop {
            let mut header = [0u8; HEADER_SIZE];
            self.transport.read_exact(&mut header).await?;

            let len = usize::from(header[0])
                | (usize::from(header[1]) << 8)
                | (usize::from(header[2]) << 16);
            let sequence = header[3];
            if sequence != self.sequence {
                return Err(DriverError::Desync {
                    expected: self.sequence,
                    actual: sequence,
                });
            }
            self.sequence = self.sequence.wrapping_add(1);
            trace!(len, sequence, "read packet");

            let mut chunk = BytesMut::zeroed(len);
            self.transport.read_exact(&mut chunk).await?;

            match joined.as_mut() {
                None if len < MAX_PACKET_SIZE => return Ok(chunk.freeze()),
                None => joined = Some(chunk),
                Some(payload) => payload.extend_from_slice(&chunk),
            }

            if len < MAX_PACKET_SIZE {
                break;
            }
        }
        Ok(joined.map(BytesMut::freeze).unwrap_or_default())
    }

    /// Shut down the write half of the transport
    pub async fn close(&mut self) -> DriverResult<()> {
        self.transport.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

async fn with_timeout<F, R>(timeout: Option<Duration>, operation: &str, fut: F) -> DriverResult<R>
where
    F: Future<Output = DriverResult<R>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DriverError::timeout(format!("{operation} after {limit:?}")))?,
        None => fut.await,
    }
}

#[cfg(test)]
impl Transport for tokio_test::io::Mock {}
