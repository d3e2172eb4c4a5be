//! # External Media Transport
//!
//! Per call, a TCP listener the PBX is instructed to connect to. Once the PBX
//! connects, the stream carries raw fixed-size PCM frames in both directions
//! at the PBX's native rate. There is no framing header: frame size is a
//! configuration constant shared by both ends.
//!
//! ## Lifecycle:
//! 1. `MediaListener::start_server` binds (ephemeral port by default)
//! 2. The PBX is told to connect to `advertise_host:local_port`
//! 3. `accept` waits, bounded by the attach timeout, for exactly one connection
//! 4. The connection is split into a `MediaReceiver` (PBX → bridge) and a
//!    `MediaSender` (bridge → PBX) owned by the two relay directions
//!
//! Both halves are generic over the underlying stream so tests can drive them
//! with in-memory duplex pipes.
//!
//! ## Timeouts:
//! Reads and writes are each bounded (`media.read_timeout_ms`,
//! `media.write_timeout_ms`). A PBX that stops reading cannot wedge the
//! sender: a stalled write closes the transport.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::FrameAssembler;
use crate::audio::codec;
use crate::audio::frame::AudioFrame;
use crate::config::MediaConfig;
use crate::error::BridgeError;

/// Wire format shared with the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    pub sample_rate: u32,
    pub frame_ms: u32,
}

impl MediaFormat {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }
}

impl From<&MediaConfig> for MediaFormat {
    fn from(config: &MediaConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_ms: config.frame_ms,
        }
    }
}

/// I/O bounds for one media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl From<&MediaConfig> for MediaTimeouts {
    fn from(config: &MediaConfig) -> Self {
        Self {
            read: config.read_timeout(),
            write: config.write_timeout(),
        }
    }
}

/// A bound, not-yet-connected media listener.
pub struct MediaListener {
    listener: TcpListener,
    format: MediaFormat,
    timeouts: MediaTimeouts,
}

impl MediaListener {
    /// Bind a listener for one call.
    ///
    /// ## Parameters:
    /// - **bind_host**: interface to listen on
    /// - **bind_port**: 0 for an ephemeral port
    pub async fn start_server(
        bind_host: &str,
        bind_port: u16,
        format: MediaFormat,
        timeouts: MediaTimeouts,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind((bind_host, bind_port))
            .await
            .map_err(|e| BridgeError::Network(format!("cannot bind media listener on {}:{}: {}", bind_host, bind_port, e)))?;

        debug!(addr = ?listener.local_addr().ok(), "Media listener ready");

        Ok(Self {
            listener,
            format,
            timeouts,
        })
    }

    /// Check at startup that listeners can be created on `bind_host`.
    pub async fn check_bind(bind_host: &str) -> Result<SocketAddr, BridgeError> {
        let listener = TcpListener::bind((bind_host, 0))
            .await
            .map_err(|e| BridgeError::Network(format!("cannot bind media listener on {}: {}", bind_host, e)))?;
        Ok(listener.local_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the PBX to connect. The listener is consumed: one call, one
    /// connection.
    pub async fn accept(self, timeout: Duration) -> Result<MediaConnection<TcpStream>, BridgeError> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| BridgeError::Timeout(format!("waiting {:?} for the PBX media connection", timeout)))??;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Could not disable Nagle on media socket");
        }

        info!(peer = %peer, "PBX connected to external media socket");
        Ok(MediaConnection::new(stream, self.format, self.timeouts))
    }
}

/// An established media connection, before it is split per direction.
pub struct MediaConnection<S> {
    stream: S,
    format: MediaFormat,
    timeouts: MediaTimeouts,
}

impl<S> MediaConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, format: MediaFormat, timeouts: MediaTimeouts) -> Self {
        Self {
            stream,
            format,
            timeouts,
        }
    }

    /// Split into independently owned receive and send halves.
    pub fn split(self) -> (MediaReceiver<ReadHalf<S>>, MediaSender<WriteHalf<S>>) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            MediaReceiver {
                reader,
                assembler: FrameAssembler::new(self.format.frame_bytes()),
                format: self.format,
                read_timeout: self.timeouts.read,
                read_buf: vec![0u8; self.format.frame_bytes().max(512) * 4],
                eof: false,
            },
            MediaSender {
                writer,
                format: self.format,
                write_timeout: self.timeouts.write,
                closed: false,
            },
        )
    }
}

/// PBX → bridge direction.
pub struct MediaReceiver<R> {
    reader: R,
    assembler: FrameAssembler,
    format: MediaFormat,
    read_timeout: Duration,
    read_buf: Vec<u8>,
    eof: bool,
}

impl<R> MediaReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Next complete frame from the PBX.
    ///
    /// ## Returns:
    /// - **Ok(Some(frame))**: one full native frame
    /// - **Ok(None)**: the PBX closed the socket (a trailing partial frame is discarded)
    /// - **Err(Timeout)**: nothing arrived within the read timeout
    pub async fn receive(&mut self) -> Result<Option<AudioFrame>, BridgeError> {
        loop {
            if let Some(bytes) = self.assembler.next_frame() {
                let frame = AudioFrame::from_pcm_bytes(&bytes, self.format.sample_rate)?;
                trace!(samples = frame.len(), "Frame received from PBX");
                return Ok(Some(frame));
            }

            if self.eof {
                return Ok(None);
            }

            let read = tokio::time::timeout(self.read_timeout, self.reader.read(&mut self.read_buf))
                .await
                .map_err(|_| BridgeError::Timeout(format!("reading media for {:?}", self.read_timeout)))?;

            match read {
                Ok(0) => {
                    self.eof = true;
                    let leftover = self.assembler.pending_len();
                    if leftover > 0 {
                        debug!(bytes = leftover, "Discarding partial frame at end of media stream");
                    }
                }
                Ok(n) => self.assembler.push(&self.read_buf[..n]),
                Err(e) => {
                    return match BridgeError::from(e) {
                        BridgeError::TransportClosed => Ok(None),
                        other => Err(other),
                    };
                }
            }
        }
    }
}

/// Bridge → PBX direction.
pub struct MediaSender<W> {
    writer: W,
    format: MediaFormat,
    write_timeout: Duration,
    closed: bool,
}

impl<W> MediaSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Write one frame to the PBX.
    ///
    /// Frames at a foreign rate are resampled to the native rate first. A
    /// write that fails or stalls past the write timeout closes the sender;
    /// from then on every call returns `TransportClosed`.
    pub async fn send(&mut self, frame: AudioFrame) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::TransportClosed);
        }

        let frame = if frame.sample_rate() != self.format.sample_rate {
            codec::resample(&frame, self.format.sample_rate)
        } else {
            frame
        };

        let bytes = frame.to_pcm_bytes();
        match tokio::time::timeout(self.write_timeout, self.writer.write_all(&bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.closed = true;
                debug!(error = %e, "Media socket write failed");
                Err(BridgeError::TransportClosed)
            }
            Err(_) => {
                self.closed = true;
                warn!(
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "PBX stopped reading media, closing transport"
                );
                Err(BridgeError::TransportClosed)
            }
        }
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = tokio::time::timeout(self.write_timeout, self.writer.shutdown()).await;
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NARROWBAND: MediaFormat = MediaFormat {
        sample_rate: 8_000,
        frame_ms: 20,
    };

    const TIMEOUTS: MediaTimeouts = MediaTimeouts {
        read: Duration::from_secs(1),
        write: Duration::from_secs(1),
    };

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let (pbx, bridge) = tokio::io::duplex(64);
        let conn = MediaConnection::new(bridge, NARROWBAND, TIMEOUTS);
        let (mut receiver, _sender) = conn.split();

        let payload = pattern(NARROWBAND.frame_bytes() * 2 + 100);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            let mut pbx = pbx;
            // Dribble the bytes in uneven chunks.
            for chunk in payload.chunks(37) {
                pbx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            pbx.shutdown().await.unwrap();
        });

        let first = receiver.receive().await.unwrap().unwrap();
        let second = receiver.receive().await.unwrap().unwrap();
        assert_eq!(first.len(), 160);
        assert_eq!(first.to_pcm_bytes(), expected[..320].to_vec());
        assert_eq!(second.to_pcm_bytes(), expected[320..640].to_vec());
        // The 100-byte tail never surfaces as a short frame.
        assert!(receiver.receive().await.unwrap().is_none());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_reports_transport_closed() {
        let (pbx, bridge) = tokio::io::duplex(1024);
        let conn = MediaConnection::new(bridge, NARROWBAND, TIMEOUTS);
        let (_receiver, mut sender) = conn.split();

        sender.send(AudioFrame::silence(160, 8_000)).await.unwrap();
        drop(pbx);

        let mut saw_closed = false;
        for _ in 0..4 {
            if sender.send(AudioFrame::silence(160, 8_000)).await == Err(BridgeError::TransportClosed) {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_send_resamples_foreign_rate() {
        let (mut pbx, bridge) = tokio::io::duplex(4096);
        let conn = MediaConnection::new(bridge, NARROWBAND, TIMEOUTS);
        let (_receiver, mut sender) = conn.split();

        sender.send(AudioFrame::silence(480, 24_000)).await.unwrap();
        let mut buf = vec![0u8; 320];
        pbx.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_read_timeout_is_bounded() {
        let (_pbx, bridge) = tokio::io::duplex(64);
        let timeouts = MediaTimeouts {
            read: Duration::from_millis(20),
            ..TIMEOUTS
        };
        let conn = MediaConnection::new(bridge, NARROWBAND, timeouts);
        let (mut receiver, _sender) = conn.split();

        let err = receiver.receive().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_tcp_accept_and_stream() {
        let listener = MediaListener::start_server("127.0.0.1", 0, NARROWBAND, TIMEOUTS)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let pbx = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(&vec![0u8; 320 * 3]).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let conn = listener.accept(Duration::from_secs(1)).await.unwrap();
        let (mut receiver, _sender) = conn.split();
        let mut frames = 0;
        while let Some(frame) = receiver.receive().await.unwrap() {
            assert_eq!(frame.len(), 160);
            frames += 1;
        }
        assert_eq!(frames, 3);
        pbx.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_times_out_without_pbx() {
        let listener = MediaListener::start_server("127.0.0.1", 0, NARROWBAND, TIMEOUTS)
            .await
            .unwrap();
        let result = listener.accept(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stalled_peer_closes_sender() {
        // The PBX end never reads; the pipe fills after a few frames.
        let (_pbx, bridge) = tokio::io::duplex(64);
        let timeouts = MediaTimeouts {
            write: Duration::from_millis(30),
            ..TIMEOUTS
        };
        let conn = MediaConnection::new(bridge, NARROWBAND, timeouts);
        let (_receiver, mut sender) = conn.split();

        let result = tokio::time::timeout(Duration::from_secs(2), sender.send(AudioFrame::silence(160, 8_000)))
            .await
            .expect("a stalled write must be bounded");
        assert_eq!(result, Err(BridgeError::TransportClosed));
        assert!(sender.is_closed());
        assert_eq!(
            sender.send(AudioFrame::silence(160, 8_000)).await,
            Err(BridgeError::TransportClosed)
        );
    }
}
