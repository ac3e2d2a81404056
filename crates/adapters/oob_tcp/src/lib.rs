//! # gattbridge-adapter-oob-tcp
//!
//! Line-oriented TCP server for the out-of-band pairing-secret exchange.
//!
//! Peripherals in the field hand their pairing material to the bridge over a
//! wired side channel. On a host deployment that channel is a TCP socket:
//! the peer connects, sends one exchange line per secret, and receives the
//! bridge's local material as a reply line. Malformed input never gets a
//! reply, so a peer that wrote garbage simply times out; one that streams
//! bytes past the line cap is hung up on.
//!
//! One client is served at a time; the channel mirrors a point-to-point
//! serial link, not a multi-user API.
//!
//! ## Dependency rule
//!
//! Depends on `gattbridge-app` (for [`BridgeHandle`]). Nothing in the
//! workspace depends on this crate except the binary.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt as _;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_stream::StreamExt as _;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use gattbridge_app::bridge::BridgeHandle;

/// Longest accepted exchange line, in bytes. A well-formed line is under a
/// hundred bytes; anything bigger is noise, and the framed reader never
/// buffers past this cap.
const MAX_LINE_LEN: usize = 256;

/// Why a client session ended.
enum SessionEnd {
    /// The peer closed, failed, or flooded the channel; keep accepting.
    Peer,
    /// The bridge loop is gone; stop serving.
    Bridge,
}

/// TCP server feeding exchange lines into the bridge.
pub struct OobTcpServer {
    listener: TcpListener,
    bridge: BridgeHandle,
}

impl OobTcpServer {
    /// Bind the side-channel listener.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind(addr: impl ToSocketAddrs, bridge: BridgeHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, bridge })
    }

    /// The bound address, useful when binding to port 0.
    ///
    /// # Errors
    ///
    /// Propagates the socket query failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until the bridge loop goes away.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(%err, "out-of-band accept failed");
                    continue;
                }
            };
            tracing::info!(%peer, "out-of-band channel connected");
            match serve_client(stream, peer, &self.bridge).await {
                SessionEnd::Peer => {
                    tracing::info!(%peer, "out-of-band channel closed");
                }
                SessionEnd::Bridge => {
                    tracing::info!("bridge stopped, closing out-of-band listener");
                    return;
                }
            }
        }
    }
}

/// Relay one client's lines through the bridge until the socket closes.
///
/// The codec enforces [`MAX_LINE_LEN`] while framing, so a peer streaming
/// bytes without a newline hits the cap instead of growing the buffer; the
/// session is cut off there and the listener moves on.
async fn serve_client(stream: TcpStream, peer: SocketAddr, bridge: &BridgeHandle) -> SessionEnd {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::debug!(%peer, "out-of-band line cap exceeded, hanging up");
                return SessionEnd::Peer;
            }
            Some(Err(LinesCodecError::Io(err))) => {
                tracing::debug!(%err, %peer, "out-of-band read failed");
                return SessionEnd::Peer;
            }
            None => return SessionEnd::Peer,
        };

        match bridge.exchange_oob(line).await {
            Ok(Some(reply)) => {
                let written = async {
                    writer.write_all(reply.as_bytes()).await?;
                    writer.write_all(b"\n").await
                };
                if let Err(err) = written.await {
                    tracing::debug!(%err, %peer, "out-of-band reply write failed");
                    return SessionEnd::Peer;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%err, "bridge refused out-of-band exchange");
                return SessionEnd::Bridge;
            }
        }
    }
}
