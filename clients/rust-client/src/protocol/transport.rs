//! Frame channel between a client session and a server dispatcher.
//!
//! A [`Channel`] is one end of a bidirectional, ordered frame pipe. Sending
//! never blocks; receiving is the only point where a caller waits. Channels
//! come either as an in-process pair or wrap a TCP stream, in which case a
//! reader task and a writer task move frames through the [`MessageCodec`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::codec::{MessageCodec, DRIVER_MAGIC};
use super::error::DriverError;
use super::message::Frame;

pub struct Channel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Channel {
    /// Two connected in-process ends
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Channel { tx: a_tx, rx: b_rx },
            Channel { tx: b_tx, rx: a_rx },
        )
    }

    /// Connect to a server, sending the magic header first
    pub async fn connect(addr: &str, codec: MessageCodec) -> Result<Channel, DriverError> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            DriverError::ConnectionError(format!("Failed to connect to {}: {}", addr, e))
        })?;

        stream.set_nodelay(true).map_err(|e| {
            DriverError::ConnectionError(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        stream.write_all(DRIVER_MAGIC).await.map_err(|e| {
            DriverError::ConnectionError(format!("Failed to send magic header: {}", e))
        })?;

        Ok(Self::from_stream(stream, codec))
    }

    /// Wrap an established stream whose magic header is already handled
    pub fn from_stream<S>(stream: S, codec: MessageCodec) -> Channel
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = codec.write_frame(&mut writer, &frame).await {
                    tracing::warn!("Channel write failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        tokio::spawn(async move {
            loop {
                match codec.read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("Channel closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Channel read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Channel {
            tx: out_tx,
            rx: in_rx,
        }
    }

    /// Queue a frame for the peer without waiting
    pub fn send(&self, frame: Frame) -> Result<(), DriverError> {
        self.tx
            .send(frame)
            .map_err(|_| DriverError::ConnectionError("Channel closed".to_string()))
    }

    /// Next frame from the peer, `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>) {
        (self.tx, self.rx)
    }
}
