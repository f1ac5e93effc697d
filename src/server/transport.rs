//! Newline-delimited TCP transport.
//!
//! Each line on the socket carries one serialized fragment. The socket is
//! framed with tokio-util's [`LinesCodec`] and split so the session can write
//! while the accept task keeps reading.

use std::io;

use async_trait::async_trait;
use futures::{
    SinkExt,
    Stream,
    StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::session::Transport;

type LineSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;

/// Upper bound on a single inbound line.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Write half of a line-framed TCP connection.
pub struct LineTransport {
    sink: Mutex<LineSink>,
}

impl LineTransport {
    /// Frame `stream` and split it into a transport and its inbound lines.
    pub fn split(
        stream: TcpStream,
    ) -> (
        Self,
        impl Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    ) {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, lines): (LineSink, SplitStream<_>) = framed.split();
        let inbound = lines.map(|line| line.map_err(into_io));
        (
            Self {
                sink: Mutex::new(sink),
            },
            inbound,
        )
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(err) => err,
        other @ LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, other)
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send(&self, raw: String) -> io::Result<()> {
        self.sink.lock().await.send(raw).await.map_err(into_io)
    }

    async fn close(&self) -> io::Result<()> { self.sink.lock().await.close().await.map_err(into_io) }
}
