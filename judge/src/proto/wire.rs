//! Length-delimited JSON framing used on judge connections.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single frame. Large enough for any blob the judge moves
/// around (test data, binaries), small enough to bound a hostile peer.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

pub type JudgeFrames = Framed<TcpStream, LengthDelimitedCodec>;

pub fn frame_stream(stream: TcpStream) -> JudgeFrames {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub async fn send<T: Serialize>(frames: &mut JudgeFrames, msg: &T) -> io::Result<()> {
    let buf =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    frames.send(Bytes::from(buf)).await
}

/// Receive one message; `Ok(None)` means the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(frames: &mut JudgeFrames) -> io::Result<Option<T>> {
    match frames.next().await {
        Some(frame) => {
            let frame = frame?;
            let msg = serde_json::from_slice(&frame)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(msg))
        }
        None => Ok(None),
    }
}
