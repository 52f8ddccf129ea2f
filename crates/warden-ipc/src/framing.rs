use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use warden_proto::proto::{Envelope, Outbound, Request};

pub type FramedStream<S = tokio::net::UnixStream> = Framed<S, LengthDelimitedCodec>;

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FramedStream<S> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_framed(stream)
}

pub async fn send_json<S, T>(framed: &mut FramedStream<S>, value: &T) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    framed.send(Bytes::from(bytes)).await
}

/// Read one JSON frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_json<S, T>(framed: &mut FramedStream<S>) -> io::Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let Some(frame) = framed.next().await else {
        return Ok(None);
    };
    let frame = frame?;
    serde_json::from_slice::<T>(&frame)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn read_request<S>(framed: &mut FramedStream<S>) -> io::Result<Option<Envelope<Request>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_json(framed).await
}

pub async fn send_outbound<S>(framed: &mut FramedStream<S>, out: &Outbound) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_json(framed, out).await
}

pub async fn send_request<S>(framed: &mut FramedStream<S>, req: &Envelope<Request>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_json(framed, req).await
}

pub async fn read_outbound<S>(framed: &mut FramedStream<S>) -> io::Result<Option<Outbound>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_json(framed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::proto::Command;

    #[tokio::test]
    async fn request_crosses_the_stream_and_eof_reads_as_none() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = framed(a);
        let mut server = framed(b);

        let req = Envelope {
            id: 7,
            payload: Request::Command(Command::Restore { id: "20261014T120000.000Z".into() }),
        };
        send_request(&mut client, &req).await.expect("send");

        let got = read_request(&mut server).await.expect("read").expect("frame");
        assert_eq!(got.id, 7);
        assert!(matches!(got.payload, Request::Command(Command::Restore { ref id }) if id == "20261014T120000.000Z"));

        drop(client);
        assert!(read_request(&mut server).await.expect("read after close").is_none());
    }

    #[tokio::test]
    async fn garbage_frame_is_invalid_data() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = framed(a);
        let mut server = framed(b);

        client.send(Bytes::from_static(b"not json")).await.expect("send raw");
        let err = read_outbound(&mut server).await.expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
