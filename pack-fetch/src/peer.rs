//! Peer cache listener: answers framed chunk requests for mounted entries over TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use pack_core::{FrameDecodeError, PackError, PackManager, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub async fn run_peer_listener<T>(bind: SocketAddr, manager: Arc<Mutex<PackManager<T>>>) -> std::io::Result<()>
where
    T: Transport + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %bind, "peer cache listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, manager).await {
                debug!(peer = %addr, error = %e, "peer connection closed");
            }
        });
    }
}

async fn serve_connection<T: Transport>(
    mut stream: TcpStream,
    manager: Arc<Mutex<PackManager<T>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut read_buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&read_buf[..n]);

        loop {
            let reply = manager.lock().await.handle_peer_frame(&buf);
            match reply {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    stream.write_all(&frame).await?;
                }
                Err(PackError::FrameDecode(FrameDecodeError::NeedMore)) => break,
                Err(e) => {
                    warn!(error = %e, "bad peer frame, dropping connection");
                    return Ok(());
                }
            }
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pack_core::{
        decode_frame, encode_frame, ByteRange, Catalog, Message, PackConfig, StreamHandle,
        TransportError,
    };

    /// Transport with nothing published; the manager only serves what is mounted.
    struct NoTransport;

    impl Transport for NoTransport {
        fn open_stream(&mut self, url: &str, _range: ByteRange) -> Result<StreamHandle, TransportError> {
            Err(TransportError::NotFound(url.to_string()))
        }

        fn read_available(&mut self, _handle: StreamHandle) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::UnknownStream)
        }

        fn close(&mut self, _handle: StreamHandle) {}
    }

    #[tokio::test]
    async fn unmounted_entry_is_unavailable() {
        let manager = Arc::new(Mutex::new(PackManager::new(
            PackConfig::default(),
            Catalog::new(),
            NoTransport,
        )));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_connection(stream, manager).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = encode_frame(&Message::chunk_request("base", "a.txt", 0)).unwrap();
        // Split the frame to exercise partial reads on the server.
        client.write_all(&request[..3]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&request[3..]).await.unwrap();

        let mut len = [0u8; 4];
        client.read_exact(&mut len).await.unwrap();
        let mut frame = len.to_vec();
        frame.resize(4 + u32::from_le_bytes(len) as usize, 0);
        client.read_exact(&mut frame[4..]).await.unwrap();
        let (reply, _): (Message, usize) = decode_frame(&frame).unwrap();
        assert_eq!(
            reply,
            Message::Unavailable {
                pack: "base".into(),
                file: "a.txt".into(),
            }
        );
    }
}
