use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type ClientId = Uuid;

/// Receiving end of a broadcast.
#[async_trait]
pub trait ClientSink: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;

    /// Whether the peer is still there. Must not block.
    fn is_connected(&self) -> bool;

    /// Write the whole payload and flush it.
    async fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Close the connection server-side.
    async fn close(&self);
}

/// One accepted TCP peer.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    addr: SocketAddr,
    connected_at: SystemTime,
    reader: OwnedReadHalf,
    writer: Mutex<OwnedWriteHalf>,
    write_timeout: Duration,
    alive: AtomicBool,
    bytes_sent: AtomicU64,
}

// Inbound bytes discarded per liveness probe before giving the peer the
// benefit of the doubt.
const MAX_PROBE_READS: usize = 16;

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr, write_timeout: Duration) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            id: Uuid::new_v4(),
            addr,
            connected_at: SystemTime::now(),
            reader,
            writer: Mutex::new(writer),
            write_timeout,
            alive: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

#[async_trait]
impl ClientSink for ClientConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_connected(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }

        // The TCP side is send-only: anything the peer sends is discarded,
        // and end-of-stream means it hung up.
        let mut probe = [0u8; 256];
        for _ in 0..MAX_PROBE_READS {
            match self.reader.try_read(&mut probe) {
                Ok(0) => {
                    self.mark_dead();
                    return false;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(_) => {
                    self.mark_dead();
                    return false;
                }
            }
        }
        true
    }

    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;

        let write = async {
            writer.write_all(payload).await?;
            writer.flush().await
        };

        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", self.write_timeout),
            )),
        };

        match &result {
            Ok(()) => {
                self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            Err(_) => self.mark_dead(),
        }
        result
    }

    async fn close(&self) {
        self.mark_dead();
        let mut writer = self.writer.lock().await;
        // The peer may already be gone; nothing left to report
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (ClientConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        (ClientConnection::new(stream, remote, Duration::from_secs(1)), peer)
    }

    #[tokio::test]
    async fn test_send_delivers_raw_bytes() {
        let (connection, mut peer) = connected_pair().await;

        let payload = [0x00, 0xff, b'O', b'K', b'\n'];
        connection.send(&payload).await.unwrap();

        let mut received = [0u8; 5];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(connection.bytes_sent(), 5);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_is_detected() {
        let (connection, peer) = connected_pair().await;
        assert!(connection.is_connected());

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!connection.is_connected());
        // Stays dead once detected
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_data_is_ignored() {
        let (connection, mut peer) = connected_pair().await;

        peer.write_all(b"ignored").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (connection, mut peer) = connected_pair().await;

        connection.close().await;
        assert!(!connection.is_connected());

        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
