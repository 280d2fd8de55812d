//! TCP transport: publisher fan-out and reconnecting subscriber feed
//!
//! Wire format per message: `u32` part count, then for each part a `u32`
//! length followed by the part bytes (all big-endian).

use super::Multipart;
use crate::error::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Upper bound on parts per message
pub(crate) const MAX_FRAME_PARTS: u32 = 64;

/// Upper bound on a single part
pub(crate) const MAX_PART_LEN: u32 = 16 * 1024 * 1024;

/// Messages buffered between the reader task and the sample
const FEED_CAPACITY: usize = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) fn encode_frame(parts: &[Bytes]) -> Result<Bytes> {
    if parts.is_empty() || parts.len() > MAX_FRAME_PARTS as usize {
        return Err(EngineError::Frame(format!(
            "message must have 1..={} parts, got {}",
            MAX_FRAME_PARTS,
            parts.len()
        )));
    }

    let len = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32(parts.len() as u32);
    for part in parts {
        if part.len() > MAX_PART_LEN as usize {
            return Err(EngineError::Frame(format!(
                "part of {} bytes exceeds limit",
                part.len()
            )));
        }
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }
    Ok(buf.freeze())
}

/// Read one message. `Ok(None)` means the peer closed between messages.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Multipart>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count == 0 || count > MAX_FRAME_PARTS {
        return Err(EngineError::Frame(format!("invalid part count {}", count)));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await?;
        if len > MAX_PART_LEN {
            return Err(EngineError::Frame(format!("part length {} exceeds limit", len)));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await?;
        parts.push(Bytes::from(part));
    }
    Ok(Some(parts))
}

/// Frames queued for one subscriber before it counts as stalled
const PEER_QUEUE: usize = 256;

/// One accepted subscriber with its own writer task
struct Peer {
    addr: SocketAddr,
    frames: mpsc::Sender<Bytes>,
    timed_out: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl Peer {
    /// The writer exits on the first failed or timed-out write; a peer that
    /// missed part of a frame is no longer aligned on a frame boundary.
    fn spawn(addr: SocketAddr, mut stream: TcpStream, timeout: Duration) -> Self {
        let (frames, mut queue) = mpsc::channel::<Bytes>(PEER_QUEUE);
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                match tokio::time::timeout(timeout, stream.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(peer = %addr, "Dropping subscriber: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!(peer = %addr, "Send timed out, dropping subscriber");
                        flag.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        });

        Self {
            addr,
            frames,
            timed_out,
            writer,
        }
    }
}

/// Bound publisher side: accepts subscribers and queues every message to each of them
pub(crate) struct TcpFanout {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<(SocketAddr, TcpStream)>,
    peers: Vec<Peer>,
    acceptor: JoinHandle<()>,
}

impl TcpFanout {
    /// Must be called from inside a tokio runtime; the accept loop is spawned on it.
    pub(crate) async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::unbounded_channel();

        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, "set_nodelay failed: {}", e);
                        }
                        debug!(peer = %peer, "Subscriber connected");
                        if tx.send((peer, stream)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed on {}: {}", local_addr, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            incoming,
            peers: Vec::new(),
            acceptor,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue the frame for every connected peer; returns how many took it.
    ///
    /// Each peer is written by its own task, so a slow subscriber never holds
    /// up the others. A peer whose write did not finish within `timeout`, or
    /// whose queue is full, is dropped and the call reports
    /// [`EngineError::Timeout`]. Broken peers are dropped silently.
    pub(crate) fn send(&mut self, frame: &Bytes, timeout: Duration) -> Result<usize> {
        while let Ok((addr, stream)) = self.incoming.try_recv() {
            self.peers.push(Peer::spawn(addr, stream, timeout));
        }

        let mut delivered = 0;
        let mut timed_out = false;
        self.peers.retain(|peer| match peer.frames.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(peer = %peer.addr, "Subscriber stalled, dropping it");
                peer.writer.abort();
                timed_out = true;
                false
            }
            Err(TrySendError::Closed(_)) => {
                timed_out |= peer.timed_out.load(Ordering::Relaxed);
                false
            }
        });

        if timed_out {
            Err(EngineError::Timeout(timeout))
        } else {
            Ok(delivered)
        }
    }
}

impl Drop for TcpFanout {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// Connected subscriber side: a reader task that keeps (re)connecting to the publisher
pub(crate) struct TcpFeed {
    frames: mpsc::Receiver<Multipart>,
    reader: JoinHandle<()>,
}

impl TcpFeed {
    /// Must be called from inside a tokio runtime; the reader is spawned on it.
    pub(crate) fn connect(addr: SocketAddr, retry: Duration) -> Self {
        let (tx, frames) = mpsc::channel(FEED_CAPACITY);

        let reader = tokio::spawn(async move {
            loop {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        let _ = stream.set_nodelay(true);
                        debug!(peer = %addr, "Connected to publisher");
                        loop {
                            match read_frame(&mut stream).await {
                                Ok(Some(parts)) => {
                                    if tx.send(parts).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {
                                    debug!(peer = %addr, "Publisher closed connection");
                                    break;
                                }
                                Err(e) => {
                                    warn!(peer = %addr, "Dropping publisher connection: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => trace!(peer = %addr, "Connect failed, retrying: {}", e),
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(retry).await;
            }
        });

        Self { frames, reader }
    }

    pub(crate) async fn recv(&mut self) -> Option<Multipart> {
        self.frames.recv().await
    }
}

impl Drop for TcpFeed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_codec() {
        let parts = vec![Bytes::from_static(b"t1"), Bytes::from_static(b"hello")];
        let frame = encode_frame(&parts).unwrap();
        assert_eq!(frame.len(), 4 + (4 + 2) + (4 + 5));

        let mut reader = &frame[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(parts));
        // Clean end of stream after a full frame
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let frame = encode_frame(&[Bytes::from_static(b"topic")]).unwrap();
        let mut reader = &frame[..frame.len() - 2];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(matches!(encode_frame(&[]), Err(EngineError::Frame(_))));
    }

    #[tokio::test]
    async fn test_fanout_to_feed() {
        let mut fanout = TcpFanout::bind("127.0.0.1", 0).await.unwrap();
        let mut feed = TcpFeed::connect(fanout.local_addr(), Duration::from_millis(10));

        let frame = encode_frame(&[Bytes::from_static(b"t"), Bytes::from_static(b"v")]).unwrap();

        // Wait until the acceptor has handed over the connection
        let mut delivered = 0;
        for _ in 0..200 {
            delivered = fanout.send(&frame, Duration::from_secs(1)).unwrap();
            if delivered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered, 1);
        assert_eq!(fanout.peer_count(), 1);

        let parts = feed.recv().await.unwrap();
        assert_eq!(parts, vec![Bytes::from_static(b"t"), Bytes::from_static(b"v")]);
    }

    /// Connect a subscriber that never reads, then wait until the fanout has taken it
    async fn with_stalled_peer(fanout: &mut TcpFanout, timeout: Duration) -> TcpStream {
        let stalled = TcpStream::connect(fanout.local_addr()).await.unwrap();
        let warmup = encode_frame(&[Bytes::from_static(b"warmup")]).unwrap();
        for _ in 0..200 {
            if fanout.send(&warmup, timeout).unwrap() > 0 {
                return stalled;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stalled peer was never accepted");
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_delay_others() {
        let mut fanout = TcpFanout::bind("127.0.0.1", 0).await.unwrap();
        let _stalled = with_stalled_peer(&mut fanout, Duration::from_secs(30)).await;
        let mut feed = TcpFeed::connect(fanout.local_addr(), Duration::from_millis(10));

        let big = Bytes::from(vec![7u8; 1024 * 1024]);
        let frame = encode_frame(&[Bytes::from_static(b"t"), big]).unwrap();

        let mut queued = 0;
        while queued < 32 {
            if fanout.send(&frame, Duration::from_secs(30)).unwrap() == 2 {
                queued += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(fanout.peer_count(), 2);

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            let mut count = 0;
            while count < queued {
                let parts = feed.recv().await.unwrap();
                if parts.len() == 2 {
                    count += 1;
                }
            }
            count
        })
        .await;
        assert_eq!(received.unwrap(), queued);
    }

    #[tokio::test]
    async fn test_timed_out_peer_is_reported() {
        let mut fanout = TcpFanout::bind("127.0.0.1", 0).await.unwrap();
        let timeout = Duration::from_millis(50);
        let _stalled = with_stalled_peer(&mut fanout, timeout).await;

        let frame = encode_frame(&[Bytes::from(vec![1u8; 1024 * 1024])]).unwrap();
        let mut reported = false;
        for _ in 0..500 {
            if let Err(e) = fanout.send(&frame, timeout) {
                assert!(matches!(e, EngineError::Timeout(_)));
                reported = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reported);
        assert_eq!(fanout.peer_count(), 0);
    }
}
