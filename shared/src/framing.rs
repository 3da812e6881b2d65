//! Frame transport: length-prefixed byte frames over a TCP stream, plus the
//! file-oriented chunk variant.
//!
//! Send and receive sides are guarded by separate mutexes so the dispatch and
//! receive loops of a peer worker never contend with each other. A frame is
//! `[4-byte big-endian length][body]`; a chunk frame is a length-prefixed JSON
//! header followed by `size` raw payload bytes with no further prefix.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{FILE_CHUNK_SIZE, MAX_FRAME_LEN};

/// Header of one file-transfer chunk. `size == 0` marks end-of-stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub sequence: u64,
    pub size: u64,
}

/// One TCP stream with a frame-oriented interface, safe for one concurrent
/// sender and one concurrent receiver.
pub struct FrameTransport {
    stream: TcpStream,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl FrameTransport {
    /// Connect to `addr`, bounded by `timeout`.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let target: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Protocol(format!("address '{addr}' did not resolve")))?;
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream (the accept side).
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// All subsequent blocking reads abort with [`Error::Timeout`] after this
    /// long. Zero is rejected.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::Protocol("read timeout must be positive".to_owned()));
        }
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Send one length-prefixed frame. The prefix and body go out in a single
    /// locked write so concurrent senders cannot interleave.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        let _guard = self.send_lock.lock();
        self.write_all(&frame)
    }

    /// Receive one frame body. Rejects a length prefix of zero or above
    /// [`MAX_FRAME_LEN`] without consuming any body bytes.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let _guard = self.recv_lock.lock();
        self.read_frame()
    }

    /// Send one chunk frame. `None` payload emits the zero-size terminator.
    pub fn send_chunk(&self, sequence: u64, payload: Option<&[u8]>) -> Result<()> {
        let body = payload.unwrap_or(&[]);
        let header = serde_json::to_vec(&ChunkHeader {
            sequence,
            size: body.len() as u64,
        })?;
        let mut frame = Vec::with_capacity(4 + header.len() + body.len());
        frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(body);
        let _guard = self.send_lock.lock();
        self.write_all(&frame)
    }

    /// Receive one chunk frame. `None` payload means the stream ended. The
    /// receive lock is held across header and payload so the two reads cannot
    /// be split by another receiver.
    pub fn receive_chunk(&self) -> Result<(u64, Option<Vec<u8>>)> {
        let _guard = self.recv_lock.lock();
        let header_bytes = self.read_frame()?;
        let header: ChunkHeader = serde_json::from_slice(&header_bytes)?;
        if header.size == 0 {
            return Ok((header.sequence, None));
        }
        if header.size > FILE_CHUNK_SIZE as u64 {
            return Err(Error::InvalidFrameLength {
                length: header.size,
            });
        }
        let mut payload = vec![0u8; header.size as usize];
        self.read_full(&mut payload)?;
        Ok((header.sequence, Some(payload)))
    }

    /// Best-effort shutdown of both halves, unblocking any thread parked in
    /// `receive` or `send`. Idempotent.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown after close: {}", e);
        }
    }

    fn read_frame(&self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.read_full(&mut prefix)?;
        let length = u32::from_be_bytes(prefix);
        if length == 0 || length as usize > MAX_FRAME_LEN {
            return Err(Error::InvalidFrameLength {
                length: length as u64,
            });
        }
        let mut body = vec![0u8; length as usize];
        self.read_full(&mut body)?;
        Ok(body)
    }

    /// Read exactly `buf.len()` bytes. A peer close mid-read is a connection
    /// loss, never a silent short return.
    fn read_full(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ConnectionLost),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(Error::Timeout),
                Err(_) => return Err(Error::ConnectionLost),
            }
        }
        Ok(())
    }

    fn write_all(&self, bytes: &[u8]) -> Result<()> {
        match (&self.stream).write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) if is_timeout(&e) => Err(Error::Timeout),
            Err(_) => Err(Error::ConnectionLost),
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
