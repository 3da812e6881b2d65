//! File sender and receiver over the chunk transport.
//!
//! Bulk data moves on a dedicated short-lived socket so it never blocks
//! request/response traffic. The receiver writes to a `.part` sibling and only
//! renames onto the final path after the terminator, so the destination is
//! never partially written. Neither side retries internally.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::framing::FrameTransport;
use crate::FILE_CHUNK_SIZE;

/// Streams one file to a peer as ordered chunks plus a terminator.
pub struct FileSender {
    transport: FrameTransport,
    path: PathBuf,
}

impl FileSender {
    pub fn new(transport: FrameTransport, path: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }

    /// Send the whole file from sequence 0, then the terminator. A zero-length
    /// source produces a terminator-only stream. Returns payload bytes sent.
    pub fn send(&self) -> Result<u64> {
        let mut file = File::open(&self.path)?;
        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        let mut sequence = 0u64;
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.transport.send_chunk(sequence, Some(&buffer[..n]))?;
            sequence += 1;
            total += n as u64;
        }
        self.transport.send_chunk(sequence, None)?;
        info!(
            "sent {} in {} chunks ({} bytes)",
            self.path.display(),
            sequence,
            total
        );
        Ok(total)
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

/// Receives one chunk stream into a destination path, published atomically.
pub struct FileReceiver {
    transport: FrameTransport,
    path: PathBuf,
}

impl FileReceiver {
    pub fn new(transport: FrameTransport, path: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }

    /// Receive until the terminator, then rename the temp file onto the final
    /// path. On any failure the temp file is removed and the final path is
    /// left untouched. Returns payload bytes written.
    pub fn receive(&self) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = part_path(&self.path);
        let outcome: Result<u64> = (|| {
            let written = self.receive_into(&temp)?;
            fs::rename(&temp, &self.path)?;
            Ok(written)
        })();
        if let Err(e) = &outcome {
            warn!("transfer into {} failed: {}", self.path.display(), e);
            if let Err(cleanup) = fs::remove_file(&temp) {
                debug!("temp cleanup: {}", cleanup);
            }
        }
        outcome
    }

    fn receive_into(&self, temp: &Path) -> Result<u64> {
        let mut file = File::create(temp)?;
        let mut expected = 0u64;
        let mut written = 0u64;
        loop {
            let (sequence, payload) = self.transport.receive_chunk()?;
            if sequence != expected {
                return Err(Error::Protocol(format!(
                    "chunk sequence {sequence} arrived, expected {expected}"
                )));
            }
            match payload {
                Some(bytes) => {
                    file.write_all(&bytes)?;
                    written += bytes.len() as u64;
                    expected += 1;
                }
                None => break,
            }
        }
        // Data must hit disk before the rename publishes it.
        file.flush()?;
        file.sync_all()?;
        Ok(written)
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn transport_pair() -> (FrameTransport, FrameTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        (
            FrameTransport::from_stream(accepted),
            FrameTransport::from_stream(client.join().unwrap()),
        )
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_file_roundtrip_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let dest = dir.path().join("received.bin");
        // 150 000 bytes = 2 full 60 KiB chunks + 1 partial + terminator.
        let content = patterned(150_000);
        fs::write(&source, &content).unwrap();

        let (tx, rx) = transport_pair();
        let sender = thread::spawn(move || FileSender::new(tx, source).send());
        let received = FileReceiver::new(rx, &dest).receive().unwrap();

        assert_eq!(sender.join().unwrap().unwrap(), 150_000);
        assert_eq!(received, 150_000);
        assert_eq!(fs::read(&dest).unwrap(), content);
    }

    #[test]
    fn test_empty_file_is_terminator_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.bin");
        let dest = dir.path().join("out/empty.bin");
        fs::write(&source, b"").unwrap();

        let (tx, rx) = transport_pair();
        let sender = thread::spawn(move || FileSender::new(tx, source).send());
        let received = FileReceiver::new(rx, &dest).receive().unwrap();

        assert_eq!(sender.join().unwrap().unwrap(), 0);
        assert_eq!(received, 0);
        // Parent directory was created on demand.
        assert_eq!(fs::read(&dest).unwrap(), b"");
    }

    #[test]
    fn test_disconnect_midstream_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partial.bin");

        let (tx, rx) = transport_pair();
        let sender = thread::spawn(move || {
            tx.send_chunk(0, Some(&[1u8; 4096])).unwrap();
            // Close without ever sending the terminator.
            tx.close();
        });
        let result = FileReceiver::new(rx, &dest).receive();
        sender.join().unwrap();

        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_out_of_order_sequence_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("skewed.bin");

        let (tx, rx) = transport_pair();
        let sender = thread::spawn(move || {
            tx.send_chunk(0, Some(b"first")).unwrap();
            tx.send_chunk(2, Some(b"skipped one")).unwrap();
        });
        let result = FileReceiver::new(rx, &dest).receive();
        sender.join().unwrap();

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/games/build.zip")),
            PathBuf::from("/tmp/games/build.zip.part")
        );
    }
}
