//! Bounded in-memory byte pipe between two threads.
//!
//! The writing end batches bytes into chunks and sends them over a
//! `sync_channel`, so a slow reader applies back-pressure instead of the
//! stream piling up in memory. A stream only reads as complete when the
//! writer called [`PipeWriter::close`]; a writer that aborted or simply
//! vanished makes the reader fail, so a truncated stream can never pass
//! for a whole one.

use std::io::{Error, ErrorKind, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

pub const CHUNK_SIZE: usize = 64 * 1024;

enum Message {
    Data(Vec<u8>),
    End,
    Abort(String),
}

pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(depth);
    (
        PipeWriter {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            state: ReaderState::Open,
        },
    )
}

#[derive(Debug)]
pub struct PipeWriter {
    tx: SyncSender<Message>,
    buf: Vec<u8>,
}

/// Lets the producer abort the stream after the writer was moved into an
/// encoder chain.
#[derive(Clone)]
pub struct PipeAbortHandle {
    tx: SyncSender<Message>,
}

impl PipeAbortHandle {
    pub fn abort(&self, reason: impl Into<String>) {
        // the reader may already be gone, nothing to tell it then
        let _ = self.tx.send(Message::Abort(reason.into()));
    }
}

impl PipeWriter {
    pub fn abort_handle(&self) -> PipeAbortHandle {
        PipeAbortHandle {
            tx: self.tx.clone(),
        }
    }

    /// Flushes buffered bytes and marks the stream as complete.
    pub fn close(mut self) -> std::io::Result<()> {
        self.send_buf()?;
        self.tx.send(Message::End).map_err(|_| broken_pipe())
    }

    fn send_buf(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx.send(Message::Data(chunk)).map_err(|_| broken_pipe())
    }
}

fn broken_pipe() -> Error {
    Error::new(ErrorKind::BrokenPipe, "pipe reader dropped")
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = buf.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&buf[..n]);
        if self.buf.len() == CHUNK_SIZE {
            self.send_buf()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buf()
    }
}

enum ReaderState {
    Open,
    Ended,
    Failed(String),
}

pub struct PipeReader {
    rx: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
    state: ReaderState,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = buf.len().min(self.current.len() - self.pos);
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match &self.state {
                ReaderState::Ended => return Ok(0),
                ReaderState::Failed(reason) => return Err(Error::other(reason.clone())),
                ReaderState::Open => {}
            }
            match self.rx.recv() {
                Ok(Message::Data(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Message::End) => self.state = ReaderState::Ended,
                Ok(Message::Abort(reason)) => {
                    self.state = ReaderState::Failed(format!("stream aborted: {reason}"))
                }
                Err(_) => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "pipe writer dropped without closing the stream",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_stream_reads_fully() {
        let (mut writer, mut reader) = pipe(2);
        let producer = std::thread::spawn(move || {
            for _ in 0..100 {
                writer.write_all(&[7u8; 10_000]).unwrap();
            }
            writer.close().unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out.len(), 1_000_000);
        assert!(out.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_dropped_writer_is_an_error() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"partial").unwrap();
        writer.flush().unwrap();
        drop(writer);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_abort_is_an_error_even_with_writer_alive() {
        let (mut writer, mut reader) = pipe(4);
        let abort = writer.abort_handle();
        writer.write_all(b"partial").unwrap();
        writer.flush().unwrap();
        abort.abort("dump exited with status 2");
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("dump exited with status 2"));
        drop(writer);
    }

    #[test]
    fn test_write_after_reader_dropped_is_broken_pipe() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        writer.write_all(b"x").unwrap();
        let err = writer.flush().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
