//! Newline-delimited JSON framing over arbitrary byte streams.
//!
//! MCP's stdio transport is:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stderr may be used for logging (not MCP messages)
//!
//! The validator talks to a child process, so the reader and writer halves are
//! generic over any `AsyncRead` / `AsyncWrite`. Tests bind them to in-memory
//! duplex pipes; the stub server binds them to its own stdin/stdout.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads newline-delimited frames.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Reads the next raw line without its terminator.
    ///
    /// Returns `None` when the stream is closed (EOF). The bytes are not
    /// decoded, so a line that is not UTF-8 does not poison the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let bytes_read = self.reader.read_until(b'\n', &mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        // Remove the trailing newline
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Reads the next line as UTF-8.
    ///
    /// Returns `None` when the stream is closed (EOF).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails, or [`io::ErrorKind::InvalidData`]
    /// if the line is not UTF-8. The offending line is consumed either way,
    /// so the next call reads the following line.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.read_bytes().await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

/// Writes newline-delimited frames.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a byte sink.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialises `message` and writes it as one line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message<T: Serialize + Sync>(&mut self, message: &T) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.write_raw(&json).await
    }

    /// Writes a raw JSON string with newline termination.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !json.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Closes the write side, signalling EOF to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
