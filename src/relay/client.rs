//! A buffered client connection to a downstream host.

use std::io;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// One pooled connection. Writes are buffered; callers flush after each
/// forwarded line.
#[derive(Debug)]
pub struct TcpClient {
    writer: BufWriter<TcpStream>,
    poisoned: bool,
}

impl TcpClient {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            writer: BufWriter::new(stream),
            poisoned: false,
        }
    }

    /// Write one protocol line, appending the newline.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let result = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await
        }
        .await;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        let result = self.writer.flush().await;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// True once any write or flush has failed. The pool closes poisoned
    /// clients instead of idling them.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}
