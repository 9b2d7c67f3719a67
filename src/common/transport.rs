use crate::common::codec;
use crate::common::sink::MailSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Owns one TCP socket and frames the line protocol over it
///
/// Lines are ISO-8859-1, CRLF delimited. The owning session loop is the only
/// reader; writes are serialized by that same ownership.
pub struct Transport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    sink: Arc<dyn MailSink>,
    local_host: String,
    peer_host: String,
    peer_ip: String,
    open: bool,
}

impl Transport {
    pub fn new(
        stream: TcpStream,
        local_host: impl Into<String>,
        sink: Arc<dyn MailSink>,
    ) -> Result<Self, String> {
        let peer_ip = stream
            .peer_addr()
            .map_err(|e| format!("Failed to read peer address: {}", e))?
            .ip()
            .to_string();
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            sink,
            local_host: local_host.into(),
            peer_host: peer_ip.clone(),
            peer_ip,
            open: true,
        })
    }

    /// Sends one line, logging it through the sink
    pub async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.sink.log(line);
        self.write_framed(line).await
    }

    /// Sends one line, logging only a same-length run of `*`
    pub async fn send_line_hidden(&mut self, line: &str) -> Result<(), String> {
        self.sink.log(&"*".repeat(line.chars().count()));
        self.write_framed(line).await
    }

    async fn write_framed(&mut self, line: &str) -> Result<(), String> {
        let mut bytes = codec::latin1_encode(line);
        bytes.extend_from_slice(codec::MSG_DELIMITER.as_bytes());

        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| format!("Failed to write to {}: {}", self.peer_ip, e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| format!("Failed to flush to {}: {}", self.peer_ip, e))
    }

    /// Awaits the next framed line; peer hangup is an error
    pub async fn read_line(&mut self) -> Result<String, String> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| format!("Failed to read from {}: {}", self.peer_ip, e))?;

        if n == 0 {
            return Err(format!("Connection closed by {}", self.peer_ip));
        }

        while matches!(buf.last(), Some(&b'\n') | Some(&b'\r')) {
            buf.pop();
        }

        Ok(codec::latin1_decode(&buf))
    }

    /// Non-blocking readiness probe; never consumes bytes
    ///
    /// Reports true on buffered data, fresh data, or EOF, so that the next
    /// `read_line` either returns a line or surfaces the closed connection.
    pub async fn has_data(&mut self) -> bool {
        if !self.reader.buffer().is_empty() {
            return true;
        }

        matches!(
            tokio::time::timeout(Duration::ZERO, self.reader.fill_buf()).await,
            Ok(_)
        )
    }

    /// Idempotent teardown of the owned socket
    pub async fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.writer.shutdown().await;
        }
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_host
    }

    pub fn peer_hostname(&self) -> &str {
        &self.peer_host
    }

    pub fn peer_ip(&self) -> &str {
        &self.peer_ip
    }
}
