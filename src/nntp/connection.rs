use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::Provider;
use crate::nntp::error::NntpError;
use crate::nntp::speed::SpeedMeter;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const STAT_TIMEOUT: Duration = Duration::from_secs(5);

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[derive(Debug, Clone)]
pub struct NntpStatus {
    pub code: u16,
    pub message: String,
}

impl NntpStatus {
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }
}

/// One authenticated NNTP conversation, idle at the command prompt between
/// calls. Created and recycled by the connection pool.
pub struct NntpConnection {
    stream: BufReader<Box<dyn AsyncStream>>,
    meter: SpeedMeter,
    host: String,
}

impl NntpConnection {
    /// Connect, read the greeting and complete AUTHINFO. The whole
    /// handshake runs under one 15 s deadline.
    pub async fn connect(provider: &Provider, meter: SpeedMeter) -> Result<Self, NntpError> {
        timeout(HANDSHAKE_TIMEOUT, Self::handshake(provider, meter))
            .await
            .map_err(|_| NntpError::Timeout("handshake"))?
    }

    async fn handshake(provider: &Provider, meter: SpeedMeter) -> Result<Self, NntpError> {
        let tcp = TcpStream::connect((provider.host.as_str(), provider.port)).await?;

        let stream: Box<dyn AsyncStream> = if provider.use_tls {
            let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
            let tls = connector
                .connect(&provider.host, tcp)
                .await
                .map_err(NntpError::Tls)?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut conn = Self {
            stream: BufReader::new(stream),
            meter,
            host: provider.host.clone(),
        };

        let greeting = conn.read_status().await?;
        if !matches!(greeting.code, 200 | 201) {
            return Err(NntpError::UnexpectedResponse {
                code: greeting.code,
                message: greeting.message,
            });
        }

        if !provider.username.is_empty() {
            conn.authenticate(&provider.username, &provider.password)
                .await?;
        }

        debug!(host = %conn.host, "NNTP connection established");
        Ok(conn)
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), NntpError> {
        let user = self
            .command(&format!("AUTHINFO USER {username}"), READ_TIMEOUT)
            .await?;
        match user.code {
            281 => return Ok(()),
            381 => {}
            _ => return Err(NntpError::Auth(user.message)),
        }

        let pass = self
            .command(&format!("AUTHINFO PASS {password}"), READ_TIMEOUT)
            .await?;
        if pass.code != 281 {
            return Err(NntpError::Auth(pass.message));
        }
        Ok(())
    }

    /// `STAT <id>`: true when the article exists, false on 423/430.
    pub async fn stat(&mut self, message_id: &str) -> Result<bool, NntpError> {
        let status = self
            .command(&format!("STAT {}", bracketed(message_id)), STAT_TIMEOUT)
            .await?;
        match status.code {
            223 => Ok(true),
            423 | 430 => Ok(false),
            code => Err(NntpError::UnexpectedResponse {
                code,
                message: status.message,
            }),
        }
    }

    pub async fn body(&mut self, message_id: &str) -> Result<Bytes, NntpError> {
        self.fetch_multiline("BODY", 222, message_id).await
    }

    pub async fn article(&mut self, message_id: &str) -> Result<Bytes, NntpError> {
        self.fetch_multiline("ARTICLE", 220, message_id).await
    }

    pub async fn head(&mut self, message_id: &str) -> Result<Bytes, NntpError> {
        self.fetch_multiline("HEAD", 221, message_id).await
    }

    /// `GROUP <name>`: returns the 211 payload (`count low high name`).
    pub async fn group(&mut self, name: &str) -> Result<String, NntpError> {
        let status = self.command(&format!("GROUP {name}"), READ_TIMEOUT).await?;
        match status.code {
            211 => Ok(status.message),
            411 => Err(NntpError::ArticleMissing(name.to_string())),
            code => Err(NntpError::UnexpectedResponse {
                code,
                message: status.message,
            }),
        }
    }

    pub async fn date(&mut self) -> Result<String, NntpError> {
        let status = self.command("DATE", READ_TIMEOUT).await?;
        match status.code {
            111 => Ok(status.message),
            code => Err(NntpError::UnexpectedResponse {
                code,
                message: status.message,
            }),
        }
    }

    /// Best-effort QUIT; the connection is consumed either way.
    pub async fn quit(mut self) {
        let _ = self.write_line("QUIT").await;
        let _ = self.read_status().await;
    }

    async fn fetch_multiline(
        &mut self,
        verb: &str,
        expect: u16,
        message_id: &str,
    ) -> Result<Bytes, NntpError> {
        let status = self
            .command(&format!("{verb} {}", bracketed(message_id)), READ_TIMEOUT)
            .await?;

        match status.code {
            code if code == expect => {}
            423 | 430 => return Err(NntpError::ArticleMissing(message_id.to_string())),
            code => {
                return Err(NntpError::UnexpectedResponse {
                    code,
                    message: status.message,
                });
            }
        }

        let body = self.read_multiline().await?;
        self.meter.record(body.len() as u64);
        Ok(body)
    }

    async fn command(&mut self, line: &str, read_timeout: Duration) -> Result<NntpStatus, NntpError> {
        trace!(host = %self.host, command = %line.split_whitespace().next().unwrap_or(""), "send");
        self.write_line(line).await?;
        timeout(read_timeout, self.read_status())
            .await
            .map_err(|_| NntpError::Timeout("response"))?
    }

    async fn write_line(&mut self, line: &str) -> Result<(), NntpError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_status(&mut self) -> Result<NntpStatus, NntpError> {
        let line = self.read_raw_line().await?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();

        let (code, message) = text
            .split_once(' ')
            .map(|(c, m)| (c, m.to_string()))
            .unwrap_or((text, String::new()));
        let code = code
            .parse()
            .map_err(|_| NntpError::Malformed(text.to_string()))?;

        Ok(NntpStatus { code, message })
    }

    /// Read a dot-terminated block, undoing dot-stuffing. Line endings are
    /// preserved so the yEnc decoder sees real line boundaries.
    async fn read_multiline(&mut self) -> Result<Bytes, NntpError> {
        let mut out = BytesMut::new();
        loop {
            let line = timeout(READ_TIMEOUT, self.read_raw_line())
                .await
                .map_err(|_| NntpError::Timeout("body"))??;

            if line == b".\r\n"[..] || line == b".\n"[..] {
                break;
            }
            if line.starts_with(b".") {
                out.extend_from_slice(&line[1..]);
            } else {
                out.extend_from_slice(&line);
            }
        }
        Ok(out.freeze())
    }

    async fn read_raw_line(&mut self) -> Result<Vec<u8>, NntpError> {
        let mut line = Vec::new();
        let n = self.stream.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(NntpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed connection",
            )));
        }
        Ok(line)
    }
}

/// NZB message-ids are stored without angle brackets; the wire wants them.
fn bracketed(message_id: &str) -> String {
    if message_id.starts_with('<') {
        message_id.to_string()
    } else {
        format!("<{message_id}>")
    }
}
