use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::nntp::{ArticleSource, NntpError};

const GREETING: &str = "200 streamnzb NNTP proxy ready";

/// Per-client observability record.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub remote_addr: String,
    pub user: Option<String>,
    pub current_group: Option<String>,
}

/// Multi-client NNTP front-end over the shared provider pools. Clients see
/// one high-availability server; article commands fail over across
/// providers in priority order.
pub struct ProxyServer {
    config: ProxyConfig,
    sources: Arc<RwLock<Vec<Arc<dyn ArticleSource>>>>,
    clients: RwLock<HashMap<u64, ClientInfo>>,
    next_client: AtomicU64,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        sources: Arc<RwLock<Vec<Arc<dyn ArticleSource>>>>,
    ) -> Arc<Self> {
        if config.auth_user.is_empty() {
            warn!("NNTP proxy has no credentials configured; all logins will be refused");
        }
        Arc::new(Self {
            config,
            sources,
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "NNTP proxy listening");
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let id = server.next_client.fetch_add(1, Ordering::Relaxed);
                server.clients.write().await.insert(
                    id,
                    ClientInfo {
                        remote_addr: addr.to_string(),
                        user: None,
                        current_group: None,
                    },
                );

                if let Err(e) = server.handle_client(id, socket, addr).await {
                    debug!(%addr, error = %e, "proxy client ended with error");
                }
                server.clients.write().await.remove(&id);
            });
        }
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients.read().await.values().cloned().collect()
    }

    async fn handle_client(
        &self,
        id: u64,
        socket: TcpStream,
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        let (read_half, mut writer) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        write_line(&mut writer, GREETING).await?;

        let mut authenticated = false;
        let mut pending_user: Option<String> = None;
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(()); // client hung up
            }
            let input = line.trim_end();
            let (verb, rest) = split_command(input);
            debug!(%addr, verb, "proxy command");

            match verb.as_str() {
                "CAPABILITIES" => {
                    write_line(&mut writer, "101 Capability list follows").await?;
                    write_line(&mut writer, "VERSION 2").await?;
                    write_line(&mut writer, "READER").await?;
                    write_line(&mut writer, "AUTHINFO USER").await?;
                    write_line(&mut writer, ".").await?;
                }
                "QUIT" => {
                    write_line(&mut writer, "205 Goodbye").await?;
                    return Ok(());
                }
                "DATE" => {
                    let stamp = Utc::now().format("%Y%m%d%H%M%S");
                    write_line(&mut writer, &format!("111 {stamp}")).await?;
                }
                "AUTHINFO" => {
                    let (kind, value) = split_command(rest);
                    match kind.as_str() {
                        "USER" => {
                            pending_user = Some(value.to_string());
                            write_line(&mut writer, "381 Enter password").await?;
                        }
                        "PASS" => {
                            let user = pending_user.take().unwrap_or_default();
                            if !self.config.auth_user.is_empty()
                                && user == self.config.auth_user
                                && value == self.config.auth_pass
                            {
                                authenticated = true;
                                if let Some(entry) = self.clients.write().await.get_mut(&id) {
                                    entry.user = Some(user.clone());
                                }
                                info!(%addr, %user, "proxy client authenticated");
                                write_line(&mut writer, "281 Authentication accepted").await?;
                            } else {
                                warn!(%addr, %user, "proxy authentication failed");
                                write_line(&mut writer, "481 Authentication failed").await?;
                            }
                        }
                        _ => write_line(&mut writer, "501 Syntax error").await?,
                    }
                }
                "GROUP" | "STAT" | "HEAD" | "BODY" | "ARTICLE" => {
                    if !authenticated {
                        write_line(&mut writer, "480 Authentication required").await?;
                        continue;
                    }
                    if rest.is_empty() {
                        write_line(&mut writer, "501 Syntax error").await?;
                        continue;
                    }
                    self.dispatch(id, &mut writer, &verb, rest).await?;
                }
                "" => write_line(&mut writer, "500 Unknown command").await?,
                _ => write_line(&mut writer, "500 Unknown command").await?,
            }
        }
    }

    /// Run an article command against providers in priority order; first
    /// success is streamed back, all-failed maps to the NNTP error code.
    async fn dispatch(
        &self,
        id: u64,
        writer: &mut OwnedWriteHalf,
        verb: &str,
        argument: &str,
    ) -> std::io::Result<()> {
        let sources: Vec<Arc<dyn ArticleSource>> = {
            let mut sources = self.sources.read().await.clone();
            sources.retain(|s| s.enabled());
            sources.sort_by_key(|s| s.priority());
            sources
        };

        match verb {
            "GROUP" => {
                for source in &sources {
                    match source.group(argument).await {
                        Ok(payload) => {
                            if let Some(entry) = self.clients.write().await.get_mut(&id) {
                                entry.current_group = Some(argument.to_string());
                            }
                            return write_line(writer, &format!("211 {payload}")).await;
                        }
                        Err(e) => {
                            debug!(host = source.host(), error = %e, "GROUP failed, next provider");
                        }
                    }
                }
                write_line(writer, "411 No such newsgroup").await
            }
            "STAT" => {
                for source in &sources {
                    if let Ok(true) = source.stat(argument).await {
                        return write_line(writer, &format!("223 0 {argument}")).await;
                    }
                }
                write_line(writer, "430 No such article").await
            }
            "HEAD" | "BODY" | "ARTICLE" => {
                let (code, label) = match verb {
                    "HEAD" => (221, "head"),
                    "BODY" => (222, "body"),
                    _ => (220, "article"),
                };

                for source in &sources {
                    let fetched = match verb {
                        "HEAD" => source.head(argument).await,
                        "BODY" => source.body(argument).await,
                        _ => source.article(argument).await,
                    };
                    match fetched {
                        Ok(data) => {
                            write_line(writer, &format!("{code} 0 {argument} {label}")).await?;
                            return write_multiline(writer, &data).await;
                        }
                        Err(NntpError::ArticleMissing(_)) => {
                            debug!(host = source.host(), "article missing, next provider");
                        }
                        Err(e) => {
                            warn!(host = source.host(), error = %e, "provider failed, next provider");
                        }
                    }
                }
                write_line(writer, "430 No such article").await
            }
            _ => write_line(writer, "500 Unknown command").await,
        }
    }
}

fn split_command(input: &str) -> (String, &str) {
    match input.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (input.to_ascii_uppercase(), ""),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// Emit a dot-terminated block with dot-stuffing re-applied.
async fn write_multiline<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    for line in data.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            writer.write_all(b".").await?;
        }
        writer.write_all(line).await?;
    }
    if !data.is_empty() && !data.ends_with(b"\n") {
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap as StdHashMap;
    use tokio::io::AsyncReadExt;

    struct MapSource {
        host: &'static str,
        priority: u8,
        bodies: StdHashMap<String, Bytes>,
    }

    #[async_trait]
    impl ArticleSource for MapSource {
        fn host(&self) -> &str {
            self.host
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn stat(&self, message_id: &str) -> Result<bool, NntpError> {
            Ok(self.bodies.contains_key(message_id))
        }

        async fn body(&self, message_id: &str) -> Result<Bytes, NntpError> {
            self.bodies
                .get(message_id)
                .cloned()
                .ok_or_else(|| NntpError::ArticleMissing(message_id.to_string()))
        }

        async fn article(&self, message_id: &str) -> Result<Bytes, NntpError> {
            self.body(message_id).await
        }

        async fn head(&self, message_id: &str) -> Result<Bytes, NntpError> {
            self.body(message_id).await
        }

        async fn group(&self, name: &str) -> Result<String, NntpError> {
            if name == "alt.binaries.test" {
                Ok("10 1 10 alt.binaries.test".to_string())
            } else {
                Err(NntpError::ArticleMissing(name.to_string()))
            }
        }
    }

    fn config() -> ProxyConfig {
        ProxyConfig::new(
            true,
            "127.0.0.1".to_string(),
            0,
            "user".to_string(),
            "pass".to_string(),
        )
    }

    async fn start_proxy(sources: Vec<Arc<dyn ArticleSource>>) -> SocketAddr {
        let server = ProxyServer::new(config(), Arc::new(RwLock::new(sources)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        addr
    }

    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    async fn send(stream: &mut TcpStream, line: &str) {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
    }

    fn sources_with_article() -> Vec<Arc<dyn ArticleSource>> {
        // Body contains a dot-leading line that must be stuffed on the way
        // back out.
        let empty = MapSource {
            host: "news.empty.com",
            priority: 1,
            bodies: StdHashMap::new(),
        };
        let mut bodies = StdHashMap::new();
        bodies.insert(
            "a@x".to_string(),
            Bytes::from_static(b"line one\r\n.hidden\r\n"),
        );
        let full = MapSource {
            host: "news.full.com",
            priority: 2,
            bodies,
        };
        vec![Arc::new(empty), Arc::new(full)]
    }

    async fn authenticate(stream: &mut TcpStream) {
        assert!(read_reply(stream).await.starts_with("200"));
        send(stream, "AUTHINFO USER user").await;
        assert!(read_reply(stream).await.starts_with("381"));
        send(stream, "AUTHINFO PASS pass").await;
        assert!(read_reply(stream).await.starts_with("281"));
    }

    #[tokio::test]
    async fn anonymous_commands_are_refused() {
        let addr = start_proxy(sources_with_article()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        assert!(read_reply(&mut stream).await.starts_with("200"));
        send(&mut stream, "BODY <a@x>").await;
        assert!(read_reply(&mut stream).await.starts_with("480"));
    }

    #[tokio::test]
    async fn bad_password_is_rejected() {
        let addr = start_proxy(sources_with_article()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        assert!(read_reply(&mut stream).await.starts_with("200"));
        send(&mut stream, "AUTHINFO USER user").await;
        read_reply(&mut stream).await;
        send(&mut stream, "AUTHINFO PASS wrong").await;
        assert!(read_reply(&mut stream).await.starts_with("481"));
    }

    #[tokio::test]
    async fn body_fails_over_and_restuffs_dots() {
        let addr = start_proxy(sources_with_article()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        authenticate(&mut stream).await;

        send(&mut stream, "BODY a@x").await;
        let mut reply = String::new();
        while !reply.ends_with(".\r\n") {
            reply.push_str(&read_reply(&mut stream).await);
        }
        assert!(reply.starts_with("222"), "got: {reply}");
        assert!(reply.contains("line one\r\n"));
        // Dot-stuffed on the wire.
        assert!(reply.contains("\r\n..hidden\r\n"));
        assert!(reply.ends_with(".\r\n"));
    }

    #[tokio::test]
    async fn missing_article_is_430() {
        let addr = start_proxy(sources_with_article()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        authenticate(&mut stream).await;

        send(&mut stream, "STAT nope@x").await;
        assert!(read_reply(&mut stream).await.starts_with("430"));
    }

    #[tokio::test]
    async fn group_selection_is_tracked() {
        let server = ProxyServer::new(config(), Arc::new(RwLock::new(sources_with_article())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        authenticate(&mut stream).await;

        send(&mut stream, "GROUP alt.binaries.test").await;
        let reply = read_reply(&mut stream).await;
        assert!(reply.starts_with("211 10 1 10 alt.binaries.test"), "got: {reply}");

        let clients = server.clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].user.as_deref(), Some("user"));
        assert_eq!(
            clients[0].current_group.as_deref(),
            Some("alt.binaries.test")
        );
    }

    #[tokio::test]
    async fn quit_ends_session() {
        let addr = start_proxy(sources_with_article()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(read_reply(&mut stream).await.starts_with("200"));

        send(&mut stream, "QUIT").await;
        assert!(read_reply(&mut stream).await.starts_with("205"));
    }
}
