// =============================================================================
// SERVENT CORE - transfer.rs
// File transfer service
// =============================================================================
//
// Byte streaming lives outside the overlay. The servent only needs:
//   matches(keywords) - local index lookup for incoming queries
//   push(file, addr)  - firewalled holder opens the socket itself
//   fetch(addr, file) - direct download from a reachable holder
//   serve(listener)   - answers GET and PUSH requests
//
// Protocol: one request line, then raw bytes until EOF.
//   GET <name>   ->  FOUND | NOT FOUND, then file bytes
//   PUSH <name>  ->  file bytes follow, stored in the shared folder
// Lines are u32 big-endian length + UTF-8.
// =============================================================================

use crate::constants::{FOUND_MARKER, GET_MARKER, HANDSHAKE_TIMEOUT, MAX_REQUEST_LINE, NOT_FOUND_MARKER, PUSH_MARKER};
use crate::error::{Result, ServentError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Shared file names matching any of the keywords.
    fn matches(&self, keywords: &[String]) -> Vec<String>;

    fn shared_files(&self) -> Vec<String>;

    /// Accept loop; returns once `halt` fires.
    async fn serve(&self, listener: TcpListener, halt: CancellationToken);

    /// Streams a local file to `target` with a PUSH request.
    async fn push(&self, file_name: &str, target: SocketAddr) -> Result<u64>;

    /// Downloads `file_name` from `source` into the local store.
    async fn fetch(&self, source: SocketAddr, file_name: &str) -> Result<u64>;
}

// -----------------------------------------------------------------------------
// Request lines
// -----------------------------------------------------------------------------

pub async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> Result<()> {
    let len = line.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u32().await? as usize;
    if len > MAX_REQUEST_LINE {
        return Err(ServentError::Handshake(format!("request line too long: {}", len)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| ServentError::Handshake(e.to_string()))
}

/// `read_line` bounded by `limit`; a silent peer is an error.
pub async fn read_line_within<R: AsyncRead + Unpin>(r: &mut R, limit: Duration) -> Result<String> {
    timeout(limit, read_line(r))
        .await
        .map_err(|_| ServentError::Handshake(format!("no request line within {:?}", limit)))?
}

#[derive(Debug, PartialEq)]
enum Request {
    Get(String),
    Push(String),
}

fn parse_request(line: &str) -> Option<Request> {
    let (verb, name) = line.split_once(' ')?;
    match verb {
        GET_MARKER => Some(Request::Get(name.to_string())),
        PUSH_MARKER => Some(Request::Push(name.to_string())),
        _ => None,
    }
}

/// Only plain names inside the shared folder are served.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

// -----------------------------------------------------------------------------
// SharedFolder
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SharedFolder {
    root: Arc<PathBuf>,
    line_timeout: Duration,
}

impl SharedFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SharedFolder {
            root: Arc::new(root.into()),
            line_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// How long either side may stay silent before its request or answer line.
    pub fn with_line_timeout(mut self, limit: Duration) -> Self {
        self.line_timeout = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if !is_plain_name(name) {
            return Err(ServentError::Transfer {
                file: name.to_string(),
                reason: "not a plain file name".into(),
            });
        }
        Ok(self.root.join(name))
    }

    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let line = read_line_within(&mut stream, self.line_timeout).await?;
        match parse_request(&line) {
            Some(Request::Get(name)) => {
                let file = match self.path_of(&name) {
                    Ok(path) if path.is_file() => File::open(path).await.ok(),
                    _ => None,
                };
                let Some(mut file) = file else {
                    write_line(&mut stream, NOT_FOUND_MARKER).await?;
                    log::info!("📁 GET {} from {}: not found", name, peer);
                    return Ok(());
                };
                write_line(&mut stream, FOUND_MARKER).await?;
                let sent = tokio::io::copy(&mut file, &mut stream).await?;
                stream.shutdown().await?;
                log::info!("📤 Sent \"{}\" to {} ({} bytes)", name, peer, sent);
            }
            Some(Request::Push(name)) => {
                let mut file = File::create(self.path_of(&name)?).await?;
                let received = tokio::io::copy(&mut stream, &mut file).await?;
                file.flush().await?;
                log::info!("📥 Received pushed \"{}\" from {} ({} bytes)", name, peer, received);
            }
            None => {
                log::debug!("Transfer request from {} ignored: {:?}", peer, line);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for SharedFolder {
    fn matches(&self, keywords: &[String]) -> Vec<String> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self.shared_files()
            .into_iter()
            .filter(|name| {
                let lower = name.to_lowercase();
                keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .collect()
    }

    fn shared_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.root.as_path()) else {
            return vec![];
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    async fn serve(&self, listener: TcpListener, halt: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("📁 File server listening on {} (folder {})", addr, self.root.display());
        }
        loop {
            let accepted = tokio::select! {
                _ = halt.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let folder = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = folder.handle_client(stream, peer).await {
                            log::warn!("File transfer with {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("File server accept error: {}", e),
            }
        }
        log::info!("📁 File server stopped");
    }

    async fn push(&self, file_name: &str, target: SocketAddr) -> Result<u64> {
        let mut file = File::open(self.path_of(file_name)?).await?;
        let mut stream = TcpStream::connect(target).await?;
        write_line(&mut stream, &format!("{} {}", PUSH_MARKER, file_name)).await?;
        log::info!("📤 Pushing \"{}\" to {}", file_name, target);
        let sent = tokio::io::copy(&mut file, &mut stream).await?;
        stream.shutdown().await?;
        log::info!("📤 Push of \"{}\" to {} done ({} bytes)", file_name, target, sent);
        Ok(sent)
    }

    async fn fetch(&self, source: SocketAddr, file_name: &str) -> Result<u64> {
        let path = self.path_of(file_name)?;
        let mut stream = TcpStream::connect(source).await?;
        write_line(&mut stream, &format!("{} {}", GET_MARKER, file_name)).await?;
        let answer = read_line_within(&mut stream, self.line_timeout).await?;
        if answer != FOUND_MARKER {
            return Err(ServentError::Transfer {
                file: file_name.to_string(),
                reason: format!("{} answered {:?}", source, answer),
            });
        }
        log::info!("📥 Downloading \"{}\" from {}", file_name, source);
        let mut file = File::create(path).await?;
        let received = tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        log::info!("📥 Download of \"{}\" done ({} bytes)", file_name, received);
        Ok(received)
    }
}
