use std::str::FromStr;
use std::{
    fmt, fs, io,
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{tcp, unix, TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

/// Unify behavior of tcp & unix socket addresses. A string starting with
/// '/' parses as a unix socket path, anything else as host:port.
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Clone for UnifyAddr {
    fn clone(&self) -> Self {
        match self {
            Self::Socket(s) => Self::Socket(*s),
            Self::Path(p) => Self::Path(p.clone()),
        }
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // not a literal address, resolve through the name service and
            // take the first result
            Err(e) => match s.to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

/// Unify behavior of tcp & unix socket listeners.
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl UnifyListener {
    pub async fn bind(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(a) => Ok(Self::Tcp(TcpListener::bind(a).await?)),
            UnifyAddr::Path(path) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
        }
    }

    #[inline]
    pub async fn accept(&mut self) -> io::Result<UnifyStream> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(UnifyStream::Tcp(stream))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(UnifyStream::Unix(stream))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<UnifyAddr> {
        match self {
            Self::Tcp(l) => Ok(UnifyAddr::Socket(l.local_addr()?)),
            Self::Unix(l) => {
                let addr = l.local_addr()?;
                let path = addr.as_pathname().unwrap_or(Path::new("")).to_path_buf();
                Ok(UnifyAddr::Path(path))
            }
        }
    }
}

impl fmt::Display for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "listener unknown"),
        }
    }
}

const ZERO_TIME: Duration = Duration::from_secs(0);

// one ordinary message should fit the stream buffers
pub(crate) const READ_BUF_SIZE: usize = 32 * 1024;
pub(crate) const WRITE_BUF_SIZE: usize = 32 * 1024;

/// Unify behavior of tcp & unix streams.
pub enum UnifyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UnifyStream {
    #[inline(always)]
    pub async fn connect(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(a) => Ok(Self::Tcp(TcpStream::connect(a).await?)),
            UnifyAddr::Path(p) => Ok(Self::Unix(UnixStream::connect(p).await?)),
        }
    }

    pub async fn connect_timeout(
        addr: &UnifyAddr, connect_timeout: Duration,
    ) -> io::Result<Self> {
        if connect_timeout == ZERO_TIME {
            return Self::connect(addr).await;
        }
        match timeout(connect_timeout, Self::connect(addr)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown().await,
            Self::Unix(s) => s.shutdown().await,
        }
    }

    /// Identity of the stream for logs and notifiers.
    pub fn info(&self) -> StreamInfo {
        match self {
            Self::Tcp(s) => StreamInfo {
                local: s.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string()),
                peer: s.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string()),
            },
            Self::Unix(s) => StreamInfo {
                local: unix_addr_string(s.local_addr().ok()),
                peer: unix_addr_string(s.peer_addr().ok()),
            },
        }
    }

    /// Split into independently owned read and write halves. The RPC core
    /// dedicates the read half to a single reader task and serializes
    /// writers on the write half.
    pub fn into_split(self) -> (UnifyReadHalf, UnifyWriteHalf) {
        match self {
            Self::Tcp(s) => {
                let (r, w) = s.into_split();
                (UnifyReadHalf::Tcp(r), UnifyWriteHalf::Tcp(w))
            }
            Self::Unix(s) => {
                let (r, w) = s.into_split();
                (UnifyReadHalf::Unix(r), UnifyWriteHalf::Unix(w))
            }
        }
    }
}

fn unix_addr_string(addr: Option<tokio::net::unix::SocketAddr>) -> String {
    match addr {
        Some(a) => match a.as_pathname() {
            Some(p) => p.display().to_string(),
            None => "unix:unnamed".to_string(),
        },
        None => "?".to_string(),
    }
}

impl fmt::Display for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.info(), f)
    }
}

/// Local and peer address pair of a stream.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub local: String,
    pub peer: String,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.peer)
    }
}

pub enum UnifyReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

pub enum UnifyWriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl AsyncRead for UnifyReadHalf {
    #[inline(always)]
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            Self::Unix(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UnifyWriteHalf {
    #[inline(always)]
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context, buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::get_mut(self) {
            Self::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            Self::Unix(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    #[inline(always)]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(w) => Pin::new(w).poll_flush(cx),
            Self::Unix(w) => Pin::new(w).poll_flush(cx),
        }
    }

    #[inline(always)]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            Self::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            Self::Unix(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Parse `addr` and bind a listener on it.
pub async fn listen_on_addr(addr: &str) -> io::Result<UnifyListener> {
    match UnifyAddr::from_str(addr) {
        Err(_) => {
            error!("fail to parse addr {:?}", addr);
            Err(io::Error::new(io::ErrorKind::InvalidInput, "bad listen address"))
        }
        Ok(listen_addr) => match UnifyListener::bind(&listen_addr).await {
            Ok(listener) => {
                info!("listen on {:?}", addr);
                Ok(listener)
            }
            Err(e) => {
                error!("fail to bind on addr {:?}: {:?}", listen_addr, e);
                Err(e)
            }
        },
    }
}
