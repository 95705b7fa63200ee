use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::codec::ReplyCodec;
use crate::command::{Command, ToArg};
use crate::frame::Reply;
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 6379;

// Read and write buffers both start at 4kb.
const BUF_CAPACITY: usize = 4096;

/// Options recognized by [`Client::connect`](crate::Client::connect).
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub db: u32,
    pub password: Option<Bytes>,
    pub name: Option<String>,
    /// Reconnect ceiling for retry-on-reconnect. Zero disables retries, and
    /// any transport failure is surfaced directly.
    pub max_retries: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tls: false,
            db: 0,
            password: None,
            name: None,
            max_retries: 0,
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>) -> ConnectOptions {
        ConnectOptions {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Parse a `host[:port]` address. The port must be a decimal number when
    /// present; a missing port defaults to 6379.
    pub fn from_addr(addr: &str) -> Result<ConnectOptions> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::InvalidArgument(format!("invalid port {:?} in address {:?}", port, addr))
                })?;
                (host, port)
            }
            None => (addr, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "missing hostname in address {:?}",
                addr
            )));
        }

        Ok(ConnectOptions {
            host: host.to_string(),
            port,
            ..Default::default()
        })
    }

    pub fn port(mut self, port: u16) -> ConnectOptions {
        self.port = port;
        self
    }

    pub fn tls(mut self, tls: bool) -> ConnectOptions {
        self.tls = tls;
        self
    }

    pub fn db(mut self, db: u32) -> ConnectOptions {
        self.db = db;
        self
    }

    pub fn password(mut self, password: impl ToArg) -> ConnectOptions {
        self.password = Some(password.to_arg());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> ConnectOptions {
        self.name = Some(name.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> ConnectOptions {
        self.max_retries = max_retries;
        self
    }
}

/// Plain TCP or TLS-wrapped client stream.
enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read_buf(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.write_all(data).await,
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush().await,
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.shutdown().await,
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// A duplex stream with a read-ahead buffer and a write-behind buffer.
///
/// Replies are decoded out of the read buffer one whole frame at a time;
/// data for a frame that has been handed out is gone from the buffer.
/// Writes coalesce a whole command, or a whole batch, before a single
/// flush puts it on the wire.
pub struct Connection {
    stream: Stream,
    codec: ReplyCodec,
    buffer: BytesMut,
    write_buf: BytesMut,
    closed: bool,
}

impl Connection {
    /// Dial and perform the connect handshake: TCP (or TLS) dial, then
    /// `AUTH`, `SELECT` and `CLIENT SETNAME` as the options demand. A
    /// failure during the handshake closes the socket before surfacing.
    pub async fn establish(options: &ConnectOptions) -> Result<Connection> {
        let tcp = TcpStream::connect((options.host.as_str(), options.port)).await?;
        tcp.set_nodelay(true)?;

        let stream = if options.tls {
            Self::wrap_tls(tcp, &options.host).await?
        } else {
            Stream::Tcp(tcp)
        };

        let mut conn = Connection {
            stream,
            codec: ReplyCodec,
            buffer: BytesMut::with_capacity(BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(BUF_CAPACITY),
            closed: false,
        };

        if let Some(password) = &options.password {
            let auth = Command::new("AUTH").arg(password);
            conn.handshake(auth).await?;
        }

        if options.db != 0 {
            let select = Command::new("SELECT").arg(options.db);
            conn.handshake(select).await?;
        }

        if let Some(name) = &options.name {
            let setname = Command::new("CLIENT").arg("SETNAME").arg(name.as_str());
            conn.handshake(setname).await?;
        }

        debug!(host = %options.host, port = options.port, "connection established");

        Ok(conn)
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(tcp: TcpStream, host: &str) -> Result<Stream> {
        use std::sync::Arc;
        use tokio_rustls::TlsConnector;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let domain = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidArgument(format!("invalid TLS server name {:?}", host)))?;

        let stream = connector.connect(domain, tcp).await?;
        Ok(Stream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(_tcp: TcpStream, _host: &str) -> Result<Stream> {
        Err(Error::InvalidArgument(
            "TLS support requires the `tls` feature".to_string(),
        ))
    }

    /// One handshake exchange. Anything but a status reply tears the
    /// connection down.
    async fn handshake(&mut self, command: Command) -> Result<()> {
        let result = self.round_trip(&command).await;

        match result {
            Ok(Reply::Status(_)) => Ok(()),
            Ok(Reply::Error(message)) => {
                let _ = self.shutdown().await;
                Err(Error::Server(message))
            }
            Ok(other) => {
                let _ = self.shutdown().await;
                Err(Error::Protocol(format!(
                    "unexpected {} reply, got {}",
                    command.name(),
                    other
                )))
            }
            Err(err) => {
                let _ = self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Encode one command into the write buffer and flush it.
    pub async fn write_command(&mut self, command: &Command) -> Result<()> {
        self.write_buf.clear();
        command.write_to(&mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Encode a whole batch into the write buffer and flush once.
    pub async fn write_batch<'a>(
        &mut self,
        commands: impl IntoIterator<Item = &'a Command>,
    ) -> Result<()> {
        self.write_buf.clear();
        for command in commands {
            command.write_to(&mut self.write_buf);
        }
        self.flush_write_buf().await
    }

    async fn flush_write_buf(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Read exactly one reply, pulling more bytes off the socket until a
    /// whole frame is buffered. EOF with an empty buffer is a closed
    /// connection; EOF with a partial frame buffered is a truncated stream,
    /// which is a protocol error and never retried.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        loop {
            if let Some(reply) = self.codec.decode(&mut self.buffer)? {
                return Ok(reply);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    self.closed = true;
                    return Err(Error::Protocol("truncated stream".to_string()));
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }

    pub async fn round_trip(&mut self, command: &Command) -> Result<Reply> {
        self.write_command(command).await?;
        self.read_reply().await
    }

    /// Probe the connection. Any failure, including an error reply, counts
    /// as dead; probing never returns an error.
    pub async fn ping(&mut self) -> bool {
        let ping = Command::new("PING");
        matches!(self.round_trip(&ping).await, Ok(Reply::Status(s)) if s == "PONG")
    }

    /// Close the write half. Idempotent; an already-closed stream is not an
    /// error.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_port() {
        let options = ConnectOptions::new("example.com");

        assert_eq!(options.host, "example.com");
        assert_eq!(options.port, 6379);
        assert_eq!(options.db, 0);
        assert!(!options.tls);
        assert_eq!(options.max_retries, 0);
    }

    #[test]
    fn options_from_addr_with_port() {
        let options = ConnectOptions::from_addr("cache.internal:6380").unwrap();

        assert_eq!(options.host, "cache.internal");
        assert_eq!(options.port, 6380);
    }

    #[test]
    fn options_from_addr_without_port() {
        let options = ConnectOptions::from_addr("cache.internal").unwrap();

        assert_eq!(options.host, "cache.internal");
        assert_eq!(options.port, 6379);
    }

    #[test]
    fn options_from_addr_rejects_bad_port() {
        assert!(matches!(
            ConnectOptions::from_addr("cache.internal:eleven"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ConnectOptions::from_addr("cache.internal:70000"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn options_from_addr_rejects_missing_host() {
        assert!(matches!(
            ConnectOptions::from_addr(":6379"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn options_builders() {
        let options = ConnectOptions::new("example.com")
            .port(7000)
            .db(2)
            .password("hunter2")
            .name("worker-1")
            .max_retries(3);

        assert_eq!(options.port, 7000);
        assert_eq!(options.db, 2);
        assert_eq!(options.password, Some(Bytes::from("hunter2")));
        assert_eq!(options.name.as_deref(), Some("worker-1"));
        assert_eq!(options.max_retries, 3);
    }
}
