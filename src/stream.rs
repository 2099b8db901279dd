//! Buffered duplex stream over TCP, Unix socket, or TLS, plus message framing.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};
use crate::opts::{Network, Opts};
use crate::state::BufferSet;

/// An EOF mid-message means the server went away; surface the distinguished
/// connection-lost error so callers classify it as fatal.
fn map_eof(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Buffered duplex stream to the PostgreSQL server.
pub enum Stream {
    Tcp(BufReader<TcpStream>),
    Unix(BufReader<UnixStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    /// Establish the socket described by `opts`, applying the dial, read and
    /// write timeouts.
    pub fn connect(opts: &Opts) -> Result<Self> {
        match opts.network {
            Network::Tcp => {
                if opts.host.is_empty() {
                    return Err(Error::InvalidUsage("host is empty".into()));
                }
                let tcp = match opts.dial_timeout {
                    Some(timeout) => {
                        let mut last_err: Option<io::Error> = None;
                        let mut stream = None;
                        for addr in (opts.host.as_str(), opts.port).to_socket_addrs()? {
                            match TcpStream::connect_timeout(&addr, timeout) {
                                Ok(s) => {
                                    stream = Some(s);
                                    break;
                                }
                                Err(e) => last_err = Some(e),
                            }
                        }
                        stream.ok_or_else(|| {
                            map_eof(last_err.unwrap_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::AddrNotAvailable,
                                    "host resolved to no addresses",
                                )
                            }))
                        })?
                    }
                    None => TcpStream::connect((opts.host.as_str(), opts.port))?,
                };
                tcp.set_nodelay(true)?;
                tcp.set_read_timeout(opts.read_timeout)?;
                tcp.set_write_timeout(opts.write_timeout)?;
                Ok(Self::Tcp(BufReader::new(tcp)))
            }
            Network::Unix => {
                let unix = UnixStream::connect(&opts.host)?;
                unix.set_read_timeout(opts.read_timeout)?;
                unix.set_write_timeout(opts.write_timeout)?;
                Ok(Self::Unix(BufReader::new(unix)))
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(r) => r.read_exact(buf),
            Stream::Unix(r) => r.read_exact(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.read_exact(buf),
        }
    }

    /// Write without flushing; used to batch a message sequence.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let res = match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf),
            Stream::Unix(r) => r.get_mut().write_all(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().write_all(buf),
        };
        res.map_err(map_eof)
    }

    /// Flush buffered writes to the socket.
    pub fn flush(&mut self) -> Result<()> {
        let res = match self {
            Stream::Tcp(r) => r.get_mut().flush(),
            Stream::Unix(r) => r.get_mut().flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().flush(),
        };
        res.map_err(map_eof)
    }

    /// Write a batch of frontend messages and flush, one syscall per batch.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    /// Read a single byte (the SSLRequest response).
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).map_err(map_eof)?;
        Ok(byte[0])
    }

    /// Read one framed message (type byte + length + payload) into the
    /// buffer set.
    pub fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        let mut header = [0u8; 5];
        self.read_exact(&mut header).map_err(map_eof)?;
        buffer_set.type_byte = header[0];

        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if length < 4 {
            return Err(Error::Protocol(format!("invalid message length: {}", length)));
        }

        let payload_len = (length - 4) as usize;
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.resize(payload_len, 0);
        self.read_exact(&mut buffer_set.read_buffer).map_err(map_eof)?;

        Ok(())
    }

    /// Wrap the TCP stream in TLS after a successful SSLRequest handshake.
    #[cfg(feature = "tls")]
    pub fn upgrade_tls(self, host: &str) -> Result<Self> {
        match self {
            Stream::Tcp(reader) => {
                let tcp = reader.into_inner();
                let connector = native_tls::TlsConnector::new()?;
                let tls = connector.connect(host, tcp).map_err(|e| match e {
                    native_tls::HandshakeError::Failure(err) => Error::Tls(err),
                    native_tls::HandshakeError::WouldBlock(_) => {
                        Error::Protocol("TLS handshake would block on a blocking socket".into())
                    }
                })?;
                Ok(Stream::Tls(BufReader::new(tls)))
            }
            other => Ok(other),
        }
    }
}
