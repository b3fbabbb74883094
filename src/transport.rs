//! Address parsing and dialing: spec §4.D. D-Bus addresses are a
//! semicolon-separated list of `transport:key1=value1,key2=value2` entries;
//! the first one this crate knows how to dial wins.

use std::env;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Error, ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// One `transport:key=value,...` entry from a D-Bus address string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AddressEntry {
    transport: String,
    options: Vec<(String, String)>,
}

impl AddressEntry {
    fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a full D-Bus address string into its semicolon-separated entries.
fn parse_address(address: &str) -> Result<Vec<AddressEntry>> {
    address.split(';').filter(|s| !s.is_empty()).map(parse_entry).collect()
}

fn parse_entry(entry: &str) -> Result<AddressEntry> {
    let (transport, rest) = entry
        .split_once(':')
        .ok_or_else(|| Error::new(ErrorKind::InvalidAddress))?;

    let mut options = Vec::new();
    if !rest.is_empty() {
        for pair in rest.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::new(ErrorKind::InvalidAddress))?;
            options.push((key.to_string(), percent_decode(value)?));
        }
    }

    Ok(AddressEntry {
        transport: transport.to_string(),
        options,
    })
}

/// Percent-decode a D-Bus address value (`%XX` escapes, used for bytes that
/// aren't valid in the address grammar, e.g. path separators on obscure
/// platforms).
fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::new(ErrorKind::InvalidAddress))?;
            let hex_str = std::str::from_utf8(hex).map_err(|_| Error::new(ErrorKind::InvalidAddress))?;
            let byte = u8::from_str_radix(hex_str, 16).map_err(|_| Error::new(ErrorKind::InvalidAddress))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| e.utf8_error().into())
}

/// An established, not-yet-authenticated transport.
pub enum Transport {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// Dial the session bus, per `DBUS_SESSION_BUS_ADDRESS`.
    pub async fn session_bus() -> Result<Self> {
        let address = env::var(ENV_SESSION_BUS).map_err(|_| Error::new(ErrorKind::MissingBus))?;
        Self::dial(&address).await
    }

    /// Dial the system bus, per `DBUS_SYSTEM_BUS_ADDRESS` or the
    /// well-known default path.
    pub async fn system_bus() -> Result<Self> {
        let address = env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_string());
        Self::dial(&address).await
    }

    /// Dial an explicit D-Bus address string.
    pub async fn dial(address: &str) -> Result<Self> {
        let entries = parse_address(address)?;

        let mut last_err = Error::new(ErrorKind::MissingBus);
        for entry in entries {
            match Self::dial_entry(&entry).await {
                Ok(transport) => return Ok(transport),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn dial_entry(entry: &AddressEntry) -> Result<Self> {
        match entry.transport.as_str() {
            "unix" => {
                #[cfg(unix)]
                {
                    if let Some(path) = entry.option("path") {
                        return Ok(Transport::Unix(UnixStream::connect(path).await?));
                    }
                    if let Some(abstract_name) = entry.option("abstract") {
                        return Self::dial_abstract(abstract_name);
                    }
                    Err(Error::new(ErrorKind::MissingTransportOption("path")))
                }
                #[cfg(not(unix))]
                Err(Error::new(ErrorKind::UnknownTransport(entry.transport.clone())))
            }
            "tcp" => {
                let host = entry.option("host").unwrap_or("localhost");
                let port = entry
                    .option("port")
                    .ok_or_else(|| Error::new(ErrorKind::MissingTransportOption("port")))?
                    .parse::<u16>()
                    .map_err(|_| Error::new(ErrorKind::InvalidAddress))?;

                let stream = match entry.option("family") {
                    None | Some("") => TcpStream::connect((host, port)).await?,
                    Some(family @ ("ipv4" | "ipv6")) => {
                        let want_v6 = family == "ipv6";
                        let addr = lookup_host((host, port))
                            .await?
                            .find(|addr| addr.is_ipv6() == want_v6)
                            .ok_or_else(|| Error::new(ErrorKind::InvalidAddress))?;
                        TcpStream::connect(addr).await?
                    }
                    Some(_) => return Err(Error::new(ErrorKind::InvalidAddress)),
                };
                Ok(Transport::Tcp(stream))
            }
            other => Err(Error::new(ErrorKind::UnknownTransport(other.to_string()))),
        }
    }

    /// Dial a Linux abstract-namespace `unix:abstract=` socket. Abstract
    /// sockets have no filesystem entry (`tokio::net::UnixStream::connect`
    /// only resolves paths), so the `sockaddr_un` is built by hand with a
    /// leading NUL byte and connected via raw `libc` calls before the fd is
    /// handed back to Tokio.
    #[cfg(unix)]
    fn dial_abstract(name: &str) -> Result<Self> {
        #[cfg(feature = "libc")]
        {
            use std::os::unix::io::FromRawFd;
            use std::os::unix::net::UnixStream as StdUnixStream;

            let name_bytes = name.as_bytes();
            // 1 byte for the leading NUL; `sun_path` is 108 bytes on Linux.
            if name_bytes.len() + 1 > 108 {
                return Err(Error::new(ErrorKind::InvalidAddress));
            }

            unsafe {
                let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
                if fd < 0 {
                    return Err(Error::from(std::io::Error::last_os_error()));
                }

                let mut addr: libc::sockaddr_un = std::mem::zeroed();
                addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let path_ptr = addr.sun_path.as_mut_ptr() as *mut u8;
                path_ptr.write(0);
                std::ptr::copy_nonoverlapping(name_bytes.as_ptr(), path_ptr.add(1), name_bytes.len());
                let addr_len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len()) as libc::socklen_t;

                let ret = libc::connect(fd, &addr as *const _ as *const libc::sockaddr, addr_len);
                if ret < 0 {
                    let err = std::io::Error::last_os_error();
                    libc::close(fd);
                    return Err(Error::from(err));
                }

                let std_stream = StdUnixStream::from_raw_fd(fd);
                std_stream.set_nonblocking(true)?;
                Ok(Transport::Unix(UnixStream::from_std(std_stream)?))
            }
        }
        #[cfg(not(feature = "libc"))]
        {
            let _ = name;
            Err(Error::new(ErrorKind::AbstractSocketUnavailable))
        }
    }

    /// Read exactly `buf.len()` bytes, treating a short read as an error
    /// rather than EOF (spec §4.D edge case: a short read never silently
    /// succeeds).
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(stream) => stream.read_exact(buf).await.map(|_| ()).map_err(Error::from),
            Transport::Tcp(stream) => stream.read_exact(buf).await.map(|_| ()).map_err(Error::from),
        }
    }

    /// Read a single byte.
    pub async fn recv_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.recv_exact(&mut byte).await?;
        Ok(byte[0])
    }

    /// Write the whole buffer, looping over partial writes.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await?;
            }
            Transport::Tcp(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    /// Split into an owned read half and write half, so the receive loop
    /// and the writer sub-task (spec §5's concurrency model) can each own
    /// one without sharing a lock around the socket itself.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        match self {
            #[cfg(unix)]
            Transport::Unix(stream) => {
                let (r, w) = stream.into_split();
                (TransportReader::Unix(r), TransportWriter::Unix(w))
            }
            Transport::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (TransportReader::Tcp(r), TransportWriter::Tcp(w))
            }
        }
    }
}

pub enum TransportReader {
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
    Tcp(tokio::net::tcp::OwnedReadHalf),
}

impl TransportReader {
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            #[cfg(unix)]
            TransportReader::Unix(r) => r.read_exact(buf).await.map(|_| ()).map_err(Error::from),
            TransportReader::Tcp(r) => r.read_exact(buf).await.map(|_| ()).map_err(Error::from),
        }
    }
}

pub enum TransportWriter {
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
    Tcp(tokio::net::tcp::OwnedWriteHalf),
}

impl TransportWriter {
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            #[cfg(unix)]
            TransportWriter::Unix(w) => {
                w.write_all(buf).await?;
                w.flush().await?;
            }
            TransportWriter::Tcp(w) => {
                w.write_all(buf).await?;
                w.flush().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path_address() {
        let entries = parse_address("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transport, "unix");
        assert_eq!(entries[0].option("path"), Some("/run/dbus/system_bus_socket"));
    }

    #[test]
    fn parses_multiple_entries() {
        let entries = parse_address("unix:path=/a;tcp:host=localhost,port=1234").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].transport, "tcp");
        assert_eq!(entries[1].option("port"), Some("1234"));
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(percent_decode("a%2cb").unwrap(), "a,b");
    }

    #[test]
    fn rejects_entry_without_colon() {
        assert!(parse_address("nonsense").is_err());
    }
}
