//! SASL authentication: spec §4.E. A line-oriented text protocol runs over
//! the same socket before the binary D-Bus protocol begins; the sequence
//! is a leading NUL byte, then `AUTH`/`DATA`/`CANCEL`/`BEGIN` lines
//! terminated by `\r\n`.

use std::env;
use std::fmt::Write as _;
use std::path::PathBuf;

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};
use crate::transport::Transport;

/// A SASL mechanism this crate can negotiate, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    External,
    CookieSha1,
}

/// Mechanisms to try, in the order `tokio-dbus` and the original client
/// both prefer: `EXTERNAL` first (no round trip needed beyond the uid),
/// falling back to `DBUS_COOKIE_SHA1`.
pub fn default_mechanisms() -> Vec<Mechanism> {
    vec![Mechanism::External, Mechanism::CookieSha1]
}

/// Run the SASL handshake to completion, leaving the transport positioned
/// to switch to the binary protocol (the caller still needs to send
/// `BEGIN`, done by [`authenticate`] itself).
pub async fn authenticate(transport: &mut Transport, mechanisms: &[Mechanism]) -> Result<()> {
    transport.send_all(&[0]).await?;

    for &mechanism in mechanisms {
        if try_mechanism(transport, mechanism).await? {
            transport.send_all(b"BEGIN\r\n").await?;
            return Ok(());
        }
    }

    Err(Error::new(ErrorKind::AuthFailed))
}

async fn try_mechanism(transport: &mut Transport, mechanism: Mechanism) -> Result<bool> {
    let initial = initial_response(mechanism)?;
    let mut line = format!("AUTH {}", mechanism_name(mechanism));
    if !initial.is_empty() {
        let _ = write!(line, " {}", hex_encode(&initial));
    }
    send_line(transport, &line).await?;

    loop {
        let reply = recv_line(transport).await?;
        let mut words = reply.split(' ');
        match words.next().unwrap_or("") {
            "OK" => return Ok(true),
            "REJECTED" => return Ok(false),
            "ERROR" => return Err(Error::new(ErrorKind::SaslError(reply))),
            "DATA" => {
                let challenge_hex = words.next().unwrap_or("");
                let challenge = hex_decode(challenge_hex)?;
                match respond_to_challenge(mechanism, &challenge) {
                    Ok(response) => {
                        send_line(transport, &format!("DATA {}", hex_encode(&response))).await?;
                    }
                    Err(_) => {
                        send_line(transport, "CANCEL").await?;
                    }
                }
            }
            _ => return Err(Error::new(ErrorKind::MalformedSaslLine)),
        }
    }
}

fn mechanism_name(mechanism: Mechanism) -> &'static str {
    match mechanism {
        Mechanism::External => "EXTERNAL",
        Mechanism::CookieSha1 => "DBUS_COOKIE_SHA1",
    }
}

fn initial_response(mechanism: Mechanism) -> Result<Vec<u8>> {
    match mechanism {
        Mechanism::External => {
            #[cfg(all(unix, feature = "libc"))]
            let uid = unsafe { libc::geteuid() };
            #[cfg(not(all(unix, feature = "libc")))]
            let uid: u32 = 0;
            Ok(uid.to_string().into_bytes())
        }
        Mechanism::CookieSha1 => Ok(env::var("USER").unwrap_or_default().into_bytes()),
    }
}

fn respond_to_challenge(mechanism: Mechanism, challenge: &[u8]) -> Result<Vec<u8>> {
    match mechanism {
        Mechanism::External => Err(Error::new(ErrorKind::UnexpectedSaslData)),
        Mechanism::CookieSha1 => cookie_sha1_response(challenge),
    }
}

/// `DATA` payload for `DBUS_COOKIE_SHA1` is `<keyring context> <cookie id>
/// <server challenge>`; the response is `<client challenge> <sha1 hex of
/// "server_challenge:client_challenge:cookie">`.
fn cookie_sha1_response(challenge: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(challenge)?;
    let mut parts = text.splitn(3, ' ');
    let context = parts.next().ok_or_else(|| Error::new(ErrorKind::MissingCookie))?;
    let cookie_id = parts.next().ok_or_else(|| Error::new(ErrorKind::MissingCookie))?;
    let server_challenge = parts.next().ok_or_else(|| Error::new(ErrorKind::MissingCookie))?;

    let cookie = find_cookie(context, cookie_id)?;

    let mut client_challenge = vec![0u8; server_challenge.len().max(1)];
    rand::thread_rng().fill_bytes(&mut client_challenge);
    let client_challenge_hex = hex_encode(&client_challenge);

    let mut hasher = Sha1::new();
    hasher.update(server_challenge.as_bytes());
    hasher.update(b":");
    hasher.update(client_challenge_hex.as_bytes());
    hasher.update(b":");
    hasher.update(cookie.as_bytes());
    let digest = hex_encode(&hasher.finalize());

    Ok(format!("{client_challenge_hex} {digest}").into_bytes())
}

/// Look up a cookie by id in `~/.dbus-keyrings/<context>`, per the
/// `DBUS_COOKIE_SHA1` keyring file format: one `<id> <creation-time>
/// <cookie>` line per entry.
fn find_cookie(context: &str, cookie_id: &str) -> Result<String> {
    let home = env::var("HOME").map_err(|_| Error::new(ErrorKind::MissingCookie))?;
    let mut path = PathBuf::from(home);
    path.push(".dbus-keyrings");
    path.push(context);

    let contents = std::fs::read_to_string(&path).map_err(|_| Error::new(ErrorKind::MissingCookie))?;
    for line in contents.lines() {
        let mut fields = line.splitn(3, ' ');
        let id = fields.next().unwrap_or("");
        if id == cookie_id {
            return fields
                .nth(1)
                .map(str::to_string)
                .ok_or_else(|| Error::new(ErrorKind::MissingCookie));
        }
    }

    Err(Error::new(ErrorKind::MissingCookie))
}

async fn send_line(transport: &mut Transport, line: &str) -> Result<()> {
    let mut buf = line.as_bytes().to_vec();
    buf.extend_from_slice(b"\r\n");
    transport.send_all(&buf).await
}

/// Read one `\r\n`-terminated SASL line, byte at a time: the handshake
/// must stop reading at the exact boundary where the binary protocol
/// begins, so no buffered-ahead reads are allowed here.
async fn recv_line(transport: &mut Transport) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = transport.recv_u8().await?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            break;
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|e| e.utf8_error().into())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::MalformedSaslLine));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::new(ErrorKind::MalformedSaslLine)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = b"hello";
        let hex = hex_encode(bytes);
        assert_eq!(hex, "68656c6c6f");
        assert_eq!(hex_decode(&hex).unwrap(), bytes);
    }

    #[test]
    fn external_initial_response_is_decimal_uid() {
        let response = initial_response(Mechanism::External).unwrap();
        assert!(String::from_utf8(response).unwrap().chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn external_auth_against_fake_server() {
        #[cfg(unix)]
        {
            let (client, server) = tokio::net::UnixStream::pair().unwrap();
            let server_task = tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
                let mut server = server;
                let mut nul = [0u8; 1];
                server.read_exact(&mut nul).await.unwrap();
                let mut reader = BufReader::new(&mut server);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                assert!(line.starts_with("AUTH EXTERNAL "));
                reader.write_all(b"OK 1234deadbeef\r\n").await.unwrap();
                let mut begin = String::new();
                reader.read_line(&mut begin).await.unwrap();
                assert_eq!(begin.trim_end(), "BEGIN");
            });

            let mut transport = Transport::Unix(client);
            authenticate(&mut transport, &[Mechanism::External]).await.unwrap();
            server_task.await.unwrap();
        }
    }
}
