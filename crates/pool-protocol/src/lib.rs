//! Control-protocol client (spec §4.C).
//!
//! One session per call: connect, cookie-authenticate, issue a single
//! `GETINFO`/`SIGNAL` command, parse the textual reply, close. Sessions are
//! never reused across calls — mirrors the request/response line protocol in
//! the teacher's `DaemonClient` (`crates/runtime/src/client.rs`), swapped from
//! JSON-over-Unix-socket to the relay's AUTHENTICATE/GETINFO/SIGNAL dialect
//! over TCP.

mod error;
pub mod testing;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub use error::ControlError;

/// Name Tor (and relay binaries compatible with its control protocol) write
/// the authentication cookie to inside each instance's data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// The control-protocol operations the supervisor needs (spec §4.C item 3).
/// Implemented for real relay children by [`TcpControlClient`]; swapped for a
/// [`testing::StubControlClient`] in property and unit tests so the Health
/// and Rotation loops can be exercised without a real relay binary.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// `GETINFO status/bootstrap-phase` — returns once `PROGRESS=100` is seen
    /// in the reply, or the timeout elapses.
    async fn bootstrap_phase(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<String, ControlError>;

    /// `GETINFO circuit-status` — used for health probing (spec §4.D).
    async fn circuit_status(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<String, ControlError>;

    /// `SIGNAL NEWNYM` — request fresh circuits (spec glossary: NEWNYM).
    async fn signal_newnym(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<(), ControlError>;
}

/// Real control-protocol client: TCP to `127.0.0.1:<control_port>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpControlClient;

#[async_trait]
impl ControlClient for TcpControlClient {
    async fn bootstrap_phase(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<String, ControlError> {
        run_session(control_port, data_dir, timeout, "GETINFO status/bootstrap-phase").await
    }

    async fn circuit_status(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<String, ControlError> {
        run_session(control_port, data_dir, timeout, "GETINFO circuit-status").await
    }

    async fn signal_newnym(
        &self,
        control_port: u16,
        data_dir: &Path,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        run_session(control_port, data_dir, timeout, "SIGNAL NEWNYM")
            .await
            .map(|_| ())
    }
}

/// Connect, authenticate, send `command`, read the reply, close.
async fn run_session(
    control_port: u16,
    data_dir: &Path,
    timeout: Duration,
    command: &str,
) -> Result<String, ControlError> {
    tokio::time::timeout(timeout, run_session_inner(control_port, data_dir, command))
        .await
        .map_err(|_| ControlError::Unavailable("control session timed out".to_string()))?
}

async fn run_session_inner(
    control_port: u16,
    data_dir: &Path,
    command: &str,
) -> Result<String, ControlError> {
    let addr: SocketAddr = ([127, 0, 0, 1], control_port).into();
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ControlError::Unavailable(format!("connect to {addr}: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let cookie = read_cookie(data_dir).await?;
    send_line(&mut write_half, &format!("AUTHENTICATE {cookie}")).await?;
    read_reply(&mut reader).await?;

    send_line(&mut write_half, command).await?;
    let reply = read_reply(&mut reader).await?;

    send_line(&mut write_half, "QUIT").await?;
    let _ = write_half.shutdown().await;

    Ok(reply)
}

async fn read_cookie(data_dir: &Path) -> Result<String, ControlError> {
    let path = data_dir.join(COOKIE_FILE_NAME);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ControlError::Unavailable(format!("read cookie {}: {e}", path.display())))?;
    Ok(hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn send_line(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> Result<(), ControlError> {
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ControlError::Unavailable(format!("write: {e}")))?;
    write_half
        .write_all(b"\r\n")
        .await
        .map_err(|e| ControlError::Unavailable(format!("write: {e}")))?;
    write_half
        .flush()
        .await
        .map_err(|e| ControlError::Unavailable(format!("flush: {e}")))
}

/// Reads one textual reply, handling the `250-`/`250+...\r\n.\r\n` multi-line
/// forms. Returns the accumulated body on a `2xx` final line; otherwise
/// reports the non-2xx status as `ControlRejected`.
async fn read_reply<R>(reader: &mut BufReader<R>) -> Result<String, ControlError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut body = String::new();
    let mut in_data_block = false;

    loop {
        let mut line = String::new();
        let bytes = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ControlError::Unavailable(format!("read: {e}")))?;
        if bytes == 0 {
            return Err(ControlError::Unavailable(
                "connection closed before a final reply line".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);

        if in_data_block {
            if line == "." {
                in_data_block = false;
                continue;
            }
            body.push_str(line);
            body.push('\n');
            continue;
        }

        if line.len() < 4 {
            return Err(ControlError::Malformed(format!("short reply line: {line:?}")));
        }
        let (code, rest) = line.split_at(3);
        let separator = rest.chars().next().unwrap_or(' ');
        let text = &rest[1.min(rest.len())..];

        match separator {
            '-' => {
                body.push_str(text);
                body.push('\n');
                continue;
            }
            '+' => {
                body.push_str(text);
                body.push('\n');
                in_data_block = true;
                continue;
            }
            ' ' => {
                body.push_str(text);
                if code.starts_with('2') {
                    return Ok(body);
                }
                return Err(ControlError::Rejected(format!("{code} {text}")));
            }
            _ => return Err(ControlError::Malformed(format!("bad separator in {line:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn parses_single_line_ok_reply() {
        let (mut server, client) = pair().await;
        tokio::spawn(async move {
            server.write_all(b"250 OK\r\n").await.unwrap();
        });
        let mut reader = BufReader::new(client);
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply, "OK");
    }

    #[tokio::test]
    async fn parses_bootstrap_progress_from_multiline_reply() {
        let (mut server, client) = pair().await;
        tokio::spawn(async move {
            server
                .write_all(
                    b"250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done\r\n250 OK\r\n",
                )
                .await
                .unwrap();
        });
        let mut reader = BufReader::new(client);
        let reply = read_reply(&mut reader).await.unwrap();
        assert!(reply.contains("PROGRESS=100"));
    }

    #[tokio::test]
    async fn non_2xx_final_line_is_rejected() {
        let (mut server, client) = pair().await;
        tokio::spawn(async move {
            server.write_all(b"515 Authentication failed\r\n").await.unwrap();
        });
        let mut reader = BufReader::new(client);
        let err = read_reply(&mut reader).await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected(_)));
    }

    #[tokio::test]
    async fn truncated_connection_is_unavailable() {
        let (server, client) = pair().await;
        drop(server);
        let mut reader = BufReader::new(client);
        let err = read_reply(&mut reader).await.unwrap_err();
        assert!(matches!(err, ControlError::Unavailable(_)));
    }

    #[test]
    fn hex_encodes_cookie_bytes() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }
}
