//! Interactive exec sessions.
//!
//! `GET /v1/ws/exec` upgrades the control connection to a framed message
//! stream:
//!
//! - client → server, first frame (text): `{"command":[...], "tty": bool}`
//! - client → server, text: `{"cols": N, "rows": N}` resize (tty only)
//! - client → server, binary: raw stdin bytes
//! - server → client, binary: raw stdout bytes (64 KiB chunks)
//! - server → client, text: `{"Exit":{"code":N,"signal":N}}` then close
//! - server → client, text: `{"Error":{"message":"..."}}` on failure
//!
//! The child runs in its own process group and is registered with the
//! supervisor's reap loop under the spawn lock; client disconnect kills the
//! whole group.

use std::process::{Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nix::sys::wait::WaitStatus;
use serde::Deserialize;
use serde_json::json;
use std::os::unix::process::CommandExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::InitError;
use crate::fdio::FdIo;
use crate::server::{apply_env, write_error, ApiServer, Request};
use crate::supervisor::Supervisor;

/// Per-frame read limit on the client side of the stream.
const READ_LIMIT: usize = 128 * 1024;

/// Stdout chunk size per binary frame.
const STDOUT_CHUNK: usize = 65536;

/// How long to keep draining stdout after the exit frame.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct InitMsg {
    command: Vec<String>,
    #[serde(default)]
    tty: bool,
}

#[derive(Deserialize)]
struct ResizeMsg {
    cols: u16,
    rows: u16,
}

/// Complete the websocket handshake on an upgraded control connection and
/// run the session on it.
pub(crate) async fn handle_upgrade<S>(
    server: &ApiServer,
    mut stream: BufReader<S>,
    req: &Request,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(key) = req.header("sec-websocket-key") else {
        return write_error(&mut stream, 400, "bad upgrade request").await;
    };
    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let config = WebSocketConfig {
        max_message_size: Some(READ_LIMIT),
        max_frame_size: Some(READ_LIMIT),
        ..Default::default()
    };
    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, Some(config)).await;
    if let Err(e) = session(&server.supervisor, &server.env, ws, shutdown).await {
        debug!(error = %e, "exec session ended");
    }
    Ok(())
}

/// Child stdio wiring for one session.
enum SessionIo {
    /// Pty master: stdout source, stdin sink, and resize target in one fd.
    Tty { master: FdIo },
    /// Pipe read end; no stdin sink, stderr goes to the serial log.
    Pipe { out: FdIo },
}

impl SessionIo {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tty { master } => master.read(buf).await,
            Self::Pipe { out } => out.read(buf).await,
        }
    }

    /// Forward stdin bytes; dropped when the child has no stdin sink.
    async fn write_stdin(&self, data: &[u8]) {
        if let Self::Tty { master } = self {
            let _ = master.write_all(data).await;
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let Self::Tty { master } = self else { return };
        if cols == 0 || rows == 0 {
            return;
        }
        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: the master fd is open; size is a live stack value.
        unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &size) };
    }
}

enum SessionEnd {
    Exited(Option<WaitStatus>),
    Disconnected,
    Cancelled,
}

/// Run one exec session on an established message stream.
pub(crate) async fn session<S>(
    supervisor: &Supervisor,
    env: &[String],
    mut ws: WebSocketStream<S>,
    shutdown: CancellationToken,
) -> Result<(), InitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let init = match ws.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<InitMsg>(&text) {
            Ok(init) if !init.command.is_empty() => init,
            _ => return close_protocol(ws, "invalid init message").await,
        },
        Some(Ok(_)) => return close_protocol(ws, "expected text init message").await,
        _ => return Ok(()),
    };
    debug!(command = ?init.command, tty = init.tty, "exec session");

    let mut cmd = Command::new(&init.command[0]);
    cmd.args(&init.command[1..]);
    apply_env(&mut cmd, env);

    let io = match if init.tty {
        setup_tty(&mut cmd)
    } else {
        setup_pipe(&mut cmd)
    } {
        Ok(io) => io,
        Err(e) => return send_error(ws, &e.to_string()).await,
    };

    // Spawn and register atomically with respect to the reap loop.
    let guard = supervisor.lock().await;
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            drop(guard);
            return send_error(ws, &e.to_string()).await;
        }
    };
    let pid = child.id() as i32;
    let mut exit_rx = supervisor.register_exec(pid);
    drop(guard);
    // Release the parent's copies of the child-side fds.
    drop(child);
    drop(cmd);

    let mut buf = vec![0u8; STDOUT_CHUNK];
    let mut output_open = true;

    let end = loop {
        tokio::select! {
            status = &mut exit_rx => break SessionEnd::Exited(status.ok()),
            _ = shutdown.cancelled() => break SessionEnd::Cancelled,
            r = io.read(&mut buf), if output_open => match r {
                Ok(0) | Err(_) => output_open = false,
                Ok(n) => {
                    if ws.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => io.write_stdin(&data).await,
                Some(Ok(Message::Text(text))) => {
                    if let Ok(resize) = serde_json::from_str::<ResizeMsg>(&text) {
                        io.resize(resize.cols, resize.rows);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(_)) => break SessionEnd::Disconnected,
            }
        }
    };

    if let SessionEnd::Exited(status) = end {
        send_exit(&mut ws, status).await;
        if output_open {
            let drain = async {
                loop {
                    match io.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if ws.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            };
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
        }
        let _ = ws.close(None).await;
    }

    // Reached on every path: a live child (disconnect, cancellation) dies
    // with its whole group; after a normal exit this is a no-op.
    // SAFETY: kill takes no pointers; -pid targets the process group.
    unsafe { libc::kill(-pid, libc::SIGKILL) };
    supervisor.unregister_exec(pid);
    Ok(())
}

/// Attach the child to a fresh pty. The slave becomes the child's
/// controlling terminal and stdio; the master is the session's I/O handle.
fn setup_tty(cmd: &mut Command) -> std::io::Result<SessionIo> {
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    let slave_out = pty.slave.try_clone()?;
    let slave_err = pty.slave.try_clone()?;

    cmd.env("TERM", "xterm-256color");
    cmd.stdin(Stdio::from(pty.slave));
    cmd.stdout(Stdio::from(slave_out));
    cmd.stderr(Stdio::from(slave_err));
    // SAFETY: setsid and ioctl are async-signal-safe; fd 0 is the pty slave
    // at that point.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Ok(SessionIo::Tty {
        master: FdIo::new(pty.master)?,
    })
}

/// Non-interactive wiring: no stdin, stdout through a pipe, stderr onto the
/// VM serial log.
fn setup_pipe(cmd: &mut Command) -> std::io::Result<SessionIo> {
    let (read_end, write_end) =
        nix::unistd::pipe().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(write_end));
    cmd.stderr(Stdio::inherit());
    // SAFETY: setpgid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Ok(SessionIo::Pipe {
        out: FdIo::new(read_end)?,
    })
}

async fn send_exit<S>(ws: &mut WebSocketStream<S>, status: Option<WaitStatus>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (code, signal) = match status {
        Some(WaitStatus::Exited(_, code)) => (Some(code), None),
        Some(WaitStatus::Signaled(_, sig, _)) => (None, Some(sig as i32)),
        _ => (None, None),
    };
    let msg = json!({"Exit": {"code": code, "signal": signal}});
    let _ = ws.send(Message::Text(msg.to_string())).await;
}

async fn send_error<S>(
    mut ws: WebSocketStream<S>,
    detail: &str,
) -> Result<(), InitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let err = InitError::SpawnFailed(detail.to_string());
    let msg = json!({"Error": {"message": err.to_string()}});
    let _ = ws.send(Message::Text(msg.to_string())).await;
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "".into(),
        }))
        .await;
    Err(err)
}

async fn close_protocol<S>(
    mut ws: WebSocketStream<S>,
    reason: &str,
) -> Result<(), InitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Protocol,
            reason: reason.to_string().into(),
        }))
        .await;
    Err(InitError::StreamProtocolError(
        reason.to_string(),
    ))
}
