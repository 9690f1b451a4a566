//! Host control plane.
//!
//! Serves HTTP/1.1 on a vsock port only the hypervisor can reach. Requests
//! are parsed and answered directly on the stream; the interactive exec
//! route hands the connection over to [`crate::exec`]. Handlers are generic
//! over the stream type so tests drive them through in-memory duplex pipes.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_vsock::VsockListener;
use tracing::{debug, info, warn};

use crate::error::InitError;
use crate::fdio::FdIo;
use crate::supervisor::Supervisor;

/// Control-plane port, fixed by the host side.
pub const VSOCK_PORT: u32 = 10000;

/// Wall-clock budget for one `POST /v1/exec` command.
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on request bodies; the control plane only ever sees small
/// JSON documents.
const MAX_BODY: usize = 1 << 20;

pub struct ApiServer {
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) env: Arc<Vec<String>>,
}

impl ApiServer {
    pub fn new(supervisor: Arc<Supervisor>, env: Vec<String>) -> Self {
        Self {
            supervisor,
            env: Arc::new(env),
        }
    }

    /// Accept loop. Lives until `shutdown` fires, which also tears down all
    /// in-flight handlers.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), InitError> {
        let mut listener = VsockListener::bind(libc::VMADDR_CID_ANY, VSOCK_PORT)
            .map_err(|e| InitError::ControlTransportFailed(format!("vsock listen: {e}")))?;
        info!(port = VSOCK_PORT, "vsock API listening");

        let server = Arc::new(self);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.map_err(|e| {
                        InitError::ControlTransportFailed(format!("vsock accept: {e}"))
                    })?;
                    let server = server.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, token).await {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }

    /// Serve requests on one connection until EOF or shutdown.
    pub(crate) async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(stream);
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = Request::read(&mut reader) => match r? {
                    Some(req) => req,
                    None => return Ok(()),
                },
            };

            match (req.method.as_str(), req.path.as_str()) {
                ("GET", "/v1/status") => {
                    write_json(&mut reader, 200, &json!({"ok": true})).await?;
                }
                ("GET", "/v1/exit_code") => {
                    self.handle_exit_code(&mut reader, &shutdown).await?;
                }
                ("POST", "/v1/signals") => match self.queue_signal(&req.body).await {
                    Ok(value) => write_json(&mut reader, 200, &value).await?,
                    Err(e) => write_error(&mut reader, status_for(&e), &e.to_string()).await?,
                },
                ("POST", "/v1/exec") => match self.run_exec_request(&req.body).await {
                    Ok(value) => write_json(&mut reader, 200, &value).await?,
                    Err(e) => {
                        warn!(error = %e, "exec failed");
                        write_error(&mut reader, status_for(&e), &e.to_string()).await?;
                    }
                },
                ("GET", "/v1/ws/exec") => {
                    // The exec stream owns the connection from here on.
                    return crate::exec::handle_upgrade(&self, reader, &req, shutdown).await;
                }
                _ => write_error(&mut reader, 404, "not found").await?,
            }
        }
    }

    /// Block until the workload result is published, then return it.
    async fn handle_exit_code<S>(
        &self,
        stream: &mut S,
        shutdown: &CancellationToken,
    ) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        tokio::select! {
            result = self.supervisor.wait_result() => write_json(stream, 200, &result).await,
            _ = shutdown.cancelled() => write_error(stream, 504, "timeout").await,
        }
    }

    /// Validate and enqueue a signal for forwarding to the workload group.
    async fn queue_signal(&self, body: &[u8]) -> Result<serde_json::Value, InitError> {
        #[derive(Deserialize)]
        struct SignalRequest {
            signal: i64,
        }

        let req = serde_json::from_slice::<SignalRequest>(body)
            .map_err(|_| InitError::InvalidRequest("invalid body".into()))?;
        if !(1..=64).contains(&req.signal) {
            return Err(InitError::InvalidRequest("invalid signal number".into()));
        }

        self.supervisor
            .signal_sender()
            .send(req.signal as i32)
            .await
            .map_err(|_| InitError::ControlTransportFailed("signal queue closed".into()))?;
        Ok(json!({"ok": true}))
    }

    async fn run_exec_request(&self, body: &[u8]) -> Result<serde_json::Value, InitError> {
        #[derive(Deserialize)]
        struct ExecRequest {
            cmd: Vec<String>,
        }

        let cmd = match serde_json::from_slice::<ExecRequest>(body) {
            Ok(req) if !req.cmd.is_empty() => req.cmd,
            _ => return Err(InitError::InvalidRequest("invalid body".into())),
        };

        let resp = self.run_exec(&cmd).await?;
        serde_json::to_value(resp).map_err(|e| InitError::ControlTransportFailed(e.to_string()))
    }

    /// Run a command to completion, capturing stdout and stderr separately.
    ///
    /// The supervisor lock is held only across spawn+registration; the wait
    /// happens on the receiver the reaper redeems. On deadline the child's
    /// whole group is killed and the collected (signalled) status reported.
    async fn run_exec(&self, argv: &[String]) -> Result<ExecResponse, InitError> {
        let (out_r, out_w) =
            nix::unistd::pipe().map_err(|e| InitError::SpawnFailed(format!("pipe: {e}")))?;
        let (err_r, err_w) =
            nix::unistd::pipe().map_err(|e| InitError::SpawnFailed(format!("pipe: {e}")))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        apply_env(&mut cmd, &self.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(out_w));
        cmd.stderr(Stdio::from(err_w));
        // SAFETY: setpgid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let guard = self.supervisor.lock().await;
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(guard);
                return Err(InitError::SpawnFailed(e.to_string()));
            }
        };
        let pid = child.id() as i32;
        let mut exit_rx = self.supervisor.register_exec(pid);
        drop(guard);
        // Close the parent's pipe write ends so the readers see EOF.
        drop(child);
        drop(cmd);

        let stdout_io = FdIo::new(out_r).map_err(|e| InitError::SpawnFailed(e.to_string()))?;
        let stderr_io = FdIo::new(err_r).map_err(|e| InitError::SpawnFailed(e.to_string()))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_io.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_io.read_to_end(&mut buf).await;
            buf
        });

        let status = match tokio::time::timeout(EXEC_TIMEOUT, &mut exit_rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                self.supervisor.unregister_exec(pid);
                return Err(InitError::SpawnFailed("exit status lost".into()));
            }
            Err(_) => {
                // SAFETY: kill takes no pointers; -pid targets the group.
                unsafe { libc::kill(-pid, libc::SIGKILL) };
                match exit_rx.await {
                    Ok(status) => status,
                    Err(_) => {
                        self.supervisor.unregister_exec(pid);
                        return Err(InitError::DeadlineExceeded);
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let (exit_code, exit_signal) = match status {
            WaitStatus::Exited(_, code) => (code, 0),
            WaitStatus::Signaled(_, sig, _) => (-1, sig as i32),
            _ => (-1, 0),
        };

        Ok(ExecResponse {
            exit_code,
            exit_signal,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ExecResponse {
    exit_code: i32,
    exit_signal: i32,
    stdout: String,
    stderr: String,
}

/// Apply `KEY=VAL` entries to a command, replacing the inherited
/// environment.
pub(crate) fn apply_env(cmd: &mut Command, env: &[String]) {
    cmd.env_clear();
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
}

/// One parsed HTTP request.
pub(crate) struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Read one request off the wire. `None` on clean EOF before a request
    /// line.
    async fn read<S>(reader: &mut BufReader<S>) -> std::io::Result<Option<Request>>
    where
        S: AsyncRead + Unpin,
    {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let mut parts = line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed request line",
            ));
        };
        let (method, path) = (method.to_string(), path.to_string());

        let mut headers = Vec::new();
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof in headers",
                ));
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "body too large",
            ));
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        Ok(Some(Request {
            method,
            path,
            headers,
            body,
        }))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Map a handler fault to its HTTP status: request faults are the client's
/// (400), everything else is ours (500).
fn status_for(err: &InitError) -> u16 {
    match err {
        InitError::InvalidRequest(_) => 400,
        _ => 500,
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        504 => "Gateway Timeout",
        _ => "",
    }
}

async fn write_response<S>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        reason(status),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

pub(crate) async fn write_json<S>(
    stream: &mut S,
    status: u16,
    value: &impl Serialize,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).unwrap_or_default();
    write_response(stream, status, "application/json", &body).await
}

pub(crate) async fn write_error<S>(stream: &mut S, status: u16, msg: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, status, "text/plain; charset=utf-8", format!("{msg}\n").as_bytes())
        .await
}

/// Assemble the workload argv: an exec override wins outright, otherwise the
/// image entrypoint followed by either the single cmd override or the image
/// cmd.
pub fn build_argv(
    exec_override: &[String],
    entrypoint: &[String],
    cmd: &[String],
    cmd_override: Option<&str>,
) -> Vec<String> {
    if !exec_override.is_empty() {
        return exec_override.to_vec();
    }

    let mut argv = entrypoint.to_vec();
    match cmd_override {
        Some(single) => argv.push(single.to_string()),
        None => argv.extend(cmd.iter().cloned()),
    }
    argv
}

/// Merge the workload environment: image env first, extra env over it, and
/// a `HOME` default from the identity when neither source set one.
pub fn build_env(
    image_env: &[String],
    extra_env: &HashMap<String, String>,
    home: &str,
) -> Vec<String> {
    let mut env: HashMap<String, String> = HashMap::new();

    for entry in image_env {
        if let Some((key, value)) = entry.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    for (key, value) in extra_env {
        env.insert(key.clone(), value.clone());
    }
    env.entry("HOME".to_string())
        .or_insert_with(|| home.to_string());

    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::test_support::REAP_SERIAL;
    use crate::user::Identity;

    fn env_to_map(env: &[String]) -> HashMap<String, String> {
        env.iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn argv_exec_override() {
        let got = build_argv(
            &["/bin/custom".into(), "--flag".into()],
            &["/bin/entry".into()],
            &["default".into()],
            None,
        );
        assert_eq!(got, ["/bin/custom", "--flag"]);
    }

    #[test]
    fn argv_entrypoint_plus_cmd() {
        let got = build_argv(
            &[],
            &["/bin/entry".into()],
            &["arg1".into(), "arg2".into()],
            None,
        );
        assert_eq!(got, ["/bin/entry", "arg1", "arg2"]);
    }

    #[test]
    fn argv_entrypoint_plus_cmd_override() {
        let got = build_argv(
            &[],
            &["/bin/entry".into()],
            &["default".into()],
            Some("overridden"),
        );
        assert_eq!(got, ["/bin/entry", "overridden"]);
    }

    #[test]
    fn argv_empty_inputs() {
        assert!(build_argv(&[], &[], &[], None).is_empty());
    }

    #[test]
    fn argv_exec_override_beats_all() {
        let got = build_argv(
            &["/exec".into()],
            &["/entry".into()],
            &["cmd".into()],
            Some("cmd-override"),
        );
        assert_eq!(got, ["/exec"]);
    }

    #[test]
    fn env_merges_image_and_extra() {
        let extra = [("BAZ".to_string(), "qux".to_string())].into();
        let got = build_env(
            &["PATH=/usr/bin".into(), "FOO=bar".into()],
            &extra,
            "/home/test",
        );
        let env = env_to_map(&got);
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["BAZ"], "qux");
        assert_eq!(env["HOME"], "/home/test");
    }

    #[test]
    fn env_extra_overrides_image() {
        let extra = [("FOO".to_string(), "overridden".to_string())].into();
        let got = build_env(&["FOO=original".into()], &extra, "/root");
        assert_eq!(env_to_map(&got)["FOO"], "overridden");
    }

    #[test]
    fn env_home_not_overridden() {
        let got = build_env(&["HOME=/custom".into()], &HashMap::new(), "/default");
        assert_eq!(env_to_map(&got)["HOME"], "/custom");
    }

    #[test]
    fn env_home_defaulted() {
        let got = build_env(&[], &HashMap::new(), "/fallback");
        assert_eq!(env_to_map(&got)["HOME"], "/fallback");
    }

    #[test]
    fn env_malformed_image_entries_dropped() {
        let got = build_env(
            &["NOEQUALS".into(), "GOOD=value".into(), "=empty_key".into()],
            &HashMap::new(),
            "/root",
        );
        let env = env_to_map(&got);
        assert!(!env.contains_key("NOEQUALS"));
        assert_eq!(env["GOOD"], "value");
        assert_eq!(env[""], "empty_key");
    }

    #[test]
    fn env_value_may_contain_equals() {
        let got = build_env(
            &["DSN=postgres://host?opt=val".into()],
            &HashMap::new(),
            "/root",
        );
        assert_eq!(env_to_map(&got)["DSN"], "postgres://host?opt=val");
    }

    // ----- handler tests over in-memory streams -----

    fn current_identity() -> Identity {
        Identity {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home: "/".into(),
        }
    }

    fn test_server(argv: &[&str]) -> Arc<ApiServer> {
        let sup = Supervisor::new(
            argv.iter().map(|s| s.to_string()).collect(),
            &["PATH=/usr/bin:/bin".to_string()],
            "",
            &current_identity(),
        )
        .unwrap();
        Arc::new(ApiServer::new(
            Arc::new(sup),
            vec!["PATH=/usr/bin:/bin".to_string()],
        ))
    }

    /// Drive one raw request through the connection handler and return
    /// (status, body).
    async fn roundtrip(
        server: Arc<ApiServer>,
        token: CancellationToken,
        raw: &str,
    ) -> (u16, String) {
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let conn = tokio::spawn(server.handle_connection(server_side, token));

        client.write_all(raw.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let _ = conn.await;

        let text = String::from_utf8_lossy(&response).into_owned();
        let status = text
            .get(9..12)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    fn get(path: &str) -> String {
        format!("GET {path} HTTP/1.1\r\nHost: init\r\n\r\n")
    }

    fn post(path: &str, body: &str) -> String {
        format!(
            "POST {path} HTTP/1.1\r\nHost: init\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn status_returns_ok_json() {
        let server = test_server(&["/bin/true"]);
        let (status, body) = roundtrip(server, CancellationToken::new(), &get("/v1/status")).await;
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["ok"], true);
    }

    #[tokio::test]
    async fn signal_rejects_invalid_body() {
        let server = test_server(&["/bin/true"]);
        let (status, _) = roundtrip(
            server,
            CancellationToken::new(),
            &post("/v1/signals", "not json"),
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn signal_rejects_out_of_range_numbers() {
        for sig in [0, -1, 65] {
            let server = test_server(&["/bin/true"]);
            let (status, _) = roundtrip(
                server,
                CancellationToken::new(),
                &post("/v1/signals", &format!("{{\"signal\":{sig}}}")),
            )
            .await;
            assert_eq!(status, 400, "signal {sig}");
        }
    }

    #[tokio::test]
    async fn signal_accepts_valid_number() {
        let server = test_server(&["/bin/true"]);
        let (status, body) = roundtrip(
            server,
            CancellationToken::new(),
            &post("/v1/signals", "{\"signal\":15}"),
        )
        .await;
        assert_eq!(status, 200);
        assert!(body.contains("true"), "body: {body}");
    }

    #[tokio::test]
    async fn exec_rejects_invalid_body() {
        let server = test_server(&["/bin/true"]);
        let (status, _) = roundtrip(
            server,
            CancellationToken::new(),
            &post("/v1/exec", "not json"),
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn exec_rejects_empty_cmd() {
        let server = test_server(&["/bin/true"]);
        let (status, _) = roundtrip(
            server,
            CancellationToken::new(),
            &post("/v1/exec", "{\"cmd\":[]}"),
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn registered_routes_never_404() {
        let routes = [
            get("/v1/status"),
            post("/v1/signals", "{}"),
            post("/v1/exec", "{}"),
            get("/v1/ws/exec"),
        ];
        for raw in routes {
            let server = test_server(&["/bin/true"]);
            let (status, _) = roundtrip(server, CancellationToken::new(), &raw).await;
            assert_ne!(status, 404, "request: {raw:?}");
        }
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let server = test_server(&["/bin/true"]);
        let (status, _) = roundtrip(server, CancellationToken::new(), &get("/v1/nope")).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn exit_code_times_out_on_cancellation() {
        let server = test_server(&["/bin/true"]);
        let token = CancellationToken::new();
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let conn = tokio::spawn(server.handle_connection(server_side, token.clone()));

        client
            .write_all(get("/v1/exit_code").as_bytes())
            .await
            .unwrap();
        // Let the handler reach its wait before cancelling the server.
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let _ = conn.await;

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 504"), "got: {text}");
    }

    #[tokio::test]
    async fn exec_runs_command_and_captures_output() {
        let _serial = REAP_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let server = test_server(&["/bin/sleep", "30"]);
        server.supervisor.start().unwrap();
        let sup = server.supervisor.clone();
        let run = tokio::spawn(async move { sup.run().await });

        let (status, body) = roundtrip(
            server.clone(),
            CancellationToken::new(),
            &post(
                "/v1/exec",
                "{\"cmd\":[\"/bin/sh\",\"-c\",\"echo out; echo err >&2; exit 3\"]}",
            ),
        )
        .await;
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["exit_code"], 3);
        assert_eq!(parsed["exit_signal"], 0);
        assert_eq!(parsed["stdout"], "out\n");
        assert_eq!(parsed["stderr"], "err\n");

        server
            .supervisor
            .signal_sender()
            .send(libc::SIGKILL)
            .await
            .unwrap();
        let _ = run.await;
    }

    #[tokio::test]
    async fn exit_code_returns_result_json() {
        let _serial = REAP_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let server = test_server(&["/bin/sh", "-c", "exit 5"]);
        server.supervisor.start().unwrap();
        let sup = server.supervisor.clone();
        let run = tokio::spawn(async move { sup.run().await });

        let (status, body) =
            roundtrip(server, CancellationToken::new(), &get("/v1/exit_code")).await;
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["code"], 5);
        assert_eq!(parsed["oom_killed"], false);
        let _ = run.await;
    }
}
