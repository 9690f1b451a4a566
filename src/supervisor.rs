//! Workload supervision and PID 1 reaping.
//!
//! The supervisor owns every child-exit event in the VM: the workload, exec
//! children spawned by the control plane, and orphans re-parented to PID 1.
//! A single reap loop drains `waitpid(-1)` under the reap lock; the control
//! plane registers exec PIDs under the same lock, so a spawn and its table
//! entry are atomic with respect to any reap batch.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::InitError;
use crate::fdio::FdIo;
use crate::user::Identity;

/// Capacity of the control-plane signal inbox.
const SIGNAL_INBOX_DEPTH: usize = 16;

/// How long the OOM probe may spend scanning the kernel ring buffer.
const OOM_SCAN_DEADLINE: Duration = Duration::from_millis(10);

/// Final status of the workload, published exactly once.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkloadResult {
    #[serde(rename = "code")]
    pub exit_code: i32,
    pub oom_killed: bool,
}

/// Host and inbox signal sources consumed by the run loop. Registered at
/// construction time so a child exiting before [`Supervisor::run`] still
/// wakes the loop.
struct SignalStreams {
    sigchld: Signal,
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
    sighup: Signal,
    inbox: mpsc::Receiver<i32>,
}

pub struct Supervisor {
    argv: Vec<String>,
    command: StdMutex<Option<Command>>,
    stdout_pipe: StdMutex<Option<OwnedFd>>,
    pid: AtomicI32,

    /// Serializes reap batches against exec spawn+register sections.
    reap_lock: Mutex<()>,
    exec_waits: StdMutex<HashMap<i32, oneshot::Sender<WaitStatus>>>,

    result_tx: watch::Sender<Option<WorkloadResult>>,
    result_rx: watch::Receiver<Option<WorkloadResult>>,

    signal_tx: mpsc::Sender<i32>,
    streams: StdMutex<Option<SignalStreams>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Poison-proof lock on a std mutex; the guarded state stays consistent
/// even if a holder panicked.
fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Supervisor {
    /// Build the unstarted workload.
    ///
    /// The child gets a fresh session (so group-wide signals reach it and
    /// everything it forks), the given credentials, init's stdin, and a
    /// pipe for stdout+stderr whose ends are chowned to the identity.
    ///
    /// Must be called inside the runtime: signal handlers are installed
    /// here so that no SIGCHLD can be lost between spawn and run loop.
    pub fn new(
        argv: Vec<String>,
        env: &[String],
        workdir: &str,
        identity: &Identity,
    ) -> Result<Self, InitError> {
        if argv.is_empty() {
            return Err(InitError::EmptyArgv);
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if !workdir.is_empty() {
            cmd.current_dir(workdir);
        }
        cmd.uid(identity.uid).gid(identity.gid);
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let (read_end, write_end) = nix::unistd::pipe()
            .map_err(|e| InitError::SpawnFailed(format!("create pipe: {e}")))?;
        for fd in [&read_end, &write_end] {
            // SAFETY: both fds were just created and are open.
            let rc = unsafe { libc::fchown(fd.as_raw_fd(), identity.uid, identity.gid) };
            if rc != 0 {
                return Err(InitError::SpawnFailed(format!(
                    "chown pipe: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        let write_dup = write_end
            .try_clone()
            .map_err(|e| InitError::SpawnFailed(format!("dup pipe: {e}")))?;
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::from(write_end));
        cmd.stderr(Stdio::from(write_dup));

        let sig = |kind: SignalKind| {
            signal(kind).map_err(|e| InitError::SpawnFailed(format!("signal handler: {e}")))
        };
        let (signal_tx, inbox) = mpsc::channel(SIGNAL_INBOX_DEPTH);
        let streams = SignalStreams {
            sigchld: sig(SignalKind::child())?,
            sigterm: sig(SignalKind::terminate())?,
            sigint: sig(SignalKind::interrupt())?,
            sigquit: sig(SignalKind::quit())?,
            sighup: sig(SignalKind::hangup())?,
            inbox,
        };

        let (result_tx, result_rx) = watch::channel(None);

        Ok(Self {
            argv,
            command: StdMutex::new(Some(cmd)),
            stdout_pipe: StdMutex::new(Some(read_end)),
            pid: AtomicI32::new(0),
            reap_lock: Mutex::new(()),
            exec_waits: StdMutex::new(HashMap::new()),
            result_tx,
            result_rx,
            signal_tx,
            streams: StdMutex::new(Some(streams)),
        })
    }

    /// Spawn the workload and start forwarding its output to init's stdout.
    pub fn start(&self) -> Result<(), InitError> {
        let Some(mut cmd) = lock(&self.command).take() else {
            return Err(InitError::SpawnFailed("workload already started".into()));
        };
        let child = cmd
            .spawn()
            .map_err(|e| InitError::SpawnFailed(format!("start workload: {e}")))?;
        let pid = child.id() as i32;
        self.pid.store(pid, Ordering::Relaxed);
        // The reap loop owns status collection; the Child handle must not
        // wait on it. Dropping cmd closes the parent's pipe write ends.
        drop(child);
        drop(cmd);

        if let Some(read_end) = lock(&self.stdout_pipe).take() {
            tokio::spawn(forward_stdout(read_end));
        }

        info!(pid, argv = ?self.argv, "workload started");
        Ok(())
    }

    /// Run the reap loop until the workload terminates.
    pub async fn run(&self) -> Result<WorkloadResult, InitError> {
        let Some(mut s) = lock(&self.streams).take() else {
            return Err(InitError::SpawnFailed("run loop already consumed".into()));
        };

        // A child may have exited before this point; its SIGCHLD is already
        // latched in the stream, but drain once up front regardless.
        if let Some(result) = self.reap().await {
            return Ok(result);
        }

        loop {
            tokio::select! {
                _ = s.sigchld.recv() => {
                    if let Some(result) = self.reap().await {
                        return Ok(result);
                    }
                }
                Some(sig) = s.inbox.recv() => self.forward_signal(sig),
                _ = s.sigterm.recv() => self.forward_signal(libc::SIGTERM),
                _ = s.sigint.recv() => self.forward_signal(libc::SIGINT),
                _ = s.sigquit.recv() => self.forward_signal(libc::SIGQUIT),
                _ = s.sighup.recv() => self.forward_signal(libc::SIGHUP),
            }
        }
    }

    /// Await the workload result; usable by any number of concurrent
    /// callers, before or after the exit.
    pub async fn wait_result(&self) -> WorkloadResult {
        let mut rx = self.result_rx.clone();
        let result = match rx.wait_for(|r| r.is_some()).await {
            Ok(r) => (*r).unwrap_or_default(),
            // Sender dropped: supervisor torn down, nothing left to report.
            Err(_) => WorkloadResult::default(),
        };
        result
    }

    /// Queue for signals the control plane wants forwarded to the workload's
    /// process group. FIFO, best-effort.
    pub fn signal_sender(&self) -> mpsc::Sender<i32> {
        self.signal_tx.clone()
    }

    /// Take the spawn/reap lock. While held, no reap batch runs: a caller
    /// may spawn a child and register it without racing status collection.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.reap_lock.lock().await
    }

    /// Register an exec child with the reap loop. The returned receiver
    /// yields the child's wait status exactly once.
    ///
    /// Caller must hold the lock from [`Supervisor::lock`].
    pub fn register_exec(&self, pid: i32) -> oneshot::Receiver<WaitStatus> {
        let (tx, rx) = oneshot::channel();
        lock(&self.exec_waits).insert(pid, tx);
        rx
    }

    /// Drop an exec registration. Idempotent.
    pub fn unregister_exec(&self, pid: i32) {
        lock(&self.exec_waits).remove(&pid);
    }

    /// Drain every terminated child. Returns the workload result if the
    /// workload itself was among them.
    async fn reap(&self) -> Option<WorkloadResult> {
        let _guard = self.reap_lock.lock().await;
        loop {
            match waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        return None;
                    };
                    let pid = pid.as_raw();
                    let workload_pid = self.pid.load(Ordering::Relaxed);

                    if workload_pid != 0 && pid == workload_pid {
                        let exit_code = match status {
                            WaitStatus::Exited(_, code) => code,
                            WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                            _ => continue,
                        };
                        let oom_killed = check_oom(workload_pid);
                        let result = WorkloadResult {
                            exit_code,
                            oom_killed,
                        };
                        info!(pid, exit_code, oom_killed, "workload exited");
                        // Publishing the value and waking waiters is one
                        // operation; readers never observe a stale result.
                        let _ = self.result_tx.send(Some(result));
                        return Some(result);
                    }

                    if let Some(tx) = lock(&self.exec_waits).remove(&pid) {
                        let _ = tx.send(status);
                        continue;
                    }

                    debug!(pid, "reaped orphan");
                }
                Err(nix::errno::Errno::EINTR) => continue,
                // ECHILD: nothing left to reap.
                Err(_) => return None,
            }
        }
    }

    /// Deliver a signal to the workload's whole process group.
    fn forward_signal(&self, sig: i32) {
        let pid = self.pid.load(Ordering::Relaxed);
        if pid <= 0 {
            warn!(signal = sig, "signal before workload start, dropped");
            return;
        }
        // SAFETY: kill takes no pointers; -pid targets the process group.
        let rc = unsafe { libc::kill(-pid, sig) };
        if rc != 0 {
            warn!(
                signal = sig,
                pid,
                error = %std::io::Error::last_os_error(),
                "signal forward failed"
            );
        }
    }
}

/// Copy the workload's stdout/stderr pipe to init's stdout, byte for byte.
async fn forward_stdout(read_end: OwnedFd) {
    let pipe = match FdIo::new(read_end) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "workload output pipe unavailable");
            return;
        }
    };
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
        }
    }
}

/// Scan the kernel ring buffer for an OOM kill of `pid`.
///
/// Bounded by [`OOM_SCAN_DEADLINE`]; a record the kernel has not written
/// yet is reported as no-OOM.
fn check_oom(pid: i32) -> bool {
    use std::io::Read;

    let Ok(mut kmsg) = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/kmsg")
    else {
        return false;
    };

    let needle = format!("Killed process {pid}");
    let deadline = Instant::now() + OOM_SCAN_DEADLINE;
    let mut buf = [0u8; 8192];

    while Instant::now() < deadline {
        // One record per read on /dev/kmsg.
        match kmsg.read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => {
                if String::from_utf8_lossy(&buf[..n]).contains(&needle) {
                    return true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            // EPIPE: the buffer wrapped past our position; keep scanning.
            Err(e) if e.raw_os_error() == Some(libc::EPIPE) => continue,
            Err(_) => return false,
        }
    }
    false
}


#[cfg(test)]
mod tests {
    use super::test_support::REAP_SERIAL;
    use super::*;
    use std::sync::Arc;

    fn current_identity() -> Identity {
        Identity {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home: "/".into(),
        }
    }

    fn new_supervisor(argv: &[&str]) -> Supervisor {
        Supervisor::new(
            argv.iter().map(|s| s.to_string()).collect(),
            &["PATH=/usr/bin:/bin".to_string()],
            "",
            &current_identity(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_argv_rejected() {
        let err = Supervisor::new(vec![], &[], "", &current_identity()).unwrap_err();
        assert!(matches!(err, InitError::EmptyArgv));
    }

    #[tokio::test]
    async fn workload_clean_exit() {
        let _serial = lock(&REAP_SERIAL);
        let sup = new_supervisor(&["/bin/true"]);
        sup.start().unwrap();
        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.oom_killed);
    }

    #[tokio::test]
    async fn workload_nonzero_exit() {
        let _serial = lock(&REAP_SERIAL);
        let sup = new_supervisor(&["/bin/false"]);
        sup.start().unwrap();
        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn workload_exit_code_passthrough() {
        let _serial = lock(&REAP_SERIAL);
        let sup = new_supervisor(&["/bin/sh", "-c", "exit 42"]);
        sup.start().unwrap();
        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn signal_maps_to_128_plus_signo() {
        let _serial = lock(&REAP_SERIAL);
        let sup = Arc::new(new_supervisor(&["/bin/sleep", "30"]));
        sup.start().unwrap();

        let tx = sup.signal_sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(libc::SIGKILL).await.unwrap();
        });

        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn forwarded_signal_reaches_group_member() {
        let _serial = lock(&REAP_SERIAL);
        // The shell installs a trap, then parks on a background sleep; the
        // group-wide TERM must reach it through the session it leads.
        let sup = Arc::new(new_supervisor(&[
            "/bin/sh",
            "-c",
            "trap 'exit 99' TERM; sleep 30 & wait",
        ]));
        sup.start().unwrap();

        let tx = sup.signal_sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.send(libc::SIGTERM).await.unwrap();
        });

        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 99);
    }

    #[tokio::test]
    async fn exec_children_dispatch_to_receivers() {
        let _serial = lock(&REAP_SERIAL);
        let sup = Arc::new(new_supervisor(&["/bin/sleep", "30"]));
        sup.start().unwrap();

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run().await });

        let mut receivers = Vec::new();
        for code in [3, 4, 5] {
            let guard = sup.lock().await;
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg(format!("exit {code}"))
                .spawn()
                .unwrap();
            let rx = sup.register_exec(child.id() as i32);
            drop(guard);
            drop(child);
            receivers.push((code, rx));
        }

        for (code, rx) in receivers {
            let status = rx.await.unwrap();
            match status {
                WaitStatus::Exited(_, got) => assert_eq!(got, code),
                other => panic!("unexpected status: {other:?}"),
            }
        }

        // The workload is still running and its result still pending.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sup.wait_result())
                .await
                .is_err()
        );

        sup.signal_sender().send(libc::SIGKILL).await.unwrap();
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.exit_code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn wait_result_observes_final_value() {
        let _serial = lock(&REAP_SERIAL);
        let sup = Arc::new(new_supervisor(&["/bin/sh", "-c", "exit 7"]));
        sup.start().unwrap();

        let waiter_sup = sup.clone();
        let waiter = tokio::spawn(async move { waiter_sup.wait_result().await });

        let result = sup.run().await.unwrap();
        assert_eq!(result.exit_code, 7);
        assert_eq!(waiter.await.unwrap().exit_code, 7);
        // Late waiters see the same published value.
        assert_eq!(sup.wait_result().await.exit_code, 7);
    }

    #[tokio::test]
    async fn unregister_exec_is_idempotent() {
        let sup = new_supervisor(&["/bin/true"]);
        let _rx = sup.register_exec(4242);
        sup.unregister_exec(4242);
        sup.unregister_exec(4242);
    }
}
