use std::{
    fs::{self, OpenOptions},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use router_plugin::HandshakePayload;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::{Mutex, oneshot},
};
use tracing::{debug, info, warn};

use crate::error::RouterError;

/// Invoked exactly once when a started plugin process ends.
///
/// `restart` is false when the exit was requested through [`Runner::stop`];
/// `err` is `None` for a clean exit.
pub type OnStop = Box<dyn FnOnce(bool, Option<anyhow::Error>) + Send + 'static>;

/// Launches and stops one plugin process.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Starts the process and hands it `"<callback port> <id>"` on stdin.
    async fn start(&self, id: u32, callback: SocketAddr, on_stop: OnStop) -> Result<(), RouterError>;

    /// Terminates the process and waits until it is gone. Stopping a runner
    /// that is not running is a no-op.
    async fn stop(&self) -> Result<(), RouterError>;
}

/// Produces a fresh [`Runner`] per launch of an executable.
pub trait RunnerFactory: Send + Sync {
    fn new_runner(&self, exe: &Path) -> Result<Arc<dyn Runner>, RouterError>;
}

/// Runs plugins as child processes, stdout and stderr appended to a log file.
#[derive(Debug, Clone, Default)]
pub struct CmdRunnerFactory {
    log_dir: Option<PathBuf>,
}

impl CmdRunnerFactory {
    /// With `log_dir` unset, logs land next to the executable.
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self { log_dir }
    }

    pub fn log_path(&self, exe: &Path) -> PathBuf {
        match (&self.log_dir, exe.file_name()) {
            (Some(dir), Some(name)) => {
                let mut file = name.to_os_string();
                file.push(".log");
                dir.join(file)
            }
            _ => {
                let mut path = exe.as_os_str().to_os_string();
                path.push(".log");
                PathBuf::from(path)
            }
        }
    }
}

impl RunnerFactory for CmdRunnerFactory {
    fn new_runner(&self, exe: &Path) -> Result<Arc<dyn Runner>, RouterError> {
        if !exe.is_file() {
            return Err(RouterError::Spawn {
                exe: exe.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a file"),
            });
        }
        Ok(Arc::new(CmdRunner {
            exe: exe.to_path_buf(),
            log_path: self.log_path(exe),
            running: Mutex::new(None),
        }))
    }
}

struct Running {
    stop_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

pub struct CmdRunner {
    exe: PathBuf,
    log_path: PathBuf,
    running: Mutex<Option<Running>>,
}

impl CmdRunner {
    fn log_stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        if let Some(dir) = self.log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

#[async_trait]
impl Runner for CmdRunner {
    async fn start(&self, id: u32, callback: SocketAddr, on_stop: OnStop) -> Result<(), RouterError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RouterError::Spawn {
                exe: self.exe.clone(),
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "already running"),
            });
        }

        let spawn_err = |source| RouterError::Spawn {
            exe: self.exe.clone(),
            source,
        };
        let (stdout, stderr) = self.log_stdio().map_err(spawn_err)?;
        let mut child = Command::new(&self.exe)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let payload = HandshakePayload {
            port: callback.port(),
            id,
        };
        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(payload.to_string().as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            match written {
                Ok(()) => {}
                // exited before reading; the monitor reports it
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(id, exe = %self.exe.display(), "plugin closed stdin early");
                }
                Err(err) => {
                    let _ = child.kill().await;
                    return Err(spawn_err(err));
                }
            }
        }
        info!(id, exe = %self.exe.display(), pid = ?child.id(), "plugin started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(monitor(child, id, self.exe.clone(), stop_rx, done_tx, on_stop));
        *running = Some(Running { stop_tx, done_rx });
        Ok(())
    }

    async fn stop(&self) -> Result<(), RouterError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        // the monitor may already be gone if the process exited on its own
        let _ = running.stop_tx.send(());
        let _ = running.done_rx.await;
        Ok(())
    }
}

async fn monitor(
    mut child: Child,
    id: u32,
    exe: PathBuf,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
    on_stop: OnStop,
) {
    let (stopped, status) = tokio::select! {
        status = child.wait() => (false, status),
        Ok(()) = &mut stop_rx => {
            if let Err(err) = child.start_kill() {
                warn!(id, exe = %exe.display(), "kill failed: {err}");
            }
            (true, child.wait().await)
        }
    };

    let err = match status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(anyhow!("plugin exited: {status}")),
        Err(err) => Some(anyhow!(err).context("waiting for plugin")),
    };
    debug!(id, exe = %exe.display(), stopped, "plugin process ended");

    on_stop(!stopped, err);
    let _ = done_tx.send(());
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{os::unix::fs::PermissionsExt, time::Duration};
    use tokio::sync::mpsc;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn on_stop_channel() -> (OnStop, mpsc::UnboundedReceiver<(bool, bool)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: OnStop = Box::new(move |restart, err| {
            let _ = tx.send((restart, err.is_some()));
        });
        (cb, rx)
    }

    fn callback() -> SocketAddr {
        "127.0.0.1:4321".parse().unwrap()
    }

    #[tokio::test]
    async fn writes_handshake_payload_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("payload");
        let exe = script(dir.path(), "plugin", &format!("cat > {}", out.display()));

        let factory = CmdRunnerFactory::new(None);
        let runner = factory.new_runner(&exe).unwrap();
        let (cb, mut rx) = on_stop_channel();
        runner.start(9, callback(), cb).await.unwrap();

        let (restart, failed) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(restart);
        assert!(!failed);
        assert_eq!(fs::read_to_string(out).unwrap(), "4321 9");
    }

    #[tokio::test]
    async fn crash_asks_for_restart() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "crasher", "echo boom >&2; exit 3");

        let runner = CmdRunnerFactory::new(None).new_runner(&exe).unwrap();
        let (cb, mut rx) = on_stop_channel();
        runner.start(1, callback(), cb).await.unwrap();

        let (restart, failed) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(restart);
        assert!(failed);

        let log = fs::read_to_string(dir.path().join("crasher.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn stop_is_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let exe = script(dir.path(), "sleeper", "exec sleep 30");

        let factory = CmdRunnerFactory::new(Some(logs.clone()));
        let runner = factory.new_runner(&exe).unwrap();
        let (cb, mut rx) = on_stop_channel();
        runner.start(2, callback(), cb).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner.stop())
            .await
            .unwrap()
            .unwrap();
        let (restart, _) = rx.recv().await.unwrap();
        assert!(!restart);
        assert!(logs.join("sleeper.log").exists());

        // second stop is a no-op
        runner.stop().await.unwrap();
    }

    #[test]
    fn missing_executable_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = CmdRunnerFactory::new(None)
            .new_runner(&dir.path().join("nope"))
            .err()
            .unwrap();
        assert!(matches!(err, RouterError::Spawn { .. }));
    }

    #[test]
    fn log_path_follows_log_dir() {
        let f = CmdRunnerFactory::new(None);
        assert_eq!(f.log_path(Path::new("plugins/echo")), PathBuf::from("plugins/echo.log"));
        let f = CmdRunnerFactory::new(Some(PathBuf::from("logs")));
        assert_eq!(f.log_path(Path::new("plugins/echo")), PathBuf::from("logs/echo.log"));
    }
}
