//! Runs a command and appends everything it prints to a log, one stamped
//! line at a time:
//!
//! ```text
//! [2024-05-01 10:00:00] flying: started with command=plugin_echo, args=[], CWD=/srv
//! [2024-05-01 10:00:01] [plugin_echo] listening
//! [2024-05-01 10:00:02] [plugin_echo] [error] something went wrong
//! ```

use std::{
    env,
    fmt::Display,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

#[cfg(windows)]
const NL: &str = "\r\n";
#[cfg(not(windows))]
const NL: &str = "\n";

#[derive(Debug, Error)]
pub enum FlyingError {
    #[error("flying: command already started")]
    AlreadyStarted,

    #[error("flying: empty command")]
    EmptyCommand,

    #[error("flying: command is not running")]
    NotRunning,

    #[error("flying: executable {0:?} not found")]
    NotFound(String),

    #[error("flying: {0}")]
    Exit(ExitStatus),

    #[error("flying: {0}")]
    Io(#[from] io::Error),
}

/// Sink shared between the client and its output pumps.
pub type SharedLog = Arc<Mutex<Box<dyn Write + Send>>>;

/// Per-OS way of asking a child process to stop.
pub trait ProcessControl {
    /// SIGINT on unix; elsewhere the process is killed.
    fn interrupt(&mut self) -> io::Result<()>;
}

impl ProcessControl for Child {
    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        // already reaped
        let Some(pid) = self.id() else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> io::Result<()> {
        self.start_kill()
    }
}

/// Writes to every inner writer in turn.
pub struct MultiWriter(Vec<Box<dyn Write + Send>>);

impl MultiWriter {
    pub fn new(writers: Vec<Box<dyn Write + Send>>) -> Self {
        Self(writers)
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in &mut self.0 {
            w.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.0 {
            w.flush()?;
        }
        Ok(())
    }
}

pub struct Client {
    log: SharedLog,
    env: Vec<(String, String)>,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn new<W: Write + Send + 'static>(log: W) -> Self {
        Self {
            log: Arc::new(Mutex::new(Box::new(log))),
            env: Vec::new(),
            child: None,
            pumps: Vec::new(),
        }
    }

    /// Extra variable for the child, on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub async fn start(&mut self, cmd: &[String]) -> Result<(), FlyingError> {
        if self.child.is_some() {
            return Err(FlyingError::AlreadyStarted);
        }
        let (program, args) = cmd.split_first().ok_or(FlyingError::EmptyCommand)?;
        let name = base_name(program);
        let cwd = env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|_| "<nil>".to_string());
        self.printf(format_args!(
            "flying: started with command={name}, args=[{}], CWD={cwd}",
            args.join(", ")
        ));

        let path = match resolve(program) {
            Ok(path) => path,
            Err(err) => return Err(self.exit(err)),
        };
        self.printf(format_args!("flying: {name} is {}", path.display()));

        let spawned = Command::new(&path)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => return Err(self.exit(err.into())),
        };

        if let Some(stdout) = child.stdout.take() {
            self.pumps
                .push(tokio::spawn(pump(stdout, self.log.clone(), format!("[{name}] "))));
        }
        if let Some(stderr) = child.stderr.take() {
            self.pumps.push(tokio::spawn(pump(
                stderr,
                self.log.clone(),
                format!("[{name}] [error] "),
            )));
        }
        self.child = Some(child);
        Ok(())
    }

    pub fn interrupt(&mut self) -> Result<(), FlyingError> {
        let child = self.child.as_mut().ok_or(FlyingError::NotRunning)?;
        Ok(child.interrupt()?)
    }

    /// Waits for the command and drains its output. A non-zero exit is an
    /// error.
    pub async fn wait(&mut self) -> Result<(), FlyingError> {
        let child = self.child.as_mut().ok_or(FlyingError::NotRunning)?;
        let status = child.wait().await;
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
        self.child = None;

        match status {
            Ok(status) if status.success() => {
                self.printf("flying: exited successfully");
                Ok(())
            }
            Ok(status) => Err(self.exit(FlyingError::Exit(status))),
            Err(err) => Err(self.exit(err.into())),
        }
    }

    /// Starts `cmd`, turns Ctrl-C into [`Client::interrupt`] and waits.
    pub async fn run(&mut self, cmd: &[String]) -> Result<(), FlyingError> {
        self.start(cmd).await?;

        let mut interrupt_err = None;
        loop {
            let child = self.child.as_mut().ok_or(FlyingError::NotRunning)?;
            tokio::select! {
                // the status is kept by the child for the final wait
                _ = child.wait() => break,
                signal = tokio::signal::ctrl_c() => {
                    let sent = signal.map_err(FlyingError::from).and_then(|()| self.interrupt());
                    if let Err(err) = sent {
                        interrupt_err = Some(err);
                    }
                }
            }
        }

        let result = self.wait().await;
        match interrupt_err {
            Some(err) if result.is_ok() => Err(err),
            _ => result,
        }
    }

    fn exit(&self, err: FlyingError) -> FlyingError {
        self.printf(format_args!("flying: failed with: {err}"));
        err
    }

    fn printf(&self, msg: impl Display) {
        write_line(&self.log, &format!("[{}] {msg}", now()));
    }
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn base_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn write_line(log: &SharedLog, line: &str) {
    let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = log
        .write_all(line.as_bytes())
        .and_then(|()| log.write_all(NL.as_bytes()))
        .and_then(|()| log.flush());
}

/// Copies `reader` into the log line by line, stamping each line.
async fn pump<R: AsyncRead + Unpin>(reader: R, log: SharedLog, tag: String) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                write_line(&log, &format!("[{}] {tag}{line}", now()));
            }
        }
    }
}

/// Finds `program` the way a shell would: paths are taken as given, bare
/// names are looked up on `PATH`.
fn resolve(program: &str) -> Result<PathBuf, FlyingError> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        if candidate.is_file() {
            return Ok(std::path::absolute(candidate).unwrap_or_else(|_| candidate.to_path_buf()));
        }
        return Err(FlyingError::NotFound(program.to_string()));
    }

    let paths = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&paths) {
        let path = dir.join(program);
        if path.is_file() {
            return Ok(std::path::absolute(&path).unwrap_or(path));
        }
        if cfg!(windows) {
            let exe = path.with_extension("exe");
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }
    Err(FlyingError::NotFound(program.to_string()))
}
