use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, bail};
use futures::future::join_all;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

use crate::plugin::{Control, PluginRecord};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Finds plugin executables in a directory and keeps the supervisor in
/// sync with it.
#[derive(Debug, Clone)]
pub struct Loader {
    dir: PathBuf,
}

impl Loader {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            bail!("plugin directory {} does not exist", dir.display());
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Plugin candidates, sorted. Names differing only in case count once.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_plugin(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen = HashSet::new();
        paths.retain(|path| {
            let key = path.file_name().map(|n| n.to_string_lossy().to_lowercase());
            if seen.insert(key) {
                true
            } else {
                warn!(path = %path.display(), "skipping plugin with a duplicate name");
                false
            }
        });
        Ok(paths)
    }

    /// Runs every candidate concurrently. Failures are logged, not fatal.
    pub async fn load_all(&self, control: &Arc<Control>) -> Vec<Arc<PluginRecord>> {
        let paths = match self.scan() {
            Ok(paths) => paths,
            Err(err) => {
                error!(dir = %self.dir.display(), "failed to scan plugin directory: {err}");
                return Vec::new();
            }
        };

        let results = join_all(paths.iter().map(|path| control.run(path))).await;
        let mut loaded = Vec::new();
        for (path, result) in paths.iter().zip(results) {
            match result {
                Ok(record) => loaded.push(record),
                Err(err) => error!(path = %path.display(), "failed to load plugin: {err}"),
            }
        }
        info!(loaded = loaded.len(), found = paths.len(), "plugins loaded");
        loaded
    }

    /// Polls the directory: new executables are run, replaced ones are
    /// restarted and removed ones are stopped.
    pub fn watch(&self, control: Arc<Control>) -> Result<PluginWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening any more once the task is gone
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(POLL_INTERVAL)
                .with_compare_contents(true),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => dispatch(&control, event),
                    Err(err) => warn!("plugin watcher error: {err}"),
                }
            }
        });
        info!(dir = %self.dir.display(), "watching plugin directory");

        Ok(PluginWatcher {
            _watcher: watcher,
            task,
        })
    }
}

fn dispatch(control: &Arc<Control>, event: Event) {
    for path in event.paths {
        let control = control.clone();
        match event.kind {
            EventKind::Create(CreateKind::Any | CreateKind::File) if is_plugin(&path) => {
                tokio::spawn(async move {
                    if let Err(err) = control.run(&path).await {
                        error!(path = %path.display(), "failed to load new plugin: {err}");
                    }
                });
            }
            EventKind::Modify(ModifyKind::Data(_)) if is_plugin(&path) => {
                tokio::spawn(async move {
                    if let Err(err) = control.stop_exe(&path).await {
                        warn!(path = %path.display(), "failed to stop replaced plugin: {err}");
                    }
                    if let Err(err) = control.run(&path).await {
                        error!(path = %path.display(), "failed to reload plugin: {err}");
                    }
                });
            }
            EventKind::Remove(_) if !is_ignored(&path) => {
                tokio::spawn(async move {
                    if let Err(err) = control.stop_exe(&path).await {
                        warn!(path = %path.display(), "failed to stop removed plugin: {err}");
                    }
                });
            }
            _ => {}
        }
    }
}

/// Log files and dotfiles are never plugins.
fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.starts_with('.')
        || path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("log"))
}

fn is_plugin(path: &Path) -> bool {
    if is_ignored(path) {
        return false;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Keeps the directory watch alive; dropping it stops watching.
pub struct PluginWatcher {
    _watcher: PollWatcher,
    task: JoinHandle<()>,
}

impl PluginWatcher {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Loader::new(dir.path().join("nope")).is_err());
    }

    #[test]
    fn scan_skips_logs_dotfiles_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let echo = touch(dir.path(), "echo");
        let add = touch(dir.path(), "add");
        touch(dir.path(), "echo.log");
        touch(dir.path(), ".hidden");
        fs::create_dir(dir.path().join("sub")).unwrap();

        let loader = Loader::new(dir.path()).unwrap();
        assert_eq!(loader.scan().unwrap(), vec![add, echo]);
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), "hi").unwrap();
        let echo = touch(dir.path(), "echo");

        let loader = Loader::new(dir.path()).unwrap();
        assert_eq!(loader.scan().unwrap(), vec![echo]);
    }

    #[test]
    fn scan_dedupes_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Echo");
        touch(dir.path(), "echo");
        // case-insensitive filesystems collapse these on their own
        let loader = Loader::new(dir.path()).unwrap();
        assert_eq!(loader.scan().unwrap().len(), 1);
    }
}
