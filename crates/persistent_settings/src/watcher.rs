//! Detects settings files rewritten by another process.
//!
//! The settings folder is watched non-recursively. When it does not exist yet
//! its parent is watched instead, until the folder shows up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, SettingsError};
use crate::scheduler::{DebouncedTask, TaskMode, TaskOutcome};

struct WatcherShared {
    file: PathBuf,
    folder: PathBuf,
    parent: Option<PathBuf>,
    watching_folder: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: DebouncedTask,
}

/// Watches one settings file and calls back after a quiet period following
/// the last create, modify or remove event for it.
pub struct SettingsFileWatcher {
    shared: Arc<WatcherShared>,
}

impl std::fmt::Debug for SettingsFileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsFileWatcher")
            .field("file", &self.shared.file)
            .field("watching_folder", &self.is_watching_folder())
            .finish()
    }
}

impl SettingsFileWatcher {
    /// Starts watching `file`. Returns `None` when neither its folder nor the
    /// folder's parent exists.
    pub fn attach<F>(name: &str, file: &Path, delay: Duration, on_changed: F) -> Result<Option<Self>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let Some(folder) = file.parent().map(Path::to_path_buf) else {
            return Ok(None);
        };
        let parent = folder.parent().map(Path::to_path_buf);
        let folder_exists = folder.is_dir();
        let parent_exists = parent.as_deref().is_some_and(Path::is_dir);
        if !folder_exists && !parent_exists {
            debug!(file = %file.display(), "Settings folder and its parent are missing; not watching");
            return Ok(None);
        }

        let task = DebouncedTask::spawn(format!("watcher-{name}"), delay, TaskMode::OneShot, move || {
            on_changed();
            TaskOutcome::Done
        })?;

        let shared = Arc::new(WatcherShared {
            file: file.to_path_buf(),
            folder,
            parent,
            watching_folder: AtomicBool::new(false),
            watcher: Mutex::new(None),
            task,
        });

        let weak = Arc::downgrade(&shared);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match res {
                    Ok(event) => WatcherShared::handle_event(&shared, &event),
                    Err(err) => warn!("Settings watcher error: {}", err),
                }
            },
            Config::default(),
        )
        .map_err(watch_error)?;

        if folder_exists {
            watcher
                .watch(&shared.folder, RecursiveMode::NonRecursive)
                .map_err(watch_error)?;
            shared.watching_folder.store(true, Ordering::SeqCst);
            debug!(folder = %shared.folder.display(), "Watching settings folder");
        } else if let Some(parent) = &shared.parent {
            watcher
                .watch(parent, RecursiveMode::NonRecursive)
                .map_err(watch_error)?;
            debug!(parent = %parent.display(), "Settings folder missing; watching its parent");
        }
        *shared.watcher.lock() = Some(watcher);

        Ok(Some(Self { shared }))
    }

    pub fn file(&self) -> &Path {
        &self.shared.file
    }

    pub fn is_watching_folder(&self) -> bool {
        self.shared.watching_folder.load(Ordering::SeqCst)
    }

    /// Stops watching and drops any countdown in flight.
    pub fn detach(&self) {
        self.shared.task.cancel();
        self.shared.watcher.lock().take();
    }
}

impl Drop for SettingsFileWatcher {
    fn drop(&mut self) {
        self.detach();
    }
}

impl WatcherShared {
    fn handle_event(shared: &Arc<Self>, event: &Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        if event.paths.iter().any(|path| shared.is_settings_file(path)) {
            shared.task.trigger();
        }

        let folder_created = matches!(event.kind, EventKind::Create(_))
            && !shared.watching_folder.load(Ordering::SeqCst)
            && event.paths.iter().any(|path| same_path(path, &shared.folder));
        if folder_created {
            // Re-targeting from inside the notify callback would block its event loop.
            let weak = Arc::downgrade(shared);
            thread::spawn(move || switch_to_folder(weak));
        }
    }

    fn is_settings_file(&self, path: &Path) -> bool {
        if path == self.file {
            return true;
        }
        path.file_name() == self.file.file_name()
            && path
                .parent()
                .is_some_and(|parent| same_path(parent, &self.folder))
    }
}

fn switch_to_folder(weak: Weak<WatcherShared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut guard = shared.watcher.lock();
    let Some(watcher) = guard.as_mut() else {
        return;
    };
    if shared.watching_folder.load(Ordering::SeqCst) {
        return;
    }
    if let Err(err) = watcher.watch(&shared.folder, RecursiveMode::NonRecursive) {
        warn!("Failed to watch settings folder {}: {}", shared.folder.display(), err);
        return;
    }
    if let Some(parent) = &shared.parent {
        if let Err(err) = watcher.unwatch(parent) {
            debug!(parent = %parent.display(), "Failed to stop watching settings parent folder: {}", err);
        }
    }
    shared.watching_folder.store(true, Ordering::SeqCst);
    info!(folder = %shared.folder.display(), "Settings folder appeared; watching it");
    drop(guard);

    // The file may have been written before the folder watch was in place.
    if shared.file.exists() {
        shared.task.trigger();
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn watch_error(err: notify::Error) -> SettingsError {
    SettingsError::Other(format!("file watcher: {err}"))
}
