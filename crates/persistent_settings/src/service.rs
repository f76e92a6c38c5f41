//! Storage backends for settings documents.
//!
//! The engine only talks to [`SettingsService`]. [`FileSettingsService`] is the
//! default backend: XML files written to a temporary file and renamed over the
//! target under an exclusive `fs2` lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::value::SettingValue;

/// Platform storage for settings documents.
pub trait SettingsService: Send + Sync {
    /// Bytes of the document at `path`, `None` when there is nothing to read.
    fn read_settings(&self, path: &Path) -> Option<Vec<u8>>;

    /// Stores `bytes` at `path`. `on_writing(shutting_down, done)` is called
    /// right before the target is replaced (`done == false`) and once the write
    /// finished (`done == true`).
    fn write_settings(
        &self,
        shutting_down: bool,
        bytes: &[u8],
        path: &Path,
        on_writing: &mut dyn FnMut(bool, bool),
    ) -> bool;

    fn delete_settings_file(&self, path: &Path);

    fn supports_all_users(&self) -> bool {
        true
    }

    fn use_file_watchers(&self) -> bool {
        true
    }

    fn raise_changed_event_after_writing(&self) -> bool {
        false
    }

    /// Called once for every newly created cell; may seed its current value.
    fn on_add_setting_value(&self, _value: &mut SettingValue) {}

    fn delete_item(&self, _node_key: Option<&str>, _key: &str) {}

    fn delete_child(&self, _node_key: Option<&str>, _key: &str) {}
}

/// Keeps track of failed settings writes per file.
pub trait SettingsWriteErrorService: Send + Sync {
    /// Counts a success, but only for files that already failed once.
    fn log_success(&self, file: &Path);

    fn log_failure(&self, file: &Path, error: &anyhow::Error);

    /// `(successes, failures)` since the first failure.
    fn error_info(&self, file: &Path) -> (u32, u32);
}

#[derive(Default)]
pub struct CountingWriteErrorService {
    counters: Mutex<HashMap<PathBuf, (u32, u32)>>,
}

impl SettingsWriteErrorService for CountingWriteErrorService {
    fn log_success(&self, file: &Path) {
        if let Some((successes, _)) = self.counters.lock().get_mut(file) {
            *successes += 1;
        }
    }

    fn log_failure(&self, file: &Path, error: &anyhow::Error) {
        debug!(path = %file.display(), "Recording settings write failure: {:#}", error);
        self.counters
            .lock()
            .entry(file.to_path_buf())
            .or_insert((0, 0))
            .1 += 1;
    }

    fn error_info(&self, file: &Path) -> (u32, u32) {
        self.counters.lock().get(file).copied().unwrap_or((0, 0))
    }
}

/// File system backed settings service.
pub struct FileSettingsService {
    config: ServiceConfig,
    write_errors: Arc<dyn SettingsWriteErrorService>,
}

impl Default for FileSettingsService {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

impl FileSettingsService {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            write_errors: Arc::new(CountingWriteErrorService::default()),
        }
    }

    pub fn with_write_error_service(mut self, service: Arc<dyn SettingsWriteErrorService>) -> Self {
        self.write_errors = service;
        self
    }

    pub fn write_error_service(&self) -> &Arc<dyn SettingsWriteErrorService> {
        &self.write_errors
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Writes `bytes` to `settings-<uuid>.tmp.xml` next to `target`.
    fn write_temp_file(
        &self,
        shutting_down: bool,
        folder: &Path,
        target: &Path,
        bytes: &[u8],
    ) -> Option<PathBuf> {
        let temp = folder.join(format!("settings-{}.tmp.xml", Uuid::new_v4()));
        let result = fs::create_dir_all(folder).and_then(|_| {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()
        });

        match result {
            Ok(()) => {
                self.write_errors.log_success(target);
                Some(temp)
            }
            Err(err) => {
                let err = if err.kind() == io::ErrorKind::PermissionDenied {
                    self.access_denied_error(err, folder, target)
                } else {
                    anyhow::Error::new(err).context(format!(
                        "Failed to write temporary settings file in {}",
                        folder.display()
                    ))
                };
                if shutting_down {
                    error!("Settings write failed during shutdown: {:#}", err);
                } else {
                    warn!("Settings write failed: {:#}", err);
                }
                self.write_errors.log_failure(target, &err);
                None
            }
        }
    }

    fn access_denied_error(&self, err: io::Error, folder: &Path, target: &Path) -> anyhow::Error {
        let (successes, failures) = self.write_errors.error_info(target);
        let rate = failure_rate(successes, failures)
            .map(|rate| format!("{rate:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        anyhow::Error::new(err)
            .context(directory_access_report(folder))
            .context(format!(
                "Settings file: {}\nFailure rate: {}",
                report_file_name(target),
                rate
            ))
    }

    /// Renames the temporary file over `target`. A reader holding the old
    /// file keeps its contents; the target is never truncated in place.
    fn replace_target(temp: &Path, target: &Path) -> io::Result<()> {
        let existing = match File::open(target) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        if let Some(file) = &existing {
            FileExt::try_lock_exclusive(file)?;
        }
        let result = fs::rename(temp, target);
        if let Some(file) = &existing {
            if let Err(err) = FileExt::unlock(file) {
                debug!(path = %target.display(), "Failed to unlock replaced settings file: {}", err);
            }
        }
        result?;
        sync_folder(target);
        Ok(())
    }

    fn remove_temp_file(temp: &Path) {
        if let Err(err) = fs::remove_file(temp) {
            if err.kind() == io::ErrorKind::PermissionDenied {
                if let Err(err) = clear_read_only(temp).and_then(|_| fs::remove_file(temp)) {
                    warn!(path = %temp.display(), "Failed to remove temporary settings file: {}", err);
                }
            } else {
                warn!(path = %temp.display(), "Failed to remove temporary settings file: {}", err);
            }
        }
    }
}

impl SettingsService for FileSettingsService {
    fn read_settings(&self, path: &Path) -> Option<Vec<u8>> {
        if !path.exists() {
            return None;
        }
        let mut retried = false;
        loop {
            match read_shared(path) {
                Ok(bytes) => return Some(bytes),
                Err(err) if err.kind() != io::ErrorKind::NotFound && !retried => {
                    debug!(path = %path.display(), "Settings file busy, retrying: {}", err);
                    retried = true;
                    thread::sleep(self.config.read_retry_delay());
                }
                Err(err) => {
                    warn!(path = %path.display(), "Failed to read settings file: {}", err);
                    return None;
                }
            }
        }
    }

    fn write_settings(
        &self,
        shutting_down: bool,
        bytes: &[u8],
        path: &Path,
        on_writing: &mut dyn FnMut(bool, bool),
    ) -> bool {
        let Some(folder) = path.parent() else {
            warn!(path = %path.display(), "Settings path has no parent folder");
            return false;
        };
        let Some(temp) = self.write_temp_file(shutting_down, folder, path, bytes) else {
            return false;
        };

        on_writing(shutting_down, false);

        let attempts = self.config.write_retry_count.max(1);
        let mut written = false;
        for attempt in 1..=attempts {
            match Self::replace_target(&temp, path) {
                Ok(()) => {
                    written = true;
                    break;
                }
                Err(err) => {
                    debug!(attempt, path = %path.display(), "Settings replace failed: {}", err);
                    thread::sleep(self.config.write_retry_delay());
                }
            }
        }
        if !written {
            warn!(path = %path.display(), "Giving up writing settings after {} attempts", attempts);
            Self::remove_temp_file(&temp);
        }
        on_writing(shutting_down, true);
        written
    }

    fn delete_settings_file(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        match delete_file_and_directory(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied && path.exists() => {
                if let Err(err) = clear_read_only(path).and_then(|_| delete_file_and_directory(path)) {
                    warn!(path = %path.display(), "Failed to delete settings file: {}", err);
                }
            }
            Err(err) => warn!(path = %path.display(), "Failed to delete settings file: {}", err),
        }
    }

    fn supports_all_users(&self) -> bool {
        self.config.supports_all_users
    }

    fn use_file_watchers(&self) -> bool {
        self.config.use_file_watchers
    }

    fn raise_changed_event_after_writing(&self) -> bool {
        self.config.raise_changed_event_after_writing
    }
}

/// Flushes the folder entry of a renamed file where the platform allows it.
fn sync_folder(path: &Path) {
    let Some(folder) = path.parent() else {
        return;
    };
    if let Err(err) = File::open(folder).and_then(|dir| dir.sync_all()) {
        debug!(folder = %folder.display(), "Could not sync settings folder: {}", err);
    }
}

fn read_shared(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    FileExt::try_lock_shared(&file)?;
    let mut bytes = Vec::new();
    let result = file.read_to_end(&mut bytes);
    FileExt::unlock(&file)?;
    result.map(|_| bytes)
}

/// Removes the file, then up to two parent folders that are left empty.
fn delete_file_and_directory(path: &Path) -> io::Result<()> {
    fs::remove_file(path)?;
    let mut folder = path.parent();
    for _ in 0..2 {
        match folder {
            Some(dir) if delete_directory_if_empty(dir) => folder = dir.parent(),
            _ => break,
        }
    }
    Ok(())
}

pub fn delete_directory_if_empty(dir: &Path) -> bool {
    let is_empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    if !is_empty {
        return false;
    }
    match fs::remove_dir(dir) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %dir.display(), "Failed to remove empty settings folder: {}", err);
            false
        }
    }
}

#[allow(clippy::permissions_set_readonly_false)]
fn clear_read_only(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
}

/// `folder/parent/file` of a settings path, enough to tell whose file it is.
pub fn report_file_name(path: &Path) -> String {
    let name_of = |p: Option<&Path>| {
        p.and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    let folder = path.parent();
    let parent = folder.and_then(Path::parent);
    [name_of(folder), name_of(parent), name_of(Some(path))]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Failures per success, rounded down to the nearest 5 %.
pub fn failure_rate(successes: u32, failures: u32) -> Option<f64> {
    if successes == 0 {
        return None;
    }
    let ratio = failures as f64 / successes as f64;
    let rounded = (ratio / 0.05).floor() * 0.05;
    Some((rounded * 100.0).round() / 100.0)
}

fn directory_access_report(folder: &Path) -> String {
    match fs::metadata(folder) {
        Ok(meta) => {
            let mut report = format!(
                "Access rights for {}: exists, read_only={}",
                folder.display(),
                meta.permissions().readonly()
            );
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                report.push_str(&format!(", mode={:o}", meta.permissions().mode() & 0o7777));
            }
            report
        }
        Err(err) => format!("Access rights for {}: unavailable ({})", folder.display(), err),
    }
}
