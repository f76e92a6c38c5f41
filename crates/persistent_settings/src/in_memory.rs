use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::service::SettingsService;

/// MemorySettingsService: keeps settings documents in a map instead of files.
///
/// Useful for hosts that persist elsewhere and for tests: every write and
/// delete is recorded so callers can check what the engine did.
pub struct MemorySettingsService {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    writes: Mutex<Vec<PathBuf>>,
    deletes: Mutex<Vec<PathBuf>>,
    failing_writes: AtomicUsize,
    supports_all_users: bool,
    use_file_watchers: bool,
    raise_changed_event_after_writing: bool,
}

impl Default for MemorySettingsService {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            failing_writes: AtomicUsize::new(0),
            supports_all_users: true,
            use_file_watchers: false,
            raise_changed_event_after_writing: false,
        }
    }
}

impl MemorySettingsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_all_users(mut self, supported: bool) -> Self {
        self.supports_all_users = supported;
        self
    }

    pub fn with_raise_changed_event_after_writing(mut self, raise: bool) -> Self {
        self.raise_changed_event_after_writing = raise;
        self
    }

    /// Seeds a document as if it had been written earlier.
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.into(), bytes.into());
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn contents_string(&self, path: &Path) -> Option<String> {
        self.contents(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    }

    /// Paths written so far, in order.
    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn deletes(&self) -> Vec<PathBuf> {
        self.deletes.lock().clone()
    }

    /// Makes the next `count` writes fail without storing anything.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
}

impl SettingsService for MemorySettingsService {
    fn read_settings(&self, path: &Path) -> Option<Vec<u8>> {
        self.contents(path)
    }

    fn write_settings(
        &self,
        shutting_down: bool,
        bytes: &[u8],
        path: &Path,
        on_writing: &mut dyn FnMut(bool, bool),
    ) -> bool {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return false;
        }
        on_writing(shutting_down, false);
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
        self.writes.lock().push(path.to_path_buf());
        on_writing(shutting_down, true);
        true
    }

    fn delete_settings_file(&self, path: &Path) {
        if self.files.lock().remove(path).is_some() {
            self.deletes.lock().push(path.to_path_buf());
        }
    }

    fn supports_all_users(&self) -> bool {
        self.supports_all_users
    }

    fn use_file_watchers(&self) -> bool {
        self.use_file_watchers
    }

    fn raise_changed_event_after_writing(&self) -> bool {
        self.raise_changed_event_after_writing
    }
}
