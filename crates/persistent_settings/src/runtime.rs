//! Process-wide owner of all plug-in settings.
//!
//! The runtime caches one [`PluginSettings`] per plug-in, collects the ones
//! with unsaved changes, writes them after a quiet period once the host is
//! idle and reports settings files changed on disk to its subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use paths::{PathContext, SettingsOwner};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::errors::{Result, SettingsError};
use crate::plugin::{PluginSettings, SettingsContext, SettingsEvents};
use crate::scheduler::{DebouncedTask, TaskMode, TaskOutcome, WriteBackState};
use crate::service::{FileSettingsService, SettingsService};

/// Returns true while the host runs a foreground operation (a command).
pub type ForegroundBusy = Arc<dyn Fn() -> bool + Send + Sync>;

pub type Subscriber = Arc<dyn Fn(&SettingsSaved) + Send + Sync>;

/// Identifies a plug-in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginDescriptor {
    pub id: Uuid,
    pub name: Option<String>,
}

impl PluginDescriptor {
    pub fn new(id: Uuid, name: Option<&str>) -> Self {
        Self {
            id,
            name: name.map(str::to_string),
        }
    }
}

/// Queued notice that a watched settings file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsSavedEvent {
    pub plugin_id: Uuid,
    pub saved_by_this_process: bool,
}

/// What subscribers receive for a changed settings file.
#[derive(Debug, Clone)]
pub struct SettingsSaved {
    pub plugin_id: Uuid,
    pub saved_by_this_process: bool,
    /// The plug-in has changes that are about to be written again; the file
    /// was not re-read.
    pub dirty: bool,
    /// The settings as they were before the file was merged in.
    pub previous: Option<Arc<PluginSettings>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    ShuttingDown,
}

#[derive(Default)]
struct Cache {
    by_id: HashMap<Uuid, Arc<PluginSettings>>,
    by_owner: HashMap<SettingsOwner, Uuid>,
}

#[derive(Default)]
struct PendingWrites {
    state: WriteBackState,
    settings: Vec<Arc<PluginSettings>>,
}

struct RuntimeShared {
    context: SettingsContext,
    config: RuntimeConfig,
    foreground_busy: ForegroundBusy,
    lifecycle: Mutex<Lifecycle>,
    cache: Mutex<Cache>,
    pending: Mutex<PendingWrites>,
    events: Mutex<Vec<SettingsSavedEvent>>,
    subscribers: Mutex<Vec<Subscriber>>,
    write_back: Mutex<Option<DebouncedTask>>,
}

/// Builder for [`SettingsRuntime`].
pub struct SettingsRuntimeBuilder {
    paths: Option<PathContext>,
    service: Option<Arc<dyn SettingsService>>,
    config: RuntimeConfig,
    foreground_busy: Option<ForegroundBusy>,
}

impl Default for SettingsRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            paths: None,
            service: None,
            config: RuntimeConfig::default(),
            foreground_busy: None,
        }
    }

    pub fn with_paths(mut self, paths: PathContext) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Storage backend; a [`FileSettingsService`] built from the config when unset.
    pub fn with_service(mut self, service: Arc<dyn SettingsService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_foreground_busy<F>(mut self, busy: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.foreground_busy = Some(Arc::new(busy));
        self
    }

    pub fn build(self) -> Result<SettingsRuntime> {
        let paths = self
            .paths
            .ok_or_else(|| SettingsError::Config("settings paths not specified".to_string()))?;
        let config = self.config;
        let service = self
            .service
            .unwrap_or_else(|| Arc::new(FileSettingsService::new(config.service.clone())));
        let foreground_busy = self.foreground_busy.unwrap_or_else(|| Arc::new(|| false));

        let shared = Arc::new_cyclic(|weak: &Weak<RuntimeShared>| {
            let events: Weak<dyn SettingsEvents> = weak.clone();
            RuntimeShared {
                context: SettingsContext::new(paths, service)
                    .with_scheme(config.scheme.clone())
                    .with_watcher_delay(config.scheduler.watcher_delay())
                    .with_events(events),
                config: config.clone(),
                foreground_busy,
                lifecycle: Mutex::new(Lifecycle::Starting),
                cache: Mutex::new(Cache::default()),
                pending: Mutex::new(PendingWrites::default()),
                events: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                write_back: Mutex::new(None),
            }
        });

        let weak = Arc::downgrade(&shared);
        let task = DebouncedTask::spawn(
            "write-back",
            config.scheduler.write_back_delay(),
            TaskMode::Periodic,
            move || match weak.upgrade() {
                Some(shared) => shared.on_write_back_timer(),
                None => TaskOutcome::Done,
            },
        )?;
        *shared.write_back.lock() = Some(task);

        debug!(
            scheme = ?shared.context.scheme,
            user_root = %shared.context.paths.root(paths::SettingsTier::CurrentUser).display(),
            "Settings runtime created"
        );
        Ok(SettingsRuntime { shared })
    }
}

/// Handle to the settings runtime. Clones share the same state.
#[derive(Clone)]
pub struct SettingsRuntime {
    shared: Arc<RuntimeShared>,
}

impl SettingsRuntime {
    pub fn builder() -> SettingsRuntimeBuilder {
        SettingsRuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn paths(&self) -> &PathContext {
        &self.shared.context.paths
    }

    pub fn service(&self) -> &Arc<dyn SettingsService> {
        &self.shared.context.service
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.lock()
    }

    /// Startup finished; changes are tracked from now on.
    pub fn mark_started(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if *lifecycle == Lifecycle::Starting {
            *lifecycle = Lifecycle::Running;
            info!("Settings runtime running");
        }
    }

    /// Settings of a plug-in, created (but not read) on first request.
    pub fn plugin(&self, descriptor: &PluginDescriptor) -> Arc<PluginSettings> {
        let mut cache = self.shared.cache.lock();
        if let Some(settings) = cache.by_id.get(&descriptor.id) {
            return settings.clone();
        }

        let owner = if descriptor.id == self.shared.config.host_id {
            SettingsOwner::Host
        } else {
            SettingsOwner::plugin(descriptor.id.to_string(), descriptor.name.as_deref())
        };
        let settings = PluginSettings::load(
            self.shared.context.clone(),
            descriptor.id,
            owner.clone(),
            true,
        );
        cache.by_owner.insert(owner, descriptor.id);
        cache.by_id.insert(descriptor.id, settings.clone());
        debug!(plugin = %descriptor.id, "Created plug-in settings");
        settings
    }

    pub fn plugin_by_id(&self, id: Uuid) -> Option<Arc<PluginSettings>> {
        self.shared.cache.lock().by_id.get(&id).cloned()
    }

    pub fn plugin_by_owner(&self, owner: &SettingsOwner) -> Option<Arc<PluginSettings>> {
        let cache = self.shared.cache.lock();
        cache
            .by_owner
            .get(owner)
            .and_then(|id| cache.by_id.get(id))
            .cloned()
    }

    /// Settings of the host application itself.
    pub fn host_settings(&self) -> Arc<PluginSettings> {
        self.plugin(&PluginDescriptor::new(self.shared.config.host_id, None))
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&SettingsSaved) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().push(Arc::new(subscriber));
    }

    pub fn write_back_state(&self) -> WriteBackState {
        self.shared.pending.lock().state
    }

    /// Plug-ins waiting to be written.
    pub fn pending_plugins(&self) -> Vec<Uuid> {
        self.shared
            .pending
            .lock()
            .settings
            .iter()
            .map(|settings| settings.plugin_id())
            .collect()
    }

    pub fn queued_events(&self) -> Vec<SettingsSavedEvent> {
        self.shared.events.lock().clone()
    }

    /// Idle tick from the host: flushes due writes and raises queued file
    /// change events unless a foreground operation is running.
    pub fn on_idle(&self) {
        let busy = (self.shared.foreground_busy)();
        let flush = {
            let mut pending = self.shared.pending.lock();
            let (state, flush) = pending.state.on_idle(busy);
            pending.state = state;
            flush
        };
        if flush {
            self.flush_pending_writes();
        }
        if !busy {
            self.shared.raise_queued_events();
        }
    }

    /// Writes every pending plug-in that still has unsaved changes. Returns
    /// how many were written.
    pub fn flush_pending_writes(&self) -> usize {
        let pending = {
            let mut pending = self.shared.pending.lock();
            pending.state = WriteBackState::Idle;
            self.shared.cancel_write_back();
            std::mem::take(&mut pending.settings)
        };

        let raise_after_writing = self.shared.context.service.raise_changed_event_after_writing();
        let mut written = 0;
        for settings in pending
            .iter()
            .filter(|settings| settings.contains_changed_since_saved_values())
        {
            if settings.write_settings(false) {
                written += 1;
            } else {
                warn!(plugin = %settings.plugin_id(), "Failed to write settings; retrying on the next flush");
                self.shared.retry_write(settings);
                continue;
            }
            if raise_after_writing {
                self.shared.dispatch(SettingsSavedEvent {
                    plugin_id: settings.plugin_id(),
                    saved_by_this_process: true,
                });
            }
        }
        debug!(written, "Flushed pending settings");
        written
    }

    /// Writes one plug-in right away and forgets about its pending change
    /// and file events.
    pub fn save_settings_now(&self, id: Uuid, shutting_down: bool) -> bool {
        let Some(settings) = self.plugin_by_id(id) else {
            return false;
        };
        self.shared.events.lock().retain(|event| event.plugin_id != id);
        {
            let mut pending = self.shared.pending.lock();
            pending.settings.retain(|settings| settings.plugin_id() != id);
            if shutting_down || pending.settings.is_empty() {
                pending.state = WriteBackState::Idle;
                self.shared.cancel_write_back();
            }
        }
        let written = settings.write_settings(shutting_down);
        if !written && !shutting_down {
            self.shared.retry_write(&settings);
        }
        written
    }

    /// Stops change tracking and writes every cached plug-in synchronously.
    /// Returns how many files were written.
    pub fn shutdown(&self) -> usize {
        *self.shared.lifecycle.lock() = Lifecycle::ShuttingDown;
        {
            let mut pending = self.shared.pending.lock();
            pending.state = WriteBackState::Idle;
            pending.settings.clear();
            self.shared.cancel_write_back();
        }
        self.shared.events.lock().clear();

        let cached: Vec<Arc<PluginSettings>> =
            self.shared.cache.lock().by_id.values().cloned().collect();
        let mut written = 0;
        for settings in cached {
            if settings.write_settings(true) {
                written += 1;
            }
            settings.detach_watcher();
        }
        info!(plugins = written, "Settings runtime shut down");
        written
    }
}

impl RuntimeShared {
    fn cancel_write_back(&self) {
        if let Some(task) = self.write_back.lock().as_ref() {
            task.cancel();
        }
    }

    fn on_write_back_timer(&self) -> TaskOutcome {
        let busy = (self.foreground_busy)();
        let mut pending = self.pending.lock();
        pending.state = pending.state.on_timer_elapsed(busy);
        if pending.state.timer_running() {
            TaskOutcome::Rearm
        } else {
            TaskOutcome::Done
        }
    }

    fn raise_queued_events(&self) {
        let events = std::mem::take(&mut *self.events.lock());
        for event in events {
            self.dispatch(event);
        }
    }

    /// Re-reads the plug-in (unless it is about to be written anyway) and
    /// notifies subscribers.
    fn dispatch(&self, event: SettingsSavedEvent) {
        let dirty = self
            .pending
            .lock()
            .settings
            .iter()
            .any(|settings| settings.plugin_id() == event.plugin_id);
        let settings = self.cache.lock().by_id.get(&event.plugin_id).cloned();

        let previous = settings.as_ref().map(|settings| {
            let previous = settings.duplicate(false);
            if !dirty {
                let fresh = settings.read_from_disk();
                settings.merge_changed_settings_file(&fresh);
            }
            previous
        });

        let saved = SettingsSaved {
            plugin_id: event.plugin_id,
            saved_by_this_process: event.saved_by_this_process,
            dirty,
            previous,
        };
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(&saved);
        }
    }
}

impl SettingsEvents for RuntimeShared {
    fn settings_changed(&self, settings: &Arc<PluginSettings>) {
        if *self.lifecycle.lock() != Lifecycle::Running {
            return;
        }
        self.queue_write(settings);
    }

    fn file_changed(&self, plugin_id: Uuid, saved_by_this_process: bool) {
        let event = SettingsSavedEvent {
            plugin_id,
            saved_by_this_process,
        };
        let mut events = self.events.lock();
        if !events.contains(&event) {
            events.push(event);
        }
    }
}

impl RuntimeShared {
    /// Adds `settings` to the pending list and restarts the quiet period.
    fn queue_write(&self, settings: &Arc<PluginSettings>) {
        let mut pending = self.pending.lock();
        if !pending
            .settings
            .iter()
            .any(|queued| Arc::ptr_eq(queued, settings))
        {
            pending.settings.push(settings.clone());
        }
        pending.state = pending.state.on_change();
        if pending.state.timer_running() {
            if let Some(task) = self.write_back.lock().as_ref() {
                task.trigger();
            }
        }
    }

    /// Puts an aggregate whose write failed back in line.
    fn retry_write(&self, settings: &Arc<PluginSettings>) {
        if *self.lifecycle.lock() == Lifecycle::ShuttingDown {
            return;
        }
        self.queue_write(settings);
    }
}
