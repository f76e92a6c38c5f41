//! Settings of one plug-in (or the host): the main node, one node per
//! command and the window positions, read from and written to one tier.
//!
//! A current-user aggregate always has an all-users sibling. Values found in
//! the all-users file are copied into the current-user nodes as read-only
//! policy values and are only written again where the user differs from them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use paths::{PathContext, SettingsOwner, SettingsTier};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{self, CommandSection};
use crate::errors::Result;
use crate::node::{NodeContext, SettingsNode};
use crate::service::SettingsService;
use crate::watcher::SettingsFileWatcher;

/// Receives what an aggregate reports to its owner.
pub trait SettingsEvents: Send + Sync {
    /// A value changed and the aggregate needs to be written eventually.
    fn settings_changed(&self, settings: &Arc<PluginSettings>);

    /// The watched settings file changed on disk.
    fn file_changed(&self, plugin_id: Uuid, saved_by_this_process: bool);
}

/// Everything an aggregate needs from its surroundings.
#[derive(Clone)]
pub struct SettingsContext {
    pub paths: PathContext,
    pub scheme: Option<String>,
    pub service: Arc<dyn SettingsService>,
    pub watcher_delay: Duration,
    pub events: Option<Weak<dyn SettingsEvents>>,
}

impl SettingsContext {
    pub fn new(paths: PathContext, service: Arc<dyn SettingsService>) -> Self {
        Self {
            paths,
            scheme: None,
            service,
            watcher_delay: Duration::from_millis(500),
            events: None,
        }
    }

    pub fn with_scheme(mut self, scheme: Option<String>) -> Self {
        self.scheme = scheme.as_deref().and_then(paths::sanitize_scheme);
        self
    }

    pub fn with_watcher_delay(mut self, delay: Duration) -> Self {
        self.watcher_delay = delay;
        self
    }

    pub fn with_events(mut self, events: Weak<dyn SettingsEvents>) -> Self {
        self.events = Some(events);
        self
    }

    fn events(&self) -> Option<Arc<dyn SettingsEvents>> {
        self.events.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct AggregateNodes {
    plugin: Option<Arc<SettingsNode>>,
    window_positions: Option<Arc<SettingsNode>>,
    commands: BTreeMap<String, Arc<SettingsNode>>,
}

pub struct PluginSettings {
    context: SettingsContext,
    plugin_id: Uuid,
    owner: SettingsOwner,
    tier: SettingsTier,
    all_users: Option<Arc<PluginSettings>>,
    create_watcher: bool,
    self_ref: Weak<PluginSettings>,
    nodes: Mutex<AggregateNodes>,
    notifications_enabled: AtomicBool,
    writing: AtomicBool,
    watcher: Mutex<Option<SettingsFileWatcher>>,
}

impl fmt::Debug for PluginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSettings")
            .field("plugin_id", &self.plugin_id)
            .field("owner", &self.owner)
            .field("tier", &self.tier)
            .field("has_all_users", &self.all_users.is_some())
            .finish_non_exhaustive()
    }
}

impl PluginSettings {
    /// Current-user settings with their all-users sibling. Nothing is read
    /// until the first node is requested.
    pub fn load(
        context: SettingsContext,
        plugin_id: Uuid,
        owner: SettingsOwner,
        create_watcher: bool,
    ) -> Arc<Self> {
        let all_users = Self::with_tier(
            context.clone(),
            plugin_id,
            owner.clone(),
            SettingsTier::AllUsers,
            None,
            false,
        );
        Self::with_tier(
            context,
            plugin_id,
            owner,
            SettingsTier::CurrentUser,
            Some(all_users),
            create_watcher,
        )
    }

    fn with_tier(
        context: SettingsContext,
        plugin_id: Uuid,
        owner: SettingsOwner,
        tier: SettingsTier,
        all_users: Option<Arc<PluginSettings>>,
        create_watcher: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            context,
            plugin_id,
            owner,
            tier,
            all_users,
            create_watcher,
            self_ref: self_ref.clone(),
            nodes: Mutex::new(AggregateNodes::default()),
            // The all-users tier is never written.
            notifications_enabled: AtomicBool::new(tier == SettingsTier::CurrentUser),
            writing: AtomicBool::new(false),
            watcher: Mutex::new(None),
        })
    }

    pub fn plugin_id(&self) -> Uuid {
        self.plugin_id
    }

    pub fn owner(&self) -> &SettingsOwner {
        &self.owner
    }

    pub fn tier(&self) -> SettingsTier {
        self.tier
    }

    pub fn all_users(&self) -> Option<&Arc<PluginSettings>> {
        self.all_users.as_ref()
    }

    pub fn settings_file(&self, window_positions: bool) -> PathBuf {
        self.context.paths.settings_file(
            self.tier,
            &self.owner,
            self.context.scheme.as_deref(),
            window_positions,
        )
    }

    /// True between the start of a write and the watcher event it causes.
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled.load(Ordering::SeqCst)
    }

    fn node_context(&self) -> NodeContext {
        let weak = self.self_ref.clone();
        NodeContext::new(self.context.service.clone()).with_listener(Arc::new(move || {
            if let Some(settings) = weak.upgrade() {
                settings.on_node_changed();
            }
        }))
    }

    fn on_node_changed(&self) {
        if !self.notifications_enabled() {
            return;
        }
        let (Some(this), Some(events)) = (self.self_ref.upgrade(), self.context.events()) else {
            return;
        };
        events.settings_changed(&this);
    }

    fn on_file_changed(&self) {
        let saved_by_this_process = self.writing.swap(false, Ordering::SeqCst);
        debug!(plugin = %self.plugin_id, saved_by_this_process, "Settings file changed on disk");
        if let Some(events) = self.context.events() {
            events.file_changed(self.plugin_id, saved_by_this_process);
        }
    }

    /// Main settings node; reads the files on first access.
    pub fn plugin_settings(&self) -> Arc<SettingsNode> {
        if let Some(node) = self.nodes.lock().plugin.clone() {
            return node;
        }
        self.read_settings(false);
        self.ensure_plugin_node()
    }

    /// Window position node; reads the files on first access.
    pub fn window_position_settings(&self) -> Arc<SettingsNode> {
        if let Some(node) = self.nodes.lock().window_positions.clone() {
            return node;
        }
        self.read_settings(false);
        self.ensure_window_node()
    }

    /// Settings of one command. New command nodes overlay the all-users node
    /// of the same command.
    pub fn command_settings(&self, name: &str) -> Arc<SettingsNode> {
        if self.nodes.lock().plugin.is_none() {
            self.plugin_settings();
        }
        let all_users = self.all_users_command(name);
        let context = self.node_context();
        self.nodes
            .lock()
            .commands
            .entry(name.to_string())
            .or_insert_with(|| SettingsNode::new(context, all_users, Some(name.to_string())))
            .clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.nodes.lock().commands.keys().cloned().collect()
    }

    /// Existing all-users command node; never creates one.
    fn all_users_command(&self, name: &str) -> Option<Arc<SettingsNode>> {
        if name.is_empty() {
            return None;
        }
        self.all_users
            .as_ref()
            .and_then(|all_users| all_users.nodes.lock().commands.get(name).cloned())
    }

    fn all_users_plugin_node(&self) -> Option<Arc<SettingsNode>> {
        self.all_users
            .as_ref()
            .and_then(|all_users| all_users.nodes.lock().plugin.clone())
    }

    /// Creates the main node (seeded from the all-users tier) and the seeded
    /// command nodes when they do not exist yet.
    fn ensure_plugin_node(&self) -> Arc<SettingsNode> {
        if let Some(node) = self.nodes.lock().plugin.clone() {
            return node;
        }

        let all_users_node = self
            .all_users
            .as_ref()
            .map(|all_users| all_users.ensure_plugin_node());
        let all_users_commands = self
            .all_users
            .as_ref()
            .map(|all_users| all_users.nodes.lock().commands.clone())
            .unwrap_or_default();

        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.plugin.clone() {
            return node;
        }
        let node = SettingsNode::new(self.node_context(), all_users_node.clone(), None);
        if let Some(all_users_node) = &all_users_node {
            node.copy_from(all_users_node);
        }
        for (name, all_users_command) in all_users_commands {
            if nodes.commands.contains_key(&name) {
                continue;
            }
            let command = SettingsNode::new(
                self.node_context(),
                Some(all_users_command.clone()),
                Some(name.clone()),
            );
            command.copy_from(&all_users_command);
            nodes.commands.insert(name, command);
        }
        nodes.plugin = Some(node.clone());
        node
    }

    fn ensure_window_node(&self) -> Arc<SettingsNode> {
        let context = self.node_context();
        self.nodes
            .lock()
            .window_positions
            .get_or_insert_with(|| SettingsNode::new(context, None, None))
            .clone()
    }

    /// Reads the all-users file, the current-user file and the window
    /// positions. Only meaningful on a current-user aggregate. Returns whether
    /// any main settings file was read.
    pub fn read_settings(&self, update_defaults: bool) -> bool {
        let Some(all_users) = &self.all_users else {
            return false;
        };

        if update_defaults {
            let mut nodes = self.nodes.lock();
            nodes.plugin = None;
            nodes.commands.clear();
        }

        let enabled = self.notifications_enabled.swap(false, Ordering::SeqCst);
        let mut result =
            self.context.service.supports_all_users() && all_users.read_settings_helper(false);
        if self.read_settings_helper(false) {
            result = true;
        }
        self.read_settings_helper(true);
        self.notifications_enabled.store(enabled, Ordering::SeqCst);

        debug!(plugin = %self.plugin_id, result, "Read settings");
        result
    }

    /// Reads one file of this tier into its node.
    pub fn read_settings_helper(&self, window_positions: bool) -> bool {
        let target = if window_positions {
            self.ensure_window_node()
        } else {
            self.ensure_plugin_node()
        };

        if !window_positions && self.create_watcher {
            self.attach_watcher();
        }

        let path = self.settings_file(window_positions);
        let loaded = match self.context.service.read_settings(&path) {
            Some(bytes) => match codec::parse_document(&bytes) {
                Ok(document) => {
                    document.apply_settings(&target);
                    if !window_positions {
                        self.store_command_nodes(&document);
                    }
                    true
                }
                Err(err) => {
                    warn!("Ignoring settings file {}: {}", path.display(), err);
                    false
                }
            },
            None => false,
        };

        // Parsing marks every value it stores as changed.
        self.clear_changed_since_saved_flag();
        loaded
    }

    fn store_command_nodes(&self, document: &codec::ParsedDocument) {
        let parsed = document.command_nodes(|name| {
            SettingsNode::new(
                self.node_context(),
                self.all_users_command(name),
                Some(name.to_string()),
            )
        });

        let mut nodes = self.nodes.lock();
        for (name, node) in parsed {
            if self.all_users.is_some() {
                if let Some(existing) = nodes.commands.get(&name) {
                    existing.copy_from(&node);
                    continue;
                }
            }
            nodes.commands.insert(name, node);
        }
    }

    fn attach_watcher(&self) {
        if !self.context.service.use_file_watchers() {
            return;
        }
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }

        let path = self.settings_file(false);
        let weak = self.self_ref.clone();
        match SettingsFileWatcher::attach(
            &self.plugin_id.to_string(),
            &path,
            self.context.watcher_delay,
            move || {
                if let Some(settings) = weak.upgrade() {
                    settings.on_file_changed();
                }
            },
        ) {
            Ok(watcher) => *slot = watcher,
            Err(err) => warn!("Failed to watch settings file {}: {}", path.display(), err),
        }
    }

    pub fn detach_watcher(&self) {
        if self.watcher.lock().take().is_some() {
            debug!(plugin = %self.plugin_id, "Detached settings watcher");
        }
    }

    /// Writes the window positions (when there are any) and the main file.
    pub fn write_settings(&self, shutting_down: bool) -> bool {
        let window = self.nodes.lock().window_positions.clone();
        if window.is_some_and(|node| !node.is_empty()) {
            self.write_settings_helper(shutting_down, true);
        }
        self.write_settings_helper(shutting_down, false)
    }

    /// Writes one file, or deletes it when there is nothing to keep.
    pub fn write_settings_helper(&self, shutting_down: bool, window_positions: bool) -> bool {
        let path = self.settings_file(window_positions);
        let (plugin, window) = {
            let nodes = self.nodes.lock();
            (nodes.plugin.clone(), nodes.window_positions.clone())
        };
        let resetting = plugin.as_ref().is_some_and(|node| node.resetting_dont_write());

        let unsaved: Vec<Arc<SettingsNode>>;
        if window_positions {
            let Some(window) = window else {
                self.context.service.delete_settings_file(&path);
                return true;
            };
            if resetting || window.resetting_dont_write() {
                self.context.service.delete_settings_file(&path);
                return true;
            }
            unsaved = changed_nodes(vec![window.clone()]);
            window.clear_changed_flag();
        } else {
            if plugin.is_none() {
                // Never loaded, so there is nothing newer than the file.
                return true;
            }
            unsaved = changed_nodes(self.all_nodes());
            self.clear_changed_since_saved_flag();
            if resetting || !self.contains_modified_values() {
                debug!(plugin = %self.plugin_id, file = %path.display(), "Nothing to keep; deleting settings file");
                self.context.service.delete_settings_file(&path);
                return true;
            }
        }

        let bytes = match self.to_bytes(window_positions) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Failed to serialize settings for {}: {}", path.display(), err);
                mark_unsaved(&unsaved);
                return false;
            }
        };

        let use_file_watchers = self.context.service.use_file_watchers();
        let mut on_writing = |shutting_down: bool, done: bool| {
            if !done {
                self.writing.store(true, Ordering::SeqCst);
                if shutting_down {
                    self.detach_watcher();
                }
            } else if !use_file_watchers {
                self.writing.store(false, Ordering::SeqCst);
            }
        };
        let written = self
            .context
            .service
            .write_settings(shutting_down, &bytes, &path, &mut on_writing);
        if written {
            info!(plugin = %self.plugin_id, file = %path.display(), "Settings written");
        } else {
            warn!(plugin = %self.plugin_id, file = %path.display(), "Settings not written; keeping changes");
            mark_unsaved(&unsaved);
        }
        written
    }

    fn to_bytes(&self, window_positions: bool) -> Result<Vec<u8>> {
        let document = if window_positions {
            let window = self
                .nodes
                .lock()
                .window_positions
                .clone()
                .filter(|node| node.contains_modified_values(None));
            codec::settings_document(window.as_deref(), None, &[])
        } else {
            let (plugin, commands) = {
                let nodes = self.nodes.lock();
                (nodes.plugin.clone(), nodes.commands.clone())
            };
            let all_users_plugin = self.all_users_plugin_node();
            let settings = plugin.filter(|_| self.contains_modified_values());
            let all_users_commands: Vec<Option<Arc<SettingsNode>>> = commands
                .keys()
                .map(|name| self.all_users_command(name))
                .collect();
            let sections: Vec<CommandSection<'_>> = commands
                .iter()
                .zip(&all_users_commands)
                .map(|((name, node), all_users)| CommandSection {
                    name,
                    node,
                    all_users: all_users.as_deref(),
                })
                .collect();
            codec::settings_document(settings.as_deref(), all_users_plugin.as_deref(), &sections)
        };
        codec::to_bytes(&document)
    }

    fn all_nodes(&self) -> Vec<Arc<SettingsNode>> {
        let nodes = self.nodes.lock();
        nodes
            .plugin
            .iter()
            .chain(nodes.window_positions.iter())
            .chain(nodes.commands.values())
            .cloned()
            .collect()
    }

    pub fn contains_changed_since_saved_values(&self) -> bool {
        self.all_nodes()
            .iter()
            .any(|node| node.contains_changed_values())
    }

    pub fn clear_changed_since_saved_flag(&self) {
        for node in self.all_nodes() {
            node.clear_changed_flag();
        }
    }

    /// True if the main node differs from the all-users main node, or any
    /// command node from its all-users command node.
    pub fn contains_modified_values(&self) -> bool {
        let (plugin, commands) = {
            let nodes = self.nodes.lock();
            (nodes.plugin.clone(), nodes.commands.clone())
        };
        let all_users_plugin = self.all_users_plugin_node();
        if plugin.is_some_and(|node| node.contains_modified_values(all_users_plugin.as_deref())) {
            return true;
        }
        commands.iter().any(|(name, node)| {
            let all_users = self.all_users_command(name);
            node.contains_modified_values(all_users.as_deref())
        })
    }

    /// In-memory copy sharing the same all-users sibling. Nothing is read.
    pub fn duplicate(&self, create_watcher: bool) -> Arc<PluginSettings> {
        let copy = Self::with_tier(
            self.context.clone(),
            self.plugin_id,
            self.owner.clone(),
            self.tier,
            self.all_users.clone(),
            create_watcher,
        );
        copy.notifications_enabled.store(false, Ordering::SeqCst);
        {
            let mut nodes = copy.nodes.lock();
            nodes.plugin = Some(SettingsNode::new(copy.node_context(), None, None));
            nodes.window_positions = Some(SettingsNode::new(copy.node_context(), None, None));
        }
        copy.merge_changed_settings_file(self);
        copy.notifications_enabled
            .store(self.tier == SettingsTier::CurrentUser, Ordering::SeqCst);
        copy
    }

    /// Fresh aggregate read from disk, without a watcher.
    pub fn read_from_disk(&self) -> Arc<PluginSettings> {
        let fresh = Self::load(
            SettingsContext {
                events: None,
                ..self.context.clone()
            },
            self.plugin_id,
            self.owner.clone(),
            false,
        );
        fresh.read_settings(false);
        fresh
    }

    /// Re-syncs this aggregate with `other`, typically a copy freshly read
    /// after another process rewrote the file. Does not raise changes.
    pub fn merge_changed_settings_file(&self, other: &PluginSettings) {
        if other.plugin_id != self.plugin_id {
            return;
        }
        let enabled = self.notifications_enabled.swap(false, Ordering::SeqCst);

        let other_plugin = other.nodes.lock().plugin.clone();
        self.ensure_plugin_node()
            .merge_from(other_plugin.as_deref());

        let other_commands = other.nodes.lock().commands.clone();
        let own_commands = self.nodes.lock().commands.clone();
        for (name, node) in &own_commands {
            node.merge_from(other_commands.get(name).map(Arc::as_ref));
        }
        for (name, other_node) in &other_commands {
            if own_commands.contains_key(name) {
                continue;
            }
            let node = SettingsNode::new(self.node_context(), None, Some(name.clone()));
            node.merge_from(Some(other_node));
            self.nodes.lock().commands.insert(name.clone(), node);
        }

        self.clear_changed_since_saved_flag();
        self.notifications_enabled.store(enabled, Ordering::SeqCst);
    }
}

fn changed_nodes(nodes: Vec<Arc<SettingsNode>>) -> Vec<Arc<SettingsNode>> {
    nodes
        .into_iter()
        .filter(|node| node.contains_changed_values())
        .collect()
}

fn mark_unsaved(nodes: &[Arc<SettingsNode>]) {
    for node in nodes {
        node.mark_unsaved();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::MemorySettingsService;
    use pretty_assertions::assert_eq;

    struct Setup {
        _dir: tempfile::TempDir,
        service: Arc<MemorySettingsService>,
        context: SettingsContext,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = Arc::new(MemorySettingsService::new());
        let context = SettingsContext::new(
            PathContext::with_base_path(dir.path(), "Acme", "cad_host"),
            service.clone(),
        );
        Setup {
            _dir: dir,
            service,
            context,
        }
    }

    fn load(setup: &Setup) -> Arc<PluginSettings> {
        PluginSettings::load(
            setup.context.clone(),
            Uuid::nil(),
            SettingsOwner::plugin("0c0ffee0-0000-0000-0000-000000000001", Some("Grid")),
            false,
        )
    }

    #[test]
    fn unmodified_settings_delete_the_file_instead_of_writing() {
        let setup = setup();
        let settings = load(&setup);
        let path = settings.settings_file(false);
        setup.service.insert(&path, r#"<settings id="2.0"/>"#);

        settings.plugin_settings().get_integer_or("Foo", 42);
        assert!(settings.write_settings(false));
        assert_eq!(setup.service.write_count(), 0);
        assert_eq!(setup.service.deletes(), vec![path]);
    }

    #[test]
    fn modified_settings_are_written_and_read_back() {
        let setup = setup();
        let settings = load(&setup);
        settings.plugin_settings().set_integer("Foo", 7);
        settings.command_settings("Offset").set_bool("Both", true);
        assert!(settings.contains_changed_since_saved_values());

        assert!(settings.write_settings(false));
        assert!(!settings.contains_changed_since_saved_values());
        let path = settings.settings_file(false);
        let text = setup.service.contents_string(&path).expect("written");
        assert!(text.contains(r#"<entry key="Foo">7</entry>"#), "{text}");
        assert!(text.contains(r#"<command name="Offset">"#), "{text}");
        assert!(!settings.is_writing(), "cleared when the service has no watchers");

        let reread = load(&setup);
        assert_eq!(reread.plugin_settings().get_integer("Foo").expect("foo"), 7);
        assert!(reread.command_settings("Offset").get_bool("Both").expect("both"));
        assert!(!reread.contains_changed_since_saved_values());
    }

    #[test]
    fn all_users_values_are_read_only_policy() {
        let setup = setup();
        let settings = load(&setup);
        let all_users_path = settings
            .all_users()
            .expect("sibling")
            .settings_file(false);
        setup.service.insert(
            &all_users_path,
            r#"<settings id="2.0"><settings><entry key="Units">mm</entry></settings></settings>"#,
        );

        let node = settings.plugin_settings();
        assert_eq!(node.get_string("Units").expect("policy"), "mm");
        assert!(node.is_read_only("Units"));
        node.set_string("Units", "in");
        assert_eq!(node.get_string("Units").expect("unchanged"), "mm");

        assert_eq!(node.get_string_or("Units", "mm"), "mm");
        assert!(!settings.contains_modified_values());
    }

    #[test]
    fn resetting_deletes_instead_of_writing() {
        let setup = setup();
        let settings = load(&setup);
        let node = settings.plugin_settings();
        node.set_integer("Foo", 1);
        node.set_resetting_dont_write(true);

        let path = settings.settings_file(false);
        setup.service.insert(&path, "old");
        assert!(settings.write_settings(false));
        assert_eq!(setup.service.write_count(), 0);
        assert_eq!(setup.service.contents(&path), None);
    }

    #[test]
    fn window_positions_go_to_their_own_file() {
        let setup = setup();
        let settings = load(&setup);
        settings
            .window_position_settings()
            .set_rectangle("Main", crate::value::Rectangle { left: 1, top: 2, width: 3, height: 4 });
        settings.plugin_settings().set_bool("Snap", true);

        assert!(settings.write_settings(false));
        let window_text = setup
            .service
            .contents_string(&settings.settings_file(true))
            .expect("window file");
        assert!(window_text.contains(r#"<entry key="Main">1,2,3,4</entry>"#), "{window_text}");
        assert!(!window_text.contains("command"));
        assert_eq!(setup.service.write_count(), 2);
    }

    #[test]
    fn failed_write_keeps_changes_for_the_next_attempt() {
        let setup = setup();
        let settings = load(&setup);
        settings.plugin_settings().set_integer("Foo", 7);

        setup.service.fail_next_writes(1);
        assert!(!settings.write_settings(false));
        assert!(settings.contains_changed_since_saved_values());
        assert_eq!(setup.service.write_count(), 0);

        assert!(settings.write_settings(false));
        assert!(!settings.contains_changed_since_saved_values());
        assert_eq!(setup.service.write_count(), 1);
    }

    #[test]
    fn update_defaults_replaces_nodes_with_file_contents() {
        let setup = setup();
        let settings = load(&setup);
        let all_users_file = settings.all_users().expect("all users").settings_file(false);
        let user_file = settings.settings_file(false);
        setup.service.insert(
            &all_users_file,
            r#"<settings id="2.0"><settings><entry key="Units">inch</entry></settings></settings>"#,
        );
        setup.service.insert(
            &user_file,
            r#"<settings id="2.0"><settings><entry key="Foo">7</entry></settings></settings>"#,
        );

        let before = settings.plugin_settings();
        assert_eq!(before.get_string_or("Units", "mm"), "inch");
        assert_eq!(before.get_integer("Foo").expect("foo"), 7);
        before.set_integer("Bar", 1);

        setup.service.insert(
            &all_users_file,
            r#"<settings id="2.0"><settings><entry key="Units">cm</entry></settings></settings>"#,
        );
        setup.service.insert(
            &user_file,
            r#"<settings id="2.0"><settings><entry key="Foo">9</entry></settings></settings>"#,
        );
        assert!(settings.read_settings(true));

        let after = settings.plugin_settings();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.get_integer("Foo").expect("foo"), 9);
        assert_eq!(after.try_get_integer("Bar"), None);
        assert_eq!(after.get_string("Units").expect("units"), "cm");
        assert!(after.is_read_only("Units"));
        assert!(!settings.contains_changed_since_saved_values());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let setup = setup();
        let settings = load(&setup);
        setup.service.insert(settings.settings_file(false), "<settings id=\"2.0\"><oops>");
        assert!(!settings.read_settings(false));
        assert!(settings.plugin_settings().is_empty());
    }

    #[test]
    fn duplicate_and_merge_keep_values_in_sync() {
        let setup = setup();
        let settings = load(&setup);
        settings.plugin_settings().set_integer("Foo", 7);
        settings.command_settings("Offset").set_double("Distance", 2.5);

        let copy = settings.duplicate(false);
        assert_eq!(copy.plugin_settings().get_integer("Foo").expect("foo"), 7);
        assert_eq!(copy.command_settings("Offset").get_double("Distance").expect("distance"), 2.5);
        assert!(!copy.contains_changed_since_saved_values());

        copy.plugin_settings().set_integer("Foo", 8);
        settings.merge_changed_settings_file(&copy);
        assert_eq!(settings.plugin_settings().get_integer("Foo").expect("foo"), 8);
        assert!(!settings.contains_changed_since_saved_values());

        let stranger = PluginSettings::load(
            setup.context.clone(),
            Uuid::new_v4(),
            SettingsOwner::Host,
            false,
        );
        stranger.plugin_settings().set_integer("Foo", 100);
        settings.merge_changed_settings_file(&stranger);
        assert_eq!(settings.plugin_settings().get_integer("Foo").expect("foo"), 8);
    }

    struct Recorder {
        changed: Mutex<Vec<Uuid>>,
    }

    impl SettingsEvents for Recorder {
        fn settings_changed(&self, settings: &Arc<PluginSettings>) {
            self.changed.lock().push(settings.plugin_id());
        }

        fn file_changed(&self, _plugin_id: Uuid, _saved_by_this_process: bool) {}
    }

    #[test]
    fn changes_are_reported_except_while_reading() {
        let setup = setup();
        let recorder = Arc::new(Recorder {
            changed: Mutex::new(Vec::new()),
        });
        let events: Weak<dyn SettingsEvents> = Arc::downgrade(&recorder) as Weak<dyn SettingsEvents>;
        let context = setup.context.clone().with_events(events);
        let settings = PluginSettings::load(context, Uuid::nil(), SettingsOwner::Host, false);
        setup.service.insert(
            settings.settings_file(false),
            r#"<settings id="2.0"><settings><entry key="A">1</entry></settings></settings>"#,
        );

        let node = settings.plugin_settings();
        assert!(recorder.changed.lock().is_empty());
        node.set_integer("A", 2);
        node.add_child("Nested").set_bool("B", true);
        assert_eq!(recorder.changed.lock().len(), 2);
    }
}
