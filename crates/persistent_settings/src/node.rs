//! Hierarchical key/value settings with default/current semantics.
//!
//! A [`SettingsNode`] owns its cells and child nodes behind one coarse lock.
//! Validators and the change listener always run with that lock released, and
//! operations that read a second node (merge, copy, the all-users overlay)
//! take a snapshot of it first so two node locks are never held at once.

use std::any::{type_name, Any};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{Result, SettingsError};
use crate::in_memory::MemorySettingsService;
use crate::service::SettingsService;
use crate::value::{
    Color, EnumSetting, Point, Point3d, Rectangle, SettingData, SettingEnum, SettingType,
    SettingValue, Size, ValueKind,
};

/// Outcome of a validator.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    /// Store this value (possibly different from the proposed one).
    Accept(T),
    /// Leave the setting unchanged.
    Reject,
}

pub type Validator<T> = Arc<dyn Fn(Option<&T>, T) -> Validation<T> + Send + Sync>;

/// Called whenever a cell of the node (or of a child) becomes changed-since-save.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// What every node of one tree shares: the storage service and the listener
/// of the owning aggregate.
#[derive(Clone)]
pub struct NodeContext {
    service: Arc<dyn SettingsService>,
    listener: Option<ChangeListener>,
}

impl NodeContext {
    pub fn new(service: Arc<dyn SettingsService>) -> Self {
        Self {
            service,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: ChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn service(&self) -> &Arc<dyn SettingsService> {
        &self.service
    }
}

#[derive(Default)]
struct NodeState {
    settings: BTreeMap<String, SettingValue>,
    children: BTreeMap<String, Arc<SettingsNode>>,
    validators: HashMap<String, Arc<dyn Any + Send + Sync>>,
    hidden_from_ui: bool,
    item_deleted_since_save: bool,
    /// Changes whose write failed; they count until the next save.
    unsaved: bool,
    resetting_dont_write: bool,
}

/// Point-in-time copy of a node's cells and child handles.
pub(crate) struct NodeSnapshot {
    pub(crate) settings: BTreeMap<String, SettingValue>,
    pub(crate) children: BTreeMap<String, Arc<SettingsNode>>,
    pub(crate) hidden_from_ui: bool,
}

pub struct SettingsNode {
    key: Option<String>,
    all_users: Option<Arc<SettingsNode>>,
    context: NodeContext,
    state: Mutex<NodeState>,
}

impl fmt::Debug for SettingsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SettingsNode")
            .field("key", &self.key)
            .field("settings", &state.settings.keys().collect::<Vec<_>>())
            .field("children", &state.children.keys().collect::<Vec<_>>())
            .field("has_all_users", &self.all_users.is_some())
            .finish_non_exhaustive()
    }
}

impl SettingsNode {
    pub fn new(
        context: NodeContext,
        all_users: Option<Arc<SettingsNode>>,
        key: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            all_users,
            context,
            state: Mutex::new(NodeState::default()),
        })
    }

    /// A free-standing node backed by an in-memory service.
    pub fn in_memory() -> Arc<Self> {
        Self::new(
            NodeContext::new(Arc::new(MemorySettingsService::new())),
            None,
            None,
        )
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn all_users(&self) -> Option<&Arc<SettingsNode>> {
        self.all_users.as_ref()
    }

    fn notify(&self) {
        if let Some(listener) = &self.context.listener {
            listener();
        }
    }

    /// Existing cell or a new one with empty values. New cells are offered to
    /// the service before they are stored.
    fn entry<'a>(
        &self,
        state: &'a mut NodeState,
        key: &str,
        kind: Option<ValueKind>,
    ) -> &'a mut SettingValue {
        match state.settings.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut value = SettingValue::new(key);
                if let Some(kind) = kind {
                    value.set_runtime_type(kind);
                }
                self.context.service.on_add_setting_value(&mut value);
                entry.insert(value)
            }
        }
    }

    /// Moves a cell read under one of `legacy_keys` to `key`. Returns whether
    /// `key` exists afterwards.
    fn remap_legacy(state: &mut NodeState, key: &str, legacy_keys: &[&str]) -> bool {
        if state.settings.contains_key(key) {
            return true;
        }
        for legacy in legacy_keys {
            if let Some(value) = state.settings.remove(*legacy) {
                state.settings.insert(key.to_string(), value.renamed(key));
                return true;
            }
        }
        false
    }

    /// The all-users value that replaces `%root%` when reading a string list.
    fn root_for<T: SettingType>(&self, key: &str, use_default: bool) -> Option<SettingData> {
        if T::KIND != ValueKind::StringList {
            return None;
        }
        self.all_users
            .as_ref()
            .and_then(|all_users| all_users.raw_value(key, use_default))
    }

    /// Returns the cell for `key`, creating it if needed.
    pub fn get_or_create(&self, key: &str, kind: Option<ValueKind>) -> SettingValue {
        let mut state = self.state.lock();
        self.entry(&mut state, key, kind).clone()
    }

    pub fn raw_value(&self, key: &str, use_default: bool) -> Option<SettingData> {
        self.state
            .lock()
            .settings
            .get(key)
            .map(|value| value.value(use_default).clone())
    }

    pub fn try_get<T: SettingType>(&self, key: &str) -> Option<T> {
        self.try_get_legacy(key, &[])
    }

    pub fn try_get_legacy<T: SettingType>(&self, key: &str, legacy_keys: &[&str]) -> Option<T> {
        let root = self.root_for::<T>(key, false);
        let mut state = self.state.lock();
        if !Self::remap_legacy(&mut state, key, legacy_keys) {
            return None;
        }
        state.settings.get_mut(key)?.try_get::<T>(false, root.as_ref())
    }

    /// Strict read: the key must exist and parse as `T`.
    pub fn get<T: SettingType>(&self, key: &str) -> Result<T> {
        let root = self.root_for::<T>(key, false);
        let mut state = self.state.lock();
        let value = state
            .settings
            .get_mut(key)
            .ok_or_else(|| SettingsError::KeyNotFound(key.to_string()))?;
        value
            .try_get::<T>(false, root.as_ref())
            .ok_or_else(|| SettingsError::NotSupported {
                key: key.to_string(),
                kind: T::KIND,
            })
    }

    pub fn get_or<T: SettingType + Clone>(&self, key: &str, default: T) -> T {
        self.get_or_legacy(key, default, &[])
    }

    /// Reads `key`, recording `default` as its default value.
    ///
    /// A missing (or empty) value is seeded with `default`; none of this
    /// raises the changed flag.
    pub fn get_or_legacy<T: SettingType + Clone>(&self, key: &str, default: T, legacy_keys: &[&str]) -> T {
        let root = self.root_for::<T>(key, false);
        let mut state = self.state.lock();

        if Self::remap_legacy(&mut state, key, legacy_keys) {
            if let Some(value) = state.settings.get_mut(key) {
                if let Some(current) = value.try_get::<T>(false, root.as_ref()) {
                    value.set(true, default, false);
                    return current;
                }
            }
        }

        let cell = self.entry(&mut state, key, Some(T::KIND));
        cell.set(true, default.clone(), false);
        if cell.value(false).is_empty() {
            cell.set(false, default.clone(), false);
        }
        cell.try_get::<T>(false, root.as_ref()).unwrap_or(default)
    }

    /// Integer read limited on one side by `bound`.
    pub fn get_integer_bounded(&self, key: &str, default: i32, bound: i32, bound_is_lower: bool) -> i32 {
        let value = self.get_or(key, default);
        if bound_is_lower {
            value.max(bound)
        } else {
            value.min(bound)
        }
    }

    pub fn get_integer_clamped(&self, key: &str, default: i32, lower: i32, upper: i32) -> i32 {
        let value = self.get_or(key, default);
        if value < lower {
            lower
        } else if value > upper {
            upper
        } else {
            value
        }
    }

    /// Proposes `value` to the registered validator, if any.
    fn validate<T: SettingType + 'static>(&self, key: &str, value: T) -> Option<T> {
        let Some(validator) = self.validator::<T>(key) else {
            return Some(value);
        };
        let old = self.try_get::<T>(key);
        match validator(old.as_ref(), value) {
            Validation::Accept(value) => Some(value),
            Validation::Reject => None,
        }
    }

    pub fn set<T: SettingType + 'static>(&self, key: &str, value: T) {
        let Some(value) = self.validate(key, value) else {
            return;
        };
        let raised = {
            let mut state = self.state.lock();
            self.entry(&mut state, key, Some(T::KIND)).set(false, value, true)
        };
        if raised {
            self.notify();
        }
    }

    pub fn set_default<T: SettingType>(&self, key: &str, value: T) {
        let mut state = self.state.lock();
        self.entry(&mut state, key, Some(T::KIND)).set(true, value, false);
    }

    pub fn try_get_default<T: SettingType>(&self, key: &str) -> Option<T> {
        let root = self.root_for::<T>(key, true);
        let mut state = self.state.lock();
        state.settings.get_mut(key)?.try_get::<T>(true, root.as_ref())
    }

    /// Stores raw text. `<list>` and `<dictionary>` fragments are kept as
    /// structured values.
    pub fn set_string(&self, key: &str, text: &str) {
        let Some(text) = self.validate(key, text.to_string()) else {
            return;
        };
        self.set_data(key, SettingData::from_text(&text));
    }

    /// Stores an already decoded value without running validators.
    pub fn set_data(&self, key: &str, data: SettingData) {
        let raised = {
            let mut state = self.state.lock();
            self.entry(&mut state, key, None).set_value(false, data, true)
        };
        if raised {
            self.notify();
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get::<String>(key)
    }

    pub fn get_string_or(&self, key: &str, default: impl Into<String>) -> String {
        self.get_or(key, default.into())
    }

    pub fn try_get_string(&self, key: &str) -> Option<String> {
        self.try_get::<String>(key)
    }

    pub fn get_enum_or<E: SettingEnum + 'static>(&self, key: &str, default: E) -> E {
        self.get_or(key, EnumSetting(default)).0
    }

    pub fn get_enum<E: SettingEnum + 'static>(&self, key: &str) -> Result<E> {
        self.get::<EnumSetting<E>>(key).map(|e| e.0)
    }

    pub fn try_get_enum<E: SettingEnum + 'static>(&self, key: &str) -> Option<E> {
        self.try_get::<EnumSetting<E>>(key).map(|e| e.0)
    }

    pub fn set_enum<E: SettingEnum + 'static>(&self, key: &str, value: E) {
        self.set(key, EnumSetting(value));
    }

    /// Enum stored under its own type name.
    pub fn get_enum_value_or<E: SettingEnum + 'static>(&self, default: E) -> E {
        self.get_enum_or(E::type_name(), default)
    }

    pub fn set_enum_value<E: SettingEnum + 'static>(&self, value: E) {
        self.set_enum(E::type_name(), value);
    }

    pub fn register_validator<T, F>(&self, key: &str, validator: F)
    where
        T: 'static,
        F: Fn(Option<&T>, T) -> Validation<T> + Send + Sync + 'static,
    {
        let validator: Validator<T> = Arc::new(validator);
        self.state
            .lock()
            .validators
            .insert(key.to_string(), Arc::new(validator));
    }

    pub fn validator<T: 'static>(&self, key: &str) -> Option<Validator<T>> {
        let erased = self.state.lock().validators.get(key).cloned()?;
        match erased.downcast_ref::<Validator<T>>() {
            Some(validator) => Some(validator.clone()),
            None => {
                warn!(
                    key,
                    expected = type_name::<T>(),
                    "Validator was registered for another value type; ignoring it"
                );
                None
            }
        }
    }

    /// Removes `key`. The deletion itself counts as a change.
    pub fn delete_item(&self, key: &str) {
        let removed = {
            let mut state = self.state.lock();
            match state.settings.remove(key) {
                Some(mut value) => {
                    value.set_changed_since_save(true);
                    state.item_deleted_since_save = true;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify();
            self.context.service.delete_item(self.key(), key);
        }
    }

    /// Existing child or a new empty one.
    pub fn add_child(&self, key: &str) -> Arc<SettingsNode> {
        let mut state = self.state.lock();
        state
            .children
            .entry(key.to_string())
            .or_insert_with(|| SettingsNode::new(self.context.clone(), None, Some(key.to_string())))
            .clone()
    }

    pub fn get_child(&self, key: &str) -> Result<Arc<SettingsNode>> {
        self.try_get_child(key)
            .ok_or_else(|| SettingsError::KeyNotFound(key.to_string()))
    }

    pub fn try_get_child(&self, key: &str) -> Option<Arc<SettingsNode>> {
        self.state.lock().children.get(key).cloned()
    }

    pub fn delete_child(&self, key: &str) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.children.remove(key).is_some();
            if removed {
                state.item_deleted_since_save = true;
            }
            removed
        };
        if removed {
            self.notify();
            self.context.service.delete_child(self.key(), key);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().settings.keys().cloned().collect()
    }

    pub fn child_keys(&self) -> Vec<String> {
        self.state.lock().children.keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().settings.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.settings.is_empty() && state.children.is_empty()
    }

    /// Type the key was last read or written as.
    pub fn setting_kind(&self, key: &str) -> Option<ValueKind> {
        self.state
            .lock()
            .settings
            .get(key)
            .and_then(SettingValue::runtime_type)
    }

    pub fn is_read_only(&self, key: &str) -> bool {
        self.state
            .lock()
            .settings
            .get(key)
            .is_some_and(SettingValue::read_only)
    }

    pub fn is_hidden(&self, key: &str) -> bool {
        self.state
            .lock()
            .settings
            .get(key)
            .is_some_and(SettingValue::hidden)
    }

    pub fn hide_setting(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let value = state
            .settings
            .get_mut(key)
            .ok_or_else(|| SettingsError::KeyNotFound(key.to_string()))?;
        value.set_hidden(true);
        Ok(())
    }

    pub fn hidden_from_ui(&self) -> bool {
        self.state.lock().hidden_from_ui
    }

    pub fn set_hidden_from_ui(&self, hidden: bool) {
        self.state.lock().hidden_from_ui = hidden;
    }

    /// Set when the user restored factory defaults: the file is deleted
    /// instead of written.
    pub fn resetting_dont_write(&self) -> bool {
        self.state.lock().resetting_dont_write
    }

    pub fn set_resetting_dont_write(&self, resetting: bool) {
        self.state.lock().resetting_dont_write = resetting;
    }

    pub fn item_deleted_since_save(&self) -> bool {
        self.state.lock().item_deleted_since_save
    }

    pub fn contains_changed_values(&self) -> bool {
        let children: Vec<Arc<SettingsNode>> = {
            let state = self.state.lock();
            if state.item_deleted_since_save
                || state.unsaved
                || state.settings.values().any(SettingValue::changed_since_save)
            {
                return true;
            }
            state.children.values().cloned().collect()
        };
        children.iter().any(|child| child.contains_changed_values())
    }

    pub fn clear_changed_flag(&self) {
        let children: Vec<Arc<SettingsNode>> = {
            let mut state = self.state.lock();
            for value in state.settings.values_mut() {
                value.set_changed_since_save(false);
            }
            state.item_deleted_since_save = false;
            state.unsaved = false;
            state.children.values().cloned().collect()
        };
        for child in children {
            child.clear_changed_flag();
        }
    }

    /// Marks the node changed again after its write failed.
    pub(crate) fn mark_unsaved(&self) {
        self.state.lock().unsaved = true;
    }

    /// Current values of all cells.
    pub fn current_values(&self) -> BTreeMap<String, SettingData> {
        self.state
            .lock()
            .settings
            .iter()
            .map(|(key, value)| (key.clone(), value.value(false).clone()))
            .collect()
    }

    /// True if any cell differs from its default, or from the current value
    /// the all-users node holds for the same key. Children are checked
    /// without an all-users node.
    pub fn contains_modified_values(&self, all_users: Option<&SettingsNode>) -> bool {
        let all_users_values = all_users.map(SettingsNode::current_values);
        let children: Vec<Arc<SettingsNode>> = {
            let state = self.state.lock();
            for (key, value) in &state.settings {
                if value.differs_from_default() {
                    return true;
                }
                let differs_from_all_users = all_users_values
                    .as_ref()
                    .and_then(|values| values.get(key))
                    .is_some_and(|all_users_value| !value.value(false).text_eq(all_users_value));
                if differs_from_all_users {
                    return true;
                }
            }
            state.children.values().cloned().collect()
        };
        children
            .iter()
            .any(|child| child.contains_modified_values(None))
    }

    pub(crate) fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock();
        NodeSnapshot {
            settings: state.settings.clone(),
            children: state.children.clone(),
            hidden_from_ui: state.hidden_from_ui,
        }
    }

    /// Brings this node in line with `source`, the freshly read copy of the
    /// same file. `None` resets every value to its default.
    pub fn merge_from(&self, source: Option<&SettingsNode>) {
        let Some(source) = source else {
            let children: Vec<Arc<SettingsNode>> = {
                let mut state = self.state.lock();
                for value in state.settings.values_mut() {
                    let default = value.value(true).clone();
                    value.set_value(false, default, false);
                }
                state.children.values().cloned().collect()
            };
            for child in children {
                child.merge_from(None);
            }
            return;
        };

        let source = source.snapshot();
        let own_children = {
            let mut state = self.state.lock();
            for (key, value) in state.settings.iter_mut() {
                match source.settings.get(key) {
                    Some(other) => {
                        value.set_value(true, other.value(true).clone(), false);
                        value.set_value(false, other.value(false).clone(), false);
                    }
                    None => {
                        let default = value.value(true).clone();
                        value.set_value(false, default, false);
                    }
                }
            }
            for (key, other) in &source.settings {
                if !state.settings.contains_key(key) {
                    state.settings.insert(
                        key.clone(),
                        SettingValue::with_values(
                            key.as_str(),
                            other.runtime_type(),
                            other.value(false).clone(),
                            other.value(true).clone(),
                        ),
                    );
                }
            }
            state.children.clone()
        };

        for (key, child) in &own_children {
            child.merge_from(source.children.get(key).map(Arc::as_ref));
        }
        for (key, other_child) in &source.children {
            if own_children.contains_key(key) {
                continue;
            }
            self.add_child(key).merge_from(Some(other_child));
        }
    }

    /// Copies every cell of `source` into this node and marks it read-only.
    pub fn copy_from(&self, source: &SettingsNode) {
        let source = source.snapshot();
        let own_children = {
            let mut state = self.state.lock();
            for (key, other) in &source.settings {
                match state.settings.get_mut(key) {
                    Some(value) => value.copy_from(other),
                    None => {
                        state.settings.insert(
                            key.clone(),
                            SettingValue::with_values(
                                key.as_str(),
                                other.runtime_type(),
                                other.value(false).clone(),
                                other.value(true).clone(),
                            ),
                        );
                    }
                }
                if let Some(value) = state.settings.get_mut(key) {
                    value.set_read_only(true);
                }
            }
            state.children.clone()
        };

        for (key, other_child) in &source.children {
            match own_children.get(key) {
                Some(child) => child.copy_from(other_child),
                None => self.add_child(key).copy_from(other_child),
            }
        }
    }
}

macro_rules! typed_accessors {
    ($($ty:ty => $get:ident, $get_or:ident, $try_get:ident, $set:ident;)*) => {
        impl SettingsNode {
            $(
                pub fn $get(&self, key: &str) -> Result<$ty> {
                    self.get::<$ty>(key)
                }

                pub fn $get_or(&self, key: &str, default: $ty) -> $ty {
                    self.get_or(key, default)
                }

                pub fn $try_get(&self, key: &str) -> Option<$ty> {
                    self.try_get::<$ty>(key)
                }

                pub fn $set(&self, key: &str, value: $ty) {
                    self.set(key, value)
                }
            )*
        }
    };
}

typed_accessors! {
    bool => get_bool, get_bool_or, try_get_bool, set_bool;
    u8 => get_byte, get_byte_or, try_get_byte, set_byte;
    i32 => get_integer, get_integer_or, try_get_integer, set_integer;
    u32 => get_unsigned_integer, get_unsigned_integer_or, try_get_unsigned_integer, set_unsigned_integer;
    f64 => get_double, get_double_or, try_get_double, set_double;
    char => get_char, get_char_or, try_get_char, set_char;
    Uuid => get_guid, get_guid_or, try_get_guid, set_guid;
    NaiveDateTime => get_date, get_date_or, try_get_date, set_date;
    Color => get_color, get_color_or, try_get_color, set_color;
    Point => get_point, get_point_or, try_get_point, set_point;
    Point3d => get_point3d, get_point3d_or, try_get_point3d, set_point3d;
    Size => get_size, get_size_or, try_get_size, set_size;
    Rectangle => get_rectangle, get_rectangle_or, try_get_rectangle, set_rectangle;
    Vec<String> => get_string_list, get_string_list_or, try_get_string_list, set_string_list;
    Vec<(String, String)> => get_string_dictionary, get_string_dictionary_or, try_get_string_dictionary, set_string_dictionary;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_node() -> (Arc<SettingsNode>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let context = NodeContext::new(Arc::new(MemorySettingsService::new())).with_listener(
            Arc::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (SettingsNode::new(context, None, None), count)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_or_before_set_returns_default_and_stays_unmodified() {
        let (node, changes) = counting_node();
        assert_eq!(node.get_integer_or("Foo", 42), 42);
        assert_eq!(node.get_integer_or("Foo", 42), 42);
        assert!(!node.contains_modified_values(None));
        assert!(!node.contains_changed_values());
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        assert_eq!(node.setting_kind("Foo"), Some(ValueKind::Integer));
    }

    #[test]
    fn set_marks_changed_and_notifies_once_per_change() {
        let (node, changes) = counting_node();
        node.get_integer_or("Foo", 42);
        node.set_integer("Foo", 7);
        node.set_integer("Foo", 7);
        assert_eq!(node.get_integer("Foo").expect("present"), 7);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert!(node.contains_changed_values());
        assert!(node.contains_modified_values(None));

        node.clear_changed_flag();
        assert!(!node.contains_changed_values());
    }

    #[test]
    fn get_or_refreshes_default_of_existing_value() {
        let node = SettingsNode::in_memory();
        node.set_integer("Foo", 7);
        assert_eq!(node.get_integer_or("Foo", 42), 7);
        assert_eq!(node.try_get_default::<i32>("Foo"), Some(42));
        node.set_integer("Foo", 42);
        assert!(!node.contains_modified_values(None));
    }

    #[test]
    fn get_or_with_unparsable_value_returns_default_without_overwriting() {
        let node = SettingsNode::in_memory();
        node.set_string("Foo", "not a number");
        assert_eq!(node.get_integer_or("Foo", 3), 3);
        assert_eq!(node.try_get_string("Foo").as_deref(), Some("not a number"));
    }

    #[test]
    fn strict_get_reports_missing_and_mismatched_values() {
        let node = SettingsNode::in_memory();
        assert!(matches!(node.get_bool("Nope"), Err(SettingsError::KeyNotFound(k)) if k == "Nope"));
        node.set_string("Word", "abc");
        assert!(matches!(
            node.get_integer("Word"),
            Err(SettingsError::NotSupported { kind: ValueKind::Integer, .. })
        ));
    }

    #[test]
    fn legacy_key_is_moved_to_new_key() {
        let node = SettingsNode::in_memory();
        node.set_integer("OldName", 5);
        assert_eq!(node.try_get_legacy::<i32>("NewName", &["Missing", "OldName"]), Some(5));
        assert!(!node.contains_key("OldName"));
        assert_eq!(node.get_integer("NewName").expect("moved"), 5);
        assert_eq!(node.get_or_legacy("Other", 1i32, &["Absent"]), 1);
    }

    #[test]
    fn bounded_integer_getters() {
        let node = SettingsNode::in_memory();
        node.set_integer("N", 50);
        assert_eq!(node.get_integer_bounded("N", 0, 10, false), 10);
        assert_eq!(node.get_integer_bounded("N", 0, 60, true), 60);
        assert_eq!(node.get_integer_clamped("N", 0, 0, 20), 20);
        assert_eq!(node.get_integer_clamped("N", 0, 0, 100), 50);
    }

    #[test]
    fn validator_can_substitute_or_reject() {
        let node = SettingsNode::in_memory();
        node.register_validator::<i32, _>("Size", |_old, new| {
            if new < 0 {
                Validation::Reject
            } else {
                Validation::Accept(new.min(100))
            }
        });
        node.set_integer("Size", 500);
        assert_eq!(node.get_integer("Size").expect("set"), 100);
        node.set_integer("Size", -1);
        assert_eq!(node.get_integer("Size").expect("unchanged"), 100);
    }

    #[test]
    fn validator_sees_old_value() {
        let node = SettingsNode::in_memory();
        node.register_validator::<String, _>("Name", |old, new| match old {
            Some(old) if !old.is_empty() => Validation::Accept(format!("{old}+{new}")),
            _ => Validation::Accept(new),
        });
        node.set_string("Name", "a");
        node.set_string("Name", "b");
        assert_eq!(node.get_string("Name").expect("set"), "a+b");
    }

    #[test]
    fn validator_of_other_type_is_ignored() {
        let node = SettingsNode::in_memory();
        node.register_validator::<bool, _>("Count", |_, _| Validation::Reject);
        node.set_integer("Count", 3);
        assert_eq!(node.get_integer("Count").expect("set"), 3);
        assert!(node.validator::<i32>("Count").is_none());
        assert!(node.validator::<bool>("Count").is_some());
    }

    #[test]
    fn delete_then_re_add_same_value_is_a_change() {
        let (node, changes) = counting_node();
        node.set_bool("Flag", true);
        node.clear_changed_flag();

        node.delete_item("Flag");
        assert!(node.item_deleted_since_save());
        node.set_bool("Flag", true);

        assert!(node.contains_changed_values());
        assert!(changes.load(Ordering::SeqCst) >= 2);
        node.delete_item("NotThere");
    }

    #[test]
    fn children_are_created_once_and_strict_lookup_fails_when_missing() {
        let node = SettingsNode::in_memory();
        assert!(matches!(node.get_child("Advanced"), Err(SettingsError::KeyNotFound(_))));
        let child = node.add_child("Advanced");
        child.set_bool("EnableXFeature", true);
        assert!(Arc::ptr_eq(&child, &node.add_child("Advanced")));
        assert!(node.contains_changed_values());
        assert!(node.contains_modified_values(None));
        assert_eq!(node.child_keys(), vec!["Advanced".to_string()]);

        node.clear_changed_flag();
        node.delete_child("Advanced");
        assert!(node.try_get_child("Advanced").is_none());
        assert!(node.contains_changed_values());
    }

    #[test]
    fn hide_setting_requires_existing_key() {
        let node = SettingsNode::in_memory();
        assert!(node.hide_setting("x").is_err());
        node.set_bool("x", true);
        node.hide_setting("x").expect("hide");
        assert!(node.is_hidden("x"));
    }

    #[test]
    fn copied_cells_are_read_only() {
        let all_users = SettingsNode::in_memory();
        all_users.set_integer("Policy", 3);
        all_users.add_child("Nested").set_bool("On", true);

        let local = SettingsNode::in_memory();
        local.copy_from(&all_users);

        assert!(local.is_read_only("Policy"));
        local.set_integer("Policy", 9);
        assert_eq!(local.get_integer("Policy").expect("copied"), 3);
        let nested = local.get_child("Nested").expect("child copied");
        assert!(nested.get_bool("On").expect("copied"));
        assert!(nested.is_read_only("On"));
    }

    #[test]
    fn modified_against_all_users_value() {
        let all_users = SettingsNode::in_memory();
        all_users.get_integer_or("Mode", 1);
        all_users.set_integer("Mode", 2);

        let local = SettingsNode::in_memory();
        local.get_integer_or("Mode", 1);
        assert!(local.contains_modified_values(Some(&all_users)));
        assert!(!local.contains_modified_values(None));
    }

    #[test]
    fn merge_is_idempotent_and_adds_missing_entries() {
        let source = SettingsNode::in_memory();
        source.get_integer_or("A", 1);
        source.set_integer("A", 10);
        source.set_string("B", "new");
        source.add_child("Child").set_bool("C", true);

        let target = SettingsNode::in_memory();
        target.get_integer_or("A", 1);
        target.get_integer_or("Gone", 5);
        target.set_integer("Gone", 6);
        target.clear_changed_flag();

        target.merge_from(Some(&source));
        let first = (target.current_values(), target.keys(), target.child_keys());
        target.merge_from(Some(&source));
        let second = (target.current_values(), target.keys(), target.child_keys());

        assert_eq!(first, second);
        assert_eq!(target.get_integer("A").expect("merged"), 10);
        assert_eq!(target.get_integer("Gone").expect("reset"), 5);
        assert_eq!(target.get_string("B").expect("added"), "new");
        assert!(target.get_child("Child").expect("child").get_bool("C").expect("value"));
        assert!(!target.contains_changed_values(), "merge does not raise changes");
    }

    #[test]
    fn merge_without_source_resets_to_defaults() {
        let node = SettingsNode::in_memory();
        node.get_integer_or("A", 1);
        node.set_integer("A", 2);
        node.merge_from(None);
        assert_eq!(node.get_integer("A").expect("present"), 1);
    }

    #[test]
    fn string_list_expands_all_users_root() {
        let all_users = SettingsNode::in_memory();
        all_users.set_string("Paths", "R");
        let local = SettingsNode::new(
            NodeContext::new(Arc::new(MemorySettingsService::new())),
            Some(all_users),
            None,
        );
        local.set_string("Paths", "a|%root%|b");
        assert_eq!(local.get_string_list("Paths").expect("list"), strings(&["a", "R", "b"]));
    }

    #[test]
    fn string_list_and_dictionary_round_trip() {
        let node = SettingsNode::in_memory();
        node.set_string_list("Recent", strings(&["a.3dm", "b.3dm"]));
        assert_eq!(node.get_string_list("Recent").expect("list"), strings(&["a.3dm", "b.3dm"]));
        assert_eq!(
            node.raw_value("Recent", false),
            Some(SettingData::List(strings(&["a.3dm", "b.3dm"])))
        );

        let pairs = vec![("k".to_string(), "v".to_string())];
        node.set_string_dictionary("Map", pairs.clone());
        assert_eq!(node.get_string_dictionary("Map").expect("dictionary"), pairs);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::FromRepr, strum_macros::IntoStaticStr, strum_macros::EnumString)]
    #[repr(i32)]
    enum Shading {
        Wireframe = 0,
        Rendered = 2,
    }

    impl SettingEnum for Shading {
        fn to_i32(self) -> i32 {
            self as i32
        }

        fn from_i32(value: i32) -> Option<Self> {
            Shading::from_repr(value)
        }

        fn name(self) -> &'static str {
            self.into()
        }

        fn from_name(name: &str) -> Option<Self> {
            name.parse().ok()
        }
    }

    #[test]
    fn enums_are_stored_as_integers() {
        let node = SettingsNode::in_memory();
        assert_eq!(node.get_enum_value_or(Shading::Wireframe), Shading::Wireframe);
        node.set_enum_value(Shading::Rendered);
        assert_eq!(node.get_string("Shading").expect("stored"), "2");
        assert_eq!(node.get_enum::<Shading>("Shading").expect("enum"), Shading::Rendered);
        assert_eq!(
            crate::converter::try_parse_enum_name::<Shading>("2"),
            Some("Rendered")
        );
        assert_eq!(crate::converter::try_parse_enum_value::<Shading>("Rendered"), Some(2));
    }
}
