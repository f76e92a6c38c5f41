//! Persistent settings for a host application and its plug-ins.
//!
//! Each plug-in owns a [`PluginSettings`] aggregate: a tree of
//! [`SettingsNode`]s for the plug-in itself, one per command and one for
//! window positions. Values are stored as XML below the current user's data
//! folder, layered over read-only machine wide ("all users") values. The
//! [`SettingsRuntime`] keeps the aggregates, writes changes back after a quiet
//! period and reports files changed by other processes.

pub mod codec;
pub mod config;
pub mod converter;
mod errors;
pub mod in_memory;
mod node;
mod plugin;
mod runtime;
pub mod scheduler;
pub mod service;
pub mod value;
pub mod watcher;
pub mod xml;

pub use config::{RuntimeConfig, SchedulerConfig, ServiceConfig};
pub use errors::{Result, SettingsError};
pub use in_memory::MemorySettingsService;
pub use node::{ChangeListener, NodeContext, SettingsNode, Validation, Validator};
pub use plugin::{PluginSettings, SettingsContext, SettingsEvents};
pub use runtime::{
    ForegroundBusy, Lifecycle, PluginDescriptor, SettingsRuntime, SettingsRuntimeBuilder,
    SettingsSaved, SettingsSavedEvent, Subscriber,
};
pub use scheduler::WriteBackState;
pub use service::{FileSettingsService, SettingsService};
pub use value::{
    Color, EnumSetting, Point, Point3d, Rectangle, SettingData, SettingEnum, SettingType,
    SettingValue, Size, ValueKind,
};

pub use paths::{PathContext, SettingsOwner, SettingsTier};
