//! End-to-end tests for the settings runtime:
//! - values written as XML entries and read back by a fresh runtime
//! - machine wide values layered beneath the user's
//! - deferred write-back after a burst of changes
//! - files changed by another process merged back in

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use persistent_settings::{
    MemorySettingsService, NodeContext, PathContext, PluginDescriptor, RuntimeConfig,
    SettingsNode, SettingsOwner, SettingsRuntime, SettingsTier, WriteBackState,
};

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn memory_runtime(base: &Path, service: &Arc<MemorySettingsService>) -> SettingsRuntime {
    let mut config = RuntimeConfig::default();
    config.scheduler.write_back_delay_ms = 50;
    SettingsRuntime::builder()
        .with_paths(PathContext::with_base_path(base, "Acme", "cad_host"))
        .with_service(service.clone())
        .with_config(config)
        .build()
        .expect("runtime")
}

fn file_runtime(base: &Path, use_file_watchers: bool) -> SettingsRuntime {
    let mut config = RuntimeConfig::default();
    config.scheduler.watcher_delay_ms = 50;
    config.service.use_file_watchers = use_file_watchers;
    SettingsRuntime::builder()
        .with_paths(PathContext::with_base_path(base, "Acme", "cad_host"))
        .with_config(config)
        .build()
        .expect("runtime")
}

#[test]
fn modified_integer_is_saved_as_entry() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let runtime = memory_runtime(dir.path(), &service);

    let settings = runtime.host_settings();
    let node = settings.plugin_settings();
    assert_eq!(node.get_integer_or("Foo", 42), 42);
    node.set_integer("Foo", 7);

    assert!(runtime.save_settings_now(settings.plugin_id(), false));
    let text = service
        .contents_string(&settings.settings_file(false))
        .expect("written");
    assert!(text.contains(r#"<entry key="Foo">7</entry>"#), "{text}");
}

#[test]
fn string_list_survives_a_restart() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let recent = vec!["a.3dm".to_string(), "b.3dm".to_string()];
    let plugin = PluginDescriptor::new(Uuid::new_v4(), Some("Recent Files"));

    {
        let runtime = memory_runtime(dir.path(), &service);
        let settings = runtime.plugin(&plugin);
        settings.plugin_settings().set_string_list("Recent", recent.clone());
        settings
            .command_settings("Open")
            .set_bool("ShowPreview", false);
        assert_eq!(runtime.shutdown(), 1);
    }

    let runtime = memory_runtime(dir.path(), &service);
    let settings = runtime.plugin(&plugin);
    assert_eq!(
        settings.plugin_settings().get_string_list("Recent").expect("list"),
        recent
    );
    assert_eq!(settings.command_names(), vec!["Open".to_string()]);
    assert!(!settings
        .command_settings("Open")
        .get_bool("ShowPreview")
        .expect("flag"));
}

#[test]
fn legacy_list_expands_root_from_all_users() {
    let context = NodeContext::new(Arc::new(MemorySettingsService::new()));
    let all_users = SettingsNode::new(context.clone(), None, None);
    all_users.set_string("SearchPaths", "R");
    let node = SettingsNode::new(context, Some(all_users), None);
    node.set_string("SearchPaths", "a|%root%|b");

    assert_eq!(
        node.get_string_list("SearchPaths").expect("list"),
        vec!["a".to_string(), "R".to_string(), "b".to_string()]
    );
}

#[test]
fn burst_of_changes_is_written_once() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let runtime = memory_runtime(dir.path(), &service);
    runtime.mark_started();

    let node = runtime.host_settings().plugin_settings();
    for value in 1..=5 {
        node.set_integer("Foo", value);
        std::thread::sleep(Duration::from_millis(15));
    }
    assert_eq!(runtime.pending_plugins(), vec![runtime.config().host_id]);

    assert!(wait_for(Duration::from_secs(2), || {
        runtime.write_back_state() == WriteBackState::PendingFlush
    }));
    assert_eq!(service.write_count(), 0);

    runtime.on_idle();
    runtime.on_idle();
    assert_eq!(service.write_count(), 1);
    assert_eq!(runtime.write_back_state(), WriteBackState::Idle);
    assert!(runtime.pending_plugins().is_empty());
}

#[test]
fn unsupported_version_leaves_settings_empty() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let runtime = memory_runtime(dir.path(), &service);
    let settings = runtime.host_settings();
    service.insert(
        settings.settings_file(false),
        r#"<?xml version="1.0" encoding="utf-8"?><settings id="1.0"><settings><entry key="Foo">7</entry></settings></settings>"#,
    );

    let node = settings.plugin_settings();
    assert!(node.is_empty());
    assert_eq!(node.try_get_integer("Foo"), None);
}

#[test]
fn all_users_values_are_read_only_defaults() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let runtime = memory_runtime(dir.path(), &service);
    let settings = runtime.host_settings();
    let all_users = settings.all_users().expect("all users tier");
    service.insert(
        all_users.settings_file(false),
        r#"<settings id="2.0"><settings><entry key="Units">inch</entry></settings></settings>"#,
    );

    let node = settings.plugin_settings();
    assert_eq!(node.get_string_or("Units", "mm"), "inch");
    assert!(node.is_read_only("Units"));

    node.set_string("Units", "mm");
    assert_eq!(node.get_string("Units").expect("units"), "inch");
    assert!(!settings.contains_changed_since_saved_values());
}

#[test]
fn all_users_tier_can_be_disabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new().with_all_users(false));
    let runtime = memory_runtime(dir.path(), &service);
    let settings = runtime.host_settings();
    service.insert(
        settings.all_users().expect("all users tier").settings_file(false),
        r#"<settings id="2.0"><settings><entry key="Units">inch</entry></settings></settings>"#,
    );

    assert_eq!(settings.plugin_settings().get_string_or("Units", "mm"), "mm");
}

#[test]
fn file_service_writes_and_deletes_on_disk() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = file_runtime(dir.path(), false);
    let settings = runtime.host_settings();
    let file = settings.settings_file(false);

    let node = settings.plugin_settings();
    node.get_double_or("Tolerance", 0.01);
    node.set_double("Tolerance", 0.5);
    assert!(runtime.save_settings_now(settings.plugin_id(), false));
    let text = std::fs::read_to_string(&file).expect("settings file");
    assert!(text.contains(r#"<entry key="Tolerance">0.5</entry>"#), "{text}");

    let reloaded = file_runtime(dir.path(), false).host_settings();
    assert_eq!(reloaded.plugin_settings().get_double_or("Tolerance", 0.01), 0.5);

    node.set_double("Tolerance", 0.01);
    assert!(runtime.save_settings_now(settings.plugin_id(), false));
    assert!(!file.exists());
}

#[test]
fn scheme_selects_its_own_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(MemorySettingsService::new());
    let runtime = SettingsRuntime::builder()
        .with_paths(PathContext::with_base_path(dir.path(), "Acme", "cad_host"))
        .with_service(service.clone())
        .with_config(RuntimeConfig::default().with_scheme("Work"))
        .build()
        .expect("runtime");

    let settings = runtime.host_settings();
    settings.plugin_settings().set_bool("Dark", true);
    assert!(runtime.save_settings_now(settings.plugin_id(), false));

    let file = runtime.paths().settings_file(
        SettingsTier::CurrentUser,
        &SettingsOwner::Host,
        Some("Work"),
        false,
    );
    assert_eq!(settings.settings_file(false), file);
    assert!(service.contents(&file).is_some());
}

#[test]
fn external_write_is_merged_and_reported() {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let watching = file_runtime(dir.path(), true);
    watching
        .paths()
        .ensure_directories(SettingsTier::CurrentUser, &SettingsOwner::Host)
        .expect("settings folder");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    watching.subscribe(move |saved| {
        sink.lock().push((saved.saved_by_this_process, saved.dirty, saved.previous.is_some()))
    });

    let settings = watching.host_settings();
    let node = settings.plugin_settings();
    assert_eq!(node.get_integer_or("Count", 1), 1);
    assert!(settings.is_watching());

    let other = file_runtime(dir.path(), false);
    let other_settings = other.host_settings();
    other_settings.plugin_settings().set_integer("Count", 5);
    assert!(other.save_settings_now(other_settings.plugin_id(), false));

    assert!(wait_for(Duration::from_secs(5), || {
        !watching.queued_events().is_empty()
    }));
    watching.on_idle();

    assert_eq!(node.get_integer_or("Count", 1), 5);
    assert!(seen.lock().contains(&(false, false, true)), "{:?}", seen.lock());
}
