//! Path context for runtime environment detection and settings file locations.
//!
//! Settings live under two data roots: a per-user root and a machine wide
//! "all users" root. Below a root the host keeps its files in `settings/`,
//! plug-ins in `Plug-ins/<Name> (<id>)/settings/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable overriding the per-user data root.
pub const USER_DATA_ENV: &str = "PERSISTENT_SETTINGS_DATA";
/// Environment variable overriding the all-users data root.
pub const ALL_USERS_DATA_ENV: &str = "PERSISTENT_SETTINGS_ALL_USERS_DATA";

const SETTINGS_FILE_STEM: &str = "settings";
const WINDOW_POSITIONS_FILE_STEM: &str = "window_positions";

/// Identifies the runtime environment where the application is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    /// Running via `cargo run` or in development mode
    Development,
    /// Running as an installed binary in production
    Production,
}

/// Which settings tier a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsTier {
    /// Per-user settings, always writable.
    CurrentUser,
    /// Machine wide settings, read beneath the current user tier.
    AllUsers,
}

/// Whose settings a folder holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettingsOwner {
    /// The host application itself.
    Host,
    /// A plug-in, identified by its id and optional display name.
    PlugIn { id: String, name: Option<String> },
}

impl SettingsOwner {
    pub fn plugin(id: impl Into<String>, name: Option<&str>) -> Self {
        SettingsOwner::PlugIn {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }
}

/// Context for resolving settings folders and file names.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// The runtime environment (development or production)
    environment: RuntimeEnvironment,
    /// Root for per-user data
    user_root: Arc<Path>,
    /// Root for machine wide data
    all_users_root: Arc<Path>,
    /// Company identifier (e.g., "McNeel")
    company: String,
    /// Application identifier (e.g., "cad_host")
    app_id: String,
}

impl PathContext {
    /// Creates a new PathContext with automatic environment detection.
    pub fn new(company: impl Into<String>, app_id: impl Into<String>) -> Self {
        let company = company.into();
        let app_id = app_id.into();
        let environment = Self::detect_environment();
        let (user_root, all_users_root) = Self::determine_roots(environment, &company, &app_id);

        Self {
            environment,
            user_root: user_root.into(),
            all_users_root: all_users_root.into(),
            company,
            app_id,
        }
    }

    /// Creates a PathContext below an explicit base path (useful for testing).
    ///
    /// The current user root becomes `<base>/user`, the all-users root
    /// `<base>/all_users`.
    pub fn with_base_path(
        base_path: impl Into<PathBuf>,
        company: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        let base_path = base_path.into();
        Self {
            environment: Self::detect_environment(),
            user_root: base_path.join("user").into(),
            all_users_root: base_path.join("all_users").into(),
            company: company.into(),
            app_id: app_id.into(),
        }
    }

    /// Creates a PathContext with two explicit roots.
    pub fn with_roots(
        user_root: impl Into<PathBuf>,
        all_users_root: impl Into<PathBuf>,
        company: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            environment: Self::detect_environment(),
            user_root: user_root.into().into(),
            all_users_root: all_users_root.into().into(),
            company: company.into(),
            app_id: app_id.into(),
        }
    }

    /// Detects the runtime environment based on executable location.
    fn detect_environment() -> RuntimeEnvironment {
        // Check if running from cargo (development)
        if let Ok(exe_path) = std::env::current_exe() {
            if exe_path.components().any(|c| c.as_os_str() == "target") {
                return RuntimeEnvironment::Development;
            }
        }

        // Check for cargo environment variables
        if std::env::var("CARGO").is_ok() || std::env::var("CARGO_MANIFEST_DIR").is_ok() {
            return RuntimeEnvironment::Development;
        }

        RuntimeEnvironment::Production
    }

    /// Determines the (current user, all users) roots for the environment.
    fn determine_roots(
        environment: RuntimeEnvironment,
        company: &str,
        app_id: &str,
    ) -> (PathBuf, PathBuf) {
        let user_override = std::env::var_os(USER_DATA_ENV).map(PathBuf::from);
        let all_users_override = std::env::var_os(ALL_USERS_DATA_ENV).map(PathBuf::from);

        let (user_default, all_users_default) = match environment {
            RuntimeEnvironment::Development => {
                // In development, keep everything below the project's target dir
                let base = if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
                    PathBuf::from(manifest_dir)
                } else if let Ok(current_dir) = std::env::current_dir() {
                    current_dir
                } else {
                    PathBuf::from(".")
                };
                let data = base.join("target").join("settings-data");
                (data.join("user"), data.join("all_users"))
            }
            RuntimeEnvironment::Production => {
                let user = dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(company)
                    .join(app_id);
                let machine = machine_data_dir().join(company).join(app_id);
                (user, machine)
            }
        };

        (
            user_override.unwrap_or(user_default),
            all_users_override.unwrap_or(all_users_default),
        )
    }

    /// Returns the runtime environment.
    pub fn environment(&self) -> RuntimeEnvironment {
        self.environment
    }

    /// Returns the company identifier.
    pub fn company(&self) -> &str {
        &self.company
    }

    /// Returns the app identifier.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Returns the data root of a tier.
    pub fn root(&self, tier: SettingsTier) -> &Path {
        match tier {
            SettingsTier::CurrentUser => &self.user_root,
            SettingsTier::AllUsers => &self.all_users_root,
        }
    }

    /// Returns the settings folder: `<root>/settings` for the host,
    /// `<root>/Plug-ins/<Name> (<id>)/settings` for plug-ins.
    pub fn settings_dir(&self, tier: SettingsTier, owner: &SettingsOwner) -> PathBuf {
        let root = self.root(tier);
        match owner {
            SettingsOwner::Host => root.join("settings"),
            SettingsOwner::PlugIn { id, name } => root
                .join("Plug-ins")
                .join(plugin_folder_name(id, name.as_deref()))
                .join("settings"),
        }
    }

    /// Returns the settings file path: `<settings_dir>/settings[-scheme].xml`
    /// or `<settings_dir>/window_positions[-scheme].xml`.
    pub fn settings_file(
        &self,
        tier: SettingsTier,
        owner: &SettingsOwner,
        scheme: Option<&str>,
        window_positions: bool,
    ) -> PathBuf {
        self.settings_dir(tier, owner)
            .join(settings_file_name(scheme, window_positions))
    }

    /// Ensures the settings folder of a tier exists.
    pub fn ensure_directories(&self, tier: SettingsTier, owner: &SettingsOwner) -> std::io::Result<()> {
        let dir = self.settings_dir(tier, owner);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Builds `settings[-scheme].xml` / `window_positions[-scheme].xml`.
pub fn settings_file_name(scheme: Option<&str>, window_positions: bool) -> String {
    let stem = if window_positions {
        WINDOW_POSITIONS_FILE_STEM
    } else {
        SETTINGS_FILE_STEM
    };
    match scheme.and_then(sanitize_scheme) {
        Some(scheme) => format!("{stem}-{scheme}.xml"),
        None => format!("{stem}.xml"),
    }
}

/// Turns a scheme name into something usable inside a file name.
///
/// Blank names yield `None`. Characters that are invalid in file names,
/// spaces and colons become `_`.
pub fn sanitize_scheme(scheme: &str) -> Option<String> {
    let trimmed = scheme.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .chars()
            .map(|c| {
                if is_invalid_file_name_char(c) || c == ' ' || c == ':' {
                    '_'
                } else {
                    c
                }
            })
            .collect(),
    )
}

/// Folder name of a plug-in: `<Name> (<id>)`, or just the id without a name.
/// Characters that are invalid in file names are removed.
pub fn plugin_folder_name(id: &str, name: Option<&str>) -> String {
    let id = id.to_lowercase();
    let raw = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("{name} ({id})"),
        None => id,
    };
    raw.chars().filter(|c| !is_invalid_file_name_char(*c)).collect()
}

/// The portable set of characters that may not appear in a file name.
fn is_invalid_file_name_char(c: char) -> bool {
    c.is_control() || matches!(c, '"' | '<' | '>' | '|' | ':' | '*' | '?' | '\\' | '/')
}

/// Machine wide data folder for the all-users tier.
fn machine_data_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"))
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support")
    } else {
        PathBuf::from("/usr/local/share")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "1B6F4E3A-0C7D-4F0B-9F3A-6C1D2E3F4A5B";

    #[test]
    fn test_path_context_structure() {
        let ctx = PathContext::with_base_path(PathBuf::from("/test/base"), "acme", "cad");

        assert_eq!(ctx.company(), "acme");
        assert_eq!(ctx.app_id(), "cad");
        assert_eq!(
            ctx.root(SettingsTier::CurrentUser),
            Path::new("/test/base/user")
        );
        assert_eq!(
            ctx.root(SettingsTier::AllUsers),
            Path::new("/test/base/all_users")
        );
    }

    #[test]
    fn test_host_settings_paths() {
        let ctx = PathContext::with_base_path(PathBuf::from("/base"), "acme", "cad");

        assert_eq!(
            ctx.settings_file(SettingsTier::CurrentUser, &SettingsOwner::Host, None, false),
            PathBuf::from("/base/user/settings/settings.xml")
        );
        assert_eq!(
            ctx.settings_file(SettingsTier::AllUsers, &SettingsOwner::Host, None, true),
            PathBuf::from("/base/all_users/settings/window_positions.xml")
        );
    }

    #[test]
    fn test_plugin_settings_paths() {
        let ctx = PathContext::with_base_path(PathBuf::from("/base"), "acme", "cad");
        let owner = SettingsOwner::plugin(ID, Some("Mesh Tools"));

        assert_eq!(
            ctx.settings_file(SettingsTier::CurrentUser, &owner, Some("Large Icons"), false),
            PathBuf::from(
                "/base/user/Plug-ins/Mesh Tools (1b6f4e3a-0c7d-4f0b-9f3a-6c1d2e3f4a5b)/settings/settings-Large_Icons.xml"
            )
        );

        let unnamed = SettingsOwner::plugin(ID, None);
        assert_eq!(
            ctx.settings_dir(SettingsTier::AllUsers, &unnamed),
            PathBuf::from("/base/all_users/Plug-ins/1b6f4e3a-0c7d-4f0b-9f3a-6c1d2e3f4a5b/settings")
        );
    }

    #[test]
    fn test_sanitize_scheme() {
        assert_eq!(sanitize_scheme("   "), None);
        assert_eq!(sanitize_scheme(" Default "), Some("Default".to_string()));
        assert_eq!(sanitize_scheme("a b:c/d"), Some("a_b_c_d".to_string()));
        assert_eq!(sanitize_scheme("x?*y"), Some("x__y".to_string()));
    }

    #[test]
    fn test_settings_file_name() {
        assert_eq!(settings_file_name(None, false), "settings.xml");
        assert_eq!(settings_file_name(Some(""), true), "window_positions.xml");
        assert_eq!(settings_file_name(Some("Work"), true), "window_positions-Work.xml");
    }

    #[test]
    fn test_plugin_folder_name_strips_invalid_characters() {
        assert_eq!(plugin_folder_name("ABC", Some("Tools: <beta>")), "Tools beta (abc)");
        assert_eq!(plugin_folder_name("ABC", Some("  ")), "abc");
    }

    #[test]
    fn test_ensure_directories() {
        let tmp = std::env::temp_dir().join(format!(
            "paths_test_{}",
            std::process::id()
        ));
        let ctx = PathContext::with_base_path(tmp.clone(), "acme", "cad");
        ctx.ensure_directories(SettingsTier::CurrentUser, &SettingsOwner::Host)
            .expect("create settings dir");
        assert!(ctx
            .settings_dir(SettingsTier::CurrentUser, &SettingsOwner::Host)
            .is_dir());
        let _ = std::fs::remove_dir_all(tmp);
    }
}
