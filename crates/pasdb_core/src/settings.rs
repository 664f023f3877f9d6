//! Database settings.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the settings file below `<path_data>/settings`.
pub const SETTINGS_FILE: &str = "pas_database.json";

/// Placeholder in database URLs replaced with the absolute base path.
pub const PATH_BASE_PLACEHOLDER: &str = "__path_base__";

/// Database settings as read from `pas_database.json`.
///
/// Keys that are not database settings are ignored, so the file may be shared
/// with other components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Database URL. Required.
    #[serde(rename = "pas_database_url")]
    pub url: Option<String>,

    /// User name, used only if the URL carries no credentials.
    #[serde(rename = "pas_database_user")]
    pub user: Option<String>,

    /// Password, used only if the URL carries no credentials.
    #[serde(rename = "pas_database_password")]
    pub password: Option<String>,

    /// Prefix prepended to every table name.
    #[serde(rename = "pas_database_table_prefix")]
    pub table_prefix: String,

    /// Whether threads may use the database concurrently.
    #[serde(rename = "pas_database_threaded")]
    pub threaded: bool,

    /// Seconds to wait for the serialization lock.
    #[serde(rename = "pas_database_lock_timeout")]
    pub lock_timeout_secs: f64,

    /// Whether nested transactions use savepoints.
    #[serde(rename = "pas_database_transaction_use_native_nested")]
    pub use_native_nested: bool,

    /// Whether maintenance runs externally, disabling opportunistic cleanup.
    #[serde(rename = "pas_database_auto_maintenance")]
    pub auto_maintenance: bool,

    /// Whether to log connection and lock activity per thread.
    #[serde(rename = "pas_database_threaded_debug")]
    pub threaded_debug: bool,

    /// Base path substituted for `__path_base__`.
    pub path_base: PathBuf,

    /// Data path holding settings and schema scripts.
    pub path_data: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            table_prefix: "pas".to_string(),
            threaded: true,
            lock_timeout_secs: 30.0,
            use_native_nested: true,
            auto_maintenance: false,
            threaded_debug: false,
            path_base: PathBuf::from("."),
            path_data: PathBuf::from("data"),
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `<path_data>/settings/pas_database.json`.
    ///
    /// The returned settings use `path_data` as their data path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path_data: &Path) -> DbResult<Self> {
        let mut settings = Self::from_file(&path_data.join("settings").join(SETTINGS_FILE))?;
        settings.path_data = path_data.to_path_buf();
        Ok(settings)
    }

    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Sets the database URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the fallback credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the table prefix.
    #[must_use]
    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Sets whether threads may use the database concurrently.
    #[must_use]
    pub const fn threaded(mut self, value: bool) -> Self {
        self.threaded = value;
        self
    }

    /// Sets the serialization lock timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets whether nested transactions use savepoints.
    #[must_use]
    pub const fn use_native_nested(mut self, value: bool) -> Self {
        self.use_native_nested = value;
        self
    }

    /// Sets whether maintenance runs externally.
    #[must_use]
    pub const fn auto_maintenance(mut self, value: bool) -> Self {
        self.auto_maintenance = value;
        self
    }

    /// Sets whether per-thread debug logging is enabled.
    #[must_use]
    pub const fn threaded_debug(mut self, value: bool) -> Self {
        self.threaded_debug = value;
        self
    }

    /// Sets the base path.
    #[must_use]
    pub fn path_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_base = path.into();
        self
    }

    /// Sets the data path.
    #[must_use]
    pub fn path_data(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_data = path.into();
        self
    }

    /// Validates the settings and computes the values used at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Configuration`] if no URL is set or the lock timeout
    /// is invalid.
    pub fn resolve(&self) -> DbResult<ResolvedSettings> {
        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| DbError::configuration("Minimum database configuration missing"))?;

        let lock_timeout = Duration::try_from_secs_f64(self.lock_timeout_secs).map_err(|err| {
            DbError::configuration(format!(
                "invalid lock timeout {}: {err}",
                self.lock_timeout_secs
            ))
        })?;

        let mut url = if url.contains(PATH_BASE_PLACEHOLDER) {
            let base = std::path::absolute(&self.path_base)?;
            url.replace(PATH_BASE_PLACEHOLDER, &base.to_string_lossy())
        } else {
            url.to_string()
        };
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            url = with_credentials(&url, user, password);
        }

        Ok(ResolvedSettings {
            backend_name: pasdb_session::backend_name(&url),
            url,
            table_prefix: self.table_prefix.clone(),
            serialized: !self.threaded,
            lock_timeout,
            use_native_nested: self.use_native_nested,
            auto_maintenance: self.auto_maintenance,
            threaded_debug: self.threaded_debug,
            path_data: self.path_data.clone(),
        })
    }
}

/// Immutable settings in effect for a registry.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    /// Final database URL.
    pub url: String,
    /// Backend name, the URL scheme without driver suffix.
    pub backend_name: String,
    /// Table prefix.
    pub table_prefix: String,
    /// Whether connection contexts are serialized across threads.
    pub serialized: bool,
    /// Serialization lock timeout.
    pub lock_timeout: Duration,
    /// Whether nested transactions use savepoints.
    pub use_native_nested: bool,
    /// Whether maintenance runs externally.
    pub auto_maintenance: bool,
    /// Whether per-thread debug logging is enabled.
    pub threaded_debug: bool,
    /// Data path.
    pub path_data: PathBuf,
}

impl ResolvedSettings {
    /// Returns `<path_data>/database/<backend>_schema/<class_name>`.
    #[must_use]
    pub fn schema_directory(&self, class_name: &str) -> PathBuf {
        self.path_data
            .join("database")
            .join(format!("{}_schema", self.backend_name))
            .join(class_name)
    }
}

/// Inserts credentials into a URL that does not carry any.
fn with_credentials(url: &str, user: &str, password: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if rest[..authority_end].contains('@') {
        return url.to_string();
    }
    format!(
        "{scheme}://{}:{}@{rest}",
        encode_userinfo(user),
        encode_userinfo(password)
    )
}

fn encode_userinfo(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | ':' | '@' | '/' | '?' | '#' => encoded.push_str(&format!("%{:02X}", c as u32)),
            c => encoded.push(c),
        }
    }
    encoded
}
