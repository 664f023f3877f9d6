//! Engine resolution from database URLs.

use crate::error::{SessionError, SessionResult};
use crate::memory::MemoryEngine;
use crate::session::Engine;
use std::path::Path;
use std::sync::Arc;

/// Returns the backend name of a URL: its scheme up to any `+driver` suffix.
#[must_use]
pub fn backend_name(url: &str) -> String {
    let scheme = url.split_once(':').map_or(url, |(scheme, _)| scheme);
    scheme
        .split('+')
        .next()
        .unwrap_or(scheme)
        .to_ascii_lowercase()
}

/// Creates the engine serving `url`.
///
/// Supported backends:
/// - `memory:` - ephemeral in-memory tables
/// - `json://<path>` - in-memory tables persisted to a JSON file
///
/// # Errors
///
/// Returns [`SessionError::UnsupportedBackend`] for other schemes, or an
/// error if the JSON file cannot be loaded.
pub fn create_engine(url: &str) -> SessionResult<Arc<dyn Engine>> {
    match backend_name(url).as_str() {
        "memory" => Ok(Arc::new(MemoryEngine::new())),
        "json" => {
            let path = file_path(url);
            if path.is_empty() {
                return Err(SessionError::backend("json backend requires a file path"));
            }
            Ok(Arc::new(MemoryEngine::open_file(Path::new(path))?))
        }
        _ => Err(SessionError::UnsupportedBackend {
            scheme: url.split_once(':').map_or(url, |(s, _)| s).to_string(),
        }),
    }
}

/// Extracts the file path of a `json://[user:pass@]<path>` URL.
fn file_path(url: &str) -> &str {
    let rest = url.split_once(':').map_or("", |(_, rest)| rest);
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    match rest.split_once('@') {
        Some((userinfo, path)) if !userinfo.contains('/') => path,
        _ => rest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_strips_driver() {
        assert_eq!(backend_name("memory:"), "memory");
        assert_eq!(backend_name("postgresql+psycopg2://host/db"), "postgresql");
        assert_eq!(backend_name("JSON:///tmp/x.json"), "json");
    }

    #[test]
    fn file_path_skips_credentials() {
        assert_eq!(file_path("json:///tmp/db.json"), "/tmp/db.json");
        assert_eq!(file_path("json://user:pw@/tmp/db.json"), "/tmp/db.json");
        assert_eq!(file_path("json://relative/db.json"), "relative/db.json");
    }

    #[test]
    fn unsupported_scheme() {
        assert!(matches!(
            create_engine("mysql://localhost/db"),
            Err(SessionError::UnsupportedBackend { scheme }) if scheme == "mysql"
        ));
    }

    #[test]
    fn memory_engine_from_url() {
        let engine = create_engine("memory:").unwrap();
        assert_eq!(engine.backend_name(), "memory");
    }
}
