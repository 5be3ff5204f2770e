use std::env;
use std::path::PathBuf;

/// Environment variable that overrides every other database location.
pub const DATABASE_PATH_ENV: &str = "CHATWATCH_DATABASE_PATH";

/// Get the global Chatwatch data directory (~/.chatwatch/data)
fn get_global_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatwatch")
        .join("data")
}

/// Resolve the alert database path
///
/// Priority:
/// 1. CHATWATCH_DATABASE_PATH env var
/// 2. `database_path` from the configuration file
/// 3. Global: ~/.chatwatch/data/chatwatch.db
pub fn resolve_database_path(configured: Option<&str>) -> PathBuf {
    if let Ok(db_path) = env::var(DATABASE_PATH_ENV) {
        if !db_path.trim().is_empty() {
            return PathBuf::from(db_path);
        }
    }

    match configured {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => get_global_data_dir().join("chatwatch.db"),
    }
}
