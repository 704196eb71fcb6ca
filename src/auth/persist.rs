// Session persistence in a SQLite key/value table

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use super::types::PersistedSession;

const SESSION_KEY: &str = "session";

fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open session database: {}", path.display()))?;
    ensure_schema(&conn)?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )
    .context("Failed to create session_kv table")?;
    Ok(())
}

/// Load persisted session evidence; a missing row yields an empty record
pub fn load(path: &Path) -> Result<PersistedSession> {
    let conn = open(path)?;
    load_from(&conn)
}

fn load_from(conn: &Connection) -> Result<PersistedSession> {
    let json: Option<String> = conn
        .query_row(
            "SELECT value FROM session_kv WHERE key = ?",
            [SESSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to load session from SQLite")?;

    match json {
        Some(json) => serde_json::from_str(&json).context("Failed to parse persisted session"),
        None => Ok(PersistedSession::default()),
    }
}

/// Store session evidence, replacing any previous record
pub fn save(path: &Path, session: &PersistedSession) -> Result<()> {
    let conn = open(path)?;
    save_to(&conn, session)
}

fn save_to(conn: &Connection, session: &PersistedSession) -> Result<()> {
    let json = serde_json::to_string(session).context("Failed to serialize session")?;
    conn.execute(
        "INSERT INTO session_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SESSION_KEY, json.as_str()],
    )
    .context("Failed to save session to SQLite")?;
    Ok(())
}

/// Remove any stored session
pub fn clear(path: &Path) -> Result<()> {
    let conn = open(path)?;
    conn.execute("DELETE FROM session_kv WHERE key = ?", [SESSION_KEY])
        .context("Failed to clear session from SQLite")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_database_loads_default() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        assert_eq!(load_from(&conn).unwrap(), PersistedSession::default());
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        let first = PersistedSession {
            access_token: Some("a1".into()),
            refresh_token: Some("r1".into()),
            expires_at_ms: Some(1_000),
            user_id: Some("u".into()),
        };
        save_to(&conn, &first).unwrap();

        let second = PersistedSession {
            access_token: Some("a2".into()),
            ..first.clone()
        };
        save_to(&conn, &second).unwrap();

        assert_eq!(load_from(&conn).unwrap(), second);
    }

    #[test]
    fn test_file_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sqlite3");

        let record = PersistedSession {
            user_id: Some("cookie-user".into()),
            ..Default::default()
        };
        save(&path, &record).unwrap();
        assert_eq!(load(&path).unwrap(), record);

        clear(&path).unwrap();
        assert_eq!(load(&path).unwrap(), PersistedSession::default());
    }
}
