//! Best-effort account detection.
//!
//! The host keeps its signed-in account inside a SQLite key/value table
//! (`ItemTable`) in `state.vscdb`. We never depend on it: anything we
//! cannot read or parse simply yields an unknown identity.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use rusqlite::types::ValueRef;
use serde::Serialize;
use serde_json::Value;

pub const STATE_DB: &str = "state.vscdb";

/// Keys inspected in order; the first one carrying an email wins.
const IDENTITY_KEYS: &[&str] = &[
    "antigravityAuthStatus",
    "google.antigravity",
    "antigravityUserSettings.allUserSettings",
];

const ACCOUNT_ID_FIELDS: &[&str] = &["id", "userId", "accountId", "sub"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub email: Option<String>,
    pub account_id: Option<String>,
}

impl Identity {
    pub fn unknown() -> Self {
        Identity::default()
    }

    pub fn is_known(&self) -> bool {
        self.email.is_some() || self.account_id.is_some()
    }
}

/// Extract the identity stored in a state directory (live or captured).
pub fn extract(state_dir: &Path) -> Identity {
    let db_path = state_dir.join(STATE_DB);
    if !db_path.is_file() {
        return Identity::unknown();
    }

    let conn = match Connection::open_with_flags(
        &db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(path = %db_path.display(), error = %e, "state database not readable");
            return Identity::unknown();
        }
    };

    let mut fallback = Identity::unknown();
    for key in IDENTITY_KEYS {
        let Some(raw) = read_item(&conn, key) else { continue };
        let found = from_json(&raw);
        if found.email.is_some() {
            return found;
        }
        if fallback.account_id.is_none() {
            fallback.account_id = found.account_id;
        }
    }

    fallback
}

fn read_item(conn: &Connection, key: &str) -> Option<String> {
    let result = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            [key],
            |row| {
                Ok(match row.get_ref(0)? {
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        Some(String::from_utf8_lossy(bytes).into_owned())
                    }
                    _ => None,
                })
            },
        )
        .optional();

    match result {
        Ok(value) => value.flatten(),
        Err(e) => {
            tracing::debug!(key, error = %e, "state item lookup failed");
            None
        }
    }
}

/// Pull an email and account id out of a JSON object value.
pub fn from_json(raw: &str) -> Identity {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return Identity::unknown();
    };

    let email = map
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("email"))
        .and_then(|(_, v)| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let account_id = ACCOUNT_ID_FIELDS
        .iter()
        .filter_map(|field| map.get(*field))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Identity { email, account_id }
}
