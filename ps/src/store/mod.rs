//! Core Store implementation
//!
//! Owns the SQLite connection. Intended to be driven from a single owning
//! task (the engine wraps it in an actor); methods take `&mut self` and
//! each mutation is its own transaction.

mod pipelines;
mod requests;
mod results;
mod rows;
mod tasks;

use eyre::{Context, Result};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::model::ParseEnumError;
use crate::schema;

/// The persistent store for the evaluation data model.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a store at the given database file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }
        let conn = Connection::open(path).context("Failed to open database")?;
        schema::migrate(&conn)?;
        debug!(path = %path.display(), "Opened store");
        Ok(Self { conn })
    }

    /// Open an in-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Row count of an arbitrary table, for the inspection CLI.
    pub fn table_count(&self, table: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .context("Failed to count rows")?;
        Ok(count)
    }
}

/// Serialise a JSON value to TEXT, mapping `Null` to SQL NULL.
pub(crate) fn json_text(value: &Value) -> Option<String> {
    if value.is_null() { None } else { Some(value.to_string()) }
}

pub(crate) fn opt_json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().and_then(json_text)
}

pub(crate) fn map_text(map: &Map<String, Value>) -> String {
    Value::Object(map.clone()).to_string()
}

/// Parse TEXT back into a JSON value; malformed content degrades to None.
pub(crate) fn parse_json(text: Option<String>) -> Option<Value> {
    text.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn parse_map(text: Option<String>) -> Map<String, Value> {
    match parse_json(text) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

pub(crate) fn parse_opt_map(text: Option<String>) -> Option<Map<String, Value>> {
    match parse_json(text) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse a stored enum string inside a row mapper.
pub(crate) fn parse_enum<T>(text: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    text.parse().map_err(|e: ParseEnumError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_opt_enum<T>(text: Option<String>) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    text.map(parse_enum).transpose()
}
