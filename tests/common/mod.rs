//! Shared fixtures for integration tests: mapped tables on a temporary SQLite file.

#![allow(dead_code)]

use ambient_db::config::{EngineOptions, PoolOptions};
use ambient_db::db::{Column, Dao, Entity, RawSql, SessionManager, Table, Value};
use ambient_db::error::DbError;
use sqlx::Row;
use sqlx::any::AnyRow;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
pub struct TableForTest {
    pub id: Option<i64>,
    pub name: String,
    pub value: Option<i64>,
}

impl TableForTest {
    pub fn new(name: &str, value: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            value,
        }
    }

    pub fn with_id(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
            value: None,
        }
    }

    pub fn id() -> Column<TableForTest, i64> {
        Column::new("id", |t| t.id.unwrap_or_default())
    }

    pub fn name() -> Column<TableForTest, String> {
        Column::new("name", |t| t.name.clone())
    }

    pub fn value() -> Column<TableForTest, Option<i64>> {
        Column::new("value", |t| t.value)
    }
}

impl Entity for TableForTest {
    const TABLE: &'static str = "test_table";
    const COLUMNS: &'static [&'static str] = &["id", "name", "value"];
    const PRIMARY_KEY: &'static str = "id";

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn from_row(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: Some(row.try_get(offset)?),
            name: row.try_get(offset + 1)?,
            value: row.try_get(offset + 2)?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, Value)> {
        let mut values = Vec::with_capacity(3);
        if let Some(id) = self.id {
            values.push(("id", id.into()));
        }
        values.push(("name", self.name.clone().into()));
        values.push(("value", self.value.into()));
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTableForTest {
    pub id: Option<i64>,
    pub parent_id: i64,
    pub label: String,
}

impl JoinedTableForTest {
    pub fn new(parent_id: i64, label: &str) -> Self {
        Self {
            id: None,
            parent_id,
            label: label.to_string(),
        }
    }

    pub fn parent_id() -> Column<JoinedTableForTest, i64> {
        Column::new("parent_id", |t| t.parent_id)
    }

    pub fn label() -> Column<JoinedTableForTest, String> {
        Column::new("label", |t| t.label.clone())
    }
}

impl Entity for JoinedTableForTest {
    const TABLE: &'static str = "joined_table";
    const COLUMNS: &'static [&'static str] = &["id", "parent_id", "label"];
    const PRIMARY_KEY: &'static str = "id";

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn from_row(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: Some(row.try_get(offset)?),
            parent_id: row.try_get(offset + 1)?,
            label: row.try_get(offset + 2)?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, Value)> {
        let mut values = Vec::with_capacity(3);
        if let Some(id) = self.id {
            values.push(("id", id.into()));
        }
        values.push(("parent_id", self.parent_id.into()));
        values.push(("label", self.label.clone().into()));
        values
    }
}

/// Mapped onto a table and a column named after SQL keywords.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordTableForTest {
    pub id: Option<i64>,
    pub group: String,
}

impl KeywordTableForTest {
    pub fn new(group: &str) -> Self {
        Self {
            id: None,
            group: group.to_string(),
        }
    }

    pub fn id() -> Column<KeywordTableForTest, i64> {
        Column::new("id", |t| t.id.unwrap_or_default())
    }

    pub fn group() -> Column<KeywordTableForTest, String> {
        Column::new("group", |t| t.group.clone())
    }
}

impl Entity for KeywordTableForTest {
    const TABLE: &'static str = "order";
    const COLUMNS: &'static [&'static str] = &["id", "group"];
    const PRIMARY_KEY: &'static str = "id";

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn from_row(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: Some(row.try_get(offset)?),
            group: row.try_get(offset + 1)?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, Value)> {
        let mut values = Vec::with_capacity(2);
        if let Some(id) = self.id {
            values.push(("id", id.into()));
        }
        values.push(("group", self.group.clone().into()));
        values
    }
}

pub fn test_table() -> Table<TableForTest> {
    TableForTest::table()
}

/// Session manager on a fresh SQLite file with all tables created.
pub async fn setup() -> (SessionManager, TempDir) {
    setup_with(EngineOptions {
        pool: PoolOptions {
            max_connections: Some(4),
            ..PoolOptions::default()
        },
        ..EngineOptions::default()
    })
    .await
}

pub async fn setup_with(options: EngineOptions) -> (SessionManager, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("ambient.db");
    let url = format!("sqlite:{}?mode=rwc", path.display());

    let manager = SessionManager::connect(&url, options)
        .await
        .expect("Failed to connect");

    manager
        .begin_scope(|| async {
            let dao = Dao::new();
            dao.get_rows_count(&RawSql::new(
                "CREATE TABLE test_table (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 name TEXT NOT NULL, \
                 value INTEGER)",
            ))
            .await?;
            dao.get_rows_count(&RawSql::new(
                "CREATE TABLE joined_table (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 parent_id INTEGER NOT NULL REFERENCES test_table(id), \
                 label TEXT NOT NULL)",
            ))
            .await?;
            dao.get_rows_count(&RawSql::new(
                "CREATE TABLE \"order\" (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 \"group\" TEXT NOT NULL)",
            ))
            .await?;
            Ok::<_, DbError>(())
        })
        .await
        .expect("Failed to create tables");

    (manager, dir)
}
