//! SQLite-backed store. Each logical table is one `(id, body)` table holding
//! the row as JSON; tables are created the first time they are touched.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{new_id, Filter, Store, StoreError, StoreResult};
use crate::bundle::Record;

pub struct SqliteStore {
    pool: SqlitePool,
    created: Mutex<HashSet<String>>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5000))
            .log_statements(log::LevelFilter::Off);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        log_effective_pragmas(&pool, path).await;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            created: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_table(&self, table: &str) -> StoreResult<()> {
        let mut created = self.created.lock().await;
        if created.contains(table) {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
            quote_ident(table)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        created.insert(table.to_string());
        Ok(())
    }
}

async fn log_effective_pragmas(pool: &SqlitePool, path: &Path) {
    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));
    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "clinic_bundle",
        event = "db_open",
        path = %path.display(),
        journal_mode = %jm.0,
        foreign_keys = fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "clinic_bundle",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_extract_for_field(field: &str) -> String {
    let escaped = field.replace('\\', "\\\\").replace('"', "\\\"");
    format!("json_extract(body, '$.\"{}\"')", escaped.replace('\'', "''"))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::String(s) => query.bind(s.clone()),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        other => query.bind(other.to_string()),
    }
}

fn decode_row(table: &str, id: String, body: &str) -> StoreResult<Record> {
    let mut row: Record = serde_json::from_str(body).map_err(|source| StoreError::Decode {
        table: table.to_string(),
        source,
    })?;
    row.insert("id".into(), Value::String(id));
    Ok(row)
}

#[async_trait]
impl Store for SqliteStore {
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Record>> {
        self.ensure_table(table).await?;
        let base = format!("SELECT id, body FROM {}", quote_ident(table));
        let (sql, params): (String, Vec<&Value>) = match filter {
            Filter::All => (format!("{base} ORDER BY rowid"), Vec::new()),
            Filter::Eq(field, Value::Null) => (
                format!("{base} WHERE {} IS NULL ORDER BY rowid", json_extract_for_field(field)),
                Vec::new(),
            ),
            Filter::Eq(field, value) => (
                format!("{base} WHERE {} = ? ORDER BY rowid", json_extract_for_field(field)),
                vec![value],
            ),
            Filter::In(_, values) if values.is_empty() => return Ok(Vec::new()),
            Filter::In(field, values) => {
                let marks = vec!["?"; values.len()].join(", ");
                (
                    format!(
                        "{base} WHERE {} IN ({marks}) ORDER BY rowid",
                        json_extract_for_field(field)
                    ),
                    values.iter().collect(),
                )
            }
        };

        let mut query = sqlx::query(&sql);
        for value in params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let body: String = row.try_get("body")?;
                decode_row(table, id, &body)
            })
            .collect()
    }

    async fn insert(&self, table: &str, mut row: Record) -> StoreResult<String> {
        self.ensure_table(table).await?;
        let id = new_id();
        row.insert("id".into(), Value::String(id.clone()));
        let body = serde_json::to_string(&row).map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })?;
        let sql = format!("INSERT INTO {} (id, body) VALUES (?, ?)", quote_ident(table));
        sqlx::query(&sql)
            .bind(id.clone())
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update(&self, table: &str, id: &str, changes: Record) -> StoreResult<()> {
        self.ensure_table(table).await?;
        let mut tx = self.pool.begin().await?;
        let select = format!("SELECT body FROM {} WHERE id = ?", quote_ident(table));
        let body: Option<String> = sqlx::query_scalar(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(body) = body else {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        };

        let mut row = decode_row(table, id.to_string(), &body)?;
        row.extend(changes.into_iter().filter(|(key, _)| key != "id"));
        let body = serde_json::to_string(&row).map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })?;
        let sql = format!("UPDATE {} SET body = ? WHERE id = ?", quote_ident(table));
        sqlx::query(&sql).bind(body).bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        self.ensure_table(table).await?;
        let sql = format!("DELETE FROM {} WHERE id = ?", quote_ident(table));
        let done = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn identifiers_and_paths_are_escaped() {
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(
            json_extract_for_field("clinic_id"),
            "json_extract(body, '$.\"clinic_id\"')"
        );
    }

    #[tokio::test]
    async fn rows_round_trip_through_json_bodies() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.sqlite3"))
            .await
            .unwrap();

        let a = store
            .insert("services", row(json!({"clinic_id": "c-1", "price_cents": 1999})))
            .await
            .unwrap();
        let b = store
            .insert("services", row(json!({"clinic_id": "c-2", "price_cents": 500})))
            .await
            .unwrap();

        let c1 = store
            .select("services", &Filter::eq("clinic_id", "c-1"))
            .await
            .unwrap();
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0]["id"], json!(a));
        assert_eq!(c1[0]["price_cents"], json!(1999));

        let cheap = store
            .select("services", &Filter::eq("price_cents", 500))
            .await
            .unwrap();
        assert_eq!(cheap.len(), 1);

        let both = store
            .select("services", &Filter::within("id", [a.clone(), b.clone()]))
            .await
            .unwrap();
        assert_eq!(both.len(), 2);

        store
            .update("services", &b, row(json!({"price_cents": 750})))
            .await
            .unwrap();
        let repriced = store
            .select_one("services", &Filter::eq("id", b.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repriced["price_cents"], json!(750));
        assert_eq!(repriced["clinic_id"], json!("c-2"));

        store.delete("services", &a).await.unwrap();
        let rest = store.select("services", &Filter::All).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["id"], json!(b));

        assert!(store
            .select("never_written", &Filter::All)
            .await
            .unwrap()
            .is_empty());
    }
}
