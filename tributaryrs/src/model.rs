//! Persistence for saved warehouses and report specs.
//!
//! A small SQLite metadata store with two tables: `warehouses` (unique
//! name, config params) and `reports` (warehouse ID, full request
//! params). Params are the JSON serialization of the respective config
//! or request.

use std::path::Path;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Result, TributaryError};
use crate::report::ReportRequest;

pub struct MetadataStore {
    conn: Mutex<rusqlite::Connection>,
}

#[derive(Debug, Clone)]
pub struct WarehouseRecord {
    pub id: i64,
    pub name: String,
    pub params: Value,
    pub meta: Option<Value>,
}

impl MetadataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS warehouses (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                params TEXT NOT NULL,
                meta TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY,
                warehouse_id INTEGER NOT NULL,
                params TEXT NOT NULL,
                meta TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().expect("metadata store poisoned")
    }

    pub fn save_warehouse(&self, name: &str, params: &Value, meta: Option<Value>) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO warehouses (name, params, meta) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                name,
                params.to_string(),
                meta.map(|m| m.to_string())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_warehouse(&self, id: i64) -> Result<WarehouseRecord> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, params, meta FROM warehouses WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        let row = rows.next()?.ok_or_else(|| {
            TributaryError::Report(format!("could not find warehouse with id {id}"))
        })?;
        let params: String = row.get(2)?;
        let meta: Option<String> = row.get(3)?;
        Ok(WarehouseRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            params: serde_json::from_str(&params)?,
            meta: meta.map(|m| serde_json::from_str(&m)).transpose()?,
        })
    }

    pub fn delete_warehouse(&self, id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM warehouses WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn save_report(
        &self,
        warehouse_id: i64,
        request: &ReportRequest,
        meta: Option<Value>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reports (warehouse_id, params, meta) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                warehouse_id,
                serde_json::to_string(request)?,
                meta.map(|m| m.to_string())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_report(&self, id: i64) -> Result<(i64, ReportRequest)> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT warehouse_id, params FROM reports WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        let row = rows
            .next()?
            .ok_or_else(|| TributaryError::Report(format!("could not find report with id {id}")))?;
        let warehouse_id: i64 = row.get(0)?;
        let params: String = row.get(1)?;
        Ok((warehouse_id, serde_json::from_str(&params)?))
    }

    pub fn delete_report(&self, id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM reports WHERE id = ?1", [id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MetricSpec, Rollup};
    use serde_json::json;

    #[test]
    fn warehouse_round_trip() {
        let store = MetadataStore::in_memory().unwrap();
        let id = store
            .save_warehouse("test_wh", &json!({"metrics": []}), Some(json!({"env": "test"})))
            .unwrap();
        let record = store.load_warehouse(id).unwrap();
        assert_eq!(record.name, "test_wh");
        assert_eq!(record.params, json!({"metrics": []}));
        assert_eq!(record.meta, Some(json!({"env": "test"})));

        store.delete_warehouse(id).unwrap();
        assert!(store.load_warehouse(id).is_err());
    }

    #[test]
    fn warehouse_names_are_unique() {
        let store = MetadataStore::in_memory().unwrap();
        store.save_warehouse("wh", &json!({}), None).unwrap();
        assert!(store.save_warehouse("wh", &json!({}), None).is_err());
    }

    #[test]
    fn report_round_trip() {
        let store = MetadataStore::in_memory().unwrap();
        let request = ReportRequest {
            metrics: vec![MetricSpec::Name("revenue".to_string())],
            dimensions: vec!["partner_name".to_string()],
            rollup: Some(Rollup::Totals),
            ..ReportRequest::default()
        };
        let id = store.save_report(7, &request, None).unwrap();
        let (warehouse_id, loaded) = store.load_report(id).unwrap();
        assert_eq!(warehouse_id, 7);
        assert_eq!(loaded.dimensions, vec!["partner_name"]);
        assert_eq!(loaded.rollup, Some(Rollup::Totals));

        store.delete_report(id).unwrap();
        assert!(store.load_report(id).is_err());
    }
}
