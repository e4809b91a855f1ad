//! SQLite storage backend

use super::traits::{GraphStore, OpenStore, StorageError, StorageResult};
use crate::graph::{CommitBatch, EdgeId, EdgeRecord, GraphData, Properties, VertexId, VertexRecord};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed graph store
///
/// Uses a single SQLite database file with tables for keyspaces, vertices
/// and edges. Properties are stored as JSON. Thread-safe via internal mutex
/// on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS keyspaces (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS vertices (
                keyspace TEXT NOT NULL,
                id INTEGER NOT NULL,
                label TEXT NOT NULL,
                properties_json TEXT NOT NULL,
                PRIMARY KEY (keyspace, id),
                FOREIGN KEY (keyspace) REFERENCES keyspaces(name) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS edges (
                keyspace TEXT NOT NULL,
                id INTEGER NOT NULL,
                label TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                properties_json TEXT NOT NULL,
                PRIMARY KEY (keyspace, id),
                FOREIGN KEY (keyspace) REFERENCES keyspaces(name) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_edges_source
                ON edges(keyspace, source_id);
            CREATE INDEX IF NOT EXISTS idx_edges_target
                ON edges(keyspace, target_id);

            PRAGMA foreign_keys = ON;

            -- WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn id_to_sql(raw: u64) -> i64 {
        raw as i64
    }

    fn id_from_sql(raw: i64) -> u64 {
        raw as u64
    }

    fn load_properties(tx: &Transaction<'_>, table: &str, keyspace: &str, id: i64) -> StorageResult<Option<Properties>> {
        let sql = format!("SELECT properties_json FROM {} WHERE keyspace = ?1 AND id = ?2", table);
        let json: Option<String> = tx
            .query_row(&sql, params![keyspace, id], |row| row.get(0))
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn store_properties(tx: &Transaction<'_>, table: &str, keyspace: &str, id: i64, properties: &Properties) -> StorageResult<()> {
        let sql = format!("UPDATE {} SET properties_json = ?3 WHERE keyspace = ?1 AND id = ?2", table);
        tx.execute(&sql, params![keyspace, id, serde_json::to_string(properties)?])?;
        Ok(())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl GraphStore for SqliteStore {
    fn load_graph(&self, keyspace: &str) -> StorageResult<GraphData> {
        let conn = self.conn.lock().unwrap();
        let mut graph = GraphData::new();

        let mut stmt = conn.prepare("SELECT id, label, properties_json FROM vertices WHERE keyspace = ?1")?;
        let rows = stmt.query_map(params![keyspace], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (id, label, properties_json) = row?;
            graph.insert_vertex(VertexRecord {
                id: VertexId::new(Self::id_from_sql(id)),
                label,
                properties: serde_json::from_str(&properties_json)?,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, label, source_id, target_id, properties_json FROM edges WHERE keyspace = ?1",
        )?;
        let rows = stmt.query_map(params![keyspace], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (id, label, source, target, properties_json) = row?;
            let edge = EdgeRecord {
                id: EdgeId::new(Self::id_from_sql(id)),
                label,
                source: VertexId::new(Self::id_from_sql(source)),
                target: VertexId::new(Self::id_from_sql(target)),
                properties: serde_json::from_str(&properties_json)?,
            };
            let edge_id = edge.id;
            if !graph.insert_edge(edge) {
                return Err(StorageError::Corrupt {
                    keyspace: keyspace.to_string(),
                    reason: format!("edge {} references a missing vertex", edge_id),
                });
            }
        }

        Ok(graph)
    }

    fn apply_batch(&self, keyspace: &str, batch: &CommitBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("INSERT OR IGNORE INTO keyspaces (name) VALUES (?1)", params![keyspace])?;

        for id in &batch.removed_edges {
            tx.execute(
                "DELETE FROM edges WHERE keyspace = ?1 AND id = ?2",
                params![keyspace, Self::id_to_sql(id.as_u64())],
            )?;
        }
        for id in &batch.removed_vertices {
            let raw = Self::id_to_sql(id.as_u64());
            tx.execute(
                "DELETE FROM edges WHERE keyspace = ?1 AND (source_id = ?2 OR target_id = ?2)",
                params![keyspace, raw],
            )?;
            tx.execute("DELETE FROM vertices WHERE keyspace = ?1 AND id = ?2", params![keyspace, raw])?;
        }
        for vertex in &batch.new_vertices {
            tx.execute(
                r#"
                INSERT INTO vertices (keyspace, id, label, properties_json)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(keyspace, id) DO UPDATE SET
                    label = excluded.label,
                    properties_json = excluded.properties_json
                "#,
                params![
                    keyspace,
                    Self::id_to_sql(vertex.id.as_u64()),
                    vertex.label,
                    serde_json::to_string(&vertex.properties)?,
                ],
            )?;
        }
        for (id, key, value) in &batch.vertex_properties {
            let raw = Self::id_to_sql(id.as_u64());
            if let Some(mut properties) = Self::load_properties(&tx, "vertices", keyspace, raw)? {
                match value {
                    Some(value) => properties.insert(key.clone(), value.clone()),
                    None => properties.remove(key),
                };
                Self::store_properties(&tx, "vertices", keyspace, raw, &properties)?;
            }
        }
        for edge in &batch.new_edges {
            tx.execute(
                r#"
                INSERT INTO edges (keyspace, id, label, source_id, target_id, properties_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(keyspace, id) DO UPDATE SET
                    label = excluded.label,
                    source_id = excluded.source_id,
                    target_id = excluded.target_id,
                    properties_json = excluded.properties_json
                "#,
                params![
                    keyspace,
                    Self::id_to_sql(edge.id.as_u64()),
                    edge.label,
                    Self::id_to_sql(edge.source.as_u64()),
                    Self::id_to_sql(edge.target.as_u64()),
                    serde_json::to_string(&edge.properties)?,
                ],
            )?;
        }
        for (id, key, value) in &batch.edge_properties {
            let raw = Self::id_to_sql(id.as_u64());
            if let Some(mut properties) = Self::load_properties(&tx, "edges", keyspace, raw)? {
                match value {
                    Some(value) => properties.insert(key.clone(), value.clone()),
                    None => properties.remove(key),
                };
                Self::store_properties(&tx, "edges", keyspace, raw, &properties)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn list_keyspaces(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM keyspaces ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn delete_keyspace(&self, keyspace: &str) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        // Explicit deletes: rows may predate the foreign-key pragma.
        conn.execute("DELETE FROM edges WHERE keyspace = ?1", params![keyspace])?;
        conn.execute("DELETE FROM vertices WHERE keyspace = ?1", params![keyspace])?;
        let rows = conn.execute("DELETE FROM keyspaces WHERE name = ?1", params![keyspace])?;
        Ok(rows > 0)
    }
}
