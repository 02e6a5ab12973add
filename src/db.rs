// 💾 SQLite adapter - durable GraphStore
//
// Providers are stored as JSON bodies alongside the columns the store
// queries on (normalized NPI, normalized name, lineage pointer), with a
// side table of relationship edges for candidate blocking. Merge writes run
// inside a real transaction, so the golden update, lineage redirect, and
// history append land together or not at all. Busy/locked errors surface as
// transient so the orchestrator's retry loop can absorb them.

use rusqlite::{params, Connection, Transaction as SqlTransaction};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{MdmError, Result};
use crate::merge::MergeHistory;
use crate::model::{NaturalKey, Provider, Relationship, Satellite};
use crate::similarity::normalize_name;
use crate::store::{merge_upsert, CandidateFilter, GraphStore, MergeWrite, PendingReview};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| storage("open", e))?;
        setup_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage("open", e))?;
        setup_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn setup_schema(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| storage("setup", e))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS providers (
            record_id TEXT PRIMARY KEY,
            npi_key TEXT,
            name_norm TEXT NOT NULL,
            master_record_id TEXT,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider_relationships (
            record_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            target_key TEXT NOT NULL,
            PRIMARY KEY (record_id, kind, target_key)
        );

        CREATE TABLE IF NOT EXISTS satellites (
            natural_key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_reviews (
            record_id TEXT NOT NULL,
            candidate_id TEXT NOT NULL,
            score REAL NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (record_id, candidate_id)
        );

        CREATE TABLE IF NOT EXISTS merge_history (
            merge_id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            merged_at TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_providers_npi ON providers(npi_key);
        CREATE INDEX IF NOT EXISTS idx_providers_name ON providers(name_norm);
        CREATE INDEX IF NOT EXISTS idx_relationships_target
            ON provider_relationships(target_key);
        CREATE INDEX IF NOT EXISTS idx_history_source ON merge_history(source_id);",
    )
    .map_err(|e| storage("setup", e))?;

    Ok(())
}

/// Busy/locked means another writer holds the database; that is retryable.
fn storage(operation: &str, e: rusqlite::Error) -> MdmError {
    let transient = matches!(
        &e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    );
    if transient {
        MdmError::TransientStore {
            operation: operation.to_string(),
            reason: e.to_string(),
        }
    } else {
        MdmError::Storage {
            operation: operation.to_string(),
            reason: e.to_string(),
        }
    }
}

fn encode<T: serde::Serialize>(operation: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| MdmError::Storage {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(operation: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| MdmError::Storage {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

/// Write a provider row and refresh its relationship edges. Callers that
/// need atomicity across several writes run this inside a transaction.
fn write_provider(conn: &Connection, operation: &str, provider: &Provider) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO providers (record_id, npi_key, name_norm, master_record_id, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            provider.record_id,
            provider.natural_key(),
            provider.name_norm(),
            provider.master_record_id,
            encode(operation, provider)?,
        ],
    )
    .map_err(|e| storage(operation, e))?;

    conn.execute(
        "DELETE FROM provider_relationships WHERE record_id = ?1",
        params![provider.record_id],
    )
    .map_err(|e| storage(operation, e))?;
    for rel in &provider.relationships {
        conn.execute(
            "INSERT OR REPLACE INTO provider_relationships (record_id, kind, target_key)
             VALUES (?1, ?2, ?3)",
            params![provider.record_id, rel.kind.as_str(), rel.target_key],
        )
        .map_err(|e| storage(operation, e))?;
    }
    Ok(())
}

fn read_provider(conn: &Connection, operation: &str, record_id: &str) -> Result<Option<Provider>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM providers WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(storage(operation, other)),
        })?;
    body.map(|b| decode(operation, &b)).transpose()
}

fn read_active_by_npi(conn: &Connection, operation: &str, npi_key: &str) -> Result<Option<Provider>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM providers
             WHERE npi_key = ?1 AND master_record_id IS NULL
             ORDER BY record_id LIMIT 1",
            params![npi_key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(storage(operation, other)),
        })?;
    body.map(|b| decode(operation, &b)).transpose()
}

fn append_history(tx: &SqlTransaction, history: &MergeHistory) -> Result<()> {
    tx.execute(
        "INSERT INTO merge_history (merge_id, source_id, target_id, merged_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            history.merge_id,
            history.source_id,
            history.target_id,
            history.merged_at.to_rfc3339(),
            encode("apply_merge", history)?,
        ],
    )
    .map_err(|e| storage("apply_merge", e))?;
    Ok(())
}

impl GraphStore for SqliteStore {
    fn insert_provider(&self, provider: &Provider) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_provider(&conn, "insert_provider", provider)
    }

    fn upsert_provider(&self, provider: &Provider) -> Result<Provider> {
        let conn = self.conn.lock().unwrap();

        let existing = match provider.natural_key() {
            Some(key) => read_active_by_npi(&conn, "upsert_provider", &key)?,
            None => None,
        };

        let stored = match existing {
            Some(mut current) => {
                merge_upsert(&mut current, provider);
                current
            }
            None => provider.clone(),
        };
        write_provider(&conn, "upsert_provider", &stored)?;
        Ok(stored)
    }

    fn get_provider(&self, record_id: &str) -> Result<Option<Provider>> {
        let conn = self.conn.lock().unwrap();
        read_provider(&conn, "get_provider", record_id)
    }

    fn find_by_npi(&self, npi: &str) -> Result<Option<Provider>> {
        let conn = self.conn.lock().unwrap();
        read_active_by_npi(&conn, "find_by_npi", &normalize_name(npi))
    }

    fn upsert_satellite(&self, satellite: &Satellite) -> Result<()> {
        let key = satellite
            .natural_key()
            .ok_or_else(|| MdmError::NotFound("satellite without natural key".to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO satellites (natural_key, kind, body) VALUES (?1, ?2, ?3)",
            params![key, satellite.kind_label(), encode("upsert_satellite", satellite)?],
        )
        .map_err(|e| storage("upsert_satellite", e))?;
        Ok(())
    }

    fn get_satellite(&self, natural_key: &str) -> Result<Option<Satellite>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM satellites WHERE natural_key = ?1",
                params![natural_key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(storage("get_satellite", other)),
            })?;
        body.map(|b| decode("get_satellite", &b)).transpose()
    }

    fn link(&self, record_id: &str, rel: &Relationship) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut provider = read_provider(&conn, "link", record_id)?
            .ok_or_else(|| MdmError::NotFound(record_id.to_string()))?;
        provider.link(rel.clone());
        provider.touch();
        write_provider(&conn, "link", &provider)
    }

    fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Provider>> {
        let conn = self.conn.lock().unwrap();

        let keys: Vec<&str> = filter
            .relationship_keys
            .iter()
            .map(|k| k.as_str())
            .collect();
        let keys_json = encode("find_candidates", &keys)?;

        let mut stmt = conn
            .prepare(
                "SELECT body FROM providers p
                 WHERE p.master_record_id IS NULL
                   AND p.record_id <> COALESCE(?1, '')
                   AND (
                       (?2 IS NOT NULL AND p.npi_key = ?2)
                       OR (?3 IS NOT NULL AND ?3 <> '' AND p.name_norm LIKE ?3 || '%')
                       OR EXISTS (
                           SELECT 1 FROM provider_relationships r
                           WHERE r.record_id = p.record_id
                             AND r.target_key IN (SELECT value FROM json_each(?4))
                       )
                   )
                 ORDER BY p.record_id
                 LIMIT ?5",
            )
            .map_err(|e| storage("find_candidates", e))?;

        let rows = stmt
            .query_map(
                params![
                    filter.exclude_record_id,
                    filter.npi,
                    filter.name_prefix,
                    keys_json,
                    limit as i64,
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| storage("find_candidates", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("find_candidates", e))?;

        rows.iter()
            .map(|body| decode("find_candidates", body))
            .collect()
    }

    fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<Provider>> {
        let name_needle = normalize_name(query);
        let email_needle = query.trim().to_lowercase();
        if name_needle.is_empty() && email_needle.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT body FROM providers
                 WHERE master_record_id IS NULL
                   AND (
                       (?1 <> '' AND instr(name_norm, ?1) > 0)
                       OR (?2 <> '' AND
                           instr(lower(coalesce(json_extract(body, '$.email'), '')), ?2) > 0)
                   )
                 ORDER BY record_id
                 LIMIT ?3",
            )
            .map_err(|e| storage("search_providers", e))?;

        let rows = stmt
            .query_map(params![name_needle, email_needle, limit as i64], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| storage("search_providers", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("search_providers", e))?;

        rows.iter()
            .map(|body| decode("search_providers", body))
            .collect()
    }

    fn apply_merge(&self, write: &MergeWrite) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| storage("apply_merge", e))?;
        write_provider(&tx, "apply_merge", &write.golden)?;
        write_provider(&tx, "apply_merge", &write.source)?;
        append_history(&tx, &write.history)?;
        tx.commit().map_err(|e| storage("apply_merge", e))
    }

    fn mark_pending_review(&self, review: &PendingReview) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pending_reviews (record_id, candidate_id, score, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                review.record_id,
                review.candidate_id,
                review.score,
                review.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| storage("mark_pending_review", e))?;
        Ok(())
    }

    fn pending_reviews(&self) -> Result<Vec<PendingReview>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT record_id, candidate_id, score, created_at
                 FROM pending_reviews ORDER BY created_at, record_id",
            )
            .map_err(|e| storage("pending_reviews", e))?;

        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    created_at,
                ))
            })
            .map_err(|e| storage("pending_reviews", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("pending_reviews", e))?;

        rows.into_iter()
            .map(|(record_id, candidate_id, score, created_at)| {
                let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| MdmError::Storage {
                        operation: "pending_reviews".to_string(),
                        reason: e.to_string(),
                    })?
                    .with_timezone(&chrono::Utc);
                Ok(PendingReview {
                    record_id,
                    candidate_id,
                    score,
                    created_at,
                })
            })
            .collect()
    }

    fn merge_history(&self) -> Result<Vec<MergeHistory>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT body FROM merge_history ORDER BY rowid")
            .map_err(|e| storage("merge_history", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| storage("merge_history", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("merge_history", e))?;
        rows.iter()
            .map(|body| decode("merge_history", body))
            .collect()
    }
}
