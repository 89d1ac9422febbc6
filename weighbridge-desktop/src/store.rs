//! Local SQLite persistence for the offline write queue.
//!
//! WAL journal with `synchronous = NORMAL`. Every mutation that touches more than
//! one row runs inside a single SQLite transaction, so a crash leaves either the
//! old or the new state.

use crate::error::StoreError;
use crate::models::{QueueItem, QueuedWrite, SyncStatus, TransactionRef};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

const CURRENT_SCHEMA_VERSION: i32 = 2;

const ACTIVE_TRANSACTION: &str = "active_transaction";
const LAST_SYNCED_AT: &str = "last_synced_at";
const LAST_ERROR: &str = "last_error";

const STATE_QUEUED: &str = "queued";
const STATE_REJECTED: &str = "rejected";

pub struct QueueStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl QueueStore {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        info!("Opening offline queue at {}", path.display());

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::with_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Queue a create and make it the active weighing. A create still queued for the
    /// previous pending pointer is superseded and removed; re-queueing the same key
    /// keeps the existing item, its position and its attempt count.
    pub fn enqueue_create(
        &self,
        idempotency_key: &str,
        write: &QueuedWrite,
    ) -> Result<QueueItem, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let superseded = match read_active(&tx)? {
            Some(TransactionRef::PendingCreate {
                idempotency_key: previous,
            }) if previous != idempotency_key => Some(previous),
            _ => None,
        };
        if let Some(previous) = superseded {
            let removed = tx.execute(
                "DELETE FROM queue_items WHERE idempotency_key = ?1 AND kind = 'CREATE_TX' AND state = ?2",
                params![previous, STATE_QUEUED],
            )?;
            if removed > 0 {
                debug!(superseded = %previous, "Replaced queued create");
            }
        }

        let item = insert_item(&tx, idempotency_key, write)?;
        write_active(
            &tx,
            Some(&TransactionRef::PendingCreate {
                idempotency_key: idempotency_key.to_string(),
            }),
        )?;
        tx.commit()?;
        Ok(item)
    }

    /// Queue a completion and release the active pointer.
    pub fn enqueue_complete(
        &self,
        idempotency_key: &str,
        write: &QueuedWrite,
    ) -> Result<QueueItem, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let item = insert_item(&tx, idempotency_key, write)?;
        write_active(&tx, None)?;
        tx.commit()?;
        Ok(item)
    }

    /// Queued items in insertion order. The AUTOINCREMENT id is the order; the
    /// wall clock is not, since it may step backwards.
    pub fn pending(&self) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, idempotency_key, payload, created_at, attempts, last_error
             FROM queue_items
             WHERE state = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![STATE_QUEUED], row_to_parts)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(into_item(row?)?);
        }
        Ok(items)
    }

    /// Whether a queued completion still waits on the create queued under `idempotency_key`.
    pub fn has_queued_completion_for(&self, idempotency_key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_items
             WHERE kind = 'COMPLETE_TX' AND state = ?1
               AND json_extract(payload, '$.target.idempotency_key') = ?2",
            params![STATE_QUEUED, idempotency_key],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        count_in_state(&conn, STATE_QUEUED)
    }

    /// Drop an item without sending it.
    pub fn discard(&self, item_id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM queue_items WHERE id = ?1", params![item_id])?;
        Ok(())
    }

    pub fn record_failure(&self, item_id: i64, error: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE queue_items SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![item_id, error],
        )?;
        Ok(())
    }

    /// Park an item the server refused. A refused create also stops being the
    /// active weighing.
    pub fn reject(&self, item: &QueueItem, error: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE queue_items SET state = ?2, attempts = attempts + 1, last_error = ?3 WHERE id = ?1",
            params![item.id, STATE_REJECTED, error],
        )?;
        if matches!(item.write, QueuedWrite::CreateTx { .. }) {
            let pointer = TransactionRef::PendingCreate {
                idempotency_key: item.idempotency_key.clone(),
            };
            if read_active(&tx)?.as_ref() == Some(&pointer) {
                write_active(&tx, None)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The server confirmed a queued create.
    pub fn acknowledge_create(
        &self,
        item_id: i64,
        idempotency_key: &str,
        server_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue_items WHERE id = ?1", params![item_id])?;
        insert_server_id(&tx, idempotency_key, server_id)?;

        let pending = TransactionRef::PendingCreate {
            idempotency_key: idempotency_key.to_string(),
        };
        if read_active(&tx)?.as_ref() == Some(&pending) {
            write_active(&tx, Some(&TransactionRef::Server { id: server_id }))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The server confirmed a queued completion.
    pub fn acknowledge_complete(&self, item_id: i64, server_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue_items WHERE id = ?1", params![item_id])?;
        if read_active(&tx)? == Some(TransactionRef::Server { id: server_id }) {
            write_active(&tx, None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remember which server transaction a create key produced.
    pub fn record_server_id(&self, idempotency_key: &str, server_id: Uuid) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_server_id(&conn, idempotency_key, server_id)
    }

    pub fn server_id_for(&self, idempotency_key: &str) -> Result<Option<Uuid>, StoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT server_id FROM create_keys WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    pub fn active(&self) -> Result<Option<TransactionRef>, StoreError> {
        let conn = self.lock()?;
        read_active(&conn)
    }

    pub fn set_active(&self, pointer: Option<&TransactionRef>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        write_active(&conn, pointer)
    }

    /// Record the outcome of a flush for the status line.
    pub fn record_sync(&self, error: Option<&str>) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match error {
            Some(error) => set_state_value(&tx, LAST_ERROR, Some(error))?,
            None => {
                set_state_value(&tx, LAST_ERROR, None)?;
                set_state_value(&tx, LAST_SYNCED_AT, Some(&timestamp(Utc::now())))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        let conn = self.lock()?;
        Ok(SyncStatus {
            pending: count_in_state(&conn, STATE_QUEUED)?,
            rejected: count_in_state(&conn, STATE_REJECTED)?,
            last_error: get_state_value(&conn, LAST_ERROR)?,
            last_synced_at: get_state_value(&conn, LAST_SYNCED_AT)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating offline queue from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('CREATE_TX', 'COMPLETE_TX')),
            idempotency_key TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued' CHECK (state IN ('queued', 'rejected')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_items_order ON queue_items (state, created_at, id);

        CREATE TABLE IF NOT EXISTS create_keys (
            idempotency_key TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS local_state (
            state_key TEXT PRIMARY KEY,
            state_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )?;
    Ok(())
}

/// v2: replay order follows the row id alone.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;
        DROP INDEX IF EXISTS idx_queue_items_order;
        CREATE INDEX IF NOT EXISTS idx_queue_items_state_id ON queue_items (state, id);
        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;
        ",
    )?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert_item(
    tx: &Transaction<'_>,
    idempotency_key: &str,
    write: &QueuedWrite,
) -> Result<QueueItem, StoreError> {
    let created_at = Utc::now();
    let inserted = tx.execute(
        "INSERT INTO queue_items (kind, idempotency_key, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (idempotency_key) DO NOTHING",
        params![
            write.kind(),
            idempotency_key,
            serde_json::to_string(write)?,
            timestamp(created_at)
        ],
    )?;
    if inserted == 0 {
        debug!(idempotency_key, "Write already queued");
    }

    let parts = tx.query_row(
        "SELECT id, idempotency_key, payload, created_at, attempts, last_error
         FROM queue_items WHERE idempotency_key = ?1",
        params![idempotency_key],
        row_to_parts,
    )?;
    into_item(parts)
}

type ItemParts = (i64, String, String, String, i64, Option<String>);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_item(
    (id, idempotency_key, payload, created_at, attempts, last_error): ItemParts,
) -> Result<QueueItem, StoreError> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("queue item {id} created_at {created_at:?}: {e}")))?;
    Ok(QueueItem {
        id,
        idempotency_key,
        write: serde_json::from_str(&payload)?,
        created_at,
        attempts,
        last_error,
    })
}

fn count_in_state(conn: &Connection, state: &str) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM queue_items WHERE state = ?1",
        params![state],
        |row| row.get(0),
    )?)
}

fn insert_server_id(conn: &Connection, idempotency_key: &str, server_id: Uuid) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO create_keys (idempotency_key, server_id) VALUES (?1, ?2)
         ON CONFLICT (idempotency_key) DO UPDATE SET server_id = excluded.server_id",
        params![idempotency_key, server_id.to_string()],
    )?;
    Ok(())
}

fn get_state_value(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT state_value FROM local_state WHERE state_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_state_value(conn: &Connection, key: &str, value: Option<&str>) -> Result<(), StoreError> {
    match value {
        Some(value) => conn.execute(
            "INSERT INTO local_state (state_key, state_value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT (state_key) DO UPDATE
             SET state_value = excluded.state_value, updated_at = excluded.updated_at",
            params![key, value],
        )?,
        None => conn.execute(
            "DELETE FROM local_state WHERE state_key = ?1",
            params![key],
        )?,
    };
    Ok(())
}

fn read_active(conn: &Connection) -> Result<Option<TransactionRef>, StoreError> {
    get_state_value(conn, ACTIVE_TRANSACTION)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(StoreError::from)
}

fn write_active(conn: &Connection, pointer: Option<&TransactionRef>) -> Result<(), StoreError> {
    let raw = pointer.map(serde_json::to_string).transpose()?;
    set_state_value(conn, ACTIVE_TRANSACTION, raw.as_deref())
}
