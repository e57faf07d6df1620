//! Durable local store (SQLite).
//!
//! Persists the engine collections (records, pending mutations, sync
//! cursors, snapshots) plus the durable queue for event-class
//! fallback. All multi-write operations run inside a single SQLite
//! transaction, so reads never observe partial writes. A full disk
//! surfaces as [`Error::StorageExhausted`]; the store never silently
//! drops a write.

mod migrations;

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{
    Envelope, MutationState, PendingMutation, Record, RecordMeta, Snapshot, SyncCursor, SyncStatus,
    VectorClock,
};

/// A single operation inside an all-or-nothing [`LocalStore::batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Record),
    /// Physical removal; soft deletes go through the repository.
    Delete { collection: String, id: String },
    Clear { collection: String },
}

/// Durable, tenant-partitioned storage shared by the repository, the
/// mutation log, and the sync engine.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open a store at the given path, creating and migrating as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    // ----- records -------------------------------------------------------

    pub fn get_record(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Record>> {
        let result = self.conn.query_row(
            "SELECT tenant_id, collection, id, payload, created_at, updated_at, version,
                    deleted, last_synced_at, clock, origin_mutation
             FROM records WHERE tenant_id = ? AND collection = ? AND id = ?",
            params![tenant_id, collection, id],
            parse_record,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All records of a collection within a tenant, most recently
    /// updated first. Includes tombstones; callers filter.
    pub fn get_records(&self, tenant_id: &str, collection: &str) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, collection, id, payload, created_at, updated_at, version,
                    deleted, last_synced_at, clock, origin_mutation
             FROM records WHERE tenant_id = ? AND collection = ?
             ORDER BY updated_at DESC",
        )?;
        let records = stmt
            .query_map(params![tenant_id, collection], parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn put_record(&self, record: &Record) -> Result<()> {
        insert_record(&self.conn, record)
    }

    /// Physical removal, used for tombstone garbage collection after a
    /// successful sync round.
    pub fn remove_record(&self, tenant_id: &str, collection: &str, id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE tenant_id = ? AND collection = ? AND id = ?",
            params![tenant_id, collection, id],
        )?;
        Ok(())
    }

    /// Write a record and append its mutation in one transaction, so
    /// the (record, mutation) tuple is atomic.
    pub fn put_record_with_mutation(
        &mut self,
        record: &Record,
        mutation: &PendingMutation,
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        insert_record(&tx, record)?;
        insert_mutation(&tx, mutation)?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(seq)
    }

    /// All-or-nothing application of a batch of record operations.
    pub fn batch(&mut self, tenant_id: &str, ops: &[BatchOp]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for op in ops {
            match op {
                BatchOp::Put(record) => {
                    insert_record(&tx, record)?;
                }
                BatchOp::Delete { collection, id } => {
                    tx.execute(
                        "DELETE FROM records WHERE tenant_id = ? AND collection = ? AND id = ?",
                        params![tenant_id, collection, id],
                    )?;
                }
                BatchOp::Clear { collection } => {
                    tx.execute(
                        "DELETE FROM records WHERE tenant_id = ? AND collection = ?",
                        params![tenant_id, collection],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replace every record of a collection from a verified
    /// snapshot, advancing the cursor in the same transaction.
    pub fn replace_collection(
        &mut self,
        tenant_id: &str,
        collection: &str,
        records: &[Record],
        last_pulled_at: i64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE tenant_id = ? AND collection = ?",
            params![tenant_id, collection],
        )?;
        for record in records {
            insert_record(&tx, record)?;
        }
        tx.execute(
            "INSERT INTO sync_cursors (tenant_id, collection, last_pulled_at, last_status)
             VALUES (?, ?, ?, 'success')
             ON CONFLICT(tenant_id, collection) DO UPDATE SET
                last_pulled_at = MAX(last_pulled_at, excluded.last_pulled_at),
                last_status = 'success',
                last_error = NULL",
            params![tenant_id, collection, last_pulled_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Destroy all records and pending mutations for a collection in
    /// one tenant. Never cross-tenant.
    pub fn clear_collection(&mut self, tenant_id: &str, collection: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE tenant_id = ? AND collection = ?",
            params![tenant_id, collection],
        )?;
        tx.execute(
            "DELETE FROM pending_mutations WHERE tenant_id = ? AND collection = ?",
            params![tenant_id, collection],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ----- mutation log --------------------------------------------------

    pub fn append_mutation(&self, mutation: &PendingMutation) -> Result<i64> {
        insert_mutation(&self.conn, mutation)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest pending mutations in append order.
    pub fn pending_mutations(&self, tenant_id: &str, limit: usize) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, mutation_id, tenant_id, kind, collection, record_id, payload,
                    timestamp, retry_count, last_error, clock, state
             FROM pending_mutations
             WHERE tenant_id = ? AND state = 'pending'
             ORDER BY seq ASC LIMIT ?",
        )?;
        let mutations = stmt
            .query_map(params![tenant_id, limit as i64], parse_mutation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mutations)
    }

    pub fn mutations_in_state(
        &self,
        tenant_id: &str,
        state: MutationState,
    ) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, mutation_id, tenant_id, kind, collection, record_id, payload,
                    timestamp, retry_count, last_error, clock, state
             FROM pending_mutations
             WHERE tenant_id = ? AND state = ?
             ORDER BY seq ASC",
        )?;
        let mutations = stmt
            .query_map(params![tenant_id, state.as_str()], parse_mutation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mutations)
    }

    /// Remove the contiguous acknowledged prefix ending at `mutation_id`.
    pub fn ack_up_to(&self, tenant_id: &str, mutation_id: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM pending_mutations
             WHERE tenant_id = ? AND state = 'pending'
               AND seq <= (SELECT seq FROM pending_mutations WHERE mutation_id = ?)",
            params![tenant_id, mutation_id],
        )?;
        Ok(removed)
    }

    /// Targeted removal of a single acknowledged mutation that sits
    /// behind an unacknowledged one for a different record.
    pub fn remove_mutation(&self, mutation_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_mutations WHERE mutation_id = ?",
            params![mutation_id],
        )?;
        Ok(())
    }

    /// Record a retryable failure: bump the retry count, keep position.
    pub fn requeue_mutation(&self, mutation_id: &str, error: &str) -> Result<u32> {
        self.conn.execute(
            "UPDATE pending_mutations
             SET retry_count = retry_count + 1, last_error = ?
             WHERE mutation_id = ?",
            params![error, mutation_id],
        )?;
        let count: u32 = self.conn.query_row(
            "SELECT retry_count FROM pending_mutations WHERE mutation_id = ?",
            params![mutation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_mutation_state(
        &self,
        mutation_id: &str,
        state: MutationState,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_mutations
             SET state = ?, last_error = COALESCE(?, last_error)
             WHERE mutation_id = ?",
            params![state.as_str(), error, mutation_id],
        )?;
        Ok(())
    }

    /// Re-arm mutations whose retry budget was spent.
    pub fn reset_exhausted(&self, tenant_id: &str) -> Result<usize> {
        let count = self.conn.execute(
            "UPDATE pending_mutations
             SET state = 'pending', retry_count = 0
             WHERE tenant_id = ? AND state = 'exhausted'",
            params![tenant_id],
        )?;
        Ok(count)
    }

    /// Drop queued mutations subsumed by a conflict resolution that
    /// elected the remote side.
    pub fn remove_mutations_for_record(
        &self,
        tenant_id: &str,
        collection: &str,
        record_id: &str,
    ) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM pending_mutations
             WHERE tenant_id = ? AND collection = ? AND record_id = ? AND state = 'pending'",
            params![tenant_id, collection, record_id],
        )?;
        Ok(removed)
    }

    pub fn pending_count(&self, tenant_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_mutations WHERE tenant_id = ? AND state = 'pending'",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Pending mutations captured before `cutoff_ms`.
    pub fn stuck_mutations(&self, tenant_id: &str, cutoff_ms: i64) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, mutation_id, tenant_id, kind, collection, record_id, payload,
                    timestamp, retry_count, last_error, clock, state
             FROM pending_mutations
             WHERE tenant_id = ? AND state = 'pending' AND timestamp < ?
             ORDER BY seq ASC",
        )?;
        let mutations = stmt
            .query_map(params![tenant_id, cutoff_ms], parse_mutation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mutations)
    }

    // ----- cursors -------------------------------------------------------

    /// Cursor for a (tenant, collection) pair, lazily initialized.
    pub fn get_cursor(&self, tenant_id: &str, collection: &str) -> Result<SyncCursor> {
        let result = self.conn.query_row(
            "SELECT tenant_id, collection, last_pulled_at, last_pushed_mutation_id,
                    last_status, last_error
             FROM sync_cursors WHERE tenant_id = ? AND collection = ?",
            params![tenant_id, collection],
            parse_cursor,
        );

        match result {
            Ok(cursor) => Ok(cursor),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Ok(SyncCursor::initial(tenant_id, collection))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_cursors
             (tenant_id, collection, last_pulled_at, last_pushed_mutation_id,
              last_status, last_error)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                cursor.tenant_id,
                cursor.collection,
                cursor.last_pulled_at,
                cursor.last_pushed_mutation_id,
                cursor.last_status.as_str(),
                cursor.last_error,
            ],
        )?;
        Ok(())
    }

    // ----- snapshots -----------------------------------------------------

    pub fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots
             (snapshot_id, tenant_id, entity_type, version, payload, created_at, checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                snapshot.snapshot_id,
                snapshot.tenant_id,
                snapshot.entity_type,
                snapshot.version,
                serde_json::to_string(&snapshot.payload)?,
                snapshot.created_at,
                snapshot.checksum,
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self, tenant_id: &str, entity_type: &str) -> Result<Option<Snapshot>> {
        let result = self.conn.query_row(
            "SELECT snapshot_id, tenant_id, entity_type, version, payload, created_at, checksum
             FROM snapshots WHERE tenant_id = ? AND entity_type = ?
             ORDER BY created_at DESC LIMIT 1",
            params![tenant_id, entity_type],
            parse_snapshot,
        );

        match result {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ----- durable message queue (event-class fallback) ------------------

    /// Queue an envelope under its recipient, bounded by `cap`.
    pub fn enqueue_message(
        &self,
        env: &Envelope,
        recipient_id: &str,
        expires_at: i64,
        cap: usize,
    ) -> Result<()> {
        let queued: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queued_messages WHERE tenant_id = ? AND recipient_id = ?",
            params![env.tenant_id, recipient_id],
            |row| row.get(0),
        )?;
        if queued as usize >= cap {
            return Err(Error::QueueFull(recipient_id.to_string()));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO queued_messages
             (message_id, tenant_id, recipient_id, envelope, enqueued_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                env.message_id,
                env.tenant_id,
                recipient_id,
                serde_json::to_string(env)?,
                env.timestamp,
                expires_at,
            ],
        )?;
        Ok(())
    }

    /// Remove and return every queued envelope for a tenant, split into
    /// (deliverable, expired) by the supplied clock.
    pub fn drain_messages(
        &mut self,
        tenant_id: &str,
        now_ms: i64,
    ) -> Result<(Vec<Envelope>, Vec<Envelope>)> {
        let tx = self.conn.transaction()?;
        let mut live = Vec::new();
        let mut expired = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT envelope, expires_at FROM queued_messages
                 WHERE tenant_id = ? ORDER BY enqueued_at ASC",
            )?;
            let rows = stmt.query_map(params![tenant_id], |row| {
                let envelope: String = row.get(0)?;
                let expires_at: i64 = row.get(1)?;
                Ok((envelope, expires_at))
            })?;
            for row in rows {
                let (text, expires_at) = row?;
                let env: Envelope = serde_json::from_str(&text)?;
                if expires_at <= now_ms {
                    expired.push(env);
                } else {
                    live.push(env);
                }
            }
        }
        tx.execute(
            "DELETE FROM queued_messages WHERE tenant_id = ?",
            params![tenant_id],
        )?;
        tx.commit()?;
        Ok((live, expired))
    }

    pub fn queued_message_count(&self, tenant_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queued_messages WHERE tenant_id = ?",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn insert_record(conn: &Connection, record: &Record) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records
         (tenant_id, collection, id, payload, created_at, updated_at, version,
          deleted, last_synced_at, clock, origin_mutation)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.tenant_id,
            record.collection,
            record.id,
            serde_json::to_string(&record.payload)?,
            record.meta.created_at,
            record.meta.updated_at,
            record.meta.version,
            i32::from(record.meta.deleted),
            record.meta.last_synced_at,
            serde_json::to_string(&record.meta.clock)?,
            record.meta.origin_mutation,
        ],
    )?;
    Ok(())
}

fn insert_mutation(conn: &Connection, mutation: &PendingMutation) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_mutations
         (mutation_id, tenant_id, kind, collection, record_id, payload, timestamp,
          retry_count, last_error, clock, state)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            mutation.mutation_id,
            mutation.tenant_id,
            mutation.kind.as_str(),
            mutation.collection,
            mutation.record_id,
            serde_json::to_string(&mutation.payload)?,
            mutation.timestamp,
            mutation.retry_count,
            mutation.last_error,
            serde_json::to_string(&mutation.clock)?,
            mutation.state.as_str(),
        ],
    )?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    text: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let payload_text: String = row.get(3)?;
    let clock_text: String = row.get(9)?;
    Ok(Record {
        tenant_id: row.get(0)?,
        collection: row.get(1)?,
        id: row.get(2)?,
        payload: json_column(3, &payload_text)?,
        meta: RecordMeta {
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            version: row.get(6)?,
            deleted: row.get::<_, i32>(7)? != 0,
            last_synced_at: row.get(8)?,
            clock: json_column::<VectorClock>(9, &clock_text)?,
            origin_mutation: row.get(10)?,
        },
    })
}

fn parse_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMutation> {
    let kind_text: String = row.get(3)?;
    let payload_text: String = row.get(6)?;
    let clock_text: String = row.get(10)?;
    let state_text: String = row.get(11)?;
    Ok(PendingMutation {
        seq: row.get(0)?,
        mutation_id: row.get(1)?,
        tenant_id: row.get(2)?,
        kind: crate::models::MutationKind::parse(&kind_text).unwrap_or(
            crate::models::MutationKind::Update,
        ),
        collection: row.get(4)?,
        record_id: row.get(5)?,
        payload: json_column(6, &payload_text)?,
        timestamp: row.get(7)?,
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
        clock: json_column::<VectorClock>(10, &clock_text)?,
        state: MutationState::parse(&state_text).unwrap_or(MutationState::Pending),
    })
}

fn parse_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCursor> {
    let status_text: String = row.get(4)?;
    Ok(SyncCursor {
        tenant_id: row.get(0)?,
        collection: row.get(1)?,
        last_pulled_at: row.get(2)?,
        last_pushed_mutation_id: row.get(3)?,
        last_status: SyncStatus::parse(&status_text).unwrap_or(SyncStatus::Idle),
        last_error: row.get(5)?,
    })
}

fn parse_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let payload_text: String = row.get(4)?;
    Ok(Snapshot {
        snapshot_id: row.get(0)?,
        tenant_id: row.get(1)?,
        entity_type: row.get(2)?,
        version: row.get(3)?,
        payload: json_column(4, &payload_text)?,
        created_at: row.get(5)?,
        checksum: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MutationKind, RecordDraft};
    use serde_json::json;

    fn record(tenant: &str, id: &str, version: i64) -> Record {
        let mut record = Record::first_version(
            RecordDraft::new(id, tenant, json!({"title": id})),
            "documents",
            "c1",
        );
        record.meta.version = version;
        record
    }

    fn mutation(tenant: &str, id: &str) -> PendingMutation {
        PendingMutation::capture(
            tenant,
            MutationKind::Create,
            "documents",
            id,
            json!({"title": id}),
            VectorClock::new(),
        )
    }

    #[test]
    fn put_and_get_roundtrip() {
        let store = LocalStore::open_in_memory().unwrap();
        let rec = record("t1", "d1", 1);
        store.put_record(&rec).unwrap();

        let fetched = store.get_record("t1", "documents", "d1").unwrap().unwrap();
        assert_eq!(fetched, rec);
        assert!(store.get_record("t2", "documents", "d1").unwrap().is_none());
    }

    #[test]
    fn records_are_tenant_partitioned() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_record(&record("t1", "d1", 1)).unwrap();
        store.put_record(&record("t2", "d2", 1)).unwrap();

        let t1 = store.get_records("t1", "documents").unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].id, "d1");
    }

    #[test]
    fn record_and_mutation_commit_together() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let rec = record("t1", "d1", 1);
        let m = mutation("t1", "d1");
        store.put_record_with_mutation(&rec, &m).unwrap();

        assert!(store.get_record("t1", "documents", "d1").unwrap().is_some());
        assert_eq!(store.pending_count("t1").unwrap(), 1);
    }

    #[test]
    fn mutations_keep_append_order() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = mutation("t1", "d1");
        let second = mutation("t1", "d2");
        store.append_mutation(&first).unwrap();
        store.append_mutation(&second).unwrap();

        let batch = store.pending_mutations("t1", 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].mutation_id, first.mutation_id);
        assert!(batch[0].seq < batch[1].seq);
    }

    #[test]
    fn ack_up_to_removes_prefix() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = mutation("t1", "d1");
        let second = mutation("t1", "d2");
        let third = mutation("t1", "d3");
        store.append_mutation(&first).unwrap();
        store.append_mutation(&second).unwrap();
        store.append_mutation(&third).unwrap();

        let removed = store.ack_up_to("t1", &second.mutation_id).unwrap();
        assert_eq!(removed, 2);
        let remaining = store.pending_mutations("t1", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].mutation_id, third.mutation_id);
    }

    #[test]
    fn requeue_bumps_retry_count() {
        let store = LocalStore::open_in_memory().unwrap();
        let m = mutation("t1", "d1");
        store.append_mutation(&m).unwrap();

        let count = store.requeue_mutation(&m.mutation_id, "timeout").unwrap();
        assert_eq!(count, 1);
        let pending = store.pending_mutations("t1", 10).unwrap();
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn quarantined_mutations_leave_pending_queue() {
        let store = LocalStore::open_in_memory().unwrap();
        let m = mutation("t1", "d1");
        store.append_mutation(&m).unwrap();
        store
            .set_mutation_state(&m.mutation_id, MutationState::Quarantined, Some("denied"))
            .unwrap();

        assert!(store.pending_mutations("t1", 10).unwrap().is_empty());
        let quarantined = store
            .mutations_in_state("t1", MutationState::Quarantined)
            .unwrap();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn cursor_is_lazily_initialized_and_persisted() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut cursor = store.get_cursor("t1", "documents").unwrap();
        assert_eq!(cursor.last_pulled_at, 0);
        assert_eq!(cursor.last_status, SyncStatus::Idle);

        cursor.advance(1_000);
        cursor.last_status = SyncStatus::Success;
        store.put_cursor(&cursor).unwrap();

        let loaded = store.get_cursor("t1", "documents").unwrap();
        assert_eq!(loaded.last_pulled_at, 1_000);
        assert_eq!(loaded.last_status, SyncStatus::Success);
    }

    #[test]
    fn replace_collection_is_atomic_and_advances_cursor() {
        let mut store = LocalStore::open_in_memory().unwrap();
        store.put_record(&record("t1", "old", 4)).unwrap();

        let fresh = vec![record("t1", "new1", 1), record("t1", "new2", 1)];
        store
            .replace_collection("t1", "documents", &fresh, 9_000)
            .unwrap();

        let records = store.get_records("t1", "documents").unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.id.starts_with("new")));
        assert_eq!(store.get_cursor("t1", "documents").unwrap().last_pulled_at, 9_000);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut store = LocalStore::open_in_memory().unwrap();
        store.put_record(&record("t1", "d1", 1)).unwrap();

        store
            .batch(
                "t1",
                &[
                    BatchOp::Put(record("t1", "d2", 1)),
                    BatchOp::Delete {
                        collection: "documents".to_string(),
                        id: "d1".to_string(),
                    },
                ],
            )
            .unwrap();

        assert!(store.get_record("t1", "documents", "d1").unwrap().is_none());
        assert!(store.get_record("t1", "documents", "d2").unwrap().is_some());
    }

    #[test]
    fn message_queue_is_bounded_and_expires() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let env = Envelope::direct(
            crate::models::DeliveryClass::Event,
            "chat",
            "t1",
            "u1",
            "u2",
            json!({"n": 1}),
        );
        store.enqueue_message(&env, "u2", env.timestamp + 1_000, 2).unwrap();

        let env2 = Envelope::direct(
            crate::models::DeliveryClass::Event,
            "chat",
            "t1",
            "u1",
            "u2",
            json!({"n": 2}),
        );
        store
            .enqueue_message(&env2, "u2", env2.timestamp + 1_000, 2)
            .unwrap();

        let env3 = Envelope::direct(
            crate::models::DeliveryClass::Event,
            "chat",
            "t1",
            "u1",
            "u2",
            json!({"n": 3}),
        );
        let err = store
            .enqueue_message(&env3, "u2", env3.timestamp + 1_000, 2)
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));

        // Draining at the expiry instant reports both as expired
        let (live, expired) = store
            .drain_messages("t1", env.timestamp + 1_000)
            .unwrap();
        assert_eq!(expired.len(), 2);
        assert_eq!(live.len(), 0);
        assert_eq!(store.queued_message_count("t1").unwrap(), 0);
    }
}
