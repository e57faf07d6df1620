//! Local store schema migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: records, mutation log, cursors, snapshots
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS records (
            tenant_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            last_synced_at INTEGER,
            clock TEXT NOT NULL DEFAULT '{}',
            origin_mutation TEXT,
            PRIMARY KEY (tenant_id, collection, id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_tenant ON records(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_records_type ON records(tenant_id, collection);
        CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at DESC);

        CREATE TABLE IF NOT EXISTS pending_mutations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            mutation_id TEXT NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            clock TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'pending'
        );
        CREATE INDEX IF NOT EXISTS idx_mutations_tenant_time
            ON pending_mutations(tenant_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_mutations_collection
            ON pending_mutations(collection);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            tenant_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            last_pulled_at INTEGER NOT NULL DEFAULT 0,
            last_pushed_mutation_id TEXT,
            last_status TEXT NOT NULL DEFAULT 'idle',
            last_error TEXT,
            PRIMARY KEY (tenant_id, collection)
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            checksum TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_tenant
            ON snapshots(tenant_id, entity_type);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;

    tx.commit()?;
    tracing::info!("Migrated local store to version 1");
    Ok(())
}

/// Migration to version 2: durable queue for event-class fallback
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queued_messages (
            message_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            envelope TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queued_recipient
            ON queued_messages(tenant_id, recipient_id);
        CREATE INDEX IF NOT EXISTS idx_queued_expiry
            ON queued_messages(expires_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;

    tx.commit()?;
    tracing::info!("Migrated local store to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrations_reach_current_version() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn migration_v2_creates_queue_table() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'queued_messages'
                )",
                [],
                |row| row.get::<_, i32>(0).map(|v| v != 0),
            )
            .unwrap();
        assert!(exists);
    }
}
