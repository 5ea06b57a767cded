use crate::allocator::{clamp_range, first_free, PortAllocator, Result};
use chrono::{DateTime, Utc};
use portalloc_common::{
    validate_owner, validate_port, validate_request, AllocationError, PortAllocation, PortBinding, Protocol,
};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// The primary key is what makes concurrent allocations of one triple safe
// across processes sharing the file.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS port_allocations (
    server_id INTEGER NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    protocol TEXT NOT NULL CHECK (protocol IN ('TCP', 'UDP')),
    owner_id INTEGER NOT NULL CHECK (owner_id > 0),
    allocated_at TEXT NOT NULL,
    PRIMARY KEY (server_id, port, protocol)
);
CREATE INDEX IF NOT EXISTS idx_port_allocations_owner ON port_allocations (owner_id);
"#;

const SELECT_COLUMNS: &str = "SELECT server_id, port, protocol, owner_id, allocated_at FROM port_allocations";

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.portalloc/allocations.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portalloc")
        .join("allocations.db")
}

fn conversion_failure<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn row_to_allocation(row: &Row<'_>) -> rusqlite::Result<PortAllocation> {
    let protocol: String = row.get(2)?;
    let allocated_at: String = row.get(4)?;

    Ok(PortAllocation {
        server_id: row.get(0)?,
        port: row.get(1)?,
        protocol: protocol.parse().map_err(|e| conversion_failure(2, e))?,
        owner_id: row.get(3)?,
        allocated_at: DateTime::parse_from_rfc3339(&allocated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_failure(4, e))?,
    })
}

fn is_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn owner_of(conn: &Connection, server_id: i64, port: u16, protocol: Protocol) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT owner_id FROM port_allocations WHERE server_id = ?1 AND port = ?2 AND protocol = ?3",
        params![server_id, port, protocol.as_str()],
        |row| row.get(0),
    )
    .optional()
}

/// Insert one row, turning a key violation into `PortConflict`. Must run
/// inside a transaction so the owner read back is the one that blocked us.
fn insert_allocation(conn: &Connection, server_id: i64, port: u16, protocol: Protocol, owner_id: i64) -> Result<()> {
    let inserted = conn.execute(
        "INSERT INTO port_allocations (server_id, port, protocol, owner_id, allocated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![server_id, port, protocol.as_str(), owner_id, Utc::now().to_rfc3339()],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_key_violation(&err) => {
            let existing_owner = owner_of(conn, server_id, port, protocol)
                .map_err(AllocationError::store)?
                .ok_or_else(|| AllocationError::store(err))?;
            Err(AllocationError::PortConflict {
                server_id,
                port,
                protocol,
                existing_owner,
                requested_owner: owner_id,
            })
        }
        Err(err) => Err(AllocationError::store(err)),
    }
}

/// Port allocator backed by a SQLite table.
///
/// Every write runs in a `BEGIN IMMEDIATE` transaction, so several daemons
/// pointed at the same file serialize on SQLite's writer lock.
pub struct SqliteAllocator {
    conn: Mutex<Connection>,
}

impl SqliteAllocator {
    pub fn open(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Self> {
        Ok(Self::from_connection(init_db(path, busy_timeout)?))
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AllocationError::store("database connection lock poisoned"))
    }

    fn query_allocations(&self, filter: &str, value: i64) -> Result<Vec<PortAllocation>> {
        let conn = self.lock()?;
        let sql = format!("{SELECT_COLUMNS} WHERE {filter} = ?1 ORDER BY server_id, port, protocol");
        let mut stmt = conn.prepare(&sql).map_err(AllocationError::store)?;
        let rows = stmt
            .query_map(params![value], row_to_allocation)
            .map_err(AllocationError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(AllocationError::store)
    }
}

impl PortAllocator for SqliteAllocator {
    fn allocate_port(&self, server_id: i64, port: i64, protocol: &str, owner_id: i64) -> Result<()> {
        let (port, protocol) = validate_request(port, protocol, owner_id)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(AllocationError::store)?;
        if let Err(err) = insert_allocation(&tx, server_id, port, protocol, owner_id) {
            if err.is_conflict() {
                warn!("{}", err);
            }
            return Err(err);
        }
        tx.commit().map_err(AllocationError::store)?;

        info!(server_id, port, %protocol, owner_id, "allocated port");
        Ok(())
    }

    fn deallocate_port(&self, server_id: i64, port: i64, protocol: &str) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "DELETE FROM port_allocations WHERE server_id = ?1 AND port = ?2 AND protocol = ?3",
                params![server_id, port, protocol],
            )
            .map_err(AllocationError::store)?;

        if rows > 0 {
            info!(server_id, port, protocol, "released port");
        } else {
            debug!(server_id, port, protocol, "release of unallocated port ignored");
        }
        Ok(())
    }

    fn is_port_available(&self, server_id: i64, port: i64, protocol: &str) -> Result<bool> {
        let conn = self.lock()?;
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM port_allocations WHERE server_id = ?1 AND port = ?2 AND protocol = ?3",
                params![server_id, port, protocol],
                |row| row.get(0),
            )
            .optional()
            .map_err(AllocationError::store)?;
        Ok(held.is_none())
    }

    fn get_port_allocation(&self, server_id: i64, port: i64, protocol: &str) -> Result<PortAllocation> {
        let conn = self.lock()?;
        let sql = format!("{SELECT_COLUMNS} WHERE server_id = ?1 AND port = ?2 AND protocol = ?3");
        conn.query_row(&sql, params![server_id, port, protocol], row_to_allocation)
            .optional()
            .map_err(AllocationError::store)?
            .ok_or_else(|| AllocationError::PortNotFound {
                server_id,
                port,
                protocol: protocol.to_string(),
            })
    }

    fn list_allocated_ports(&self, server_id: i64) -> Result<Vec<PortAllocation>> {
        self.query_allocations("server_id", server_id)
    }

    fn list_ports_by_owner(&self, owner_id: i64) -> Result<Vec<PortAllocation>> {
        self.query_allocations("owner_id", owner_id)
    }

    fn deallocate_ports_by_owner(&self, owner_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM port_allocations WHERE owner_id = ?1", params![owner_id])
            .map_err(AllocationError::store)?;
        info!(owner_id, released = rows, "released ports for owner");
        Ok(())
    }

    fn allocate_multiple_ports(&self, server_id: i64, bindings: &[PortBinding], owner_id: i64) -> Result<()> {
        validate_owner(owner_id)?;
        let requested = bindings
            .iter()
            .map(|b| -> Result<(u16, Protocol)> {
                Ok((validate_port(b.host_port)?, b.protocol.parse::<Protocol>()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(AllocationError::store)?;

        // Pre-check. Returning drops the untouched transaction.
        for &(port, protocol) in &requested {
            let existing = owner_of(&tx, server_id, port, protocol).map_err(AllocationError::store)?;
            if let Some(existing_owner) = existing {
                let err = AllocationError::PortConflict {
                    server_id,
                    port,
                    protocol,
                    existing_owner,
                    requested_owner: owner_id,
                };
                warn!("batch rejected: {}", err);
                return Err(err);
            }
        }

        for &(port, protocol) in &requested {
            if let Err(err) = insert_allocation(&tx, server_id, port, protocol, owner_id) {
                warn!(server_id, owner_id, "batch failed mid-commit, rolling back: {}", err);
                return Err(match tx.rollback() {
                    Ok(()) => err,
                    Err(rollback) => AllocationError::RollbackFailed {
                        cause: Box::new(err),
                        message: rollback.to_string(),
                    },
                });
            }
        }

        tx.commit().map_err(AllocationError::store)?;
        info!(server_id, owner_id, count = requested.len(), "allocated port batch");
        Ok(())
    }

    fn get_available_ports_in_range(
        &self,
        server_id: i64,
        protocol: &str,
        start_port: i64,
        end_port: i64,
        limit: usize,
    ) -> Result<Vec<u16>> {
        let protocol = protocol.parse::<Protocol>()?;
        let Some((start, end)) = clamp_range(start_port, end_port) else {
            return Ok(Vec::new());
        };

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT port FROM port_allocations WHERE server_id = ?1 AND protocol = ?2 AND port BETWEEN ?3 AND ?4",
            )
            .map_err(AllocationError::store)?;
        let taken = stmt
            .query_map(params![server_id, protocol.as_str(), start, end], |row| row.get::<_, u16>(0))
            .map_err(AllocationError::store)?
            .collect::<rusqlite::Result<HashSet<u16>>>()
            .map_err(AllocationError::store)?;

        Ok(first_free(start, end, limit, |port| taken.contains(&port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rejects_invalid_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let now = Utc::now().to_rfc3339();
        let bad_rows = [(0i64, "TCP", 1i64), (80, "tcp", 1), (80, "TCP", 0)];
        for (port, protocol, owner) in bad_rows {
            let result = conn.execute(
                "INSERT INTO port_allocations VALUES (1, ?1, ?2, ?3, ?4)",
                params![port, protocol, owner, now],
            );
            assert!(result.is_err(), "{port}/{protocol} owner {owner} accepted");
        }
    }

    #[test]
    fn test_duplicate_key_is_reported_as_conflict() {
        let allocator = SqliteAllocator::open_in_memory().unwrap();
        allocator.allocate_port(3, 27015, "UDP", 10).unwrap();

        let conn = allocator.lock().unwrap();
        let err = insert_allocation(&conn, 3, 27015, Protocol::Udp, 11).unwrap_err();
        assert_eq!(
            err,
            AllocationError::PortConflict {
                server_id: 3,
                port: 27015,
                protocol: Protocol::Udp,
                existing_owner: 10,
                requested_owner: 11,
            }
        );
    }

    #[test]
    fn test_allocated_at_survives_reload() {
        let allocator = SqliteAllocator::open_in_memory().unwrap();
        let before = Utc::now();
        allocator.allocate_port(1, 8080, "TCP", 5).unwrap();

        let allocation = allocator.get_port_allocation(1, 8080, "TCP").unwrap();
        assert!(allocation.allocated_at >= before - chrono::Duration::seconds(1));
        assert!(allocation.allocated_at <= Utc::now());
    }

    #[test]
    fn test_default_db_path_is_under_portalloc() {
        let path = default_db_path();
        assert!(path.ends_with(".portalloc/allocations.db"));
    }
}
