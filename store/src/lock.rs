use std::time::{Duration, Instant};

use rusqlite::Connection;

/// The two ways a critical section can begin a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `BEGIN EXCLUSIVE` — blocks all other writers and readers-that-lock.
    Exclusive,
    /// `BEGIN TRANSACTION` — a write transaction without an immediate
    /// upgrade to exclusive.
    Transaction,
}

/// Acquire a lock on `conn` in `mode`, retrying in a tight poll until
/// success or until `timeout` has elapsed. Returns whether the lock was
/// acquired; on `false` the caller must not assume a transaction is open.
pub fn acquire(conn: &Connection, mode: LockMode, timeout: Duration) -> bool {
    let stmt = match mode {
        LockMode::Exclusive => "BEGIN EXCLUSIVE",
        LockMode::Transaction => "BEGIN TRANSACTION",
    };

    let start = Instant::now();
    loop {
        if conn.execute_batch(stmt).is_ok() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
    }
}

/// Commit the transaction started by a successful `acquire`.
pub fn release(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("COMMIT")
}

/// Roll back the transaction started by a successful `acquire`, used when
/// the critical section observed an error.
pub fn rollback(conn: &Connection) {
    // Rollback is best-effort: if it fails the connection is already in a
    // state the caller can't recover from further, so we swallow the error
    // rather than double-fault out of an error path.
    let _ = conn.execute_batch("ROLLBACK");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER)").unwrap();
        assert!(acquire(&conn, LockMode::Exclusive, Duration::from_secs(1)));
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        release(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER)").unwrap();
        assert!(acquire(&conn, LockMode::Exclusive, Duration::from_secs(1)));
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        rollback(&conn);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
