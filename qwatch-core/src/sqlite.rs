use rusqlite::Connection;

/// Pragmas shared by every connection to a qwatch database. Several runners
/// may open the same file, so writers wait instead of failing on a lock.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// Connections to databases owned by another system must not change their
/// journal mode.
pub fn configure_read_only(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA busy_timeout = 5000;\n")
}
