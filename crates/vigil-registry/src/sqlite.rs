use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use vigil_core::{RegistryError, RegistryStore, ServiceBinding};

/// Binding table in a private in-memory SQLite database.
///
/// Nothing is written to disk: bindings live exactly as long as the process.
pub struct DbRegistry {
    conn: Mutex<Connection>,
}

fn store_err(e: rusqlite::Error) -> RegistryError {
    RegistryError::Store(e.to_string())
}

impl DbRegistry {
    pub fn in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<(), RegistryError> {
        self.conn
            .lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS bindings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                bound_at INTEGER NOT NULL
            );
            ",
            )
            .map_err(store_err)
    }
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceBinding> {
    let bound_at: i64 = row.get(3)?;
    Ok(ServiceBinding {
        name: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        bound_at: bound_at.max(0) as u64,
    })
}

fn select_binding(conn: &Connection, name: &str) -> Result<ServiceBinding, RegistryError> {
    conn.query_row(
        "SELECT name, host, port, bound_at FROM bindings WHERE name = ?1",
        [name],
        row_to_binding,
    )
    .optional()
    .map_err(store_err)?
    .ok_or_else(|| RegistryError::NotFound(name.to_string()))
}

impl RegistryStore for DbRegistry {
    fn insert_binding(&self, binding: &ServiceBinding) -> Result<u64, RegistryError> {
        let conn = self.conn.lock();
        conn.execute(
                "INSERT INTO bindings (name, host, port, bound_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    binding.name,
                    binding.host,
                    binding.port,
                    binding.bound_at as i64
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref failure, _)
                    if failure.code == ErrorCode::ConstraintViolation =>
                {
                    RegistryError::DuplicateName(binding.name.clone())
                }
                other => store_err(other),
            })?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn remove_binding(&self, name: &str) -> Result<ServiceBinding, RegistryError> {
        let conn = self.conn.lock();
        let binding = select_binding(&conn, name)?;
        conn.execute("DELETE FROM bindings WHERE name = ?1", [name])
            .map_err(store_err)?;
        Ok(binding)
    }

    fn release_binding(&self, name: &str, id: u64) -> Result<bool, RegistryError> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM bindings WHERE name = ?1 AND id = ?2",
                params![name, id as i64],
            )
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    fn get_binding(&self, name: &str) -> Result<ServiceBinding, RegistryError> {
        select_binding(&self.conn.lock(), name)
    }

    fn all_bindings(&self) -> Result<Vec<ServiceBinding>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, host, port, bound_at FROM bindings ORDER BY name")
            .map_err(store_err)?;
        let rows = stmt.query_map([], row_to_binding).map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::Endpoint;

    fn binding(name: &str, port: u16) -> ServiceBinding {
        ServiceBinding::new(name, &Endpoint::new("127.0.0.1", port), 1_700_000_000_000)
    }

    #[test]
    fn insert_get_remove() {
        let db = DbRegistry::in_memory().unwrap();
        db.insert_binding(&binding("vigil", 5801)).unwrap();

        let found = db.get_binding("vigil").unwrap();
        assert_eq!(found.port, 5801);
        assert_eq!(found.bound_at, 1_700_000_000_000);

        let removed = db.remove_binding("vigil").unwrap();
        assert_eq!(removed, found);
        assert!(matches!(db.get_binding("vigil"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let db = DbRegistry::in_memory().unwrap();
        db.insert_binding(&binding("vigil", 5801)).unwrap();
        let err = db.insert_binding(&binding("vigil", 5802)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "vigil"));
    }

    #[test]
    fn lists_in_name_order() {
        let db = DbRegistry::in_memory().unwrap();
        db.insert_binding(&binding("zeta", 1)).unwrap();
        db.insert_binding(&binding("alpha", 2)).unwrap();
        let names: Vec<String> = db.all_bindings().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn release_only_matches_its_own_id() {
        let db = DbRegistry::in_memory().unwrap();
        let old = db.insert_binding(&binding("vigil", 5801)).unwrap();
        db.remove_binding("vigil").unwrap();
        let new = db.insert_binding(&binding("vigil", 5801)).unwrap();
        assert_ne!(old, new);

        assert!(!db.release_binding("vigil", old).unwrap());
        assert_eq!(db.get_binding("vigil").unwrap().port, 5801);
        assert!(db.release_binding("vigil", new).unwrap());
        assert!(matches!(db.get_binding("vigil"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn removing_unknown_name_is_not_found() {
        let db = DbRegistry::in_memory().unwrap();
        assert!(matches!(db.remove_binding("ghost"), Err(RegistryError::NotFound(_))));
    }
}
