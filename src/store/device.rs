//! Device identity record (singleton row, id = 1)

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::Result;

/// Persisted identity of the primary tunnel device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

impl Store {
    /// Get the device record, if one was ever written
    pub fn device(&self) -> Result<Option<DeviceRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT name, private_key, public_key, listen_port, started_at
                 FROM device WHERE id = 1",
                [],
                |row| {
                    Ok(DeviceRecord {
                        name: row.get(0)?,
                        private_key: row.get(1)?,
                        public_key: row.get(2)?,
                        listen_port: row.get(3)?,
                        started_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or replace the device identity. `started_at` is preserved.
    pub fn upsert_device(
        &self,
        name: &str,
        private_key: &str,
        public_key: &str,
        listen_port: u16,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO device (id, name, private_key, public_key, listen_port)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                private_key = excluded.private_key,
                public_key = excluded.public_key,
                listen_port = excluded.listen_port",
            params![name, private_key, public_key, listen_port],
        )?;
        Ok(())
    }

    /// Update interface name and listen port, keeping the keypair
    pub fn update_device_binding(&self, name: &str, listen_port: u16) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE device SET name = ?1, listen_port = ?2 WHERE id = 1",
            params![name, listen_port],
        )?;
        Ok(())
    }

    /// Record (or clear) when the primary device was brought up
    pub fn set_device_started_at(&self, started_at: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE device SET started_at = ?1 WHERE id = 1",
            params![started_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::tests::temp_store;

    #[test]
    fn test_device_roundtrip() {
        let (_dir, store) = temp_store();
        assert!(store.device().unwrap().is_none());

        store
            .upsert_device("wg0", &"aa".repeat(32), &"bb".repeat(32), 51820)
            .unwrap();
        store.set_device_started_at(Some(1_700_000_000)).unwrap();

        let record = store.device().unwrap().unwrap();
        assert_eq!(record.name, "wg0");
        assert_eq!(record.listen_port, 51820);
        assert_eq!(record.started_at, Some(1_700_000_000));

        // Re-upsert keeps started_at, binding update keeps keys
        store
            .upsert_device("wg0", &"aa".repeat(32), &"bb".repeat(32), 51821)
            .unwrap();
        store.update_device_binding("wg1", 51999).unwrap();
        let record = store.device().unwrap().unwrap();
        assert_eq!(record.name, "wg1");
        assert_eq!(record.listen_port, 51999);
        assert_eq!(record.public_key, "bb".repeat(32));
        assert_eq!(record.started_at, Some(1_700_000_000));

        store.set_device_started_at(None).unwrap();
        assert!(store.device().unwrap().unwrap().started_at.is_none());
    }
}
