// src/store/profile.rs
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::StoreError;

/// Merchant profile mirrored to the backend. `is_synced` flips once the
/// backend has acknowledged the latest copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    pub email: String,
    pub store_name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub category: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Store {
    pub fn upsert_profile(&self, p: &UserProfile) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_profile
                (uid, email, store_name, phone_number, category, joined_at_ms, is_synced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(uid) DO UPDATE SET
                email = excluded.email,
                store_name = excluded.store_name,
                phone_number = excluded.phone_number,
                category = excluded.category,
                is_synced = excluded.is_synced",
            params![
                p.uid,
                p.email,
                p.store_name,
                p.phone_number,
                p.category,
                p.joined_at.timestamp_millis(),
                p.is_synced,
            ],
        )?;
        Ok(())
    }

    pub fn profile(&self, uid: &str) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT uid, email, store_name, phone_number, category, joined_at_ms, is_synced
                 FROM user_profile WHERE uid = ?1",
                params![uid],
                map_profile_row,
            )
            .optional()?)
    }

    pub fn unsynced_profiles(&self) -> Result<Vec<UserProfile>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT uid, email, store_name, phone_number, category, joined_at_ms, is_synced
             FROM user_profile WHERE is_synced = 0",
        )?;
        let rows = stmt
            .query_map([], map_profile_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_profile_synced(&self, uid: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE user_profile SET is_synced = 1 WHERE uid = ?1",
            params![uid],
        )?;
        Ok(())
    }
}

fn map_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let joined_ms: i64 = row.get(5)?;
    Ok(UserProfile {
        uid: row.get(0)?,
        email: row.get(1)?,
        store_name: row.get(2)?,
        phone_number: row.get(3)?,
        category: row.get(4)?,
        joined_at: DateTime::from_timestamp_millis(joined_ms).unwrap_or_default(),
        is_synced: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_join_date_and_tracks_sync() {
        let store = Store::open_in_memory().unwrap();
        let joined = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let mut p = UserProfile {
            uid: "g-1".into(),
            email: "toko@example.com".into(),
            store_name: "Toko Sejahtera".into(),
            phone_number: "0812".into(),
            category: "retail".into(),
            joined_at: joined,
            is_synced: false,
        };
        store.upsert_profile(&p).unwrap();
        assert_eq!(store.unsynced_profiles().unwrap().len(), 1);

        p.store_name = "Toko Baru".into();
        p.joined_at = Utc::now();
        store.upsert_profile(&p).unwrap();
        let got = store.profile("g-1").unwrap().unwrap();
        assert_eq!(got.store_name, "Toko Baru");
        assert_eq!(got.joined_at, joined);

        store.mark_profile_synced("g-1").unwrap();
        assert!(store.unsynced_profiles().unwrap().is_empty());
    }
}
