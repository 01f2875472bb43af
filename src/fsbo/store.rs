//! SQLite persistence for FSBO search history and their listings.
//!
//! Searches and listings live in separate tables keyed by a string
//! `search_id`; deletes cascade manually (listings first, then the
//! search row).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::fsbo::{ContactStatus, FsboListing};

/// One row of search history.
#[derive(Clone, Debug, Serialize)]
pub struct FsboSearchRow {
    pub search_id: String,
    pub state: String,
    pub city_zip: String,
    pub location: String,
    pub location_type: String,
    pub created_at: String,
    pub status: String,
    pub total_listings: i64,
    pub criteria_json: String,
}

/// SQLite-backed FSBO store. Connections are opened per operation on the
/// blocking pool, same as the scrape cache.
#[derive(Clone)]
pub struct FsboStore {
    db_path: PathBuf,
}

impl FsboStore {
    pub fn new(db_path: impl AsRef<Path>) -> FsboStore {
        FsboStore {
            db_path: db_path.as_ref().to_owned(),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .with_context(|| format!("cannot open FSBO db {}", path.display()))?;
            f(&mut conn)
        })
        .await
        .context("FSBO store task panicked")?
    }

    pub async fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS fsbo_searches (
                    search_id   TEXT PRIMARY KEY,
                    state       TEXT,
                    city_zip    TEXT,
                    location    TEXT,
                    location_type TEXT,
                    created_at  TEXT,
                    status      TEXT DEFAULT 'running',
                    total_listings INTEGER DEFAULT 0,
                    criteria_json  TEXT
                );
                CREATE TABLE IF NOT EXISTS fsbo_listings (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    search_id       TEXT NOT NULL,
                    address         TEXT,
                    city            TEXT,
                    state           TEXT,
                    zip_code        TEXT,
                    price           INTEGER,
                    beds            INTEGER,
                    baths           REAL,
                    sqft            INTEGER,
                    property_type   TEXT,
                    days_on_market  INTEGER,
                    phone           TEXT,
                    email           TEXT,
                    owner_name      TEXT,
                    listing_url     TEXT,
                    source          TEXT,
                    contact_status  TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_listings_search_id
                    ON fsbo_listings(search_id);",
            )?;
            Ok(())
        })
        .await
    }

    pub async fn save_search(
        &self,
        search_id: &str,
        state: &str,
        city_zip: &str,
        location: &str,
        location_type: &str,
        created_at: &str,
        criteria_json: &str,
    ) -> Result<()> {
        let args: Vec<String> = [
            search_id, state, city_zip, location, location_type, created_at,
            criteria_json,
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO fsbo_searches
                   (search_id, state, city_zip, location, location_type, created_at, status, criteria_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
                params![args[0], args[1], args[2], args[3], args[4], args[5], args[6]],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_search_complete(
        &self,
        search_id: &str,
        total_listings: i64,
    ) -> Result<()> {
        let search_id = search_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE fsbo_searches SET status = 'complete', total_listings = ?1
                 WHERE search_id = ?2",
                params![total_listings, search_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_search_status(&self, search_id: &str, status: &str) -> Result<()> {
        let search_id = search_id.to_owned();
        let status = status.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE fsbo_searches SET status = ?1 WHERE search_id = ?2",
                params![status, search_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn save_listings(
        &self,
        search_id: &str,
        listings: &[FsboListing],
    ) -> Result<()> {
        let search_id = search_id.to_owned();
        let listings = listings.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO fsbo_listings
                       (search_id, address, city, state, zip_code, price, beds, baths,
                        sqft, property_type, days_on_market, phone, email, owner_name,
                        listing_url, source, contact_status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                )?;
                for l in &listings {
                    stmt.execute(params![
                        search_id,
                        l.address,
                        l.city,
                        l.state,
                        l.zip_code,
                        l.price,
                        l.beds,
                        l.baths,
                        l.sqft,
                        l.property_type,
                        l.days_on_market,
                        l.phone,
                        l.email,
                        l.owner_name,
                        l.listing_url,
                        l.source,
                        l.contact_status.to_string(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_searches(&self) -> Result<Vec<FsboSearchRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT search_id, state, city_zip, location, location_type,
                        created_at, status, total_listings, criteria_json
                 FROM fsbo_searches ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(FsboSearchRow {
                        search_id: row.get(0)?,
                        state: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        city_zip: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        location: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        location_type: row
                            .get::<_, Option<String>>(4)?
                            .unwrap_or_default(),
                        created_at: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        status: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        total_listings: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                        criteria_json: row
                            .get::<_, Option<String>>(8)?
                            .unwrap_or_default(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_search(&self, search_id: &str) -> Result<Option<FsboSearchRow>> {
        let search_id = search_id.to_owned();
        let rows = self.get_searches().await?;
        Ok(rows.into_iter().find(|r| r.search_id == search_id))
    }

    pub async fn count_listings(&self, search_id: &str) -> Result<i64> {
        let search_id = search_id.to_owned();
        self.with_conn(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM fsbo_listings WHERE search_id = ?1",
                params![search_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    pub async fn get_listings(
        &self,
        search_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FsboListing>> {
        let search_id = search_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT address, city, state, zip_code, price, beds, baths, sqft,
                        property_type, days_on_market, phone, email, owner_name,
                        listing_url, source, contact_status
                 FROM fsbo_listings WHERE search_id = ?1 ORDER BY id
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![search_id, limit, offset], |row| {
                    let contact_raw: String =
                        row.get::<_, Option<String>>(15)?.unwrap_or_default();
                    Ok(FsboListing {
                        address: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        city: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        state: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        zip_code: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        price: row.get(4)?,
                        beds: row.get(5)?,
                        baths: row.get(6)?,
                        sqft: row.get(7)?,
                        property_type: row.get(8)?,
                        days_on_market: row.get(9)?,
                        phone: row.get(10)?,
                        email: row.get(11)?,
                        owner_name: row.get(12)?,
                        listing_url: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
                        source: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
                        contact_status: ContactStatus::from_str(&contact_raw)
                            .unwrap_or(ContactStatus::None),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn all_listings(&self, search_id: &str) -> Result<Vec<FsboListing>> {
        self.get_listings(search_id, 0, i64::MAX).await
    }

    /// Delete a search and its listings (manual cascade).
    pub async fn delete_search(&self, search_id: &str) -> Result<()> {
        let search_id = search_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM fsbo_listings WHERE search_id = ?1",
                params![search_id],
            )?;
            conn.execute(
                "DELETE FROM fsbo_searches WHERE search_id = ?1",
                params![search_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsbo::ContactStatus;

    fn listing(address: &str) -> FsboListing {
        FsboListing {
            address: address.to_owned(),
            city: "Phoenix".to_owned(),
            state: "AZ".to_owned(),
            zip_code: "85001".to_owned(),
            price: Some(250_000),
            beds: Some(3),
            baths: Some(2.0),
            sqft: Some(1600),
            property_type: Some("single_family".to_owned()),
            days_on_market: Some(10),
            owner_name: Some("Pat Owner".to_owned()),
            phone: Some("(555) 111-2222".to_owned()),
            email: None,
            listing_url: "https://x.test/1".to_owned(),
            source: "fsbo.com".to_owned(),
            contact_status: ContactStatus::Partial,
        }
    }

    #[tokio::test]
    async fn search_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsboStore::new(dir.path().join("fsbo.db"));
        store.initialize().await.unwrap();

        store
            .save_search("abc12345", "AZ", "85001", "85001", "zip", "2024-01-01T00:00:00", "{}")
            .await
            .unwrap();
        store
            .save_listings("abc12345", &[listing("123 Main St"), listing("456 Oak Ave")])
            .await
            .unwrap();
        store.update_search_complete("abc12345", 2).await.unwrap();

        let searches = store.get_searches().await.unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].status, "complete");
        assert_eq!(searches[0].total_listings, 2);

        assert_eq!(store.count_listings("abc12345").await.unwrap(), 2);
        let page = store.get_listings("abc12345", 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].address, "456 Oak Ave");
        assert_eq!(page[0].contact_status, ContactStatus::Partial);
        assert_eq!(page[0].sqft, Some(1600));

        store.delete_search("abc12345").await.unwrap();
        assert!(store.get_searches().await.unwrap().is_empty());
        assert_eq!(store.count_listings("abc12345").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_search_is_insert_or_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsboStore::new(dir.path().join("fsbo.db"));
        store.initialize().await.unwrap();
        for _ in 0..2 {
            store
                .save_search("dup", "", "", "85001", "zip", "2024-01-01T00:00:00", "{}")
                .await
                .unwrap();
        }
        assert_eq!(store.get_searches().await.unwrap().len(), 1);
    }
}
