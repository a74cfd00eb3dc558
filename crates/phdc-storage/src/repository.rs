//! `phd_projects` persistence: upsert-with-merge keyed by normalized listing URL.

use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use phdc_core::{Candidate, ListingRecord, UNKNOWN_FUNDING};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    /// Candidates whose URL was already stored, changed or not.
    pub merged: usize,
    pub rolled_back: bool,
}

impl UpsertOutcome {
    fn rolled_back() -> Self {
        Self {
            inserted: 0,
            merged: 0,
            rolled_back: true,
        }
    }
}

/// The fields a re-scrape is allowed to overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MutableFields {
    deadline: String,
    funding_type: String,
    description: String,
}

/// Returns the merged field set when at least one field changes.
///
/// A field is overwritten only by a non-empty value that differs from the stored one, so a
/// source that temporarily stops publishing a deadline never erases it.
fn merge_mutable(stored: &MutableFields, candidate: &Candidate) -> Option<MutableFields> {
    let mut merged = stored.clone();
    let mut changed = false;
    for (slot, incoming) in [
        (&mut merged.deadline, &candidate.deadline),
        (&mut merged.funding_type, &candidate.funding_type),
        (&mut merged.description, &candidate.description),
    ] {
        if !incoming.is_empty() && *slot != *incoming {
            *slot = incoming.clone();
            changed = true;
        }
    }
    changed.then_some(merged)
}

#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Open (creating if needed) the SQLite database behind `database_url`.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert(&self, batch: &[Candidate]) -> UpsertOutcome {
        self.upsert_at(batch, Utc::now()).await
    }

    /// Upsert the batch in one transaction, stamping new and changed rows with `now`.
    ///
    /// A storage failure rolls the whole batch back and reports zero effect.
    pub async fn upsert_at(&self, batch: &[Candidate], now: DateTime<Utc>) -> UpsertOutcome {
        match self.try_upsert(batch, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, batch_size = batch.len(), "upsert batch rolled back");
                UpsertOutcome::rolled_back()
            }
        }
    }

    async fn try_upsert(
        &self,
        batch: &[Candidate],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = UpsertOutcome::default();

        for candidate in batch {
            let existing = sqlx::query(
                "SELECT id, deadline, funding_type, description FROM phd_projects WHERE url = ?1",
            )
            .bind(&candidate.url)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => {
                    let id: i64 = row.try_get("id")?;
                    let stored = MutableFields {
                        deadline: row.try_get("deadline")?,
                        funding_type: row.try_get("funding_type")?,
                        description: row.try_get("description")?,
                    };
                    if let Some(merged) = merge_mutable(&stored, candidate) {
                        update_mutable(&mut tx, id, &merged, now).await?;
                        debug!(url = %candidate.url, "merged changed fields");
                    }
                    outcome.merged += 1;
                }
                None => {
                    insert_candidate(&mut tx, candidate, now).await?;
                    outcome.inserted += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn find_by_url(&self, url: &str) -> Result<Option<ListingRecord>, StorageError> {
        let row = sqlx::query(&format!("{SELECT_RECORD} WHERE url = ?1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    /// Most recently collected listings first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ListingRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "{SELECT_RECORD} ORDER BY collected_at DESC, id DESC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM phd_projects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

const SELECT_RECORD: &str = "SELECT id, title, university, department, supervisor, region, \
     region_label, country, funding_type, discipline, deadline, description, url, source, \
     is_new, collected_at, updated_at FROM phd_projects";

async fn insert_candidate(
    tx: &mut Transaction<'_, Sqlite>,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let funding_type = if candidate.funding_type.is_empty() {
        UNKNOWN_FUNDING
    } else {
        candidate.funding_type.as_str()
    };
    sqlx::query(
        r#"
        INSERT INTO phd_projects (
            title, university, department, supervisor, region, region_label, country,
            funding_type, discipline, deadline, description, url, source, is_new,
            collected_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14, ?14)
        "#,
    )
    .bind(&candidate.title)
    .bind(&candidate.university)
    .bind(&candidate.department)
    .bind(&candidate.supervisor)
    .bind(candidate.region_str())
    .bind(&candidate.region_label)
    .bind(&candidate.country)
    .bind(funding_type)
    .bind(&candidate.discipline)
    .bind(&candidate.deadline)
    .bind(&candidate.description)
    .bind(&candidate.url)
    .bind(&candidate.source)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_mutable(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    fields: &MutableFields,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE phd_projects
           SET deadline = ?1,
               funding_type = ?2,
               description = ?3,
               updated_at = ?4
         WHERE id = ?5
        "#,
    )
    .bind(&fields.deadline)
    .bind(&fields.funding_type)
    .bind(&fields.description)
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<ListingRecord, sqlx::Error> {
    Ok(ListingRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        university: row.try_get("university")?,
        department: row.try_get("department")?,
        supervisor: row.try_get("supervisor")?,
        region: row.try_get("region")?,
        region_label: row.try_get("region_label")?,
        country: row.try_get("country")?,
        funding_type: row.try_get("funding_type")?,
        discipline: row.try_get("discipline")?,
        deadline: row.try_get("deadline")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        is_new: row.try_get("is_new")?,
        collected_at: row.try_get("collected_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use phdc_core::Region;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn listing(url: &str, deadline: &str) -> Candidate {
        Candidate {
            title: "PhD in Quantum Optics".into(),
            url: url.into(),
            university: "TU Delft".into(),
            region: Some(Region::Europe),
            region_label: "欧陆".into(),
            country: "Netherlands".into(),
            funding_type: "fully_funded".into(),
            deadline: deadline.into(),
            description: "A fully funded position in photonics.".into(),
            source: "euraxess".into(),
            ..Default::default()
        }
    }

    async fn repo() -> Repository {
        let repo = Repository::in_memory().await.unwrap();
        repo.migrate().await.unwrap();
        repo
    }

    #[test]
    fn merge_ignores_empty_and_equal_values() {
        let stored = MutableFields {
            deadline: "2024-01-01".into(),
            funding_type: "fully_funded".into(),
            description: "desc".into(),
        };
        let mut candidate = listing("https://x", "");
        candidate.description = "desc".into();
        assert_eq!(merge_mutable(&stored, &candidate), None);

        candidate.deadline = "2024-02-01".into();
        let merged = merge_mutable(&stored, &candidate).unwrap();
        assert_eq!(merged.deadline, "2024-02-01");
        assert_eq!(merged.description, "desc");
    }

    #[tokio::test]
    async fn first_sighting_inserts_with_lifecycle_metadata() {
        let repo = repo().await;
        let outcome = repo
            .upsert_at(&[listing("https://a.example/1", "2024-01-01")], ts(8))
            .await;
        assert_eq!(
            outcome,
            UpsertOutcome {
                inserted: 1,
                merged: 0,
                rolled_back: false
            }
        );

        let record = repo.find_by_url("https://a.example/1").await.unwrap().unwrap();
        assert!(record.is_new);
        assert_eq!(record.region, "europe");
        assert_eq!(record.region_label, "欧陆");
        assert_eq!(record.collected_at, ts(8));
        assert_eq!(record.updated_at, ts(8));
    }

    #[tokio::test]
    async fn repeated_upsert_is_idempotent() {
        let repo = repo().await;
        let batch = vec![
            listing("https://a.example/1", "2024-01-01"),
            listing("https://a.example/2", "2024-03-01"),
        ];
        repo.upsert_at(&batch, ts(8)).await;
        let second = repo.upsert_at(&batch, ts(9)).await;

        assert_eq!(second.inserted, 0);
        assert_eq!(second.merged, 2);
        assert_eq!(repo.count().await.unwrap(), 2);
        for c in &batch {
            let record = repo.find_by_url(&c.url).await.unwrap().unwrap();
            assert_eq!(record.collected_at, ts(8));
            assert_eq!(record.updated_at, ts(8));
        }
    }

    #[tokio::test]
    async fn merge_is_selective() {
        let repo = repo().await;
        let url = "https://a.example/1";
        repo.upsert_at(&[listing(url, "2024-01-01")], ts(8)).await;

        let outcome = repo.upsert_at(&[listing(url, "")], ts(9)).await;
        assert_eq!(outcome.merged, 1);
        let record = repo.find_by_url(url).await.unwrap().unwrap();
        assert_eq!(record.deadline, "2024-01-01");
        assert_eq!(record.updated_at, ts(8));

        let mut changed = listing(url, "2024-02-01");
        changed.title = "Renamed upstream".into();
        changed.university = "Elsewhere".into();
        let outcome = repo.upsert_at(&[changed], ts(10)).await;
        assert_eq!(outcome.merged, 1);
        let record = repo.find_by_url(url).await.unwrap().unwrap();
        assert_eq!(record.deadline, "2024-02-01");
        assert_eq!(record.updated_at, ts(10));
        assert_eq!(record.collected_at, ts(8));
        assert_eq!(record.title, "PhD in Quantum Optics");
        assert_eq!(record.university, "TU Delft");
        assert!(record.is_new);
    }

    #[tokio::test]
    async fn duplicate_urls_within_one_batch_count_once_as_insert() {
        let repo = repo().await;
        let batch = vec![
            listing("https://a.example/1", "2024-01-01"),
            listing("https://a.example/1", "2024-05-01"),
        ];
        let outcome = repo.upsert_at(&batch, ts(8)).await;
        assert_eq!((outcome.inserted, outcome.merged), (1, 1));
        let record = repo.find_by_url("https://a.example/1").await.unwrap().unwrap();
        assert_eq!(record.deadline, "2024-05-01");
    }

    #[tokio::test]
    async fn empty_funding_type_is_stored_as_unknown() {
        let repo = repo().await;
        let mut candidate = listing("https://a.example/1", "");
        candidate.funding_type.clear();
        repo.upsert_at(&[candidate], ts(8)).await;
        let record = repo.find_by_url("https://a.example/1").await.unwrap().unwrap();
        assert_eq!(record.funding_type, "unknown");
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_whole_batch() {
        let repo = Repository::in_memory().await.unwrap();
        // no schema: the first SELECT fails
        let outcome = repo
            .upsert_at(&[listing("https://a.example/1", "")], ts(8))
            .await;
        assert_eq!(outcome, UpsertOutcome::rolled_back());

        repo.migrate().await.unwrap();
        repo.upsert_at(&[listing("https://a.example/1", "")], ts(8)).await;
        sqlx::query("CREATE TRIGGER refuse BEFORE INSERT ON phd_projects WHEN NEW.url LIKE '%/boom' BEGIN SELECT RAISE(ABORT, 'boom'); END")
            .execute(repo.pool())
            .await
            .unwrap();
        let batch = vec![
            listing("https://a.example/2", ""),
            listing("https://a.example/boom", ""),
        ];
        let outcome = repo.upsert_at(&batch, ts(9)).await;
        assert!(outcome.rolled_back);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert!(repo.find_by_url("https://a.example/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_orders_by_collection_time() {
        let repo = repo().await;
        repo.upsert_at(&[listing("https://a.example/old", "")], ts(8)).await;
        repo.upsert_at(
            &[listing("https://a.example/new", "")],
            ts(8) + Duration::hours(3),
        )
        .await;
        let recent = repo.recent(10).await.unwrap();
        let urls: Vec<_> = recent.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/new", "https://a.example/old"]);
        assert_eq!(repo.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connect_creates_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data").join("phd_projects.db");
        let url = format!("sqlite://{}", db_path.display());

        let repo = Repository::connect(&url).await.unwrap();
        repo.migrate().await.unwrap();
        repo.upsert(&[listing("https://a.example/file", "")]).await;

        assert!(db_path.exists());
        let reopened = Repository::connect(&url).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }
}
