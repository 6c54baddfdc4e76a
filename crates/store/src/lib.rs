//! Versioned document store over SQLite.
//!
//! The pipeline treats storage as a key/value document store keyed by charity
//! EIN (and phase, for the phase cache). The versioned-store surface is the
//! `commits`/`tags` pair: `commit(message)` produces a hash describing a
//! durable snapshot point, `tag` names one.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use goodmeasure_core::types::{
    Charity, CharityDocument, Evaluation, PdfRecord, PhaseCacheEntry, RawRecord,
};
use goodmeasure_core::PipelineError;

mod pdf_queries;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;
        info!(db_path, "opened store");
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === charities ===

    pub async fn get_charity(&self, ein: &str) -> Result<Option<Charity>> {
        let row = sqlx::query("SELECT ein, name, website FROM charities WHERE ein = ?1")
            .bind(ein)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Charity {
            ein: r.get("ein"),
            name: r.get("name"),
            website: r.get("website"),
        }))
    }

    pub async fn upsert_charity(&self, charity: &Charity) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO charities (ein, name, website, created_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (ein) DO UPDATE SET
                   name = CASE WHEN excluded.name != '' THEN excluded.name ELSE charities.name END,
                   website = COALESCE(excluded.website, charities.website)"#,
        )
        .bind(&charity.ein)
        .bind(&charity.name)
        .bind(&charity.website)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fill in a website from the charities file when the stored one is
    /// missing or not scheme-qualified.
    pub async fn sync_charity_website(&self, ein: &str, website: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE charities SET website = ?1
               WHERE ein = ?2
                 AND (website IS NULL OR website = ''
                      OR (website NOT LIKE 'http://%' AND website NOT LIKE 'https://%'))"#,
        )
        .bind(website)
        .bind(ein)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // === raw_scraped_data ===

    pub async fn get_raw(&self, ein: &str, source: &str) -> Result<Option<RawRecord>> {
        let row = sqlx::query(
            r#"SELECT charity_ein, source, raw_payload, parsed_payload, success,
                      error_message, retry_count, scraped_at
               FROM raw_scraped_data WHERE charity_ein = ?1 AND source = ?2"#,
        )
        .bind(ein)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.map(raw_record_from_row).transpose()
    }

    pub async fn get_raw_for_charity(&self, ein: &str) -> Result<Vec<RawRecord>> {
        let rows = sqlx::query(
            r#"SELECT charity_ein, source, raw_payload, parsed_payload, success,
                      error_message, retry_count, scraped_at
               FROM raw_scraped_data WHERE charity_ein = ?1"#,
        )
        .bind(ein)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(raw_record_from_row).collect()
    }

    /// Upsert a raw record. A successful write resets `retry_count`; the
    /// parsed payload is only ever written after schema validation upstream.
    pub async fn upsert_raw(&self, record: &RawRecord) -> Result<()> {
        let parsed = record
            .parsed_payload
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()?;
        sqlx::query(
            r#"INSERT INTO raw_scraped_data
                   (charity_ein, source, raw_payload, parsed_payload, success,
                    error_message, retry_count, scraped_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT (charity_ein, source) DO UPDATE SET
                   raw_payload = excluded.raw_payload,
                   parsed_payload = excluded.parsed_payload,
                   success = excluded.success,
                   error_message = excluded.error_message,
                   retry_count = excluded.retry_count,
                   scraped_at = excluded.scraped_at"#,
        )
        .bind(&record.charity_ein)
        .bind(&record.source)
        .bind(&record.raw_payload)
        .bind(parsed)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(record.retry_count as i64)
        .bind(record.scraped_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure and bump the cross-run retry counter. Returns the new
    /// count.
    pub async fn increment_retry(&self, ein: &str, source: &str, error: &str) -> Result<u32> {
        sqlx::query(
            r#"INSERT INTO raw_scraped_data
                   (charity_ein, source, success, error_message, retry_count, scraped_at)
               VALUES (?1, ?2, 0, ?3, 1, ?4)
               ON CONFLICT (charity_ein, source) DO UPDATE SET
                   success = 0,
                   error_message = excluded.error_message,
                   retry_count = raw_scraped_data.retry_count + 1,
                   scraped_at = excluded.scraped_at"#,
        )
        .bind(ein)
        .bind(source)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT retry_count FROM raw_scraped_data WHERE charity_ein = ?1 AND source = ?2",
        )
        .bind(ein)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("retry_count") as u32)
    }

    /// Record a permanent failure WITHOUT bumping the retry counter.
    /// Validation failures land here: retrying them would never succeed, so
    /// they must not consume the cross-run backoff budget.
    pub async fn record_failure(&self, ein: &str, source: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO raw_scraped_data
                   (charity_ein, source, success, error_message, retry_count, scraped_at)
               VALUES (?1, ?2, 0, ?3, 0, ?4)
               ON CONFLICT (charity_ein, source) DO UPDATE SET
                   success = 0,
                   error_message = excluded.error_message,
                   scraped_at = excluded.scraped_at"#,
        )
        .bind(ein)
        .bind(source)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach a validated parsed payload to an existing raw row (extract
    /// phase). Validation failures keep the row with a failure message
    /// instead.
    pub async fn set_parsed(
        &self,
        ein: &str,
        source: &str,
        parsed: Option<&serde_json::Value>,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let parsed = parsed.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"UPDATE raw_scraped_data
               SET parsed_payload = ?1, success = ?2, error_message = ?3
               WHERE charity_ein = ?4 AND source = ?5"#,
        )
        .bind(parsed)
        .bind(success)
        .bind(error)
        .bind(ein)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === charity_data ===

    pub async fn get_document(&self, ein: &str) -> Result<Option<CharityDocument>> {
        let row = sqlx::query(
            "SELECT charity_ein, data, sources, synthesized_at FROM charity_data WHERE charity_ein = ?1",
        )
        .bind(ein)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(CharityDocument {
                charity_ein: r.get("charity_ein"),
                data: serde_json::from_str(r.get::<String, _>("data").as_str())?,
                sources: serde_json::from_str(r.get::<String, _>("sources").as_str())?,
                synthesized_at: parse_ts(r.get::<String, _>("synthesized_at").as_str())?,
            })
        })
        .transpose()
    }

    pub async fn upsert_document(&self, doc: &CharityDocument) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO charity_data (charity_ein, data, sources, synthesized_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (charity_ein) DO UPDATE SET
                   data = excluded.data,
                   sources = excluded.sources,
                   synthesized_at = excluded.synthesized_at"#,
        )
        .bind(&doc.charity_ein)
        .bind(serde_json::to_string(&doc.data)?)
        .bind(serde_json::to_string(&doc.sources)?)
        .bind(doc.synthesized_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === evaluations ===

    pub async fn get_evaluation(&self, ein: &str) -> Result<Option<Evaluation>> {
        let row = sqlx::query("SELECT payload FROM evaluations WHERE charity_ein = ?1")
            .bind(ein)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok(serde_json::from_str(r.get::<String, _>("payload").as_str())?))
            .transpose()
    }

    pub async fn upsert_evaluation(&self, eval: &Evaluation) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO evaluations (charity_ein, payload, updated_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT (charity_ein) DO UPDATE SET
                   payload = excluded.payload,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&eval.charity_ein)
        .bind(serde_json::to_string(eval)?)
        .bind(eval.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_evaluations(&self) -> Result<Vec<Evaluation>> {
        let rows = sqlx::query("SELECT payload FROM evaluations")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| Ok(serde_json::from_str(r.get::<String, _>("payload").as_str())?))
            .collect()
    }

    // === citations ===

    pub async fn replace_citations(&self, ein: &str, citations: &[(String, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM citations WHERE charity_ein = ?1")
            .bind(ein)
            .execute(&mut *tx)
            .await?;
        for (id, source_url) in citations {
            sqlx::query(
                "INSERT INTO citations (charity_ein, citation_id, source_url) VALUES (?1, ?2, ?3)",
            )
            .bind(ein)
            .bind(id)
            .bind(source_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // === phase_cache ===

    pub async fn get_phase_cache(&self, ein: &str, phase: &str) -> Result<Option<PhaseCacheEntry>> {
        let row = sqlx::query(
            r#"SELECT charity_ein, phase, fingerprint, ran_at, cost_usd
               FROM phase_cache WHERE charity_ein = ?1 AND phase = ?2"#,
        )
        .bind(ein)
        .bind(phase)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(PhaseCacheEntry {
                charity_ein: r.get("charity_ein"),
                phase: r.get("phase"),
                fingerprint: r.get("fingerprint"),
                ran_at: parse_ts(r.get::<String, _>("ran_at").as_str())?,
                cost_usd: r.get("cost_usd"),
            })
        })
        .transpose()
    }

    /// Idempotent for identical fingerprints: the row is simply rewritten
    /// with a fresh timestamp inside a single statement.
    pub async fn upsert_phase_cache(&self, entry: &PhaseCacheEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO phase_cache (charity_ein, phase, fingerprint, ran_at, cost_usd)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT (charity_ein, phase) DO UPDATE SET
                   fingerprint = excluded.fingerprint,
                   ran_at = excluded.ran_at,
                   cost_usd = excluded.cost_usd"#,
        )
        .bind(&entry.charity_ein)
        .bind(&entry.phase)
        .bind(&entry.fingerprint)
        .bind(entry.ran_at.to_rfc3339())
        .bind(entry.cost_usd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A failed phase deletes its cache entry so the next run retries rather
    /// than skipping a bad state.
    pub async fn delete_phase_cache(&self, ein: &str, phase: &str) -> Result<()> {
        sqlx::query("DELETE FROM phase_cache WHERE charity_ein = ?1 AND phase = ?2")
            .bind(ein)
            .bind(phase)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === maintenance ===

    /// Delete all pipeline data for a charity (fresh reprocessing). The
    /// `charities` row itself is kept.
    pub async fn clean_charity(&self, ein: &str) -> Result<Vec<(String, u64)>> {
        let tables = [
            "raw_scraped_data",
            "charity_data",
            "evaluations",
            "citations",
            "phase_cache",
            "pdf_documents",
        ];
        let mut deleted = Vec::new();
        for table in tables {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE charity_ein = ?1"))
                .bind(ein)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() > 0 {
                deleted.push((table.to_string(), result.rows_affected()));
            }
        }
        Ok(deleted)
    }

    // === versioned-store surface ===

    /// Record a durable snapshot point and return its hash. Serialized by the
    /// single writer connection; callers additionally serialize checkpoints
    /// globally.
    pub async fn commit(&self, message: &str) -> Result<String> {
        let now = Utc::now();
        let seq_row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM commits")
            .fetch_one(&self.pool)
            .await?;
        let seq: i64 = seq_row.get("seq");

        let mut hasher = Sha256::new();
        hasher.update((seq + 1).to_le_bytes());
        hasher.update(now.to_rfc3339().as_bytes());
        hasher.update(message.as_bytes());
        let hash = hex::encode(hasher.finalize());

        sqlx::query("INSERT INTO commits (hash, message, created_at) VALUES (?1, ?2, ?3)")
            .bind(&hash)
            .bind(message)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        info!(hash = %&hash[..12], message, "commit");
        Ok(hash)
    }

    pub async fn latest_commit(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT hash FROM commits ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    pub async fn tag(&self, name: &str, message: &str, ref_hash: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO tags (name, message, ref_hash) VALUES (?1, ?2, ?3)
               ON CONFLICT (name) DO UPDATE SET
                   message = excluded.message, ref_hash = excluded.ref_hash"#,
        )
        .bind(name)
        .bind(message)
        .bind(ref_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| PipelineError::Storage(format!("bad timestamp {raw}: {e}")))?
        .with_timezone(&Utc))
}

fn raw_record_from_row(r: sqlx::sqlite::SqliteRow) -> Result<RawRecord> {
    let parsed: Option<String> = r.get("parsed_payload");
    Ok(RawRecord {
        charity_ein: r.get("charity_ein"),
        source: r.get("source"),
        raw_payload: r.get("raw_payload"),
        parsed_payload: parsed.map(|s| serde_json::from_str(&s)).transpose()?,
        success: r.get("success"),
        error_message: r.get("error_message"),
        retry_count: r.get::<i64, _>("retry_count") as u32,
        scraped_at: parse_ts(r.get::<String, _>("scraped_at").as_str())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> Store {
        let s = Store::in_memory().await.unwrap();
        s.run_migrations().await.unwrap();
        s
    }

    #[tokio::test]
    async fn charity_upsert_keeps_existing_website() {
        let s = store().await;
        s.upsert_charity(&Charity {
            ein: "12-3456789".into(),
            name: "Example".into(),
            website: Some("https://example.org".into()),
        })
        .await
        .unwrap();
        s.upsert_charity(&Charity {
            ein: "12-3456789".into(),
            name: "Example".into(),
            website: None,
        })
        .await
        .unwrap();
        let got = s.get_charity("12-3456789").await.unwrap().unwrap();
        assert_eq!(got.website.as_deref(), Some("https://example.org"));
    }

    #[tokio::test]
    async fn retry_count_increments_across_failures() {
        let s = store().await;
        for expected in 1..=3u32 {
            let n = s
                .increment_retry("12-3456789", "propublica", "HTTP 503")
                .await
                .unwrap();
            assert_eq!(n, expected);
        }
        let row = s.get_raw("12-3456789", "propublica").await.unwrap().unwrap();
        assert!(!row.success);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.error_message.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn raw_record_round_trips_parsed_payload() {
        let s = store().await;
        let record = RawRecord {
            charity_ein: "12-3456789".into(),
            source: "propublica".into(),
            raw_payload: Some("{\"organization\": {}}".into()),
            parsed_payload: Some(json!({"propublica_990": {"ein": "12-3456789"}})),
            success: true,
            error_message: None,
            retry_count: 0,
            scraped_at: Utc::now(),
        };
        s.upsert_raw(&record).await.unwrap();
        let got = s.get_raw("12-3456789", "propublica").await.unwrap().unwrap();
        assert!(got.success);
        assert_eq!(got.parsed_payload.unwrap()["propublica_990"]["ein"], "12-3456789");
    }

    #[tokio::test]
    async fn phase_cache_delete_removes_entry() {
        let s = store().await;
        s.upsert_phase_cache(&PhaseCacheEntry {
            charity_ein: "12-3456789".into(),
            phase: "crawl".into(),
            fingerprint: "abc".into(),
            ran_at: Utc::now(),
            cost_usd: 0.0,
        })
        .await
        .unwrap();
        assert!(s.get_phase_cache("12-3456789", "crawl").await.unwrap().is_some());
        s.delete_phase_cache("12-3456789", "crawl").await.unwrap();
        assert!(s.get_phase_cache("12-3456789", "crawl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commits_chain_and_tags_resolve() {
        let s = store().await;
        let h1 = s.commit("checkpoint: 5 charities").await.unwrap();
        let h2 = s.commit("checkpoint: 10 charities").await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(s.latest_commit().await.unwrap().unwrap(), h2);
        s.tag("run-2026-08", "pilot run", &h2).await.unwrap();
    }

    #[tokio::test]
    async fn clean_charity_leaves_charities_row() {
        let s = store().await;
        s.upsert_charity(&Charity {
            ein: "12-3456789".into(),
            name: "Example".into(),
            website: None,
        })
        .await
        .unwrap();
        s.increment_retry("12-3456789", "bbb", "HTTP 503").await.unwrap();
        let deleted = s.clean_charity("12-3456789").await.unwrap();
        assert_eq!(deleted, vec![("raw_scraped_data".to_string(), 1)]);
        assert!(s.get_charity("12-3456789").await.unwrap().is_some());
    }
}
