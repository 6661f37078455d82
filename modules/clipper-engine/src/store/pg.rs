//! Postgres article store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use clipper_common::{Article, Classification, ExtractionRule, Source};

use crate::traits::ArticleStore;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Idempotent; run once at startup.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_init.sql"))
            .execute(pool)
            .await?;
        Ok(())
    }
}

// Row types decouple the wire schema from the domain structs: Postgres has
// no unsigned integers and stores the learned config as JSONB.

#[derive(FromRow)]
struct SourceRow {
    id: Uuid,
    url: String,
    name: String,
    priority: i32,
    active: bool,
    consecutive_failures: i32,
    last_scraped: Option<DateTime<Utc>>,
    last_successful_scrape: Option<DateTime<Utc>>,
    scraping_config: Option<Json<ExtractionRule>>,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            id: row.id,
            url: row.url,
            name: row.name,
            priority: row.priority,
            active: row.active,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            last_scraped: row.last_scraped,
            last_successful_scrape: row.last_successful_scrape,
            scraping_config: row.scraping_config.map(|j| j.0),
        }
    }
}

#[derive(FromRow)]
struct ArticleRow {
    id: Uuid,
    source_id: Uuid,
    title: String,
    content: String,
    url: String,
    author: Option<String>,
    published_at: Option<DateTime<Utc>>,
    scraped_at: DateTime<Utc>,
    classification: Option<Json<Classification>>,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article {
            id: row.id,
            source_id: row.source_id,
            title: row.title,
            content: row.content,
            url: row.url,
            author: row.author,
            published_at: row.published_at,
            scraped_at: row.scraped_at,
            classification: row.classification.map(|j| j.0),
        }
    }
}

#[async_trait]
impl ArticleStore for PgStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleRow>(
            "SELECT * FROM articles WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert(&self, article: &Article) -> Result<Option<Uuid>> {
        // The UNIQUE constraint on url arbitrates concurrent inserts; a
        // conflict returns no row and the caller treats it as a duplicate.
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO articles
                (id, source_id, title, content, url, author, published_at,
                 scraped_at, classification)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(article.id)
        .bind(article.source_id)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.url)
        .bind(&article.author)
        .bind(article.published_at)
        .bind(article.scraped_at)
        .bind(article.classification.as_ref().map(Json))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleRow>(
            "SELECT * FROM articles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update_classification(
        &self,
        id: Uuid,
        classification: &Classification,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE articles SET classification = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Json(classification))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("article {id} not found");
        }
        Ok(())
    }

    async fn active_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>(
            "SELECT * FROM sources WHERE active ORDER BY priority DESC, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_source_health(&self, source_id: Uuid, success: bool) -> Result<()> {
        // Single statement so a run aborted mid-update never leaves the
        // failure counter and timestamps disagreeing.
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                last_scraped = NOW(),
                consecutive_failures = CASE WHEN $2 THEN 0
                                            ELSE consecutive_failures + 1 END,
                last_successful_scrape = CASE WHEN $2 THEN NOW()
                                              ELSE last_successful_scrape END
            WHERE id = $1
            "#,
        )
        .bind(source_id)
        .bind(success)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("source {source_id} not found");
        }
        Ok(())
    }

    async fn save_scraping_config(&self, source_id: Uuid, rule: &ExtractionRule) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sources SET scraping_config = $2 WHERE id = $1",
        )
        .bind(source_id)
        .bind(Json(rule))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("source {source_id} not found");
        }
        Ok(())
    }
}
