//! In-memory article store.
//!
//! A single mutex over all state makes check-then-insert atomic relative to
//! concurrent writers, which is exactly the dedup contract the orchestrator
//! relies on.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use clipper_common::{Article, Classification, ExtractionRule, Source};

use crate::traits::ArticleStore;

#[derive(Default)]
struct Inner {
    articles: HashMap<Uuid, Article>,
    by_url: HashMap<String, Uuid>,
    sources: HashMap<Uuid, Source>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, source: Source) {
        self.inner
            .lock()
            .expect("store poisoned")
            .sources
            .insert(source.id, source);
    }

    pub fn source(&self, id: Uuid) -> Option<Source> {
        self.inner.lock().expect("store poisoned").sources.get(&id).cloned()
    }

    pub fn article_count(&self) -> usize {
        self.inner.lock().expect("store poisoned").articles.len()
    }

    pub fn articles(&self) -> Vec<Article> {
        self.inner
            .lock()
            .expect("store poisoned")
            .articles
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<Article>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .by_url
            .get(url)
            .and_then(|id| inner.articles.get(id))
            .cloned())
    }

    async fn insert(&self, article: &Article) -> Result<Option<Uuid>> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if inner.by_url.contains_key(&article.url) {
            return Ok(None);
        }
        inner.by_url.insert(article.url.clone(), article.id);
        inner.articles.insert(article.id, article.clone());
        Ok(Some(article.id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Article>> {
        Ok(self.inner.lock().expect("store poisoned").articles.get(&id).cloned())
    }

    async fn update_classification(
        &self,
        id: Uuid,
        classification: &Classification,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("article {id} not found"))?;
        article.classification = Some(classification.clone());
        Ok(())
    }

    async fn active_sources(&self) -> Result<Vec<Source>> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut sources: Vec<Source> = inner
            .sources
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(sources)
    }

    async fn update_source_health(&self, source_id: Uuid, success: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let source = inner
            .sources
            .get_mut(&source_id)
            .ok_or_else(|| anyhow::anyhow!("source {source_id} not found"))?;
        let now = Utc::now();
        source.last_scraped = Some(now);
        if success {
            source.consecutive_failures = 0;
            source.last_successful_scrape = Some(now);
        } else {
            source.consecutive_failures += 1;
        }
        Ok(())
    }

    async fn save_scraping_config(&self, source_id: Uuid, rule: &ExtractionRule) -> Result<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let source = inner
            .sources
            .get_mut(&source_id)
            .ok_or_else(|| anyhow::anyhow!("source {source_id} not found"))?;
        source.scraping_config = Some(rule.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn article(url: &str) -> Article {
        Article {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            title: "Title".to_string(),
            content: "Content".to_string(),
            url: url.to_string(),
            author: None,
            published_at: None,
            scraped_at: Utc::now(),
            classification: None,
        }
    }

    #[tokio::test]
    async fn insert_dedupes_by_url() {
        let store = MemoryStore::new();
        let first = article("https://a.com/x");
        let second = article("https://a.com/x");
        assert!(store.insert(&first).await.unwrap().is_some());
        assert!(store.insert(&second).await.unwrap().is_none());
        assert_eq!(store.article_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_of_same_url_yield_one_row() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert(&article("https://a.com/race")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.article_count(), 1);
    }

    #[tokio::test]
    async fn health_update_resets_and_increments() {
        let store = MemoryStore::new();
        let source = Source::new("https://site.com", "Site");
        let id = source.id;
        store.add_source(source);

        store.update_source_health(id, false).await.unwrap();
        store.update_source_health(id, false).await.unwrap();
        assert_eq!(store.source(id).unwrap().consecutive_failures, 2);
        assert!(store.source(id).unwrap().last_successful_scrape.is_none());

        store.update_source_health(id, true).await.unwrap();
        let s = store.source(id).unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_successful_scrape.is_some());
    }

    #[tokio::test]
    async fn active_sources_ordered_by_priority() {
        let store = MemoryStore::new();
        let mut low = Source::new("https://low.com", "Low");
        low.priority = 1;
        let mut high = Source::new("https://high.com", "High");
        high.priority = 9;
        let mut inactive = Source::new("https://off.com", "Off");
        inactive.active = false;
        inactive.priority = 100;
        store.add_source(low);
        store.add_source(high);
        store.add_source(inactive);

        let sources = store.active_sources().await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "High");
    }
}
