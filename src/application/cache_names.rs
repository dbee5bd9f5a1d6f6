use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::application::repos::{CacheNameRepo, RepoError};
use crate::domain::cache_name::{CacheNameRecord, validate_segment};
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum CacheNameError {
    #[error("cache name `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl CacheNameError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheNameError::NotFound(_))
    }
}

/// Metadata records for cache names.
#[derive(Clone)]
pub struct CacheNameRegistry {
    repo: Arc<dyn CacheNameRepo>,
}

impl CacheNameRegistry {
    pub fn new(repo: Arc<dyn CacheNameRepo>) -> Self {
        Self { repo }
    }

    /// Create or revive `cache_name`.
    pub async fn create(
        &self,
        cache_name: &str,
        description: Option<String>,
    ) -> Result<CacheNameRecord, CacheNameError> {
        validate_segment("cacheName", cache_name)?;
        let revived = self
            .repo
            .find(cache_name)
            .await?
            .is_some_and(|record| !record.is_live());

        let record = CacheNameRecord::new(cache_name, description);
        self.repo.upsert(&record).await?;
        info!(cache_name, revived, "Cache name created");
        Ok(record)
    }

    pub async fn update(
        &self,
        cache_name: &str,
        description: Option<String>,
    ) -> Result<CacheNameRecord, CacheNameError> {
        let mut record = self.get(cache_name).await?;
        record.description = description;
        record.updated_at = OffsetDateTime::now_utc();
        self.repo.upsert(&record).await?;
        info!(cache_name, "Cache name updated");
        Ok(record)
    }

    pub async fn get(&self, cache_name: &str) -> Result<CacheNameRecord, CacheNameError> {
        self.repo
            .find(cache_name)
            .await?
            .filter(CacheNameRecord::is_live)
            .ok_or_else(|| CacheNameError::NotFound(cache_name.to_string()))
    }

    pub async fn exists(&self, cache_name: &str) -> Result<bool, CacheNameError> {
        match self.get(cache_name).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Mark the record deleted. Entries under the name are untouched.
    pub async fn delete(&self, cache_name: &str) -> Result<(), CacheNameError> {
        let mut record = self.get(cache_name).await?;
        record.deleted = true;
        record.updated_at = OffsetDateTime::now_utc();
        self.repo.upsert(&record).await?;
        info!(cache_name, "Cache name deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryRepositories;

    fn registry() -> CacheNameRegistry {
        CacheNameRegistry::new(Arc::new(MemoryRepositories::new()))
    }

    #[tokio::test]
    async fn lifecycle_follows_liveness() {
        let registry = registry();

        assert!(registry.get("sessions").await.expect_err("absent").is_not_found());
        assert!(
            registry
                .update("sessions", None)
                .await
                .expect_err("absent")
                .is_not_found()
        );

        registry
            .create("sessions", Some("user sessions".to_string()))
            .await
            .expect("create");
        let updated = registry
            .update("sessions", Some("login sessions".to_string()))
            .await
            .expect("update");
        assert_eq!(updated.description.as_deref(), Some("login sessions"));

        registry.delete("sessions").await.expect("delete");
        assert!(!registry.exists("sessions").await.expect("exists"));
        assert!(registry.delete("sessions").await.expect_err("deleted").is_not_found());
    }

    #[tokio::test]
    async fn create_revives_deleted_name() {
        let registry = registry();
        registry.create("sessions", None).await.expect("create");
        registry.delete("sessions").await.expect("delete");

        registry
            .create("sessions", Some("again".to_string()))
            .await
            .expect("revive");
        let record = registry.get("sessions").await.expect("get");
        assert_eq!(record.description.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let err = registry().create(" ", None).await.expect_err("blank");
        assert!(matches!(err, CacheNameError::Domain(_)));
    }
}
