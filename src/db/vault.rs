//! Persistence for installation credentials.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{
    format_timestamp, CredentialUpdate, InstallationCredential, InstallationMetadata,
    InstallationRow, NewInstallationCredential, Provider,
};
use super::DbPool;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("installation {0} not found")]
    NotFound(String),

    #[error("invalid installation metadata: {0}")]
    InvalidMetadata(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt installation row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

fn into_credential(row: InstallationRow) -> Result<InstallationCredential, VaultError> {
    InstallationCredential::try_from(row)
}

/// CRUD over `integration_installations`.
///
/// Every method acquires a pooled connection per statement; the only
/// multi-statement operation, [`CredentialVault::modify_metadata`], runs in a
/// transaction.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    pool: DbPool,
}

impl CredentialVault {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a credential, or update tokens and metadata of an existing row
    /// with the same id. `organization_id`, `provider` and `created_at` are
    /// kept on conflict.
    pub async fn create(
        &self,
        data: NewInstallationCredential,
    ) -> Result<InstallationCredential, VaultError> {
        self.create_at(data, Utc::now()).await
    }

    pub(crate) async fn create_at(
        &self,
        data: NewInstallationCredential,
        now: DateTime<Utc>,
    ) -> Result<InstallationCredential, VaultError> {
        let metadata = data.metadata.to_json()?;
        let now = format_timestamp(now);

        let row = sqlx::query_as::<_, InstallationRow>(
            r#"
            INSERT INTO integration_installations (
                id, organization_id, provider, access_token, refresh_token,
                metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&data.id)
        .bind(&data.organization_id)
        .bind(data.provider.as_str())
        .bind(&data.access_token)
        .bind(&data.refresh_token)
        .bind(&metadata)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        into_credential(row)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<InstallationCredential>, VaultError> {
        sqlx::query_as::<_, InstallationRow>("SELECT * FROM integration_installations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(into_credential)
            .transpose()
    }

    /// All installations of a tenant, most recently updated first.
    pub async fn find_by_organization_id(
        &self,
        organization_id: &str,
    ) -> Result<Vec<InstallationCredential>, VaultError> {
        sqlx::query_as::<_, InstallationRow>(
            "SELECT * FROM integration_installations WHERE organization_id = ? ORDER BY updated_at DESC, created_at DESC",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(into_credential)
        .collect()
    }

    pub async fn find_latest_by_provider(
        &self,
        provider: Provider,
    ) -> Result<Option<InstallationCredential>, VaultError> {
        sqlx::query_as::<_, InstallationRow>(
            "SELECT * FROM integration_installations WHERE provider = ? ORDER BY updated_at DESC, created_at DESC LIMIT 1",
        )
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(into_credential)
        .transpose()
    }

    /// Update the supplied fields and `updated_at`.
    pub async fn update(
        &self,
        id: &str,
        changes: CredentialUpdate,
    ) -> Result<InstallationCredential, VaultError> {
        let metadata = changes
            .metadata
            .as_ref()
            .map(InstallationMetadata::to_json)
            .transpose()?;

        let row = sqlx::query_as::<_, InstallationRow>(
            r#"
            UPDATE integration_installations SET
                access_token = COALESCE(?, access_token),
                refresh_token = COALESCE(?, refresh_token),
                metadata = COALESCE(?, metadata),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&changes.access_token)
        .bind(&changes.refresh_token)
        .bind(&metadata)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => into_credential(row),
            None => Err(VaultError::NotFound(id.to_string())),
        }
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, VaultError> {
        let result = sqlx::query("DELETE FROM integration_installations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Read-modify-write of the metadata document in one transaction.
    ///
    /// `modify` reports whether it changed anything; when it did not, nothing
    /// is written and the stored row is returned as is. Returns `None` when
    /// the row does not exist. The transaction rolls back on every early
    /// return, including a failed validation.
    pub async fn modify_metadata<F>(
        &self,
        id: &str,
        modify: F,
    ) -> Result<Option<InstallationCredential>, VaultError>
    where
        F: FnOnce(&mut InstallationMetadata) -> bool,
    {
        // Take the write lock before reading so concurrent writers queue on
        // busy_timeout instead of failing to upgrade a read snapshot
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row = sqlx::query_as::<_, InstallationRow>(
            "SELECT * FROM integration_installations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let current = into_credential(row)?;
        let mut metadata = current.metadata.clone();
        if !modify(&mut metadata) {
            return Ok(Some(current));
        }
        let metadata = metadata.to_json()?;

        let row = sqlx::query_as::<_, InstallationRow>(
            "UPDATE integration_installations SET metadata = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(&metadata)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        into_credential(row).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::test_pool;
    use chrono::Duration;

    fn new_credential(id: &str, organization_id: &str) -> NewInstallationCredential {
        NewInstallationCredential {
            id: id.to_string(),
            organization_id: organization_id.to_string(),
            provider: Provider::GitHub,
            access_token: "ENC:access".to_string(),
            refresh_token: None,
            metadata: InstallationMetadata::default(),
        }
    }

    async fn vault() -> CredentialVault {
        CredentialVault::new(test_pool().await)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let vault = vault().await;
        let created = vault.create(new_credential("42", "org-1")).await.unwrap();

        assert_eq!(created.id, "42");
        assert_eq!(created.provider, Provider::GitHub);
        assert_eq!(created.created_at, created.updated_at);

        let found = vault.find_by_id("42").await.unwrap().unwrap();
        assert_eq!(found, created);
        assert!(vault.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_existing_id_updates_in_place() {
        let vault = vault().await;
        let first = vault.create(new_credential("42", "org-1")).await.unwrap();

        let mut again = new_credential("42", "org-2");
        again.access_token = "ENC:rotated".to_string();
        again.refresh_token = Some("ENC:refresh".to_string());
        again.metadata.events = vec!["issues".to_string()];
        let second = vault
            .create_at(again, first.created_at + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(second.organization_id, "org-1");
        assert_eq!(second.access_token, "ENC:rotated");
        assert_eq!(second.refresh_token.as_deref(), Some("ENC:refresh"));
        assert_eq!(second.metadata.events, vec!["issues"]);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM integration_installations")
            .fetch_one(&vault.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_metadata() {
        let vault = vault().await;
        let mut data = new_credential("42", "org-1");
        data.metadata.suspended = true;

        let err = vault.create(data).await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidMetadata(_)));
        assert!(vault.find_by_id("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_organization_orders_newest_updated_first() {
        let vault = vault().await;
        let base = Utc::now();
        vault.create_at(new_credential("1", "org-1"), base).await.unwrap();
        vault
            .create_at(new_credential("2", "org-1"), base + Duration::seconds(1))
            .await
            .unwrap();
        vault
            .create_at(new_credential("3", "org-2"), base + Duration::seconds(2))
            .await
            .unwrap();

        let ids: Vec<String> = vault
            .find_by_organization_id("org-1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["2", "1"]);

        // Touching the older row moves it to the front
        vault
            .update(
                "1",
                CredentialUpdate {
                    access_token: Some("ENC:new".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = &vault.find_by_organization_id("org-1").await.unwrap()[0];
        assert_eq!(first.id, "1");

        assert!(vault.find_by_organization_id("org-3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_latest_by_provider() {
        let vault = vault().await;
        assert!(vault.find_latest_by_provider(Provider::GitHub).await.unwrap().is_none());

        let base = Utc::now();
        vault.create_at(new_credential("1", "org-1"), base).await.unwrap();
        vault
            .create_at(new_credential("2", "org-2"), base + Duration::seconds(1))
            .await
            .unwrap();

        let latest = vault.find_latest_by_provider(Provider::GitHub).await.unwrap().unwrap();
        assert_eq!(latest.id, "2");
    }

    #[tokio::test]
    async fn test_update_only_touches_supplied_fields() {
        let vault = vault().await;
        let mut data = new_credential("42", "org-1");
        data.refresh_token = Some("ENC:refresh".to_string());
        let created = vault.create(data).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = vault
            .update(
                "42",
                CredentialUpdate {
                    access_token: Some("ENC:rotated".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.access_token, "ENC:rotated");
        assert_eq!(updated.refresh_token.as_deref(), Some("ENC:refresh"));
        assert_eq!(updated.metadata, created.metadata);
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let vault = vault().await;
        let err = vault.update("missing", CredentialUpdate::default()).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let vault = vault().await;
        vault.create(new_credential("42", "org-1")).await.unwrap();

        assert!(vault.delete("42").await.unwrap());
        assert!(!vault.delete("42").await.unwrap());
        assert!(vault.find_by_id("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modify_metadata() {
        let vault = vault().await;
        vault.create(new_credential("42", "org-1")).await.unwrap();

        let updated = vault
            .modify_metadata("42", |m| {
                m.events.push("deployment".to_string());
                true
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.metadata.events, vec!["deployment"]);

        let missing = vault.modify_metadata("missing", |_| true).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_modify_metadata_without_change_skips_write() {
        let vault = vault().await;
        let created = vault.create(new_credential("42", "org-1")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let unchanged = vault
            .modify_metadata("42", |m| {
                m.events.push("ignored".to_string());
                false
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(unchanged, created);
        assert_eq!(vault.find_by_id("42").await.unwrap().unwrap(), created);
    }

    #[tokio::test]
    async fn test_modify_metadata_rolls_back_invalid_document() {
        let vault = vault().await;
        vault.create(new_credential("42", "org-1")).await.unwrap();

        let err = vault
            .modify_metadata("42", |m| {
                m.suspended = true;
                true
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidMetadata(_)));

        // The single pooled connection is usable again and the row is untouched
        let row = vault.find_by_id("42").await.unwrap().unwrap();
        assert!(!row.metadata.suspended);
    }

    #[tokio::test]
    async fn test_concurrent_metadata_writers_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("vault.db").display()),
            max_connections: 4,
        };
        let vault = CredentialVault::new(crate::db::init(&config).await.unwrap());
        vault.create(new_credential("42", "org-1")).await.unwrap();

        let writers = (0..8).map(|i| {
            let vault = vault.clone();
            tokio::spawn(async move {
                vault
                    .modify_metadata("42", |m| {
                        m.events.push(format!("event-{}", i));
                        true
                    })
                    .await
            })
        });
        for result in futures::future::join_all(writers).await {
            assert!(result.unwrap().unwrap().is_some());
        }

        let mut events = vault.find_by_id("42").await.unwrap().unwrap().metadata.events;
        events.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("event-{}", i)).collect();
        assert_eq!(events, expected);
    }
}
