//! Installation credential models.
//!
//! One row per upstream installation. Tokens are ciphertext produced by
//! [`crate::crypto::CredentialCipher`]; metadata is a typed document stored
//! as JSON and validated before every write.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::db::VaultError;
use crate::github::webhook::WebhookRepository;
use crate::github::{Account, RepositorySelection};

/// Credential provider discriminator. Only GitHub exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "github" => Some(Provider::GitHub),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage timestamp format: RFC 3339, UTC, microsecond precision.
///
/// Fixed width, so lexical order in SQL matches chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Last repository selection change recorded for an installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryChange {
    pub action: String,
    #[serde(default)]
    pub repositories_added: Vec<WebhookRepository>,
    #[serde(default)]
    pub repositories_removed: Vec<WebhookRepository>,
    pub added_count: usize,
    pub removed_count: usize,
    pub changed_at: DateTime<Utc>,
}

impl RepositoryChange {
    pub fn new(
        action: &str,
        added: Vec<WebhookRepository>,
        removed: Vec<WebhookRepository>,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action: action.to_string(),
            added_count: added.len(),
            removed_count: removed.len(),
            repositories_added: added,
            repositories_removed: removed,
            changed_at,
        }
    }
}

/// Facts the service records about an installation, merged into one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
    #[serde(default)]
    pub permissions: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_selection: Option<RepositorySelection>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsuspended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_change: Option<RepositoryChange>,
    /// Repositories the installation can reach, as last known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<WebhookRepository>,
}

/// A single update to [`InstallationMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFact {
    /// Account and grant as reported by the upstream installation.
    Grant {
        account: Account,
        permissions: BTreeMap<String, String>,
        events: Vec<String>,
        repository_selection: RepositorySelection,
    },
    Suspension {
        suspended: bool,
        at: DateTime<Utc>,
    },
    /// Full repository listing, replacing whatever was known.
    Repositories(Vec<WebhookRepository>),
    RepositoryChange(RepositoryChange),
}

impl InstallationMetadata {
    /// Merge a fact. Returns whether anything changed.
    ///
    /// Repeating a suspension transition keeps the first timestamp.
    pub fn apply(&mut self, fact: MetadataFact) -> bool {
        match fact {
            MetadataFact::Grant {
                account,
                permissions,
                events,
                repository_selection,
            } => {
                let before = self.clone();
                self.account = Some(account);
                self.permissions = permissions;
                self.events = events;
                self.repository_selection = Some(repository_selection);
                *self != before
            }
            MetadataFact::Suspension { suspended: true, at } => {
                if self.suspended {
                    return false;
                }
                self.suspended = true;
                self.suspended_at = Some(at);
                true
            }
            MetadataFact::Suspension { suspended: false, at } => {
                if !self.suspended && self.unsuspended_at.is_some() {
                    return false;
                }
                self.suspended = false;
                self.unsuspended_at = Some(at);
                true
            }
            MetadataFact::Repositories(repositories) => {
                let changed = self.repositories != repositories;
                self.repositories = repositories;
                changed
            }
            MetadataFact::RepositoryChange(change) => {
                let before = self.clone();
                self.repositories
                    .retain(|repo| !change.repositories_removed.iter().any(|r| r.id == repo.id));
                for added in &change.repositories_added {
                    if !self.repositories.iter().any(|repo| repo.id == added.id) {
                        self.repositories.push(added.clone());
                    }
                }
                self.repository_change = Some(change);
                *self != before
            }
        }
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.suspended && self.suspended_at.is_none() {
            return Err(VaultError::InvalidMetadata(
                "suspended installation must carry suspended_at".to_string(),
            ));
        }

        if let Some(change) = &self.repository_change {
            if change.added_count != change.repositories_added.len() {
                return Err(VaultError::InvalidMetadata(format!(
                    "added_count {} does not match {} added repositories",
                    change.added_count,
                    change.repositories_added.len()
                )));
            }
            if change.removed_count != change.repositories_removed.len() {
                return Err(VaultError::InvalidMetadata(format!(
                    "removed_count {} does not match {} removed repositories",
                    change.removed_count,
                    change.repositories_removed.len()
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn to_json(&self) -> Result<String, VaultError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| VaultError::InvalidMetadata(e.to_string()))
    }
}

/// Raw `integration_installations` row.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct InstallationRow {
    pub id: String,
    pub organization_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored installation credential. Tokens are still encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationCredential {
    pub id: String,
    pub organization_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub metadata: InstallationMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<InstallationRow> for InstallationCredential {
    type Error = VaultError;

    fn try_from(row: InstallationRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| VaultError::CorruptRow {
            id: row.id.clone(),
            reason,
        };

        let provider = Provider::from_str(&row.provider)
            .ok_or_else(|| corrupt(format!("unknown provider '{}'", row.provider)))?;
        let metadata: InstallationMetadata = serde_json::from_str(&row.metadata)
            .map_err(|e| corrupt(format!("metadata: {}", e)))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| corrupt(format!("created_at: {}", e)))?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| corrupt(format!("updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            provider,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            metadata,
            created_at,
            updated_at,
        })
    }
}

/// Payload for [`crate::db::CredentialVault::create`].
#[derive(Debug, Clone)]
pub struct NewInstallationCredential {
    pub id: String,
    pub organization_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub metadata: InstallationMetadata,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub metadata: Option<InstallationMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::AccountType;
    use chrono::Duration;

    fn repo(id: u64, name: &str) -> WebhookRepository {
        WebhookRepository {
            id,
            name: name.to_string(),
            full_name: format!("acme/{}", name),
            private: false,
        }
    }

    #[test]
    fn test_provider_roundtrip() {
        assert_eq!(Provider::from_str("GitHub"), Some(Provider::GitHub));
        assert_eq!(Provider::GitHub.to_string(), "github");
        assert_eq!(Provider::from_str("gitlab"), None);
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let whole = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(whole), "2024-05-01T10:00:00.000000Z");
        assert!(format_timestamp(whole) < format_timestamp(whole + Duration::microseconds(1)));
    }

    #[test]
    fn test_suspension_transitions_are_idempotent() {
        let first = Utc::now();
        let later = first + Duration::minutes(5);
        let mut metadata = InstallationMetadata::default();

        assert!(metadata.apply(MetadataFact::Suspension { suspended: true, at: first }));
        assert!(!metadata.apply(MetadataFact::Suspension { suspended: true, at: later }));
        assert_eq!(metadata.suspended_at, Some(first));

        assert!(metadata.apply(MetadataFact::Suspension { suspended: false, at: later }));
        assert!(!metadata.apply(MetadataFact::Suspension { suspended: false, at: later }));
        assert!(!metadata.suspended);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_grant_replaces_account_facts() {
        let mut metadata = InstallationMetadata::default();
        let grant = MetadataFact::Grant {
            account: Account {
                login: "acme".to_string(),
                id: 9,
                account_type: AccountType::Organization,
            },
            permissions: BTreeMap::from([("issues".to_string(), "read".to_string())]),
            events: vec!["issues".to_string()],
            repository_selection: RepositorySelection::Selected,
        };

        assert!(metadata.apply(grant.clone()));
        assert!(!metadata.apply(grant));
        assert_eq!(metadata.repository_selection, Some(RepositorySelection::Selected));
    }

    #[test]
    fn test_validate_rejects_inconsistent_documents() {
        let suspended = InstallationMetadata {
            suspended: true,
            ..Default::default()
        };
        assert!(matches!(suspended.validate(), Err(VaultError::InvalidMetadata(_))));

        let mut change = RepositoryChange::new("added", vec![repo(1, "api")], vec![], Utc::now());
        change.added_count = 2;
        let miscounted = InstallationMetadata {
            repository_change: Some(change),
            ..Default::default()
        };
        assert!(matches!(miscounted.validate(), Err(VaultError::InvalidMetadata(_))));
    }

    #[test]
    fn test_repository_changes_maintain_listing() {
        let mut metadata = InstallationMetadata::default();
        assert!(metadata.apply(MetadataFact::Repositories(vec![repo(1, "api"), repo(2, "web")])));

        let change = RepositoryChange::new(
            "added",
            vec![repo(3, "docs"), repo(2, "web")],
            vec![repo(1, "api")],
            Utc::now(),
        );
        assert!(metadata.apply(MetadataFact::RepositoryChange(change.clone())));
        assert!(!metadata.apply(MetadataFact::RepositoryChange(change)));

        let ids: Vec<u64> = metadata.repositories.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_repository_change_counts_match_lists() {
        let change = RepositoryChange::new(
            "removed",
            vec![],
            vec![repo(1, "api"), repo(2, "web")],
            Utc::now(),
        );
        assert_eq!(change.added_count, 0);
        assert_eq!(change.removed_count, 2);
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let row = InstallationRow {
            id: "42".to_string(),
            organization_id: "org-1".to_string(),
            provider: "github".to_string(),
            access_token: "ENC:abc".to_string(),
            refresh_token: None,
            metadata: "not json".to_string(),
            created_at: now_timestamp(),
            updated_at: now_timestamp(),
        };

        let err = InstallationCredential::try_from(row).unwrap_err();
        assert!(matches!(err, VaultError::CorruptRow { ref id, .. } if id == "42"));
    }

    #[test]
    fn test_metadata_document_shape() {
        let metadata = InstallationMetadata {
            suspended: true,
            suspended_at: Some(Utc::now()),
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&metadata.to_json().unwrap()).unwrap();

        assert_eq!(json["suspended"], true);
        assert!(json.get("account").is_none());
        assert!(json.get("repository_change").is_none());
    }
}
