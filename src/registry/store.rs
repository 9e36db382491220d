use crate::prelude::*;
use chrono::{DateTime, Utc};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherType {
    User,
    TrustedPublisher,
}

impl Display for PublisherType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublisherType::User => write!(f, "user"),
            PublisherType::TrustedPublisher => write!(f, "trusted_publisher"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Active,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherRecord {
    pub publisher_id: String,
    pub publisher_type: PublisherType,
    pub is_owner: bool,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_workflow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub filename: String,
    /// 64 lowercase hex characters.
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
    /// Where the bytes actually live; the registry never stores them.
    pub external_url: String,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<DateTime<Utc>>,
    pub url_status: UrlStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointRecord {
    pub entry_point_type: String,
    pub name: String,
    pub module: String,
    pub attr: String,
}

/// A published version. Immutable after creation except the yank fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub game: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_ap_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_ap_version: Option<String>,
    pub pure_python: bool,
    pub published_at: DateTime<Utc>,
    pub yanked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yank_reason: Option<String>,
    pub distributions: Vec<DistributionRecord>,
    pub entry_points: Vec<EntryPointRecord>,
}

/// One registered package with everything it owns. Stored as a single sled
/// value, so every mutation of a package is one atomic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub authors: Vec<AuthorRecord>,
    pub keywords: Vec<String>,
    pub publishers: Vec<PublisherRecord>,
    pub versions: BTreeMap<String, VersionRecord>,
}

impl PackageRecord {
    /// Newest non-yanked version by publication time.
    pub fn latest_version(&self) -> Option<&VersionRecord> {
        self.versions
            .values()
            .filter(|v| !v.yanked)
            .max_by_key(|v| v.published_at)
    }

    /// Versions newest-first.
    pub fn versions_by_recency(&self) -> Vec<&VersionRecord> {
        let mut versions: Vec<&VersionRecord> = self.versions.values().collect();
        versions.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        versions
    }

    pub fn owners(&self) -> impl Iterator<Item = &PublisherRecord> {
        self.publishers.iter().filter(|p| p.is_owner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// SHA-256 hex of the plaintext; the plaintext is never stored.
    pub token_hash: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Comma-separated scope list; "*" grants everything.
    pub scopes: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl TokenRecord {
    pub fn scope_list(&self) -> Vec<&str> {
        if self.scopes.is_empty() {
            vec!["upload"]
        } else {
            self.scopes.split(',').map(str::trim).collect()
        }
    }
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub package_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub action: String,
    pub actor_id: String,
    pub actor_type: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_workflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_commit: Option<String>,
}

/// The registry's persistence layer: one sled database with a tree per
/// record family, values stored as JSON.
pub struct RegistryStore {
    db: sled::Db,
    packages: sled::Tree,
    tokens: sled::Tree,
    audit: sled::Tree,
}

impl RegistryStore {
    pub fn open(path: &Path) -> Result<RegistryStore> {
        let db = sled::open(path)
            .with_context(|| format!("opening registry database {}", path.display()))?;
        RegistryStore::with_db(db)
    }

    /// In-memory store for tests; nothing touches disk.
    pub fn temporary() -> Result<RegistryStore> {
        RegistryStore::with_db(sled::Config::new().temporary(true).open()?)
    }

    fn with_db(db: sled::Db) -> Result<RegistryStore> {
        Ok(RegistryStore {
            packages: db.open_tree("packages")?,
            tokens: db.open_tree("tokens")?,
            audit: db.open_tree("audit")?,
            db,
        })
    }

    pub fn get_package(&self, name: &str) -> Result<Option<PackageRecord>> {
        match self.packages.get(name.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_package(&self, record: &PackageRecord) -> Result<()> {
        self.packages
            .insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// All packages, sorted by name (sled iterates in key order).
    pub fn list_packages(&self) -> Result<Vec<PackageRecord>> {
        let mut packages = Vec::new();
        for item in self.packages.iter() {
            let (_, raw) = item?;
            packages.push(serde_json::from_slice(&raw)?);
        }
        Ok(packages)
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn put_token(&self, record: &TokenRecord) -> Result<()> {
        self.tokens
            .insert(record.token_hash.as_bytes(), serde_json::to_vec(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_token(&self, token_hash: &str) -> Result<Option<TokenRecord>> {
        match self.tokens.get(token_hash.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn append_audit(&self, record: &AuditRecord) -> Result<u64> {
        let id = self.db.generate_id()?;
        self.audit
            .insert(id.to_be_bytes(), serde_json::to_vec(record)?)?;
        Ok(id)
    }

    pub fn audit_entries(&self, package_name: &str) -> Result<Vec<AuditRecord>> {
        let mut entries = Vec::new();
        for item in self.audit.iter() {
            let (_, raw) = item?;
            let record: AuditRecord = serde_json::from_slice(&raw)?;
            if record.package_name == package_name {
                entries.push(record);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn sample_version(version: &str, yanked: bool) -> VersionRecord {
        VersionRecord {
            version: version.into(),
            game: "My Game".into(),
            minimum_ap_version: Some("0.5.0".into()),
            maximum_ap_version: None,
            pure_python: true,
            published_at: Utc::now(),
            yanked,
            yank_reason: None,
            distributions: vec![DistributionRecord {
                filename: format!("my_game-{version}-py3-none-any.island"),
                sha256: "a".repeat(64),
                size: 123,
                platform_tag: "py3-none-any".into(),
                external_url: format!("https://host.example/my_game-{version}.island"),
                registered_at: Utc::now(),
                last_verified_at: None,
                url_status: UrlStatus::Active,
            }],
            entry_points: vec![EntryPointRecord {
                entry_point_type: "ap-island".into(),
                name: "my_game".into(),
                module: "my_game.world".into(),
                attr: "MyWorld".into(),
            }],
        }
    }

    pub fn sample_package(name: &str, versions: &[(&str, bool)]) -> PackageRecord {
        PackageRecord {
            name: name.into(),
            display_name: "My Game".into(),
            description: Some("A sample game world".into()),
            license: Some("MIT".into()),
            homepage: None,
            repository: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            authors: vec![AuthorRecord {
                name: "A. Author".into(),
                email: None,
            }],
            keywords: vec!["adventure".into()],
            publishers: vec![PublisherRecord {
                publisher_id: "user-1".into(),
                publisher_type: PublisherType::User,
                is_owner: true,
                added_at: Utc::now(),
                github_repository: None,
                github_workflow: None,
            }],
            versions: versions
                .iter()
                .map(|(v, yanked)| (v.to_string(), sample_version(v, *yanked)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_roundtrip_package() {
        let store = RegistryStore::temporary().unwrap();
        let record = sample_package("my-game", &[("1.0.0", false)]);
        store.put_package(&record).unwrap();
        let loaded = store.get_package("my-game").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get_package("ghost").unwrap().is_none());
    }

    #[test]
    fn test_list_is_name_sorted() {
        let store = RegistryStore::temporary().unwrap();
        for name in ["zebra", "apple", "mango"] {
            store.put_package(&sample_package(name, &[])).unwrap();
        }
        let names: Vec<String> = store
            .list_packages()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["apple", "mango", "zebra"]);
    }

    #[test]
    fn test_latest_version_skips_yanked() {
        let mut record = sample_package("my-game", &[]);
        let mut old = sample_version("1.0.0", false);
        old.published_at = Utc::now() - chrono::Duration::days(2);
        let mut newer = sample_version("1.1.0", true);
        newer.published_at = Utc::now();
        record.versions.insert("1.0.0".into(), old);
        record.versions.insert("1.1.0".into(), newer);

        assert_eq!(record.latest_version().unwrap().version, "1.0.0");

        let order: Vec<&str> = record
            .versions_by_recency()
            .iter()
            .map(|v| v.version.as_str())
            .collect();
        assert_eq!(order, ["1.1.0", "1.0.0"]);
    }

    #[test]
    fn test_token_roundtrip() {
        let store = RegistryStore::temporary().unwrap();
        let record = TokenRecord {
            token_hash: "ab".repeat(32),
            user_id: "user-1".into(),
            name: Some("ci token".into()),
            scopes: "upload,yank".into(),
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
            revoked: false,
        };
        store.put_token(&record).unwrap();
        let loaded = store.get_token(&record.token_hash).unwrap().unwrap();
        assert_eq!(loaded.scope_list(), vec!["upload", "yank"]);
    }

    #[test]
    fn test_audit_append() {
        let store = RegistryStore::temporary().unwrap();
        for action in ["register", "yank"] {
            store
                .append_audit(&AuditRecord {
                    package_name: "my-game".into(),
                    version: Some("1.0.0".into()),
                    action: action.into(),
                    actor_id: "user-1".into(),
                    actor_type: "user".into(),
                    timestamp: Utc::now(),
                    details: serde_json::json!({}),
                    github_repository: None,
                    github_workflow: None,
                    github_commit: None,
                })
                .unwrap();
        }
        let entries = store.audit_entries("my-game").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "register");
    }
}
