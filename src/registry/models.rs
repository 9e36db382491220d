use crate::checksum::is_valid_sha256_hex;
use crate::prelude::*;
use crate::registry::error::{ApiError, ErrorCode, FieldError};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

// Registry package names are stricter than distribution names: lowercase,
// leading letter, hyphens allowed.
static REGISTRY_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap());
static COMMIT_SHA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{40}$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRegistration {
    pub filename: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRegistration {
    pub name: String,
    pub version: String,
    pub game: String,
    pub description: String,
    pub authors: Vec<String>,
    pub minimum_ap_version: String,
    #[serde(default)]
    pub maximum_ap_version: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    /// name -> "module:attr"
    pub entry_points: BTreeMap<String, String>,
    pub distributions: Vec<DistributionRegistration>,
    #[serde(default)]
    pub source_repository: Option<String>,
    #[serde(default)]
    pub source_commit: Option<String>,
}

impl PackageRegistration {
    /// Validate the whole payload, normalizing checksums and the commit sha
    /// to lowercase. Every violation is reported, tagged with its field.
    /// `allow_http` mirrors the service setting that admits loopback test
    /// origins.
    pub fn validate_and_normalize(&mut self, allow_http: bool) -> Result<(), ApiError> {
        let mut details: Vec<FieldError> = Vec::new();
        let mut push = |field: &str, error: String| {
            details.push(FieldError {
                field: field.into(),
                error,
            })
        };

        if !REGISTRY_NAME_RE.is_match(&self.name) || self.name.len() > 100 {
            push(
                "name",
                "must be lowercase alphanumeric with hyphens/underscores, starting with a letter"
                    .into(),
            );
        }
        if !Version::is_valid(&self.version) {
            push("version", format!("{:?} is not a valid semantic version", self.version));
        }
        if self.game.is_empty() || self.game.len() > 100 {
            push("game", "must be 1-100 characters".into());
        }
        if self.description.is_empty() {
            push("description", "cannot be empty".into());
        }
        if self.authors.is_empty() {
            push("authors", "at least one author is required".into());
        }
        if !Version::is_valid(&self.minimum_ap_version) {
            push(
                "minimum_ap_version",
                format!("{:?} is not a valid semantic version", self.minimum_ap_version),
            );
        }
        if let Some(maximum) = &self.maximum_ap_version {
            if !Version::is_valid(maximum) {
                push(
                    "maximum_ap_version",
                    format!("{maximum:?} is not a valid semantic version"),
                );
            }
        }
        if self.entry_points.is_empty() {
            push("entry_points", "at least one entry point is required".into());
        }
        if self.distributions.is_empty() {
            push("distributions", "at least one distribution is required".into());
        }

        for (i, dist) in self.distributions.iter_mut().enumerate() {
            if dist.filename.is_empty() {
                push(&format!("distributions[{i}].filename"), "cannot be empty".into());
            }
            let scheme_ok = dist.url.starts_with("https://")
                || (allow_http && dist.url.starts_with("http://"));
            if !scheme_ok {
                push(
                    &format!("distributions[{i}].url"),
                    "must be an HTTPS URL".into(),
                );
            }
            dist.sha256 = dist.sha256.to_ascii_lowercase();
            if !is_valid_sha256_hex(&dist.sha256) {
                push(
                    &format!("distributions[{i}].sha256"),
                    "must be exactly 64 lowercase hex characters".into(),
                );
            }
            if dist.size == 0 {
                push(&format!("distributions[{i}].size"), "must be greater than zero".into());
            }
            if dist.platform_tag.is_empty() || dist.platform_tag.len() > 100 {
                push(
                    &format!("distributions[{i}].platform_tag"),
                    "must be 1-100 characters".into(),
                );
            }
        }

        if let Some(commit) = &mut self.source_commit {
            *commit = commit.to_ascii_lowercase();
            if !COMMIT_SHA_RE.is_match(commit) {
                push("source_commit", "must be 40 lowercase hex characters".into());
            }
        }

        if details.is_empty() {
            Ok(())
        } else {
            // A payload whose only sin is a malformed version gets the more
            // precise code.
            let code = if details.len() == 1 && details[0].field == "version" {
                ErrorCode::InvalidVersion
            } else {
                ErrorCode::InvalidManifest
            };
            Err(ApiError::new(code, "invalid registration payload").with_details(details))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub package_name: String,
    pub version: String,
    pub registered_distributions: Vec<String>,
    pub registry_url: String,
}

// --- discovery ---

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

impl PageQuery {
    pub fn clamped(&self) -> (u64, u64) {
        (self.page.max(1), self.per_page.clamp(1, 100))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageListItem {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latest_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageListResponse {
    pub packages: Vec<PackageListItem>,
    pub pagination: PaginationInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorModel {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionListItem {
    pub version: String,
    pub published_at: DateTime<Utc>,
    pub yanked: bool,
    pub pure_python: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadataResponse {
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
    pub authors: Vec<AuthorModel>,
    pub keywords: Vec<String>,
    pub latest_version: Option<String>,
    pub versions: Vec<VersionListItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionListQuery {
    #[serde(default)]
    pub include_yanked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionListResponse {
    pub package_name: String,
    pub versions: Vec<VersionListItem>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionModel {
    pub filename: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
    pub external_url: String,
    pub url_status: String,
    pub download_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMetadataResponse {
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
    pub distributions: Vec<DistributionModel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub game: Option<String>,
    #[serde(default)]
    pub compatible_with: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFilters {
    pub game: Option<String>,
    pub author: Option<String>,
    pub compatible_with: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<PackageListItem>,
    pub query: String,
    pub filters: SearchFilters,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVersionEntry {
    pub game: String,
    pub minimum_ap_version: Option<String>,
    pub maximum_ap_version: Option<String>,
    pub pure_python: bool,
    pub published_at: String,
    pub yanked: bool,
    pub distributions: Vec<IndexDistributionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDistributionEntry {
    pub filename: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPackageEntry {
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latest_version: Option<String>,
    pub versions: IndexMap<String, IndexVersionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResponse {
    pub packages: IndexMap<String, IndexPackageEntry>,
    pub generated_at: DateTime<Utc>,
    pub total_packages: u64,
    pub total_versions: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformQuery {
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YankRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorRequest {
    pub user_id: String,
    #[serde(default = "default_publisher_type")]
    pub publisher_type: String,
    #[serde(default)]
    pub github_repository: Option<String>,
    #[serde(default)]
    pub github_workflow: Option<String>,
}

fn default_publisher_type() -> String {
    "user".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorInfo {
    pub user_id: String,
    #[serde(rename = "type")]
    pub publisher_type: String,
    pub is_owner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repository: Option<String>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorListResponse {
    pub package: String,
    pub collaborators: Vec<CollaboratorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_registration() -> PackageRegistration {
        PackageRegistration {
            name: "sample-game".into(),
            version: "1.0.0".into(),
            game: "Sample Game".into(),
            description: "A sample".into(),
            authors: vec!["A. Author".into()],
            minimum_ap_version: "0.5.0".into(),
            maximum_ap_version: None,
            keywords: vec![],
            homepage: None,
            repository: None,
            license: None,
            entry_points: BTreeMap::from([(
                "sample".to_string(),
                "sample_game:World".to_string(),
            )]),
            distributions: vec![DistributionRegistration {
                filename: "sample_game-1.0.0-py3-none-any.island".into(),
                url: "https://host.example/sample.island".into(),
                sha256: "AB".repeat(32),
                size: 1234,
                platform_tag: "py3-none-any".into(),
            }],
            source_repository: None,
            source_commit: Some("ABCDEF0123456789ABCDEF0123456789ABCDEF01".into()),
        }
    }

    #[test]
    fn test_valid_payload_is_normalized() {
        let mut reg = sample_registration();
        reg.validate_and_normalize(false).unwrap();
        assert_eq!(reg.distributions[0].sha256, "ab".repeat(32));
        assert_eq!(
            reg.source_commit.as_deref().unwrap(),
            "abcdef0123456789abcdef0123456789abcdef01"
        );
    }

    #[test]
    fn test_invalid_fields_reported_together() {
        let mut reg = sample_registration();
        reg.name = "Bad Name".into();
        reg.version = "one.two".into();
        reg.distributions[0].url = "http://insecure.example/x".into();
        reg.distributions[0].sha256 = "00".into();
        reg.distributions[0].size = 0;
        let err = reg.validate_and_normalize(false).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidManifest);
        let fields: Vec<&str> = err.details.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"distributions[0].url"));
        assert!(fields.contains(&"distributions[0].sha256"));
        assert!(fields.contains(&"distributions[0].size"));
    }

    #[test]
    fn test_empty_collections_rejected() {
        let mut reg = sample_registration();
        reg.authors.clear();
        reg.entry_points.clear();
        reg.distributions.clear();
        let err = reg.validate_and_normalize(false).unwrap_err();
        let fields: Vec<&str> = err.details.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"authors"));
        assert!(fields.contains(&"entry_points"));
        assert!(fields.contains(&"distributions"));
    }

    #[test]
    fn test_lone_bad_version_gets_precise_code() {
        let mut reg = sample_registration();
        reg.version = "one.two.three".into();
        let err = reg.validate_and_normalize(false).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidVersion);
    }

    #[test]
    fn test_bad_commit_sha() {
        let mut reg = sample_registration();
        reg.source_commit = Some("not-a-sha".into());
        let err = reg.validate_and_normalize(false).unwrap_err();
        assert!(err.details.iter().any(|d| d.field == "source_commit"));
    }

    #[test]
    fn test_page_clamping() {
        let q = PageQuery { page: 0, per_page: 500 };
        assert_eq!(q.clamped(), (1, 100));
        let q = PageQuery { page: 3, per_page: 20 };
        assert_eq!(q.clamped(), (3, 20));
    }
}
