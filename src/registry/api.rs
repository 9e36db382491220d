use crate::prelude::*;
use crate::registry::auth::{
    authenticate, is_authorized_publisher, AuthenticatedSubject, JwksVerifier, TokenVerifier,
};
use crate::registry::config::RegistryConfig;
use crate::registry::error::{handle_rejection, ApiError};
use crate::registry::models::*;
use crate::registry::store::*;
use crate::registry::verify::{verify_distributions, VerifyConfig};
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Shared state behind every handler. Mutations take the write lock, which
/// serializes check-then-insert sequences per the consistency rules;
/// read-only handlers share the read lock.
#[derive(Clone)]
pub struct RegistryService {
    store: Arc<RwLock<RegistryStore>>,
    config: Arc<RegistryConfig>,
    verifier: Arc<dyn TokenVerifier>,
}

impl RegistryService {
    pub fn new(
        store: RegistryStore,
        config: RegistryConfig,
        verifier: Arc<dyn TokenVerifier>,
    ) -> RegistryService {
        RegistryService {
            store: Arc::new(RwLock::new(store)),
            config: Arc::new(config),
            verifier,
        }
    }

    pub fn store(&self) -> Arc<RwLock<RegistryStore>> {
        self.store.clone()
    }
}

fn reject(err: ApiError) -> Rejection {
    warp::reject::custom(err)
}

fn with_service(
    service: RegistryService,
) -> impl Filter<Extract = (RegistryService,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn auth_header() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

/// All routes under /v1/island, with the error envelope as the terminal
/// rejection handler.
pub fn routes(
    service: RegistryService,
) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
    let register = warp::path!("register")
        .and(warp::post())
        .and(with_service(service.clone()))
        .and(auth_header())
        .and(warp::body::json())
        .and_then(handle_register);

    let list_packages = warp::path!("packages")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and(warp::query::<PageQuery>())
        .and_then(handle_list_packages);

    let search = warp::path!("search")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and(warp::query::<SearchQuery>())
        .and_then(handle_search);

    let index = warp::path!("index.json")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_index);

    let list_collaborators = warp::path!("packages" / String / "collaborators")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_list_collaborators);

    let add_collaborator = warp::path!("packages" / String / "collaborators")
        .and(warp::post())
        .and(with_service(service.clone()))
        .and(auth_header())
        .and(warp::body::json())
        .and_then(handle_add_collaborator);

    let remove_collaborator = warp::path!("packages" / String / "collaborators" / String)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and(auth_header())
        .and_then(handle_remove_collaborator);

    let list_versions = warp::path!("packages" / String / "versions")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and(warp::query::<VersionListQuery>())
        .and_then(handle_list_versions);

    let get_package = warp::path!("packages" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_get_package);

    let download_exact = warp::path!("packages" / String / String / "download" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_download_exact);

    let download_best = warp::path!("packages" / String / String / "download")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and(warp::query::<PlatformQuery>())
        .and_then(handle_download_best);

    let yank = warp::path!("packages" / String / String / "yank")
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and(auth_header())
        .and(warp::body::json())
        .and_then(handle_yank);

    let get_version = warp::path!("packages" / String / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_get_version);

    warp::path("v1")
        .and(warp::path("island"))
        .and(
            register
                .or(list_packages)
                .or(search)
                .or(index)
                .or(list_collaborators)
                .or(add_collaborator)
                .or(remove_collaborator)
                .or(list_versions)
                .or(download_exact)
                .or(download_best)
                .or(yank)
                .or(get_version)
                .or(get_package),
        )
        .recover(handle_rejection)
}

/// Run the registry service until the process is killed.
pub async fn serve(config: RegistryConfig) -> Result<()> {
    let store = RegistryStore::open(&config.db_path)?;
    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(JwksVerifier::for_issuer(&config.oidc_issuer));
    let bind = config.bind;
    info!("island registry listening on {bind}");
    let service = RegistryService::new(store, config, verifier);
    warp::serve(routes(service)).run(bind).await;
    Ok(())
}

// --- registration ---

async fn handle_register(
    service: RegistryService,
    auth: Option<String>,
    mut payload: PackageRegistration,
) -> Result<impl Reply, Rejection> {
    payload
        .validate_and_normalize(service.config.allow_http)
        .map_err(reject)?;

    // Authenticate and pre-check authorization + version conflict before
    // spending bandwidth on verification.
    let subject = {
        let store = service.store.read().await;
        let subject = authenticate(
            &store,
            &service.config,
            service.verifier.as_ref(),
            auth.as_deref(),
        )
        .map_err(reject)?;
        subject.require_scope("upload").map_err(reject)?;
        if let Some(record) = store
            .get_package(&payload.name)
            .map_err(|_| reject(ApiError::internal()))?
        {
            check_publish_access(&record, &subject).map_err(reject)?;
            if record.versions.contains_key(&payload.version) {
                return Err(reject(ApiError::version_exists(&payload.name, &payload.version)));
            }
        }
        subject
    };

    // The correctness-critical phase: nothing below runs unless every
    // distribution URL is reachable and carries exactly the declared bytes.
    verify_distributions(
        &payload.distributions,
        &VerifyConfig::from_registry_config(&service.config),
    )
    .await
    .map_err(reject)?;

    let store = service.store.write().await;
    // Re-check under the write lock; a concurrent registration may have won.
    let existing = store
        .get_package(&payload.name)
        .map_err(|_| reject(ApiError::internal()))?;
    let mut record = match existing {
        Some(record) => {
            check_publish_access(&record, &subject).map_err(reject)?;
            if record.versions.contains_key(&payload.version) {
                return Err(reject(ApiError::version_exists(&payload.name, &payload.version)));
            }
            let mut record = record;
            record.description = Some(payload.description.clone());
            if payload.homepage.is_some() {
                record.homepage = payload.homepage.clone();
            }
            if payload.repository.is_some() {
                record.repository = payload.repository.clone();
            }
            if payload.license.is_some() {
                record.license = payload.license.clone();
            }
            record.updated_at = Utc::now();
            record
        }
        None => {
            let record = new_package_record(&payload, &subject);
            store
                .append_audit(&audit_entry(
                    &payload.name,
                    None,
                    "create_package",
                    &subject,
                    serde_json::json!({ "owner": subject.subject_id.clone() }),
                ))
                .map_err(|_| reject(ApiError::internal()))?;
            record
        }
    };

    record
        .versions
        .insert(payload.version.clone(), new_version_record(&payload));
    store
        .put_package(&record)
        .map_err(|_| reject(ApiError::internal()))?;

    let filenames: Vec<String> = payload
        .distributions
        .iter()
        .map(|d| d.filename.clone())
        .collect();
    store
        .append_audit(&audit_entry(
            &payload.name,
            Some(&payload.version),
            "register",
            &subject,
            serde_json::json!({
                "distributions": filenames.clone(),
                "source_repository": payload.source_repository.clone(),
                "source_commit": payload.source_commit.clone(),
            }),
        ))
        .map_err(|_| reject(ApiError::internal()))?;

    info!(
        "registered {} {} ({} distribution(s))",
        payload.name,
        payload.version,
        filenames.len()
    );

    Ok(warp::reply::json(&RegistrationResponse {
        package_name: payload.name.clone(),
        version: payload.version.clone(),
        registered_distributions: filenames,
        registry_url: format!(
            "{}/packages/{}/{}",
            service.config.base_url, payload.name, payload.version
        ),
    }))
}

fn check_publish_access(
    record: &PackageRecord,
    subject: &AuthenticatedSubject,
) -> Result<(), ApiError> {
    if is_authorized_publisher(record, subject) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "not authorized to publish to package '{}'",
            record.name
        )))
    }
}

fn new_package_record(
    payload: &PackageRegistration,
    subject: &AuthenticatedSubject,
) -> PackageRecord {
    let now = Utc::now();
    PackageRecord {
        name: payload.name.clone(),
        display_name: payload.game.clone(),
        description: Some(payload.description.clone()),
        license: payload.license.clone(),
        homepage: payload.homepage.clone(),
        repository: payload.repository.clone(),
        created_at: now,
        updated_at: now,
        authors: payload
            .authors
            .iter()
            .map(|name| AuthorRecord {
                name: name.clone(),
                email: None,
            })
            .collect(),
        keywords: payload.keywords.clone(),
        publishers: vec![PublisherRecord {
            publisher_id: subject.subject_id.clone(),
            publisher_type: subject.auth_type,
            is_owner: true,
            added_at: now,
            github_repository: subject.github_repository.clone(),
            github_workflow: subject.github_workflow.clone(),
        }],
        versions: BTreeMap::new(),
    }
}

fn new_version_record(payload: &PackageRegistration) -> VersionRecord {
    let now = Utc::now();
    // A version is pure-python unless some distribution says otherwise.
    let pure_python = payload.distributions.iter().all(|dist| {
        PlatformTag::try_from(dist.platform_tag.as_str())
            .map(|tag| tag.is_pure_python())
            .unwrap_or(true)
    });
    VersionRecord {
        version: payload.version.clone(),
        game: payload.game.clone(),
        minimum_ap_version: Some(payload.minimum_ap_version.clone()),
        maximum_ap_version: payload.maximum_ap_version.clone(),
        pure_python,
        published_at: now,
        yanked: false,
        yank_reason: None,
        distributions: payload
            .distributions
            .iter()
            .map(|dist| DistributionRecord {
                filename: dist.filename.clone(),
                sha256: dist.sha256.clone(),
                size: dist.size,
                platform_tag: dist.platform_tag.clone(),
                external_url: dist.url.clone(),
                registered_at: now,
                last_verified_at: Some(now),
                url_status: UrlStatus::Active,
            })
            .collect(),
        entry_points: payload
            .entry_points
            .iter()
            .map(|(name, value)| {
                let (module, attr) = split_entry_point(value);
                EntryPointRecord {
                    entry_point_type: AP_ISLAND_GROUP.into(),
                    name: name.clone(),
                    module,
                    attr,
                }
            })
            .collect(),
    }
}

fn audit_entry(
    package_name: &str,
    version: Option<&str>,
    action: &str,
    subject: &AuthenticatedSubject,
    details: serde_json::Value,
) -> AuditRecord {
    AuditRecord {
        package_name: package_name.into(),
        version: version.map(String::from),
        action: action.into(),
        actor_id: subject.subject_id.clone(),
        actor_type: subject.auth_type.to_string(),
        timestamp: Utc::now(),
        details,
        github_repository: subject.github_repository.clone(),
        github_workflow: subject.github_workflow.clone(),
        github_commit: subject.github_commit.clone(),
    }
}

// --- discovery ---

fn list_item(record: &PackageRecord) -> PackageListItem {
    PackageListItem {
        name: record.name.clone(),
        display_name: record.display_name.clone(),
        description: record.description.clone(),
        latest_version: record.latest_version().map(|v| v.version.clone()),
    }
}

fn version_list_item(version: &VersionRecord) -> VersionListItem {
    VersionListItem {
        version: version.version.clone(),
        published_at: version.published_at,
        yanked: version.yanked,
        pure_python: version.pure_python,
    }
}

fn paginate<T>(items: Vec<T>, page: u64, per_page: u64) -> (Vec<T>, PaginationInfo) {
    let total = items.len() as u64;
    let total_pages = if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    };
    let start = ((page - 1) * per_page) as usize;
    let paged = items
        .into_iter()
        .skip(start)
        .take(per_page as usize)
        .collect();
    (
        paged,
        PaginationInfo {
            page,
            per_page,
            total,
            total_pages,
        },
    )
}

async fn handle_list_packages(
    service: RegistryService,
    query: PageQuery,
) -> Result<impl Reply, Rejection> {
    let (page, per_page) = query.clamped();
    let store = service.store.read().await;
    let packages = store
        .list_packages()
        .map_err(|_| reject(ApiError::internal()))?;
    let items: Vec<PackageListItem> = packages.iter().map(list_item).collect();
    let (packages, pagination) = paginate(items, page, per_page);
    Ok(warp::reply::json(&PackageListResponse {
        packages,
        pagination,
    }))
}

async fn handle_get_package(
    name: String,
    service: RegistryService,
) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;

    Ok(warp::reply::json(&PackageMetadataResponse {
        name: record.name.clone(),
        display_name: record.display_name.clone(),
        description: record.description.clone(),
        license: record.license.clone(),
        homepage: record.homepage.clone(),
        repository: record.repository.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        authors: record
            .authors
            .iter()
            .map(|a| AuthorModel {
                name: a.name.clone(),
                email: a.email.clone(),
            })
            .collect(),
        keywords: record.keywords.clone(),
        latest_version: record.latest_version().map(|v| v.version.clone()),
        versions: record
            .versions_by_recency()
            .into_iter()
            .map(version_list_item)
            .collect(),
    }))
}

async fn handle_list_versions(
    name: String,
    service: RegistryService,
    query: VersionListQuery,
) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;

    let versions: Vec<VersionListItem> = record
        .versions_by_recency()
        .into_iter()
        .filter(|v| query.include_yanked || !v.yanked)
        .map(version_list_item)
        .collect();
    let total = versions.len() as u64;
    Ok(warp::reply::json(&VersionListResponse {
        package_name: name,
        versions,
        total,
    }))
}

async fn handle_get_version(
    name: String,
    version: String,
    service: RegistryService,
) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;
    let ver = record
        .versions
        .get(&version)
        .ok_or_else(|| reject(ApiError::version_not_found(&name, &version)))?;

    Ok(warp::reply::json(&VersionMetadataResponse {
        version: ver.version.clone(),
        game: ver.game.clone(),
        minimum_ap_version: ver.minimum_ap_version.clone(),
        maximum_ap_version: ver.maximum_ap_version.clone(),
        pure_python: ver.pure_python,
        published_at: ver.published_at,
        yanked: ver.yanked,
        yank_reason: ver.yank_reason.clone(),
        distributions: ver
            .distributions
            .iter()
            .map(|d| distribution_model(&name, &version, d, &service.config))
            .collect(),
    }))
}

fn distribution_model(
    name: &str,
    version: &str,
    dist: &DistributionRecord,
    config: &RegistryConfig,
) -> DistributionModel {
    DistributionModel {
        filename: dist.filename.clone(),
        sha256: dist.sha256.clone(),
        size: dist.size,
        platform_tag: dist.platform_tag.clone(),
        external_url: dist.external_url.clone(),
        url_status: match dist.url_status {
            UrlStatus::Active => "active".into(),
            UrlStatus::Unavailable => "unavailable".into(),
        },
        download_url: format!(
            "{}/packages/{name}/{version}/download/{}",
            config.base_url, dist.filename
        ),
    }
}

async fn handle_search(
    service: RegistryService,
    query: SearchQuery,
) -> Result<impl Reply, Rejection> {
    let (page, per_page) = (query.page.max(1), query.per_page.clamp(1, 100));
    let store = service.store.read().await;
    let packages = store
        .list_packages()
        .map_err(|_| reject(ApiError::internal()))?;

    let requested_platform: Option<PlatformTag> = query
        .platform
        .as_deref()
        .and_then(|p| PlatformTag::try_from(p).ok());
    let compatible_with: Option<Version> = query
        .compatible_with
        .as_deref()
        .and_then(|v| Version::try_from(v).ok());

    let matches: Vec<PackageListItem> = packages
        .iter()
        .filter(|record| search_matches(record, &query, &requested_platform, &compatible_with))
        .map(list_item)
        .collect();

    let total = matches.len() as u64;
    let (results, _) = paginate(matches, page, per_page);
    Ok(warp::reply::json(&SearchResponse {
        results,
        query: query.q.clone(),
        filters: SearchFilters {
            game: query.game.clone(),
            author: query.author.clone(),
            compatible_with: query.compatible_with.clone(),
            platform: query.platform.clone(),
        },
        total,
    }))
}

fn search_matches(
    record: &PackageRecord,
    query: &SearchQuery,
    requested_platform: &Option<PlatformTag>,
    compatible_with: &Option<Version>,
) -> bool {
    if !query.q.is_empty() {
        let needle = query.q.to_lowercase();
        let mut haystacks = vec![record.name.clone(), record.display_name.clone()];
        if let Some(description) = &record.description {
            haystacks.push(description.clone());
        }
        haystacks.extend(record.keywords.iter().cloned());
        if !haystacks
            .iter()
            .any(|h| h.to_lowercase().contains(&needle))
        {
            return false;
        }
    }

    if let Some(author) = &query.author {
        let needle = author.to_lowercase();
        if !record
            .authors
            .iter()
            .any(|a| a.name.to_lowercase().contains(&needle))
        {
            return false;
        }
    }

    if let Some(game) = &query.game {
        let needle = game.to_lowercase();
        if !record
            .versions
            .values()
            .filter(|v| !v.yanked)
            .any(|v| v.game.to_lowercase().contains(&needle))
        {
            return false;
        }
    }

    if let Some(target) = compatible_with {
        let compatible = record.versions.values().filter(|v| !v.yanked).any(|v| {
            let min_ok = match v
                .minimum_ap_version
                .as_deref()
                .and_then(|m| Version::try_from(m).ok())
            {
                Some(minimum) => minimum.compare_precedence(target) != std::cmp::Ordering::Greater,
                None => true,
            };
            let max_ok = match v
                .maximum_ap_version
                .as_deref()
                .and_then(|m| Version::try_from(m).ok())
            {
                Some(maximum) => maximum.compare_precedence(target) != std::cmp::Ordering::Less,
                None => true,
            };
            min_ok && max_ok
        });
        if !compatible {
            return false;
        }
    }

    if let Some(requested) = requested_platform {
        let has_platform = record.versions.values().any(|v| {
            v.distributions.iter().any(|d| {
                PlatformTag::try_from(d.platform_tag.as_str())
                    .map(|tag| tag.is_compatible_with(requested))
                    .unwrap_or(false)
            })
        });
        if !has_platform {
            return false;
        }
    }

    true
}

async fn handle_index(service: RegistryService) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let packages = store
        .list_packages()
        .map_err(|_| reject(ApiError::internal()))?;

    let mut index_packages = IndexMap::new();
    let mut total_versions = 0u64;
    for record in &packages {
        let mut versions = IndexMap::new();
        for version in record.versions_by_recency() {
            total_versions += 1;
            versions.insert(
                version.version.clone(),
                IndexVersionEntry {
                    game: version.game.clone(),
                    minimum_ap_version: version.minimum_ap_version.clone(),
                    maximum_ap_version: version.maximum_ap_version.clone(),
                    pure_python: version.pure_python,
                    published_at: version.published_at.to_rfc3339(),
                    yanked: version.yanked,
                    distributions: version
                        .distributions
                        .iter()
                        .map(|d| IndexDistributionEntry {
                            filename: d.filename.clone(),
                            sha256: d.sha256.clone(),
                            size: d.size,
                            platform_tag: d.platform_tag.clone(),
                        })
                        .collect(),
                },
            );
        }
        index_packages.insert(
            record.name.clone(),
            IndexPackageEntry {
                display_name: record.display_name.clone(),
                description: record.description.clone(),
                latest_version: record.latest_version().map(|v| v.version.clone()),
                versions,
            },
        );
    }

    Ok(warp::reply::json(&IndexResponse {
        total_packages: packages.len() as u64,
        packages: index_packages,
        generated_at: Utc::now(),
        total_versions,
    }))
}

// --- downloads ---

enum DownloadMiss {
    PackageMissing,
    VersionMissing,
    FileMissing,
    UrlUnavailable,
}

impl DownloadMiss {
    fn reason(&self) -> &'static str {
        match self {
            DownloadMiss::PackageMissing => "package_missing",
            DownloadMiss::VersionMissing => "version_missing",
            DownloadMiss::FileMissing => "file_missing",
            DownloadMiss::UrlUnavailable => "url_unavailable",
        }
    }
}

// Every miss subcase surfaces as a plain 404 so probes can't distinguish
// registration state; the audit trail records which case it actually was.
fn download_miss(
    store: &RegistryStore,
    name: &str,
    version: &str,
    miss: DownloadMiss,
) -> Rejection {
    let _ = store.append_audit(&AuditRecord {
        package_name: name.into(),
        version: Some(version.into()),
        action: "download_not_found".into(),
        actor_id: "anonymous".into(),
        actor_type: "anonymous".into(),
        timestamp: Utc::now(),
        details: serde_json::json!({ "reason": miss.reason() }),
        github_repository: None,
        github_workflow: None,
        github_commit: None,
    });
    match miss {
        DownloadMiss::PackageMissing => reject(ApiError::package_not_found(name)),
        _ => reject(ApiError::version_not_found(name, version)),
    }
}

fn redirect_reply(dist: &DistributionRecord, with_filename: bool) -> Result<warp::http::Response<String>, Rejection> {
    let mut builder = warp::http::Response::builder()
        .status(StatusCode::FOUND)
        .header("Location", dist.external_url.clone())
        .header("X-Checksum-SHA256", dist.sha256.clone())
        .header("X-Expected-Size", dist.size.to_string());
    if with_filename {
        builder = builder.header("X-Filename", dist.filename.clone());
    }
    builder
        .body(String::new())
        .map_err(|_| reject(ApiError::internal()))
}

async fn handle_download_exact(
    name: String,
    version: String,
    filename: String,
    service: RegistryService,
) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::PackageMissing))?;
    let ver = record
        .versions
        .get(&version)
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::VersionMissing))?;
    let dist = ver
        .distributions
        .iter()
        .find(|d| d.filename == filename)
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::FileMissing))?;
    if dist.url_status != UrlStatus::Active {
        return Err(download_miss(&store, &name, &version, DownloadMiss::UrlUnavailable));
    }
    redirect_reply(dist, false)
}

/// Most-specific compatible distribution; exact tag match wins outright.
/// Ties break on tag string then filename so the choice is stable.
fn select_best_distribution<'a>(
    distributions: &'a [DistributionRecord],
    platform: Option<&PlatformTag>,
) -> Option<&'a DistributionRecord> {
    let mut compatible: Vec<(&DistributionRecord, PlatformTag)> = distributions
        .iter()
        .filter(|d| d.url_status == UrlStatus::Active)
        .filter_map(|d| {
            PlatformTag::try_from(d.platform_tag.as_str())
                .ok()
                .map(|tag| (d, tag))
        })
        .filter(|(_, tag)| match platform {
            Some(requested) => tag.is_compatible_with(requested),
            None => true,
        })
        .collect();

    if let Some(requested) = platform {
        if let Some((exact, _)) = compatible
            .iter()
            .find(|(d, _)| d.platform_tag == requested.to_string())
        {
            return Some(*exact);
        }
    }

    compatible.sort_by(|(da, ta), (db, tb)| {
        tb.specificity()
            .cmp(&ta.specificity())
            .then_with(|| da.platform_tag.cmp(&db.platform_tag))
            .then_with(|| da.filename.cmp(&db.filename))
    });
    compatible.first().map(|(d, _)| *d)
}

async fn handle_download_best(
    name: String,
    version: String,
    service: RegistryService,
    query: PlatformQuery,
) -> Result<impl Reply, Rejection> {
    let requested: Option<PlatformTag> = match query.platform.as_deref() {
        Some(raw) => Some(
            PlatformTag::try_from(raw)
                .map_err(|_| reject(ApiError::invalid_request(format!("invalid platform tag {raw:?}"))))?,
        ),
        None => None,
    };

    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::PackageMissing))?;
    let ver = record
        .versions
        .get(&version)
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::VersionMissing))?;

    let dist = select_best_distribution(&ver.distributions, requested.as_ref())
        .ok_or_else(|| download_miss(&store, &name, &version, DownloadMiss::FileMissing))?;
    redirect_reply(dist, true)
}

// --- yank / collaborators ---

async fn handle_yank(
    name: String,
    version: String,
    service: RegistryService,
    auth: Option<String>,
    body: YankRequest,
) -> Result<impl Reply, Rejection> {
    let store = service.store.write().await;
    let subject = authenticate(
        &store,
        &service.config,
        service.verifier.as_ref(),
        auth.as_deref(),
    )
    .map_err(reject)?;
    subject.require_scope("upload").map_err(reject)?;

    let mut record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;
    check_publish_access(&record, &subject).map_err(reject)?;

    let ver = record
        .versions
        .get_mut(&version)
        .ok_or_else(|| reject(ApiError::version_not_found(&name, &version)))?;
    if ver.yanked {
        return Ok(warp::reply::json(&MessageResponse {
            message: format!("version {version} is already yanked"),
        }));
    }
    ver.yanked = true;
    ver.yank_reason = Some(body.reason.clone());

    store
        .put_package(&record)
        .map_err(|_| reject(ApiError::internal()))?;
    store
        .append_audit(&audit_entry(
            &name,
            Some(&version),
            "yank",
            &subject,
            serde_json::json!({ "reason": body.reason }),
        ))
        .map_err(|_| reject(ApiError::internal()))?;

    Ok(warp::reply::json(&MessageResponse {
        message: format!("successfully yanked {name} version {version}"),
    }))
}

fn check_owner_access(
    record: &PackageRecord,
    subject: &AuthenticatedSubject,
) -> Result<(), ApiError> {
    let is_owner = record
        .publishers
        .iter()
        .any(|p| p.is_owner && p.publisher_id == subject.subject_id);
    if is_owner {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "only package owners can manage collaborators",
        ))
    }
}

async fn handle_add_collaborator(
    name: String,
    service: RegistryService,
    auth: Option<String>,
    body: CollaboratorRequest,
) -> Result<impl Reply, Rejection> {
    let store = service.store.write().await;
    let subject = authenticate(
        &store,
        &service.config,
        service.verifier.as_ref(),
        auth.as_deref(),
    )
    .map_err(reject)?;
    subject.require_scope("upload").map_err(reject)?;

    let mut record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;
    check_owner_access(&record, &subject).map_err(reject)?;

    if record
        .publishers
        .iter()
        .any(|p| p.publisher_id == body.user_id)
    {
        return Ok(warp::reply::json(&MessageResponse {
            message: format!("user {} is already a collaborator", body.user_id),
        }));
    }

    let publisher_type = match body.publisher_type.as_str() {
        "trusted_publisher" => PublisherType::TrustedPublisher,
        _ => PublisherType::User,
    };
    record.publishers.push(PublisherRecord {
        publisher_id: body.user_id.clone(),
        publisher_type,
        is_owner: false,
        added_at: Utc::now(),
        github_repository: body.github_repository.clone(),
        github_workflow: body.github_workflow.clone(),
    });

    store
        .put_package(&record)
        .map_err(|_| reject(ApiError::internal()))?;
    store
        .append_audit(&audit_entry(
            &name,
            None,
            "add_collaborator",
            &subject,
            serde_json::json!({
                "collaborator_id": body.user_id.clone(),
                "collaborator_type": body.publisher_type.clone(),
            }),
        ))
        .map_err(|_| reject(ApiError::internal()))?;

    Ok(warp::reply::json(&MessageResponse {
        message: format!("successfully added {} as collaborator", body.user_id),
    }))
}

async fn handle_remove_collaborator(
    name: String,
    collaborator_id: String,
    service: RegistryService,
    auth: Option<String>,
) -> Result<impl Reply, Rejection> {
    let store = service.store.write().await;
    let subject = authenticate(
        &store,
        &service.config,
        service.verifier.as_ref(),
        auth.as_deref(),
    )
    .map_err(reject)?;
    subject.require_scope("upload").map_err(reject)?;

    let mut record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;
    check_owner_access(&record, &subject).map_err(reject)?;

    let position = match record
        .publishers
        .iter()
        .position(|p| p.publisher_id == collaborator_id)
    {
        Some(position) => position,
        None => {
            return Ok(warp::reply::json(&MessageResponse {
                message: format!("user {collaborator_id} is not a collaborator"),
            }));
        }
    };

    // Never let a package end up ownerless.
    if record.publishers[position].is_owner && record.owners().count() <= 1 {
        return Err(reject(ApiError::forbidden(
            "cannot remove the last owner of a package",
        )));
    }
    record.publishers.remove(position);

    store
        .put_package(&record)
        .map_err(|_| reject(ApiError::internal()))?;
    store
        .append_audit(&audit_entry(
            &name,
            None,
            "remove_collaborator",
            &subject,
            serde_json::json!({ "collaborator_id": collaborator_id.clone() }),
        ))
        .map_err(|_| reject(ApiError::internal()))?;

    Ok(warp::reply::json(&MessageResponse {
        message: format!("successfully removed {collaborator_id} as collaborator"),
    }))
}

async fn handle_list_collaborators(
    name: String,
    service: RegistryService,
) -> Result<impl Reply, Rejection> {
    let store = service.store.read().await;
    let record = store
        .get_package(&name)
        .map_err(|_| reject(ApiError::internal()))?
        .ok_or_else(|| reject(ApiError::package_not_found(&name)))?;

    Ok(warp::reply::json(&CollaboratorListResponse {
        package: name,
        collaborators: record
            .publishers
            .iter()
            .map(|p| CollaboratorInfo {
                user_id: p.publisher_id.clone(),
                publisher_type: p.publisher_type.to_string(),
                is_owner: p.is_owner,
                github_repository: p.github_repository.clone(),
                added_at: p.added_at,
            })
            .collect(),
    }))
}
