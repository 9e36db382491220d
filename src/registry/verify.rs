use crate::checksum::sha256_hex;
use crate::prelude::*;
use crate::registry::config::RegistryConfig;
use crate::registry::error::ApiError;
use crate::registry::models::DistributionRegistration;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub connect_timeout: Duration,
    pub head_timeout: Duration,
    pub get_timeout: Duration,
    pub allow_http: bool,
}

impl VerifyConfig {
    pub fn from_registry_config(config: &RegistryConfig) -> VerifyConfig {
        VerifyConfig {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            head_timeout: Duration::from_secs(config.head_timeout_secs),
            get_timeout: Duration::from_secs(config.get_timeout_secs),
            allow_http: config.allow_http,
        }
    }
}

fn check_scheme(url: &str, config: &VerifyConfig) -> Result<(), ApiError> {
    if url.starts_with("https://") {
        return Ok(());
    }
    if config.allow_http && url.starts_with("http://") {
        return Ok(());
    }
    Err(ApiError::invalid_request(format!(
        "URL verification failed for {url}: URL must use HTTPS"
    )))
}

async fn head_check(
    client: &reqwest::Client,
    dist: &DistributionRegistration,
    config: &VerifyConfig,
) -> Result<(), ApiError> {
    let response = client
        .head(&dist.url)
        .timeout(config.head_timeout)
        .send()
        .await
        .map_err(|err| {
            ApiError::invalid_request(format!(
                "URL verification failed for {} (HEAD): {err}",
                dist.url
            ))
        })?;
    if !response.status().is_success() {
        return Err(ApiError::invalid_request(format!(
            "URL verification failed for {} (HEAD): HTTP {}",
            dist.url,
            response.status().as_u16()
        )));
    }
    Ok(())
}

async fn get_and_check(
    client: &reqwest::Client,
    dist: &DistributionRegistration,
    config: &VerifyConfig,
) -> Result<(), ApiError> {
    let response = client
        .get(&dist.url)
        .timeout(config.get_timeout)
        .send()
        .await
        .map_err(|err| {
            ApiError::invalid_request(format!(
                "URL verification failed for {} (GET): {err}",
                dist.url
            ))
        })?;
    if !response.status().is_success() {
        return Err(ApiError::invalid_request(format!(
            "URL verification failed for {} (GET): HTTP {}",
            dist.url,
            response.status().as_u16()
        )));
    }
    let body = response.bytes().await.map_err(|err| {
        ApiError::invalid_request(format!(
            "URL verification failed for {} (GET): {err}",
            dist.url
        ))
    })?;

    if body.len() as u64 != dist.size {
        return Err(ApiError::checksum_mismatch(format!(
            "size mismatch for {} at {}: expected {} bytes, got {}",
            dist.filename,
            dist.url,
            dist.size,
            body.len()
        )));
    }
    let actual = sha256_hex(&body);
    if actual != dist.sha256 {
        return Err(ApiError::checksum_mismatch(format!(
            "checksum mismatch for {} at {}: expected {}, got {actual}",
            dist.filename, dist.url, dist.sha256
        )));
    }
    Ok(())
}

/// Verify every distribution before anything is persisted: HEAD fan-out
/// first (cheap reachability), then GET fan-out with full-body size and
/// SHA-256 checks. Any single failure fails the whole registration.
pub async fn verify_distributions(
    distributions: &[DistributionRegistration],
    config: &VerifyConfig,
) -> Result<(), ApiError> {
    for dist in distributions {
        check_scheme(&dist.url, config)?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|_| ApiError::internal())?;

    futures::future::try_join_all(
        distributions.iter().map(|dist| head_check(&client, dist, config)),
    )
    .await?;

    futures::future::try_join_all(
        distributions
            .iter()
            .map(|dist| get_and_check(&client, dist, config)),
    )
    .await?;

    debug!("verified {} distribution asset(s)", distributions.len());
    Ok(())
}
