use crate::build::BuildConfig;
use crate::checksum::sha256_file_hex;
use crate::prelude::*;
use crate::registry::{DistributionRegistration, PackageRegistration, RegistrationResponse};
use std::path::Path;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Assemble a registration payload from built artifacts: checksums and
/// sizes come from the files on disk, platform tags from their filenames,
/// and the rest of the metadata from island.toml. `url_base` is where the
/// caller has already published the assets (e.g. a GitHub release).
pub fn build_registration(
    config: &BuildConfig,
    files: &[&Path],
    url_base: &str,
) -> Result<PackageRegistration> {
    if files.is_empty() {
        bail!("no artifact files given to register");
    }
    let url_base = url_base.trim_end_matches('/');
    if !url_base.starts_with("https://") {
        bail!("asset URL base must use HTTPS: {url_base:?}");
    }

    let mut distributions = Vec::new();
    for file in files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no filename", file.display()))?;
        let island_name: IslandName = filename
            .as_str()
            .try_into()
            .with_context(|| format!("{} is not a valid island artifact", file.display()))?;
        let (sha256, size) = sha256_file_hex(file)?;
        distributions.push(DistributionRegistration {
            url: format!("{url_base}/{filename}"),
            filename,
            sha256,
            size,
            platform_tag: island_name.tag.to_string(),
        });
    }

    let entry_points: BTreeMap<String, String> = config
        .entry_points
        .group(AP_ISLAND_GROUP)
        .map(|entries| entries.clone())
        .unwrap_or_default();
    if entry_points.is_empty() {
        bail!("island.toml declares no [entry_points.ap-island] entries");
    }

    let minimum_ap_version = config
        .minimum_ap_version
        .clone()
        .ok_or_else(|| anyhow!("island.toml must set minimum_ap_version to register"))?;

    let mut payload = PackageRegistration {
        name: config.name.clone(),
        version: config.version.clone(),
        game: config.game_name.clone(),
        description: config
            .description
            .clone()
            .unwrap_or_else(|| config.game_name.clone()),
        authors: config.authors.clone(),
        minimum_ap_version,
        maximum_ap_version: config.maximum_ap_version.clone(),
        keywords: config.keywords.clone(),
        homepage: config.homepage.clone(),
        repository: config.repository.clone(),
        license: config.license.clone(),
        entry_points,
        distributions,
        source_repository: config.repository.clone(),
        source_commit: None,
    };
    payload
        .validate_and_normalize(false)
        .map_err(|err| anyhow!("registration payload invalid: {err}"))?;
    Ok(payload)
}

/// POST the payload to the registry and decode the result, surfacing the
/// registry's error envelope on failure.
pub fn submit_registration(
    registry: &str,
    token: &str,
    payload: &PackageRegistration,
) -> Result<RegistrationResponse> {
    let url = format!("{}/register", registry.trim_end_matches('/'));
    let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
    let response = agent
        .post(&url)
        .set("Authorization", &format!("Bearer {token}"))
        .send_json(serde_json::to_value(payload)?);

    match response {
        Ok(response) => Ok(response.into_json()?),
        Err(ureq::Error::Status(status, response)) => {
            let body: serde_json::Value = response.into_json().unwrap_or_default();
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("(no message)")
                .to_string();
            let code = body["error"]["code"].as_str().unwrap_or("?").to_string();
            bail!("registration failed with HTTP {status} [{code}]: {message}")
        }
        Err(err) => Err(err).with_context(|| format!("POST {url}")),
    }
}
