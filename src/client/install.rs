use crate::checksum::sha256_hex;
use crate::error::IslandError;
use crate::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Origin artifacts can be large; give downloads a generous budget.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PackageInfo {
    latest_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: String,
    distributions: Vec<DistributionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct DistributionInfo {
    filename: String,
    sha256: String,
    size: u64,
    platform_tag: String,
    external_url: String,
    #[serde(default)]
    url_status: Option<String>,
}

#[derive(Debug)]
pub struct InstallReport {
    pub path: PathBuf,
    pub filename: String,
    pub version: String,
    pub bytes: u64,
    pub sha256: String,
}

fn metadata_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(METADATA_TIMEOUT)
        .build()
}

fn fetch_json<T: serde::de::DeserializeOwned>(agent: &ureq::Agent, url: &str) -> Result<T> {
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(404, _) => anyhow!("not found: {url}"),
        other => anyhow!("request to {url} failed: {other}"),
    })?;
    Ok(response.into_json()?)
}

/// Pick a distribution: exact platform match first, then the universal
/// build, then the first .island file, then anything.
fn select_distribution<'a>(
    distributions: &'a [DistributionInfo],
    platform: Option<&str>,
) -> Option<&'a DistributionInfo> {
    if let Some(platform) = platform {
        if let Some(exact) = distributions.iter().find(|d| d.platform_tag == platform) {
            return Some(exact);
        }
    }
    if let Some(universal) = distributions
        .iter()
        .find(|d| d.platform_tag == "py3-none-any")
    {
        return Some(universal);
    }
    if let Some(island) = distributions
        .iter()
        .find(|d| d.filename.ends_with(".island"))
    {
        return Some(island);
    }
    distributions.first()
}

/// Download the package from its external origin and verify the checksum
/// against the registry's metadata before anything touches disk.
pub fn install(
    repository: &str,
    package: &str,
    version: Option<&str>,
    platform: Option<&str>,
    output_dir: &Path,
) -> Result<InstallReport> {
    let repository = repository.trim_end_matches('/');
    let agent = metadata_agent();

    let version = match version {
        Some(version) => version.to_string(),
        None => {
            let info: PackageInfo =
                fetch_json(&agent, &format!("{repository}/packages/{package}"))?;
            info.latest_version
                .ok_or_else(|| anyhow!("no versions available for {package}"))?
        }
    };

    let info: VersionInfo =
        fetch_json(&agent, &format!("{repository}/packages/{package}/{version}"))?;
    if info.distributions.is_empty() {
        bail!("no distributions available for {package} {version}");
    }

    let dist = select_distribution(&info.distributions, platform)
        .ok_or_else(|| anyhow!("no suitable distribution for platform {platform:?}"))?;
    if dist.url_status.as_deref() == Some("unavailable") {
        warn!("distribution URL for {} is marked unavailable", dist.filename);
    }

    info!(
        "downloading {} ({} bytes) from {}",
        dist.filename, dist.size, dist.external_url
    );
    let download_agent = ureq::AgentBuilder::new().timeout(DOWNLOAD_TIMEOUT).build();
    let response = download_agent
        .get(&dist.external_url)
        .call()
        .with_context(|| format!("downloading {}", dist.external_url))?;
    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;

    // Verify before writing; a mismatched artifact never reaches disk.
    let actual = sha256_hex(&body);
    let expected = dist.sha256.to_ascii_lowercase();
    let output_path = output_dir.join(&dist.filename);
    if actual != expected {
        if output_path.exists() {
            let _ = std::fs::remove_file(&output_path);
        }
        return Err(IslandError::ChecksumMismatch {
            url: dist.external_url.clone(),
            expected,
            actual,
        }
        .into());
    }

    std::fs::create_dir_all(output_dir)?;
    std::fs::write(&output_path, &body)
        .with_context(|| format!("writing {}", output_path.display()))?;

    Ok(InstallReport {
        path: output_path,
        filename: dist.filename.clone(),
        version: info.version,
        bytes: body.len() as u64,
        sha256: actual,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn dist(filename: &str, tag: &str) -> DistributionInfo {
        DistributionInfo {
            filename: filename.into(),
            sha256: "a".repeat(64),
            size: 1,
            platform_tag: tag.into(),
            external_url: format!("https://host.example/{filename}"),
            url_status: None,
        }
    }

    #[test]
    fn test_select_distribution_preference_order() {
        let dists = vec![
            dist("a.tar.gz", "source"),
            dist("b-py3-none-any.island", "py3-none-any"),
            dist("c-win.island", "cp311-cp311-win_amd64"),
        ];

        // exact platform match wins
        let chosen = select_distribution(&dists, Some("cp311-cp311-win_amd64")).unwrap();
        assert_eq!(chosen.filename, "c-win.island");

        // otherwise the universal build
        let chosen = select_distribution(&dists, Some("cp311-cp311-linux_x86_64")).unwrap();
        assert_eq!(chosen.filename, "b-py3-none-any.island");
        let chosen = select_distribution(&dists, None).unwrap();
        assert_eq!(chosen.filename, "b-py3-none-any.island");

        // no universal -> first .island
        let no_universal = vec![dist("a.tar.gz", "source"), dist("c-win.island", "cp311-cp311-win_amd64")];
        let chosen = select_distribution(&no_universal, None).unwrap();
        assert_eq!(chosen.filename, "c-win.island");

        // last resort: first entry
        let only_sdist = vec![dist("a.tar.gz", "source")];
        let chosen = select_distribution(&only_sdist, None).unwrap();
        assert_eq!(chosen.filename, "a.tar.gz");

        assert!(select_distribution(&[], None).is_none());
    }
}
