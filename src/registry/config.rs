use crate::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Registry service configuration; loadable from TOML, overridable from the
/// command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Prefix used when rendering registry URLs in responses.
    pub base_url: String,
    pub oidc_enabled: bool,
    pub oidc_issuer: String,
    pub oidc_audience: Option<String>,
    /// Verification normally refuses plain-http asset URLs; loopback test
    /// origins can turn this on.
    pub allow_http: bool,
    pub connect_timeout_secs: u64,
    pub head_timeout_secs: u64,
    pub get_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> RegistryConfig {
        RegistryConfig {
            bind: ([127, 0, 0, 1], 8642).into(),
            db_path: PathBuf::from("island-registry.sled"),
            base_url: "/v1/island".into(),
            oidc_enabled: false,
            oidc_issuer: DEFAULT_OIDC_ISSUER.into(),
            oidc_audience: None,
            allow_http: false,
            connect_timeout_secs: 10,
            head_timeout_secs: 30,
            get_timeout_secs: 120,
        }
    }
}

impl RegistryConfig {
    pub fn from_toml(input: &str) -> Result<RegistryConfig> {
        Ok(toml_edit::de::from_str(input).context("parsing registry config")?)
    }

    pub fn from_path(path: &std::path::Path) -> Result<RegistryConfig> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        RegistryConfig::from_toml(&input)
    }
}
