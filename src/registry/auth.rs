use crate::checksum::sha256_hex;
use crate::prelude::*;
use crate::registry::config::RegistryConfig;
use crate::registry::error::ApiError;
use crate::registry::store::{PackageRecord, PublisherType, RegistryStore};
use chrono::Utc;
use ring::rand::SecureRandom;

/// Current and legacy token prefixes; both authenticate.
pub const TOKEN_PREFIXES: &[&str] = &["isl_", "apw_"];

/// Mint a fresh API token. Returns (plaintext, hash); only the hash is ever
/// stored.
pub fn generate_token() -> Result<(String, String)> {
    let mut body = [0u8; 32];
    ring::rand::SystemRandom::new()
        .fill(&mut body)
        .map_err(|_| anyhow!("system RNG failure"))?;
    let token = format!("isl_{}", data_encoding::BASE64URL_NOPAD.encode(&body));
    let hash = hash_token(&token);
    Ok((token, hash))
}

pub fn hash_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Pull the credential out of an Authorization header. Accepts
/// "Bearer <t>", "Token <t>", or a bare token carrying a known prefix.
pub fn parse_authorization_header(header: Option<&str>) -> Option<String> {
    let header = header?.trim();
    if header.is_empty() {
        return None;
    }
    let lower = header.to_ascii_lowercase();
    if lower.starts_with("bearer ") {
        return Some(header[7..].trim().to_string());
    }
    if lower.starts_with("token ") {
        return Some(header[6..].trim().to_string());
    }
    if TOKEN_PREFIXES.iter().any(|prefix| header.starts_with(prefix)) {
        return Some(header.to_string());
    }
    None
}

/// Whoever a request authenticated as, via either auth method.
#[derive(Debug, Clone)]
pub struct AuthenticatedSubject {
    pub subject_id: String,
    pub auth_type: PublisherType,
    pub scopes: Vec<String>,
    pub github_repository: Option<String>,
    pub github_workflow: Option<String>,
    pub github_commit: Option<String>,
}

impl AuthenticatedSubject {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), ApiError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("missing required scope: {scope}")))
        }
    }
}

/// Claims we read out of a CI provider's OIDC token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OidcClaims {
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub aud: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub repository_owner: String,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub actor: String,
}

/// Workflows may be given as bare filenames or full paths; matching always
/// happens on the basename.
pub fn workflow_basename(workflow: &str) -> &str {
    workflow.rsplit('/').next().unwrap_or(workflow)
}

fn decode_base64url_segment(segment: &str) -> Result<Vec<u8>> {
    // JWT segments are unpadded base64url, but be tolerant of padding
    let trimmed = segment.trim_end_matches('=');
    Ok(data_encoding::BASE64URL_NOPAD.decode(trimmed.as_bytes())?)
}

pub fn decode_jwt_payload(token: &str) -> Result<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        bail!("malformed JWT: expected three segments");
    }
    let payload = decode_base64url_segment(parts[1])?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Signature verification seam. The claims in a JWT mean nothing until its
/// signature has been checked against the issuer's keys, so this runs
/// before any claim is trusted.
pub trait TokenVerifier: Send + Sync {
    fn verify_signature(&self, token: &str) -> Result<()>;
}

/// Production verifier: fetches the issuer's JWKS and checks RS256
/// signatures. Keys are fetched once and cached for the process lifetime.
pub struct JwksVerifier {
    jwks_url: String,
    keys: std::sync::Mutex<Option<Vec<Jwk>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

impl JwksVerifier {
    pub fn for_issuer(issuer: &str) -> JwksVerifier {
        JwksVerifier {
            jwks_url: format!("{}/.well-known/jwks", issuer.trim_end_matches('/')),
            keys: Default::default(),
        }
    }

    fn keys(&self) -> Result<Vec<Jwk>> {
        let mut cached = self.keys.lock().unwrap();
        if let Some(keys) = cached.as_ref() {
            return Ok(keys.clone());
        }
        let jwks: JwkSet = ureq::get(&self.jwks_url)
            .call()
            .with_context(|| format!("fetching JWKS from {}", self.jwks_url))?
            .into_json()?;
        *cached = Some(jwks.keys.clone());
        Ok(jwks.keys)
    }
}

impl TokenVerifier for JwksVerifier {
    fn verify_signature(&self, token: &str) -> Result<()> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            bail!("malformed JWT: expected three segments");
        }
        let header: serde_json::Value =
            serde_json::from_slice(&decode_base64url_segment(parts[0])?)?;
        let kid = header["kid"].as_str().unwrap_or_default();
        let signature = decode_base64url_segment(parts[2])?;
        let message = format!("{}.{}", parts[0], parts[1]);

        let keys = self.keys()?;
        let candidates: Vec<&Jwk> = if kid.is_empty() {
            keys.iter().collect()
        } else {
            keys.iter().filter(|k| k.kid == kid).collect()
        };
        if candidates.is_empty() {
            bail!("no JWKS key matches kid {kid:?}");
        }
        for key in candidates {
            let n = decode_base64url_segment(&key.n)?;
            let e = decode_base64url_segment(&key.e)?;
            let public_key = ring::signature::RsaPublicKeyComponents { n: &n, e: &e };
            if public_key
                .verify(
                    &ring::signature::RSA_PKCS1_2048_8192_SHA256,
                    message.as_bytes(),
                    &signature,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        bail!("JWT signature verification failed")
    }
}

/// Verify and parse an OIDC token: signature first, then issuer, audience,
/// and expiry.
pub fn verify_oidc_token(
    token: &str,
    config: &RegistryConfig,
    verifier: &dyn TokenVerifier,
) -> Result<OidcClaims, ApiError> {
    verifier
        .verify_signature(token)
        .map_err(|err| ApiError::unauthorized(format!("invalid OIDC token: {err}")))?;
    let payload = decode_jwt_payload(token)
        .map_err(|err| ApiError::unauthorized(format!("invalid OIDC token: {err}")))?;
    let claims: OidcClaims = serde_json::from_value(payload)
        .map_err(|err| ApiError::unauthorized(format!("invalid OIDC claims: {err}")))?;

    if claims.iss != config.oidc_issuer {
        return Err(ApiError::unauthorized(format!(
            "invalid OIDC issuer: {:?}",
            claims.iss
        )));
    }
    if let Some(audience) = &config.oidc_audience {
        if &claims.aud != audience {
            return Err(ApiError::unauthorized(format!(
                "invalid OIDC audience: {:?}",
                claims.aud
            )));
        }
    }
    if claims.exp < Utc::now().timestamp() {
        return Err(ApiError::unauthorized("OIDC token has expired"));
    }
    Ok(claims)
}

/// Authenticate a request from its Authorization header: API tokens first,
/// then OIDC when enabled. Updates the token's last_used_at on success.
pub fn authenticate(
    store: &RegistryStore,
    config: &RegistryConfig,
    verifier: &dyn TokenVerifier,
    auth_header: Option<&str>,
) -> Result<AuthenticatedSubject, ApiError> {
    let credential = parse_authorization_header(auth_header)
        .ok_or_else(|| ApiError::unauthorized("authentication required"))?;

    if TOKEN_PREFIXES.iter().any(|p| credential.starts_with(p)) {
        let mut record = store
            .get_token(&hash_token(&credential))
            .map_err(|_| ApiError::internal())?
            .filter(|record| !record.revoked)
            .ok_or_else(|| ApiError::unauthorized("invalid or revoked API token"))?;
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return Err(ApiError::unauthorized("API token has expired"));
            }
        }
        record.last_used_at = Some(Utc::now());
        let scopes = record.scope_list().iter().map(|s| s.to_string()).collect();
        let subject_id = record.user_id.clone();
        store.put_token(&record).map_err(|_| ApiError::internal())?;
        return Ok(AuthenticatedSubject {
            subject_id,
            auth_type: PublisherType::User,
            scopes,
            github_repository: None,
            github_workflow: None,
            github_commit: None,
        });
    }

    if config.oidc_enabled {
        let claims = verify_oidc_token(&credential, config, verifier)?;
        return Ok(AuthenticatedSubject {
            subject_id: format!("github:{}", claims.repository),
            auth_type: PublisherType::TrustedPublisher,
            scopes: vec!["upload".into()],
            github_repository: Some(claims.repository),
            github_workflow: Some(claims.workflow),
            github_commit: Some(claims.sha),
        });
    }

    Err(ApiError::unauthorized("invalid credentials"))
}

/// Whether this subject may publish to an existing package: either a direct
/// publisher-id match, or -- for trusted publishers -- a repository match,
/// with the workflow basename checked when the stored row pins one.
pub fn is_authorized_publisher(record: &PackageRecord, subject: &AuthenticatedSubject) -> bool {
    for publisher in &record.publishers {
        if publisher.publisher_id == subject.subject_id {
            return true;
        }
        if subject.auth_type == PublisherType::TrustedPublisher
            && publisher.publisher_type == PublisherType::TrustedPublisher
        {
            match (&publisher.github_repository, &subject.github_repository) {
                (Some(stored), Some(claimed)) if stored == claimed => {
                    match (&publisher.github_workflow, &subject.github_workflow) {
                        (Some(stored_wf), Some(claimed_wf)) => {
                            if workflow_basename(stored_wf) == workflow_basename(claimed_wf) {
                                return true;
                            }
                        }
                        (Some(_), None) => (),
                        (None, _) => return true,
                    }
                }
                _ => (),
            }
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::store::test_support::sample_package;
    use crate::registry::store::{PublisherRecord, TokenRecord};

    struct AcceptAll;
    impl TokenVerifier for AcceptAll {
        fn verify_signature(&self, _token: &str) -> Result<()> {
            Ok(())
        }
    }

    struct RejectAll;
    impl TokenVerifier for RejectAll {
        fn verify_signature(&self, _token: &str) -> Result<()> {
            bail!("bad signature")
        }
    }

    fn make_jwt(payload: serde_json::Value) -> String {
        let encode =
            |bytes: &[u8]| data_encoding::BASE64URL_NOPAD.encode(bytes);
        format!(
            "{}.{}.{}",
            encode(br#"{"alg":"RS256","kid":"k1"}"#),
            encode(payload.to_string().as_bytes()),
            encode(b"signature"),
        )
    }

    #[test]
    fn test_generate_token_shape() {
        let (token, hash) = generate_token().unwrap();
        assert!(token.starts_with("isl_"));
        assert_eq!(hash, hash_token(&token));
        assert_eq!(hash.len(), 64);
        // two tokens never collide
        let (other, _) = generate_token().unwrap();
        assert_ne!(token, other);
    }

    #[test]
    fn test_parse_authorization_header() {
        assert_eq!(
            parse_authorization_header(Some("Bearer isl_abc")).as_deref(),
            Some("isl_abc")
        );
        assert_eq!(
            parse_authorization_header(Some("token apw_xyz")).as_deref(),
            Some("apw_xyz")
        );
        assert_eq!(
            parse_authorization_header(Some("isl_raw")).as_deref(),
            Some("isl_raw")
        );
        assert_eq!(
            parse_authorization_header(Some("apw_raw")).as_deref(),
            Some("apw_raw")
        );
        assert_eq!(parse_authorization_header(Some("Basic dXNlcg==")), None);
        assert_eq!(parse_authorization_header(Some("")), None);
        assert_eq!(parse_authorization_header(None), None);
        // bearer wrapping a non-prefixed credential still comes through
        assert_eq!(
            parse_authorization_header(Some("Bearer eyJhbGciOi.x.y")).as_deref(),
            Some("eyJhbGciOi.x.y")
        );
    }

    #[test]
    fn test_token_authentication() {
        let store = RegistryStore::temporary().unwrap();
        let config = RegistryConfig::default();
        let (token, hash) = generate_token().unwrap();
        store
            .put_token(&TokenRecord {
                token_hash: hash.clone(),
                user_id: "user-1".into(),
                name: None,
                scopes: "upload".into(),
                created_at: Utc::now(),
                expires_at: None,
                last_used_at: None,
                revoked: false,
            })
            .unwrap();

        let header = format!("Bearer {token}");
        let subject = authenticate(&store, &config, &AcceptAll, Some(&header)).unwrap();
        assert_eq!(subject.subject_id, "user-1");
        assert!(subject.has_scope("upload"));
        assert!(!subject.has_scope("admin"));

        // last_used_at was stamped
        assert!(store.get_token(&hash).unwrap().unwrap().last_used_at.is_some());

        // unknown token
        let err = authenticate(&store, &config, &AcceptAll, Some("isl_nope")).unwrap_err();
        assert_eq!(err.code, crate::registry::error::ErrorCode::Unauthorized);
    }

    #[test]
    fn test_revoked_and_expired_tokens_rejected() {
        let store = RegistryStore::temporary().unwrap();
        let config = RegistryConfig::default();

        let (revoked_token, revoked_hash) = generate_token().unwrap();
        store
            .put_token(&TokenRecord {
                token_hash: revoked_hash,
                user_id: "user-1".into(),
                name: None,
                scopes: "upload".into(),
                created_at: Utc::now(),
                expires_at: None,
                last_used_at: None,
                revoked: true,
            })
            .unwrap();
        assert!(authenticate(&store, &config, &AcceptAll, Some(&revoked_token)).is_err());

        let (expired_token, expired_hash) = generate_token().unwrap();
        store
            .put_token(&TokenRecord {
                token_hash: expired_hash,
                user_id: "user-1".into(),
                name: None,
                scopes: "upload".into(),
                created_at: Utc::now(),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                last_used_at: None,
                revoked: false,
            })
            .unwrap();
        assert!(authenticate(&store, &config, &AcceptAll, Some(&expired_token)).is_err());
    }

    #[test]
    fn test_wildcard_scope() {
        let subject = AuthenticatedSubject {
            subject_id: "user-1".into(),
            auth_type: PublisherType::User,
            scopes: vec!["*".into()],
            github_repository: None,
            github_workflow: None,
            github_commit: None,
        };
        assert!(subject.has_scope("upload"));
        assert!(subject.require_scope("anything").is_ok());
    }

    #[test]
    fn test_oidc_claim_checks() {
        let mut config = RegistryConfig::default();
        config.oidc_enabled = true;
        config.oidc_audience = Some("islands".into());

        let good = make_jwt(serde_json::json!({
            "iss": config.oidc_issuer,
            "aud": "islands",
            "exp": Utc::now().timestamp() + 600,
            "repository": "owner/repo",
            "workflow": ".github/workflows/release.yml",
            "sha": "abc123",
        }));
        let claims = verify_oidc_token(&good, &config, &AcceptAll).unwrap();
        assert_eq!(claims.repository, "owner/repo");
        assert_eq!(workflow_basename(&claims.workflow), "release.yml");

        // bad signature is fatal before claims are looked at
        assert!(verify_oidc_token(&good, &config, &RejectAll).is_err());

        let wrong_issuer = make_jwt(serde_json::json!({
            "iss": "https://evil.example",
            "aud": "islands",
            "exp": Utc::now().timestamp() + 600,
        }));
        assert!(verify_oidc_token(&wrong_issuer, &config, &AcceptAll).is_err());

        let expired = make_jwt(serde_json::json!({
            "iss": config.oidc_issuer,
            "aud": "islands",
            "exp": Utc::now().timestamp() - 600,
        }));
        assert!(verify_oidc_token(&expired, &config, &AcceptAll).is_err());

        let wrong_audience = make_jwt(serde_json::json!({
            "iss": config.oidc_issuer,
            "aud": "someone-else",
            "exp": Utc::now().timestamp() + 600,
        }));
        assert!(verify_oidc_token(&wrong_audience, &config, &AcceptAll).is_err());
    }

    #[test]
    fn test_oidc_authentication_builds_subject() {
        let store = RegistryStore::temporary().unwrap();
        let mut config = RegistryConfig::default();
        config.oidc_enabled = true;
        let jwt = make_jwt(serde_json::json!({
            "iss": config.oidc_issuer,
            "exp": Utc::now().timestamp() + 600,
            "repository": "owner/repo",
            "workflow": "release.yml",
            "sha": "fedcba",
        }));
        let header = format!("Bearer {jwt}");
        let subject = authenticate(&store, &config, &AcceptAll, Some(&header)).unwrap();
        assert_eq!(subject.subject_id, "github:owner/repo");
        assert_eq!(subject.auth_type, PublisherType::TrustedPublisher);
        assert_eq!(subject.github_repository.as_deref(), Some("owner/repo"));
    }

    #[test]
    fn test_publisher_authorization() {
        let record = sample_package("my-game", &[("1.0.0", false)]);

        let direct = AuthenticatedSubject {
            subject_id: "user-1".into(),
            auth_type: PublisherType::User,
            scopes: vec!["upload".into()],
            github_repository: None,
            github_workflow: None,
            github_commit: None,
        };
        assert!(is_authorized_publisher(&record, &direct));

        let stranger = AuthenticatedSubject {
            subject_id: "user-2".into(),
            ..direct.clone()
        };
        assert!(!is_authorized_publisher(&record, &stranger));
    }

    #[test]
    fn test_trusted_publisher_matching() {
        let mut record = sample_package("my-game", &[]);
        record.publishers.push(PublisherRecord {
            publisher_id: "github:owner/repo".into(),
            publisher_type: PublisherType::TrustedPublisher,
            is_owner: false,
            added_at: Utc::now(),
            github_repository: Some("owner/repo".into()),
            github_workflow: Some(".github/workflows/release.yml".into()),
        });

        let mut subject = AuthenticatedSubject {
            subject_id: "github:other-id".into(),
            auth_type: PublisherType::TrustedPublisher,
            scopes: vec!["upload".into()],
            github_repository: Some("owner/repo".into()),
            github_workflow: Some("release.yml".into()),
            github_commit: None,
        };
        assert!(is_authorized_publisher(&record, &subject));

        subject.github_workflow = Some("different.yml".into());
        assert!(!is_authorized_publisher(&record, &subject));

        subject.github_repository = Some("owner/fork".into());
        subject.github_workflow = Some("release.yml".into());
        assert!(!is_authorized_publisher(&record, &subject));
    }
}
