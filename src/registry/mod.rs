mod api;
mod auth;
mod config;
mod error;
mod models;
mod store;
mod verify;

pub use self::api::{routes, serve, RegistryService};
pub use self::auth::{
    generate_token, hash_token, parse_authorization_header, AuthenticatedSubject,
    JwksVerifier, OidcClaims, TokenVerifier,
};
pub use self::config::RegistryConfig;
pub use self::error::{ApiError, ErrorCode, FieldError};
pub use self::models::{
    DistributionRegistration, PackageRegistration, RegistrationResponse,
};
pub use self::store::{
    AuditRecord, AuthorRecord, DistributionRecord, EntryPointRecord, PackageRecord,
    PublisherRecord, PublisherType, RegistryStore, TokenRecord, UrlStatus, VersionRecord,
};
pub use self::verify::{verify_distributions, VerifyConfig};
