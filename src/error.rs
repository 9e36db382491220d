use thiserror::Error;

#[derive(Error, Debug)]
pub enum IslandError {
    #[error(
        "island packages must declare at least one [entry_points.ap-island] entry \
         referencing the world implementation"
    )]
    MissingEntryPoint,
    #[error("invalid entry point '{name} = {value}': {reason}")]
    InvalidEntryPoint {
        name: String,
        value: String,
        reason: String,
    },
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("incompatible platform families in dependency graph: {families}")]
    IncompatiblePlatforms { families: String },
    #[error("failed to vendor '{package}' (dependency chain: {chain}): {message}")]
    DependencyChain {
        package: String,
        chain: String,
        message: String,
    },
}
