mod config;
mod island;
mod sdist;
mod wheel;

pub use self::config::BuildConfig;
pub use self::island::{build_island, detect_native_extensions, BuildOptions, IslandResult};
pub use self::sdist::{build_sdist, SdistResult, DEFAULT_EXCLUDE_PATTERNS};
pub use self::wheel::{CoreMetadata, RecordFile, WheelMetadataFile, GENERATOR};
