mod artifact_name;
mod entry_points;
mod metadata_fields;
mod package_name;
mod platform_tag;
mod version;

// All this stuff is also re-exported from crate::prelude::*

pub use self::artifact_name::{
    build_island_filename, build_sdist_filename, normalize_dist_name,
    normalize_dist_version, DistInfoName, IslandName, SdistName, WheelName,
};
pub use self::entry_points::{
    parse_entry_points, split_entry_point, validate_entry_point_value,
    validate_entry_points, EntryPoints, Entrypoint, AP_ISLAND_GROUP,
};
pub use self::metadata_fields::MetadataFields;
pub use self::package_name::PackageName;
pub use self::platform_tag::{PlatformFamily, PlatformTag};
pub use self::version::Version;
