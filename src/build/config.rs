use crate::manifest::{CURRENT_SCHEMA_VERSION, MIN_COMPATIBLE_VERSION};
use crate::prelude::*;
use std::path::{Path, PathBuf};

/// Build configuration, read from the project's island.toml.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub name: String,
    pub version: String,
    pub game_name: String,
    pub source_dir: PathBuf,
    pub description: Option<String>,
    pub authors: Vec<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    pub repository: Option<String>,
    pub keywords: Vec<String>,
    pub dependencies: Vec<String>,
    pub minimum_ap_version: Option<String>,
    pub maximum_ap_version: Option<String>,
    pub platforms: Vec<String>,
    pub schema_version: u64,
    pub compatible_version: u64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Option<Vec<String>>,
    pub vendor_exclude: Vec<String>,
    pub entry_points: EntryPoints,
}

// island.toml is split into sections; BuildConfig flattens them back out.
#[derive(Debug, Deserialize)]
struct IslandToml {
    package: PackageSection,
    #[serde(default)]
    build: BuildSection,
    #[serde(default)]
    vendor: VendorSection,
    #[serde(default)]
    entry_points: EntryPoints,
}

#[derive(Debug, Deserialize)]
struct PackageSection {
    name: String,
    version: String,
    game_name: String,
    description: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    license: Option<String>,
    homepage: Option<String>,
    repository: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BuildSection {
    source_dir: Option<PathBuf>,
    #[serde(default)]
    include: Vec<String>,
    exclude: Option<Vec<String>>,
    schema_version: Option<u64>,
    compatible_version: Option<u64>,
    #[serde(default)]
    platforms: Vec<String>,
    minimum_ap_version: Option<String>,
    maximum_ap_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VendorSection {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

impl BuildConfig {
    pub fn from_toml(input: &str) -> Result<BuildConfig> {
        let parsed: IslandToml =
            toml_edit::de::from_str(input).context("parsing island.toml")?;
        let config = BuildConfig {
            source_dir: parsed
                .build
                .source_dir
                .unwrap_or_else(|| PathBuf::from("src")),
            name: parsed.package.name,
            version: parsed.package.version,
            game_name: parsed.package.game_name,
            description: parsed.package.description,
            authors: parsed.package.authors,
            license: parsed.package.license,
            homepage: parsed.package.homepage,
            repository: parsed.package.repository,
            keywords: parsed.package.keywords,
            dependencies: parsed.vendor.dependencies,
            minimum_ap_version: parsed.build.minimum_ap_version,
            maximum_ap_version: parsed.build.maximum_ap_version,
            platforms: parsed.build.platforms,
            schema_version: parsed.build.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION),
            compatible_version: parsed
                .build
                .compatible_version
                .unwrap_or(CURRENT_SCHEMA_VERSION),
            include_patterns: parsed.build.include,
            exclude_patterns: parsed.build.exclude,
            vendor_exclude: parsed.vendor.exclude,
            entry_points: parsed.entry_points,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<BuildConfig> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = BuildConfig::from_toml(&input)?;
        // source_dir is relative to the config file
        if config.source_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.source_dir = parent.join(&config.source_dir);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        normalize_dist_name(&self.name)?;
        let _: Version = self
            .version
            .as_str()
            .try_into()
            .with_context(|| format!("package version {:?}", self.version))?;
        if self.game_name.is_empty() {
            bail!("game_name cannot be empty");
        }
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            bail!(
                "schema_version must be {CURRENT_SCHEMA_VERSION}, got {}",
                self.schema_version
            );
        }
        if self.compatible_version < MIN_COMPATIBLE_VERSION
            || self.compatible_version > self.schema_version
        {
            bail!(
                "compatible_version must be between {MIN_COMPATIBLE_VERSION} and {}",
                self.schema_version
            );
        }
        for (field, value) in [
            ("minimum_ap_version", &self.minimum_ap_version),
            ("maximum_ap_version", &self.maximum_ap_version),
        ] {
            if let Some(value) = value {
                if !Version::is_valid(value) {
                    bail!("{field} {value:?} is not a valid semantic version");
                }
            }
        }
        Ok(())
    }

    /// The underscore distribution form used for filenames and the in-archive
    /// package directory.
    pub fn normalized_name(&self) -> String {
        // validate() already proved the name normalizes
        normalize_dist_name(&self.name).unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn sample_toml() -> &'static str {
        indoc! {r#"
            [package]
            name = "my-game"
            version = "1.0.0"
            game_name = "My Game"
            description = "A game world"
            authors = ["A. Author"]
            license = "MIT"
            keywords = ["adventure"]

            [build]
            source_dir = "src/my_game"
            exclude = ["*.log"]
            minimum_ap_version = "0.5.0"

            [vendor]
            dependencies = ["pyyaml>=6.0"]
            exclude = ["typing-extensions"]

            [entry_points.ap-island]
            my_game = "my_game.world:MyWorld"
        "#}
    }

    #[test]
    fn test_parse_full_config() {
        let config = BuildConfig::from_toml(sample_toml()).unwrap();
        assert_eq!(config.name, "my-game");
        assert_eq!(config.normalized_name(), "my_game");
        assert_eq!(config.game_name, "My Game");
        assert_eq!(config.source_dir, PathBuf::from("src/my_game"));
        assert_eq!(config.dependencies, vec!["pyyaml>=6.0"]);
        assert_eq!(config.vendor_exclude, vec!["typing-extensions"]);
        assert_eq!(config.schema_version, 7);
        assert_eq!(config.compatible_version, 7);
        assert_eq!(config.exclude_patterns.as_deref(), Some(&["*.log".to_string()][..]));
        assert_eq!(
            config.entry_points.group(AP_ISLAND_GROUP).unwrap()["my_game"],
            "my_game.world:MyWorld"
        );
    }

    #[test]
    fn test_minimal_config() {
        let config = BuildConfig::from_toml(indoc! {r#"
            [package]
            name = "tiny"
            version = "0.1.0"
            game_name = "Tiny"
        "#})
        .unwrap();
        assert_eq!(config.source_dir, PathBuf::from("src"));
        assert!(config.dependencies.is_empty());
        assert!(config.entry_points.is_empty());
    }

    #[test]
    fn test_validation_failures() {
        for (original, patch) in [
            (r#"version = "1.0.0""#, r#"version = "1.0""#),
            (r#"name = "my-game""#, r#"name = "---""#),
            (r#"minimum_ap_version = "0.5.0""#, r#"minimum_ap_version = "latest""#),
        ] {
            let toml = sample_toml().replace(original, patch);
            assert!(
                BuildConfig::from_toml(&toml).is_err(),
                "{patch} should be rejected"
            );
        }
    }

    #[test]
    fn test_compatible_version_bounds() {
        let toml = sample_toml().replace("[build]", "[build]\ncompatible_version = 4");
        assert!(BuildConfig::from_toml(&toml).is_err());
        let toml = sample_toml().replace("[build]", "[build]\ncompatible_version = 5");
        assert!(BuildConfig::from_toml(&toml).is_ok());
    }
}
