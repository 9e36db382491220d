use crate::prelude::*;
use indexmap::IndexMap;

pub const CURRENT_SCHEMA_VERSION: u64 = 7;
pub const MIN_COMPATIBLE_VERSION: u64 = 5;

/// Operating systems a manifest may declare under "platforms".
pub const KNOWN_PLATFORMS: &[&str] = &["windows", "macos", "linux"];

pub const MAX_GAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_KEYWORD_LEN: usize = 50;

/// The island.json runtime manifest embedded in every .island archive.
///
/// Unknown keys are preserved through a round-trip (they land in `extra`), so
/// older tools keep newer manifests intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub game: String,
    /// Island schema version; always CURRENT_SCHEMA_VERSION when we write it.
    pub version: u64,
    pub compatible_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_ap_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_ap_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pure_python: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendored_dependencies: Option<VendoredDependencies>,
    pub entry_points: EntryPoints,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// Two generations of the vendored-dependencies section: the enhanced
/// per-package records the vendor pipeline emits, and the legacy bare
/// name -> version map. Both are accepted on input; we only ever write the
/// enhanced form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VendoredDependencies {
    Enhanced(IndexMap<String, VendoredPackageInfo>),
    Legacy(IndexMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendoredPackageInfo {
    pub version: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default = "default_true")]
    pub is_pure_python: bool,
    #[serde(default)]
    pub platform_tags: Vec<String>,
    #[serde(default)]
    pub direct_dependencies: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A single structured validation failure, pointing at the offending field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: impl Into<String>) -> ValidationIssue {
        ValidationIssue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Manifest {
    pub fn from_json(input: &str) -> Result<Manifest> {
        Ok(serde_json::from_str(input).context("parsing island.json")?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Collect every schema violation, not just the first one.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.game.is_empty() || self.game.len() > MAX_GAME_LEN {
            issues.push(ValidationIssue::new(
                "game",
                format!("must be 1-{MAX_GAME_LEN} characters"),
            ));
        }
        if self.version != CURRENT_SCHEMA_VERSION {
            issues.push(ValidationIssue::new(
                "version",
                format!("must be {CURRENT_SCHEMA_VERSION}"),
            ));
        }
        if self.compatible_version < MIN_COMPATIBLE_VERSION
            || self.compatible_version > CURRENT_SCHEMA_VERSION
        {
            issues.push(ValidationIssue::new(
                "compatible_version",
                format!("must be between {MIN_COMPATIBLE_VERSION} and {CURRENT_SCHEMA_VERSION}"),
            ));
        }

        for (field, value) in [
            ("world_version", &self.world_version),
            ("minimum_ap_version", &self.minimum_ap_version),
            ("maximum_ap_version", &self.maximum_ap_version),
        ] {
            if let Some(value) = value {
                if !Version::is_valid(value) {
                    issues.push(ValidationIssue::new(
                        field,
                        format!("{value:?} is not a valid semantic version"),
                    ));
                }
            }
        }

        for (i, author) in self.authors.iter().enumerate() {
            if author.is_empty() {
                issues.push(ValidationIssue::new(
                    &format!("authors[{i}]"),
                    "author cannot be empty",
                ));
            }
        }
        if let Some(description) = &self.description {
            if description.len() > MAX_DESCRIPTION_LEN {
                issues.push(ValidationIssue::new(
                    "description",
                    format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
                ));
            }
        }
        for (i, keyword) in self.keywords.iter().enumerate() {
            if keyword.is_empty() || keyword.len() > MAX_KEYWORD_LEN {
                issues.push(ValidationIssue::new(
                    &format!("keywords[{i}]"),
                    format!("must be 1-{MAX_KEYWORD_LEN} characters"),
                ));
            }
        }
        for (i, platform) in self.platforms.iter().enumerate() {
            if !KNOWN_PLATFORMS.contains(&platform.as_str()) {
                issues.push(ValidationIssue::new(
                    &format!("platforms[{i}]"),
                    format!("{platform:?} is not one of {KNOWN_PLATFORMS:?}"),
                ));
            }
        }

        match self.entry_points.group(AP_ISLAND_GROUP) {
            Some(entries) if !entries.is_empty() => {
                for (name, value) in entries {
                    if let Err(err) = validate_entry_point_value(name, value) {
                        issues.push(ValidationIssue::new(
                            &format!("entry_points.{AP_ISLAND_GROUP}.{name}"),
                            err.to_string(),
                        ));
                    }
                }
            }
            _ => issues.push(ValidationIssue::new(
                "entry_points",
                format!("at least one {AP_ISLAND_GROUP:?} entry point is required"),
            )),
        }

        issues
    }

    /// Like validate(), but as a Result for call sites that just want to
    /// abort on the first bad manifest.
    pub fn validate_strict(&self) -> Result<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            let rendered: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
            bail!("invalid island.json manifest:\n  {}", rendered.join("\n  "))
        }
    }

    /// Fill in the documented defaults for absent optional fields.
    pub fn apply_defaults(&mut self) {
        if self.description.is_none() {
            self.description = Some(String::new());
        }
        if self.license.is_none() {
            self.license = Some(String::new());
        }
        if self.platforms.is_empty() {
            self.platforms = KNOWN_PLATFORMS.iter().map(|p| p.to_string()).collect();
        }
        if self.pure_python.is_none() {
            self.pure_python = Some(true);
        }
    }
}
