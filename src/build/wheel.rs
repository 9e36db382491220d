use crate::build::BuildConfig;
use crate::checksum::sha256_record_digest;
use crate::prelude::*;

pub const GENERATOR: &str = "island-build";
pub const WHEEL_VERSION: &str = "1.0";
pub const METADATA_VERSION: &str = "2.1";

/// The PEP 427 WHEEL file.
#[derive(Debug, Clone)]
pub struct WheelMetadataFile {
    pub root_is_purelib: bool,
    pub tags: Vec<String>,
}

impl WheelMetadataFile {
    pub fn from_platform_tag(tag: &PlatformTag) -> WheelMetadataFile {
        WheelMetadataFile {
            root_is_purelib: tag.is_pure_python(),
            tags: vec![tag.to_string()],
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Wheel-Version: {WHEEL_VERSION}"),
            format!("Generator: {GENERATOR}"),
            format!(
                "Root-Is-Purelib: {}",
                if self.root_is_purelib { "true" } else { "false" }
            ),
        ];
        for tag in &self.tags {
            lines.push(format!("Tag: {tag}"));
        }
        lines.join("\n") + "\n"
    }
}

/// The PEP 566 METADATA file. Island packages vendor every runtime
/// dependency, so this never carries Requires-Dist.
#[derive(Debug, Clone, Default)]
pub struct CoreMetadata {
    pub name: String,
    pub version: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub keywords: Vec<String>,
    pub home_page: Option<String>,
    pub project_urls: Vec<(String, String)>,
    pub description: Option<String>,
}

impl CoreMetadata {
    pub fn from_build_config(config: &BuildConfig) -> CoreMetadata {
        let mut project_urls = Vec::new();
        if let Some(homepage) = &config.homepage {
            project_urls.push(("Homepage".to_string(), homepage.clone()));
        }
        if let Some(repository) = &config.repository {
            project_urls.push(("Repository".to_string(), repository.clone()));
        }
        CoreMetadata {
            name: config.name.clone(),
            version: config.version.clone(),
            summary: config.description.clone(),
            author: if config.authors.is_empty() {
                None
            } else {
                Some(config.authors.join(", "))
            },
            license: config.license.clone(),
            keywords: config.keywords.clone(),
            home_page: config.homepage.clone(),
            project_urls,
            description: config.description.clone(),
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Metadata-Version: {METADATA_VERSION}"),
            format!("Name: {}", self.name),
            format!("Version: {}", self.version),
        ];
        if let Some(summary) = non_empty(&self.summary) {
            lines.push(format!("Summary: {summary}"));
        }
        if let Some(author) = non_empty(&self.author) {
            lines.push(format!("Author: {author}"));
        }
        if let Some(license) = non_empty(&self.license) {
            lines.push(format!("License: {license}"));
        }
        if !self.keywords.is_empty() {
            lines.push(format!("Keywords: {}", self.keywords.join(",")));
        }
        if let Some(home_page) = non_empty(&self.home_page) {
            lines.push(format!("Home-page: {home_page}"));
        }
        for (label, target) in &self.project_urls {
            lines.push(format!("Project-URL: {label}, {target}"));
        }
        if let Some(description) = non_empty(&self.description) {
            lines.push("Description-Content-Type: text/plain".to_string());
            lines.push(String::new());
            lines.push(description.to_string());
        }
        lines.join("\n") + "\n"
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// The PEP 427 RECORD manifest: one CSV line per archive member with its
/// urlsafe-base64 SHA-256 and size; RECORD lists itself with both empty.
#[derive(Debug, Clone, Default)]
pub struct RecordFile {
    entries: Vec<(String, String, Option<u64>)>,
    record_path: String,
}

impl RecordFile {
    pub fn new(record_path: &str) -> RecordFile {
        RecordFile {
            entries: Vec::new(),
            record_path: record_path.into(),
        }
    }

    pub fn add_content(&mut self, path: &str, content: &[u8]) {
        self.entries.push((
            path.into(),
            sha256_record_digest(content),
            Some(content.len() as u64),
        ));
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|(path, digest, size)| {
                let size = size.map(|s| s.to_string()).unwrap_or_default();
                format!("{path},{digest},{size}")
            })
            .collect();
        if !self.record_path.is_empty() {
            lines.push(format!("{},,", self.record_path));
        }
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_wheel_file() {
        let wheel = WheelMetadataFile::from_platform_tag(&PlatformTag::universal());
        assert_eq!(
            wheel.render(),
            indoc! {"
                Wheel-Version: 1.0
                Generator: island-build
                Root-Is-Purelib: true
                Tag: py3-none-any
            "}
        );

        let wheel = WheelMetadataFile::from_platform_tag(&PlatformTag::new(
            "cp311",
            "cp311",
            "win_amd64",
        ));
        assert!(wheel.render().contains("Root-Is-Purelib: false"));
        assert!(wheel.render().contains("Tag: cp311-cp311-win_amd64"));
    }

    #[test]
    fn test_metadata_never_has_requires_dist() {
        let config = BuildConfig::from_toml(indoc! {r#"
            [package]
            name = "my-game"
            version = "1.0.0"
            game_name = "My Game"
            description = "A game"
            authors = ["A", "B"]

            [vendor]
            dependencies = ["pyyaml>=6.0", "scipy"]
        "#})
        .unwrap();
        let rendered = CoreMetadata::from_build_config(&config).render();
        assert!(rendered.starts_with("Metadata-Version: 2.1\nName: my-game\nVersion: 1.0.0\n"));
        assert!(rendered.contains("Author: A, B"));
        assert!(rendered.contains("\n\nA game\n"));
        assert!(!rendered.contains("Requires-Dist"));
    }

    #[test]
    fn test_record_file() {
        let mut record = RecordFile::new("my_game-1.0.0.dist-info/RECORD");
        record.add_content("my_game/__init__.py", b"# init\n");
        let rendered = record.render();
        let mut lines = rendered.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("my_game/__init__.py,sha256="));
        assert!(first.ends_with(",7"));
        assert_eq!(lines.next().unwrap(), "my_game-1.0.0.dist-info/RECORD,,");
        assert_eq!(lines.next(), None);
    }
}
