use crate::build::config::BuildConfig;
use crate::build::island::generate_manifest;
use crate::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Excluded from archives unless the config overrides the exclude set.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "__pycache__",
    "*.py[co]",
    ".git",
    ".hg",
    ".svn",
    ".DS_Store",
    "*.egg-info",
    ".pytest_cache",
    ".mypy_cache",
    ".venv",
    "venv",
    "build",
    "dist",
];

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid glob pattern {p:?}")))
        .collect()
}

pub fn effective_exclude_patterns(config: &BuildConfig) -> Vec<String> {
    match &config.exclude_patterns {
        Some(patterns) => patterns.clone(),
        None => DEFAULT_EXCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect(),
    }
}

fn matches_any(patterns: &[glob::Pattern], candidate: &str) -> bool {
    patterns.iter().any(|p| p.matches(candidate))
}

/// Collect the files to package, relative to `source_dir`, sorted. Exclude
/// patterns are applied to the relative path and to every path segment;
/// a directory whose name matches is not descended into. A non-empty
/// include set restricts the survivors to files matching at least one
/// include pattern.
pub fn collect_package_files(
    source_dir: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> Result<Vec<PathBuf>> {
    let includes = compile_patterns(include_patterns)?;
    let excludes = compile_patterns(exclude_patterns)?;
    let mut collected = Vec::new();

    let walker = WalkDir::new(source_dir).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !matches_any(&excludes, &name)
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walkdir yielded a path outside its root");
        let rel_str = rel_path.to_string_lossy().replace('\\', "/");
        if matches_any(&excludes, &rel_str) {
            continue;
        }
        if !includes.is_empty() && !matches_any(&includes, &rel_str) {
            continue;
        }
        collected.push(rel_path.to_path_buf());
    }

    collected.sort();
    Ok(collected)
}

#[derive(Debug)]
pub struct SdistResult {
    pub path: PathBuf,
    pub filename: String,
    pub files_included: Vec<String>,
    pub size: u64,
}

/// Build a source distribution: the source tree plus island.json under a
/// `{name}-{version}/` prefix, as a gzipped tar.
pub fn build_sdist(
    config: &BuildConfig,
    output_dir: &Path,
    source_dir: Option<&Path>,
) -> Result<SdistResult> {
    std::fs::create_dir_all(output_dir)?;
    let src_dir = source_dir.unwrap_or(&config.source_dir);
    if !src_dir.exists() {
        bail!("source directory does not exist: {}", src_dir.display());
    }

    let filename = build_sdist_filename(&config.name, &config.version)?;
    let archive_path = output_dir.join(&filename);
    let prefix = format!(
        "{}-{}",
        config.normalized_name(),
        normalize_dist_version(&config.version)?
    );

    let result = write_sdist(config, src_dir, &archive_path, &prefix, &filename);
    if result.is_err() {
        let _ = std::fs::remove_file(&archive_path);
    }
    result
}

fn write_sdist(
    config: &BuildConfig,
    src_dir: &Path,
    archive_path: &Path,
    prefix: &str,
    filename: &str,
) -> Result<SdistResult> {
    let excludes = effective_exclude_patterns(config);
    let files = collect_package_files(src_dir, &config.include_patterns, &excludes)?;

    let out = std::fs::File::create(archive_path)?;
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut files_included = Vec::new();

    for rel_path in &files {
        let arcname = format!("{prefix}/{}", rel_path.to_string_lossy().replace('\\', "/"));
        builder.append_path_with_name(src_dir.join(rel_path), &arcname)?;
        files_included.push(arcname);
    }

    let manifest = generate_manifest(config, Some(&config.entry_points), None, true);
    let manifest_bytes = manifest.to_json()?.into_bytes();
    let manifest_arcname = format!("{prefix}/island.json");
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, &manifest_arcname, manifest_bytes.as_slice())?;
    files_included.push(manifest_arcname);

    builder.into_inner()?.finish()?;
    let size = std::fs::metadata(archive_path)?.len();
    info!("built sdist {filename} ({size} bytes)");

    Ok(SdistResult {
        path: archive_path.to_path_buf(),
        filename: filename.to_string(),
        files_included,
        size,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (path, contents) in files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
    }

    fn sample_config() -> BuildConfig {
        BuildConfig::from_toml(indoc! {r#"
            [package]
            name = "my-game"
            version = "1.0.0"
            game_name = "My Game"

            [entry_points.ap-island]
            my_game = "my_game.world:MyWorld"
        "#})
        .unwrap()
    }

    #[test]
    fn test_collect_respects_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("__init__.py", "x"),
                ("world.py", "y"),
                ("__pycache__/world.cpython-311.pyc", "z"),
                ("notes.log", "log"),
                ("sub/data.txt", "d"),
            ],
        );
        let excludes: Vec<String> = ["__pycache__", "*.log"].iter().map(|s| s.to_string()).collect();
        let files = collect_package_files(dir.path(), &[], &excludes).unwrap();
        let rendered: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered, ["__init__.py", "sub/data.txt", "world.py"]);
    }

    #[test]
    fn test_include_patterns_restrict() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("keep.py", "k"), ("notes.md", "n"), ("sub/also.py", "a")],
        );
        let includes = vec!["*.py".to_string()];
        let files = collect_package_files(dir.path(), &includes, &[]).unwrap();
        let rendered: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered, ["keep.py", "sub/also.py"]);
    }

    #[test]
    fn test_collect_matches_nested_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("a/keep.py", "k"), ("a/skip/deep.py", "d")]);
        let excludes = vec!["a/skip*".to_string()];
        let files = collect_package_files(dir.path(), &[], &excludes).unwrap();
        let rendered: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered, ["a/keep.py"]);
    }

    #[test]
    fn test_build_sdist() {
        let src = tempfile::tempdir().unwrap();
        write_tree(&src.path().join("x"), &[("__init__.py", "# init\n")]);
        let out = tempfile::tempdir().unwrap();
        let config = sample_config();
        let result =
            build_sdist(&config, out.path(), Some(&src.path().join("x"))).unwrap();
        assert_eq!(result.filename, "my_game-1.0.0.tar.gz");
        assert!(result.path.exists());
        assert!(result
            .files_included
            .contains(&"my_game-1.0.0/island.json".to_string()));

        // and it reads back
        let file = std::fs::File::open(&result.path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"my_game-1.0.0/__init__.py".to_string()));
    }

    #[test]
    fn test_missing_source_dir_is_fatal() {
        let out = tempfile::tempdir().unwrap();
        let config = sample_config();
        assert!(build_sdist(&config, out.path(), Some(Path::new("/no/such/dir"))).is_err());
    }
}
