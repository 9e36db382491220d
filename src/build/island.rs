use crate::build::config::BuildConfig;
use crate::build::sdist::{collect_package_files, effective_exclude_patterns};
use crate::build::wheel::{CoreMetadata, RecordFile, WheelMetadataFile};
use crate::manifest::{Manifest, VendoredDependencies, VendoredPackageInfo};
use crate::prelude::*;
use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions that mark a tree as containing native code.
pub const NATIVE_EXTENSIONS: &[&str] = &["so", "dylib", "dll", "pyd"];

// The ABI we target when we have to name the host platform ourselves.
const DEFAULT_PYTHON_TAG: &str = "cp311";

#[derive(Debug)]
pub struct IslandResult {
    pub path: PathBuf,
    pub filename: String,
    pub files_included: Vec<String>,
    pub manifest: Manifest,
    pub size: u64,
    pub is_pure_python: bool,
    pub platform_tag: PlatformTag,
}

#[derive(Debug, Default)]
pub struct BuildOptions<'a> {
    /// Overrides config.source_dir.
    pub source_dir: Option<&'a Path>,
    /// Tree of already-vendored dependencies, packaged under `_vendor/`.
    pub vendor_dir: Option<&'a Path>,
    /// Overrides platform detection entirely.
    pub platform_tag: Option<PlatformTag>,
    /// Overrides config.entry_points.
    pub entry_points: Option<&'a EntryPoints>,
    /// Per-package vendor records for the manifest, as produced by the
    /// vendor pipeline.
    pub vendored_info: Option<IndexMap<String, VendoredPackageInfo>>,
}

pub fn detect_native_extensions(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.path()
                .extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy().to_ascii_lowercase();
                    NATIVE_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false)
        })
}

/// Tag for the machine we're building on, for platform-specific trees that
/// don't tell us anything better.
pub fn host_platform_tag() -> PlatformTag {
    let platform = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("windows", "x86_64") => "win_amd64".to_string(),
        ("windows", "aarch64") => "win_arm64".to_string(),
        ("macos", "aarch64") => "macosx_11_0_arm64".to_string(),
        ("macos", _) => "macosx_11_0_x86_64".to_string(),
        ("linux", "x86_64") => "manylinux_2_17_x86_64".to_string(),
        ("linux", "aarch64") => "manylinux_2_17_aarch64".to_string(),
        (os, arch) => format!("{os}_{arch}"),
    };
    PlatformTag::new(DEFAULT_PYTHON_TAG, DEFAULT_PYTHON_TAG, &platform)
}

pub(crate) fn generate_manifest(
    config: &BuildConfig,
    entry_points: Option<&EntryPoints>,
    vendored_info: Option<&IndexMap<String, VendoredPackageInfo>>,
    is_pure_python: bool,
) -> Manifest {
    Manifest {
        game: config.game_name.clone(),
        version: config.schema_version,
        compatible_version: config.compatible_version,
        world_version: Some(config.version.clone()),
        minimum_ap_version: config.minimum_ap_version.clone(),
        maximum_ap_version: config.maximum_ap_version.clone(),
        authors: config.authors.clone(),
        description: config.description.clone(),
        license: config.license.clone(),
        homepage: config.homepage.clone(),
        repository: config.repository.clone(),
        keywords: config.keywords.clone(),
        platforms: config.platforms.clone(),
        pure_python: Some(is_pure_python),
        vendored_dependencies: vendored_info
            .filter(|info| !info.is_empty())
            .map(|info| VendoredDependencies::Enhanced(info.clone())),
        entry_points: entry_points.cloned().unwrap_or_default(),
        extra: Default::default(),
    }
}

/// Build a .island binary distribution.
///
/// Entry points are NOT validated here; call validate_entry_points()
/// separately to enforce the ap-island requirement. The split lets test
/// fixtures build unvalidated archives.
pub fn build_island(
    config: &BuildConfig,
    output_dir: &Path,
    options: BuildOptions<'_>,
) -> Result<IslandResult> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let src_dir = options.source_dir.unwrap_or(&config.source_dir);
    if !src_dir.exists() {
        bail!("source directory does not exist: {}", src_dir.display());
    }

    // Pure-python detection: native files in the source or vendor trees, or
    // any platform-specific vendored dependency.
    let mut has_native = detect_native_extensions(src_dir);
    if let Some(vendor_dir) = options.vendor_dir {
        if vendor_dir.exists() {
            has_native = has_native || detect_native_extensions(vendor_dir);
        }
    }
    if let Some(info) = &options.vendored_info {
        if info.values().any(|pkg| !pkg.is_pure_python) {
            has_native = true;
        }
    }
    let is_pure_python = !has_native;

    let platform_tag = match options.platform_tag.clone() {
        Some(tag) => tag,
        None if is_pure_python => PlatformTag::universal(),
        None => inherited_tag(options.vendored_info.as_ref()).unwrap_or_else(host_platform_tag),
    };

    let filename = build_island_filename(&config.name, &config.version, &platform_tag)?;
    let archive_path = output_dir.join(&filename);

    let manifest = generate_manifest(
        config,
        options.entry_points.or(Some(&config.entry_points)),
        options.vendored_info.as_ref(),
        is_pure_python,
    );

    let result = write_archive(
        config,
        &archive_path,
        src_dir,
        options.vendor_dir,
        &platform_tag,
        &manifest,
    );
    match result {
        Ok(files_included) => {
            let size = std::fs::metadata(&archive_path)?.len();
            info!("built {filename} ({size} bytes, {} files)", files_included.len());
            Ok(IslandResult {
                path: archive_path,
                filename,
                files_included,
                manifest,
                size,
                is_pure_python,
                platform_tag,
            })
        }
        Err(err) => {
            // never leave a half-written archive behind
            let _ = std::fs::remove_file(&archive_path);
            Err(err)
        }
    }
}

fn inherited_tag(
    vendored_info: Option<&IndexMap<String, VendoredPackageInfo>>,
) -> Option<PlatformTag> {
    let info = vendored_info?;
    info.values()
        .flat_map(|pkg| pkg.platform_tags.iter())
        .filter_map(|tag| PlatformTag::try_from(tag.as_str()).ok())
        .filter(|tag| !tag.is_pure_python())
        .max_by_key(|tag| (tag.specificity(), std::cmp::Reverse(tag.to_string())))
}

fn write_archive(
    config: &BuildConfig,
    archive_path: &Path,
    src_dir: &Path,
    vendor_dir: Option<&Path>,
    platform_tag: &PlatformTag,
    manifest: &Manifest,
) -> Result<Vec<String>> {
    let dist_info = DistInfoName::from_parts(&config.name, &config.version)?.to_string();
    let package_name = config.normalized_name();
    let excludes = effective_exclude_patterns(config);

    let file = std::fs::File::create(archive_path)
        .with_context(|| format!("creating {}", archive_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let zip_options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut files_included = Vec::new();
    let mut record = RecordFile::new(&format!("{dist_info}/RECORD"));

    let mut add_entry = |zip: &mut zip::ZipWriter<std::fs::File>,
                         record: &mut RecordFile,
                         files_included: &mut Vec<String>,
                         arcname: String,
                         content: &[u8]|
     -> Result<()> {
        zip.start_file(&arcname, zip_options)?;
        zip.write_all(content)?;
        record.add_content(&arcname, content);
        files_included.push(arcname);
        Ok(())
    };

    // source tree, then vendor tree, then dist-info: a fixed order so RECORD
    // checksums reproduce across builds
    for rel_path in collect_package_files(src_dir, &config.include_patterns, &excludes)? {
        let content = std::fs::read(src_dir.join(&rel_path))?;
        let arcname = format!(
            "{package_name}/{}",
            rel_path.to_string_lossy().replace('\\', "/")
        );
        add_entry(&mut zip, &mut record, &mut files_included, arcname, &content)?;
    }

    if let Some(vendor_dir) = vendor_dir {
        if vendor_dir.exists() {
            // include patterns scope the source tree only; the vendor tree
            // ships whole
            for rel_path in collect_package_files(vendor_dir, &[], &excludes)? {
                let content = std::fs::read(vendor_dir.join(&rel_path))?;
                let arcname = format!(
                    "{package_name}/_vendor/{}",
                    rel_path.to_string_lossy().replace('\\', "/")
                );
                add_entry(&mut zip, &mut record, &mut files_included, arcname, &content)?;
            }
        }
    }

    let wheel = WheelMetadataFile::from_platform_tag(platform_tag).render();
    add_entry(
        &mut zip,
        &mut record,
        &mut files_included,
        format!("{dist_info}/WHEEL"),
        wheel.as_bytes(),
    )?;

    let metadata = CoreMetadata::from_build_config(config).render();
    add_entry(
        &mut zip,
        &mut record,
        &mut files_included,
        format!("{dist_info}/METADATA"),
        metadata.as_bytes(),
    )?;

    if !manifest.entry_points.is_empty() {
        let ini = manifest.entry_points.to_ini();
        add_entry(
            &mut zip,
            &mut record,
            &mut files_included,
            format!("{dist_info}/entry_points.txt"),
            ini.as_bytes(),
        )?;
    }

    let manifest_json = manifest.to_json()?;
    add_entry(
        &mut zip,
        &mut record,
        &mut files_included,
        format!("{dist_info}/island.json"),
        manifest_json.as_bytes(),
    )?;

    // RECORD last, listing itself with no hash
    let record_arcname = format!("{dist_info}/RECORD");
    zip.start_file(&record_arcname, zip_options)?;
    zip.write_all(record.render().as_bytes())?;
    files_included.push(record_arcname);

    zip.finish()?;
    Ok(files_included)
}
