use crate::prelude::*;
use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// A validated relative path: guaranteed relative, confined to its parent
/// directory, normalized, and made of filenames that are portable across
/// Windows/macOS/Linux. Archive member names go through this before they
/// touch the filesystem.
#[derive(Debug, PartialEq, Eq, Clone, DeserializeFromStr, SerializeDisplay)]
pub struct SafeRelPath {
    pieces: Vec<String>,
}

// https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
const NAUGHTY_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn check_piece(piece: &str) -> Result<&str> {
    if piece.is_empty() {
        bail!("path components must be non-empty");
    }
    if piece.contains(NAUGHTY_CHARS) || piece.contains(|c: char| c.is_ascii_control()) {
        bail!("invalid or non-portable characters in path component {piece:?}");
    }
    if piece.ends_with('.') || piece.ends_with(' ') {
        bail!("invalid or non-portable path component {piece:?}");
    }
    Ok(piece)
}

impl SafeRelPath {
    pub fn pieces(&self) -> &[String] {
        self.pieces.as_slice()
    }

    pub fn to_native(&self) -> PathBuf {
        self.pieces.iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

impl Display for SafeRelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pieces.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.pieces.join("/"))
        }
    }
}

impl TryFrom<&str> for SafeRelPath {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.starts_with('/') {
            bail!("expected relative path, got {value:?}");
        }
        let mut pieces: Vec<String> = Vec::new();
        for piece in value.split('/') {
            match piece {
                "" | "." => (),
                ".." => {
                    if pieces.pop().is_none() {
                        bail!("path {value:?} escapes parent directory");
                    }
                }
                piece => pieces.push(check_piece(piece)?.into()),
            }
        }
        Ok(SafeRelPath { pieces })
    }
}

try_from_str_boilerplate!(SafeRelPath);

/// Unpack a zip archive into `dest`, validating every member path first so a
/// hostile archive can't write outside the destination.
pub fn unpack_zip_carefully<T: Read + Seek>(z: &mut ZipArchive<T>, dest: &Path) -> Result<()> {
    for i in 0..z.len() {
        let mut zip_file = z.by_index(i)?;
        let path: SafeRelPath = zip_file
            .name()
            .try_into()
            .with_context(|| format!("unpacking zip member {:?}", zip_file.name()))?;
        if path.is_empty() {
            continue;
        }
        let full_path = dest.join(path.to_native());
        if zip_file.is_dir() {
            fs::create_dir_all(&full_path)?;
        } else {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&full_path)
                .with_context(|| format!("writing {}", full_path.display()))?;
            std::io::copy(&mut zip_file, &mut out)?;
        }
    }
    Ok(())
}
