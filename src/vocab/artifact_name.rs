use crate::prelude::*;

/// Normalize a package name for use in filenames and dist-info directories
/// (PEP 427 flavor): lowercase, separator runs collapsed to "_".
pub fn normalize_dist_name(name: &str) -> Result<String> {
    static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?-u)[-._\s]+").unwrap());
    static VALID: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_]*$").unwrap());

    if name.is_empty() {
        bail!("package name cannot be empty");
    }
    let normalized = SEPARATORS
        .replace_all(&name.to_ascii_lowercase(), "_")
        .trim_matches('_')
        .to_owned();
    if normalized.is_empty() || !VALID.is_match(&normalized) {
        bail!("invalid package name {:?} (normalizes to {:?})", name, normalized);
    }
    Ok(normalized)
}

/// Normalize a version for use in filenames: the pre-release separator "-"
/// becomes "_" so the filename stays splittable on hyphens.
pub fn normalize_dist_version(version: &str) -> Result<String> {
    if version.is_empty() {
        bail!("version cannot be empty");
    }
    Ok(version.replace('-', "_"))
}

// {name}-{version}(-{build})?-{python}-{abi}-{platform}.island
static ISLAND_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
          ^(?P<name>[a-zA-Z0-9][a-zA-Z0-9_]*)
          -(?P<version>[^-]+)
          (?:-(?P<build>\d+))?
          -(?P<python>[a-z0-9]+)
          -(?P<abi>[a-z0-9_]+)
          -(?P<platform>[a-z0-9_]+)
          \.island$
        ",
    )
    .unwrap()
});

// {name}-{version}.tar.gz
static SDIST_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[a-zA-Z0-9][a-zA-Z0-9_]*)-(?P<version>[^/]+)\.tar\.gz$").unwrap()
});

static DIST_INFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[a-zA-Z0-9][a-zA-Z0-9_]*)-(?P<version>[^-]+)\.dist-info$").unwrap()
});

/// A parsed `.island` filename (PEP 427 wheel conventions with our
/// extension). Name and version are in their normalized filename forms.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct IslandName {
    pub distribution: String,
    pub version: String,
    pub build_tag: Option<u32>,
    pub tag: PlatformTag,
}

impl IslandName {
    pub fn from_parts(
        name: &str,
        version: &str,
        build_tag: Option<u32>,
        tag: Option<PlatformTag>,
    ) -> Result<IslandName> {
        Ok(IslandName {
            distribution: normalize_dist_name(name)?,
            version: normalize_dist_version(version)?,
            build_tag,
            tag: tag.unwrap_or_else(PlatformTag::universal),
        })
    }
}

impl TryFrom<&str> for IslandName {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let captures = ISLAND_NAME_RE
            .captures(value)
            .ok_or_else(|| anyhow!("invalid island filename {:?}", value))?;
        Ok(IslandName {
            distribution: captures.name("name").unwrap().as_str().into(),
            version: captures.name("version").unwrap().as_str().into(),
            build_tag: captures.name("build").map(|m| m.as_str().parse()).transpose()?,
            tag: PlatformTag::new(
                captures.name("python").unwrap().as_str(),
                captures.name("abi").unwrap().as_str(),
                captures.name("platform").unwrap().as_str(),
            ),
        })
    }
}

try_from_str_boilerplate!(IslandName);

impl Display for IslandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution, self.version)?;
        if let Some(build) = self.build_tag {
            write!(f, "-{build}")?;
        }
        write!(f, "-{}.island", self.tag)
    }
}

/// A source distribution filename, `{name}-{version}.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct SdistName {
    pub distribution: String,
    pub version: String,
}

impl SdistName {
    pub fn from_parts(name: &str, version: &str) -> Result<SdistName> {
        Ok(SdistName {
            distribution: normalize_dist_name(name)?,
            version: normalize_dist_version(version)?,
        })
    }
}

impl TryFrom<&str> for SdistName {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let captures = SDIST_NAME_RE
            .captures(value)
            .ok_or_else(|| anyhow!("invalid sdist filename {:?}", value))?;
        Ok(SdistName {
            distribution: captures.name("name").unwrap().as_str().into(),
            version: captures.name("version").unwrap().as_str().into(),
        })
    }
}

try_from_str_boilerplate!(SdistName);

impl Display for SdistName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}.tar.gz", self.distribution, self.version)
    }
}

/// `{name}-{version}.dist-info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistInfoName {
    pub distribution: String,
    pub version: String,
}

impl DistInfoName {
    pub fn from_parts(name: &str, version: &str) -> Result<DistInfoName> {
        Ok(DistInfoName {
            distribution: normalize_dist_name(name)?,
            version: normalize_dist_version(version)?,
        })
    }
}

impl TryFrom<&str> for DistInfoName {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let captures = DIST_INFO_RE
            .captures(value)
            .ok_or_else(|| anyhow!("invalid dist-info directory name {:?}", value))?;
        Ok(DistInfoName {
            distribution: captures.name("name").unwrap().as_str().into(),
            version: captures.name("version").unwrap().as_str().into(),
        })
    }
}

try_from_str_boilerplate!(DistInfoName);

impl Display for DistInfoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}.dist-info", self.distribution, self.version)
    }
}

/// An upstream wheel filename, as downloaded by the dependency resolver.
/// Wheels allow compressed tag sets ("py2.py3-none-any"), so each tag slot
/// is a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelName {
    pub distribution: PackageName,
    pub version: String,
    pub build_tag: Option<String>,
    pub py_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub arch_tags: Vec<String>,
}

impl WheelName {
    /// Expand the compressed tag sets into concrete tag triples.
    pub fn expanded_tags(&self) -> Vec<PlatformTag> {
        let mut tags = Vec::new();
        for py in &self.py_tags {
            for abi in &self.abi_tags {
                for arch in &self.arch_tags {
                    tags.push(PlatformTag::new(py, abi, arch));
                }
            }
        }
        tags
    }

    pub fn is_pure_python(&self) -> bool {
        self.expanded_tags().iter().all(|t| t.is_pure_python())
    }
}

impl TryFrom<&str> for WheelName {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        static VALID_CHARS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+!-]*$").unwrap());
        if !VALID_CHARS.is_match(value) {
            bail!("invalid characters in wheel name {:?}", value);
        }
        let stem = value
            .strip_suffix(".whl")
            .ok_or_else(|| anyhow!("expected {:?} to end in .whl", value))?;

        let mut pieces: Vec<&str> = stem.split('-').collect();
        let build_tag = if pieces.len() == 6 {
            Some(pieces.remove(2).to_owned())
        } else {
            None
        };
        if pieces.len() != 5 {
            bail!("can't parse wheel name {:?}", value);
        }
        let split_tags = |compressed: &str| -> Vec<String> {
            compressed.split('.').map(|t| t.to_owned()).collect()
        };
        Ok(WheelName {
            distribution: pieces[0].try_into()?,
            version: pieces[1].into(),
            build_tag,
            py_tags: split_tags(pieces[2]),
            abi_tags: split_tags(pieces[3]),
            arch_tags: split_tags(pieces[4]),
        })
    }
}

try_from_str_boilerplate!(WheelName);

impl Display for WheelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution.as_given(), self.version)?;
        if let Some(build) = &self.build_tag {
            write!(f, "-{build}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.py_tags.join("."),
            self.abi_tags.join("."),
            self.arch_tags.join("."),
        )
    }
}

pub fn build_island_filename(
    name: &str,
    version: &str,
    tag: &PlatformTag,
) -> Result<String> {
    Ok(IslandName::from_parts(name, version, None, Some(tag.clone()))?.to_string())
}

pub fn build_sdist_filename(name: &str, version: &str) -> Result<String> {
    Ok(SdistName::from_parts(name, version)?.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_dist_name() {
        assert_eq!(normalize_dist_name("Pokemon-Emerald").unwrap(), "pokemon_emerald");
        assert_eq!(normalize_dist_name("my.game.world").unwrap(), "my_game_world");
        assert_eq!(normalize_dist_name("My  Game").unwrap(), "my_game");
        assert_eq!(normalize_dist_name("a--b__c").unwrap(), "a_b_c");
        assert!(normalize_dist_name("").is_err());
        assert!(normalize_dist_name("---").is_err());
        assert!(normalize_dist_name("né").is_err());
    }

    #[test]
    fn test_normalize_dist_version() {
        assert_eq!(normalize_dist_version("1.0.0-alpha.1").unwrap(), "1.0.0_alpha.1");
        assert_eq!(normalize_dist_version("2.0.0+build.123").unwrap(), "2.0.0+build.123");
        assert!(normalize_dist_version("").is_err());
    }

    #[test]
    fn test_island_name_roundtrip() {
        let n: IslandName = "pokemon_emerald-1.0.0-py3-none-any.island".try_into().unwrap();
        assert_eq!(n.distribution, "pokemon_emerald");
        assert_eq!(n.version, "1.0.0");
        assert_eq!(n.build_tag, None);
        assert_eq!(n.tag, PlatformTag::universal());
        assert_eq!(n.to_string(), "pokemon_emerald-1.0.0-py3-none-any.island");
    }

    #[test]
    fn test_island_name_with_build_tag() {
        let n: IslandName = "my_game-2.0.0-1-cp311-cp311-win_amd64.island"
            .try_into()
            .unwrap();
        assert_eq!(n.distribution, "my_game");
        assert_eq!(n.version, "2.0.0");
        assert_eq!(n.build_tag, Some(1));
        assert_eq!(n.tag.platform, "win_amd64");
        assert_eq!(n.to_string(), "my_game-2.0.0-1-cp311-cp311-win_amd64.island");
    }

    #[test]
    fn test_island_name_rejects() {
        for bad in [
            "my_game-1.0.0.island",
            "my_game-1.0.0-py3-none-any.whl",
            "-1.0.0-py3-none-any.island",
            "my game-1.0.0-py3-none-any.island",
        ] {
            let parsed: Result<IslandName> = bad.try_into();
            assert!(parsed.is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_build_filename_roundtrip() {
        // parse(build(name, version, tag)) == (normalize(name), normalize(version), tag)
        let cases = [
            ("Pokemon-Emerald", "1.0.0", PlatformTag::universal()),
            ("my-game", "2.0.0-alpha.1", PlatformTag::universal()),
            ("my.game", "1.2.3", PlatformTag::new("cp311", "cp311", "win_amd64")),
        ];
        for (name, version, tag) in cases {
            let filename = build_island_filename(name, version, &tag).unwrap();
            let parsed: IslandName = filename.as_str().try_into().unwrap();
            assert_eq!(parsed.distribution, normalize_dist_name(name).unwrap());
            assert_eq!(parsed.version, normalize_dist_version(version).unwrap());
            assert_eq!(parsed.tag, tag);
        }
    }

    #[test]
    fn test_sdist_name() {
        assert_eq!(
            build_sdist_filename("pokemon-emerald", "1.0.0").unwrap(),
            "pokemon_emerald-1.0.0.tar.gz"
        );
        let n: SdistName = "pokemon_emerald-1.0.0.tar.gz".try_into().unwrap();
        assert_eq!(n.distribution, "pokemon_emerald");
        assert_eq!(n.version, "1.0.0");
        let bad: Result<SdistName> = "pokemon_emerald-1.0.0.zip".try_into();
        assert!(bad.is_err());
    }

    #[test]
    fn test_dist_info_name() {
        let n = DistInfoName::from_parts("my-game", "1.0.0").unwrap();
        assert_eq!(n.to_string(), "my_game-1.0.0.dist-info");
        let parsed: DistInfoName = "my_game-1.0.0.dist-info".try_into().unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn test_wheel_name() {
        let n: WheelName = "trio-0.18.0-py3-none-any.whl".try_into().unwrap();
        assert_eq!(n.distribution.normalized(), "trio");
        assert_eq!(n.version, "0.18.0");
        assert!(n.is_pure_python());
        assert_eq!(n.to_string(), "trio-0.18.0-py3-none-any.whl");

        let n: WheelName = "foo.bar-0.1b3-1local-py2.py3-none-any.whl".try_into().unwrap();
        assert_eq!(n.build_tag.as_deref(), Some("1local"));
        assert_eq!(n.py_tags, vec!["py2", "py3"]);
        assert_eq!(n.expanded_tags().len(), 2);

        let n: WheelName = "numpy-1.24.1-cp311-cp311-manylinux_2_17_x86_64.whl"
            .try_into()
            .unwrap();
        assert!(!n.is_pure_python());
        assert_eq!(n.expanded_tags()[0].platform, "manylinux_2_17_x86_64");
    }
}
