use crate::prelude::*;
use std::cmp::Ordering;

/// A SemVer 2.0 version. Precedence follows the SemVer rules, with the usual
/// release-cycle stages given their conventional order:
///
///   1.0.0-alpha < 1.0.0-alpha.1 < 1.0.0-beta < 1.0.0-rc.1 < 1.0.0
///
/// Short spellings ("a", "b", "c") and "pre"/"preview" are folded into the
/// matching stage, and "alpha1"-style run-together suffixes compare
/// numerically within the stage. Build metadata never affects precedence; it
/// only breaks ties so that the total order stays consistent with equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

// https://semver.org/#is-there-a-suggested-regular-expression-regex-to-check-a-semver-string
static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x-u)
          ^(?P<major>0|[1-9]\d*)
          \.(?P<minor>0|[1-9]\d*)
          \.(?P<patch>0|[1-9]\d*)
          (?:-(?P<prerelease>(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)
              (?:\.(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*))?
          (?:\+(?P<build>[0-9a-zA-Z-]+(?:\.[0-9a-zA-Z-]+)*))?$
        ",
    )
    .unwrap()
});

impl Version {
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    pub fn base_version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// SemVer precedence, ignoring build metadata entirely. This is what
    /// "compatible_with" range checks use.
    pub fn compare_precedence(&self, other: &Version) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| {
                compare_prerelease(self.prerelease.as_deref(), other.prerelease.as_deref())
            })
    }

    pub fn is_valid(value: &str) -> bool {
        SEMVER_RE.is_match(value.trim())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_precedence(other)
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Stage order for named pre-release identifiers: alpha < beta < rc, with
// unknown names sorting after all of them.
fn stage_order(part: &str) -> Option<(u8, Option<u64>)> {
    for (stage, order) in [
        ("alpha", 0u8),
        ("beta", 1),
        ("preview", 0),
        ("pre", 0),
        ("rc", 2),
        ("a", 0),
        ("b", 1),
        ("c", 2),
    ] {
        if let Some(rest) = part.strip_prefix(stage) {
            if rest.is_empty() {
                return Some((order, None));
            }
            if rest.bytes().all(|b| b.is_ascii_digit()) {
                return Some((order, rest.parse().ok()));
            }
        }
    }
    None
}

fn compare_parts(a: &str, b: &str) -> Ordering {
    let a_num: Option<u64> = a.parse().ok();
    let b_num: Option<u64> = b.parse().ok();
    match (a_num, b_num) {
        (Some(x), Some(y)) => x.cmp(&y),
        // Numeric identifiers sort before alphanumeric ones.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => {
            let a_lower = a.to_ascii_lowercase();
            let b_lower = b.to_ascii_lowercase();
            match (stage_order(&a_lower), stage_order(&b_lower)) {
                (Some((sa, na)), Some((sb, nb))) => {
                    sa.cmp(&sb).then(na.cmp(&nb)).then_with(|| a.cmp(b))
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.cmp(b),
            }
        }
    }
}

fn compare_prerelease(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        // A release outranks any pre-release of the same core.
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let a_parts: Vec<&str> = a.split('.').collect();
            let b_parts: Vec<&str> = b.split('.').collect();
            for (pa, pb) in a_parts.iter().zip(b_parts.iter()) {
                match compare_parts(pa, pb) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                }
            }
            a_parts.len().cmp(&b_parts.len())
        }
    }
}

impl TryFrom<&str> for Version {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let captures = SEMVER_RE
            .captures(trimmed)
            .ok_or_else(|| anyhow!("invalid semantic version {:?}", value))?;
        // unwraps safe: these groups always match when the regex does
        Ok(Version {
            major: captures.name("major").unwrap().as_str().parse()?,
            minor: captures.name("minor").unwrap().as_str().parse()?,
            patch: captures.name("patch").unwrap().as_str().parse()?,
            prerelease: captures.name("prerelease").map(|m| m.as_str().to_owned()),
            build: captures.name("build").map(|m| m.as_str().to_owned()),
        })
    }
}

try_from_str_boilerplate!(Version);

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}
