use crate::prelude::*;

/// A PEP 425 compatibility tag triple, e.g. "py3-none-any" or
/// "cp311-cp311-manylinux_2_17_x86_64".
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PlatformTag {
    pub python: String,
    pub abi: String,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlatformFamily {
    Any,
    Linux,
    Macos,
    Windows,
    Other,
}

impl Display for PlatformFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlatformFamily::Any => "any",
            PlatformFamily::Linux => "linux",
            PlatformFamily::Macos => "macosx",
            PlatformFamily::Windows => "win",
            PlatformFamily::Other => "other",
        };
        write!(f, "{name}")
    }
}

impl PlatformTag {
    pub fn new(python: &str, abi: &str, platform: &str) -> PlatformTag {
        PlatformTag {
            python: python.into(),
            abi: abi.into(),
            platform: platform.into(),
        }
    }

    /// The universal tag for pure-Python packages.
    pub fn universal() -> PlatformTag {
        PlatformTag::new("py3", "none", "any")
    }

    pub fn is_pure_python(&self) -> bool {
        self.abi == "none" && self.platform == "any"
    }

    pub fn family(&self) -> PlatformFamily {
        let p = self.platform.as_str();
        if p == "any" {
            PlatformFamily::Any
        } else if p.starts_with("linux") || p.starts_with("manylinux") || p.starts_with("musllinux")
        {
            PlatformFamily::Linux
        } else if p.starts_with("macosx") {
            PlatformFamily::Macos
        } else if p.starts_with("win") {
            PlatformFamily::Windows
        } else {
            PlatformFamily::Other
        }
    }

    /// Specificity score: more restrictive tags score higher. Used both for
    /// platform-tag inheritance across a dependency graph and for picking the
    /// best distribution on download.
    pub fn specificity(&self) -> u32 {
        let mut score = 0;
        if self.platform != "any" {
            score += 20;
        }
        score += match self.abi.as_str() {
            "none" => 0,
            "abi3" => 5,
            _ => 10,
        };
        score += if self.python.starts_with("py") {
            0
        } else if self.python.starts_with("cp") {
            5
        } else {
            3
        };
        score
    }

    /// Whether a distribution carrying this tag can serve a request for
    /// `requested`. Universal distributions serve anything; otherwise each
    /// part must match, with "none"/"any" acting as wildcards and a generic
    /// "py3" python tag accepting any CPython 3.
    pub fn is_compatible_with(&self, requested: &PlatformTag) -> bool {
        if self.is_pure_python() {
            return true;
        }
        if self == requested {
            return true;
        }
        if self.python == "py3" {
            if !(requested.python == "py3" || requested.python.starts_with("cp3")) {
                return false;
            }
        } else if self.python != requested.python {
            return false;
        }
        if self.abi != "none" && self.abi != requested.abi {
            return false;
        }
        if self.platform != "any" && self.platform != requested.platform {
            return false;
        }
        true
    }
}

impl TryFrom<&str> for PlatformTag {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            bail!("invalid platform tag {:?}", value);
        }
        // Be forgiving of stray hyphens in the platform part; they all
        // belong to the platform component.
        Ok(PlatformTag {
            python: parts[0].into(),
            abi: parts[1].into(),
            platform: parts[2..].join("-"),
        })
    }
}

try_from_str_boilerplate!(PlatformTag);

impl Display for PlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.python, self.abi, self.platform)
    }
}
