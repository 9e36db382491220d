use crate::error::IslandError;
use crate::prelude::*;

pub const AP_ISLAND_GROUP: &str = "ap-island";

// module.path:Attribute -- the shape every ap-island entry point must have.
static ENTRY_POINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*:[a-zA-Z_][a-zA-Z0-9_]*$")
        .unwrap()
});

/// Entry point groups, as written to entry_points.txt and island.json.
/// BTreeMaps keep groups and entries in sorted order so the emitted file is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints(pub BTreeMap<String, BTreeMap<String, String>>);

impl EntryPoints {
    pub fn add(&mut self, group: &str, name: &str, value: &str) {
        self.0
            .entry(group.into())
            .or_default()
            .insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|entries| entries.is_empty())
    }

    pub fn group(&self, group: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(group)
    }

    /// Render as INI-style entry_points.txt: groups in sorted order, entries
    /// sorted within each group, blank line between groups.
    pub fn to_ini(&self) -> String {
        let mut lines = Vec::new();
        for (group, entries) in &self.0 {
            if entries.is_empty() {
                continue;
            }
            lines.push(format!("[{group}]"));
            for (name, value) in entries {
                lines.push(format!("{name} = {value}"));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

/// Split an entry point value on the rightmost ":". Values with no colon get
/// an empty attr.
pub fn split_entry_point(value: &str) -> (String, String) {
    match value.rsplit_once(':') {
        Some((module, attr)) => (module.into(), attr.into()),
        None => (value.into(), String::new()),
    }
}

pub fn validate_entry_point_value(name: &str, value: &str) -> Result<(), IslandError> {
    if value.is_empty() {
        return Err(IslandError::InvalidEntryPoint {
            name: name.into(),
            value: value.into(),
            reason: "entry point value cannot be empty".into(),
        });
    }
    if !value.contains(':') {
        return Err(IslandError::InvalidEntryPoint {
            name: name.into(),
            value: value.into(),
            reason: "entry point must contain ':' separator (module.path:attribute)".into(),
        });
    }
    if !ENTRY_POINT_RE.is_match(value) {
        return Err(IslandError::InvalidEntryPoint {
            name: name.into(),
            value: value.into(),
            reason: "entry point must be 'module.path:attribute' with valid identifiers".into(),
        });
    }
    Ok(())
}

/// Enforce the island format requirement: at least one well-formed ap-island
/// entry point. Building and validation are deliberately separate so test
/// fixtures can build unvalidated archives.
pub fn validate_entry_points(entry_points: &EntryPoints) -> Result<(), IslandError> {
    let ap_island = match entry_points.group(AP_ISLAND_GROUP) {
        Some(entries) if !entries.is_empty() => entries,
        _ => return Err(IslandError::MissingEntryPoint),
    };
    for (name, value) in ap_island {
        validate_entry_point_value(name, value)?;
    }
    Ok(())
}

// Just enough configparser to read entry_points.txt back out of an archive:
// '=' assignment only, case-sensitive names, no continuation lines.
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[#;][^\n]*").unwrap());
static EMPTY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*$").unwrap());
static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[(?P<name>.+)\]\s*$").unwrap());
static ENTRY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
          ^
          (?P<name> .*?)
          \s* = \s*
          (?P<module> [a-zA-Z_][a-zA-Z0-9_.]*)
          \s*
          (: \s* (?P<object> [a-zA-Z_][a-zA-Z0-9_.]*))?
          \s*
          # extras are parsed and ignored
          (\[ .* \])?
          \s*
          $
        ",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub name: String,
    pub module: String,
    pub object: Option<String>,
}

pub fn parse_entry_points(contents: &str) -> Result<HashMap<String, Vec<Entrypoint>>> {
    let mut current_section: Option<String> = None;
    let mut current_entries = Vec::<Entrypoint>::new();
    let mut result = HashMap::<String, Vec<Entrypoint>>::new();
    for line in contents.split('\n') {
        let line = COMMENT.replace(line, "");
        if EMPTY_LINE.is_match(line.as_ref()) {
            continue;
        } else if let Some(captures) = HEADER_LINE.captures(line.as_ref()) {
            if let Some(section) = current_section.take() {
                if !current_entries.is_empty() {
                    result.insert(section, std::mem::take(&mut current_entries));
                }
            }
            current_entries.clear();
            current_section = Some(captures.name("name").unwrap().as_str().into());
        } else if let Some(captures) = ENTRY_LINE.captures(line.as_ref()) {
            if current_section.is_none() {
                bail!("entry before any section in entry_points.txt");
            }
            current_entries.push(Entrypoint {
                name: captures.name("name").unwrap().as_str().into(),
                module: captures.name("module").unwrap().as_str().into(),
                object: captures.name("object").map(|m| m.as_str().into()),
            });
        } else {
            bail!("malformed entry_points.txt line: '{line}'");
        }
    }
    if let Some(section) = current_section {
        if !current_entries.is_empty() {
            result.insert(section, current_entries);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_emit_sorted() {
        let mut eps = EntryPoints::default();
        eps.add("console_scripts", "b", "mod:b");
        eps.add(AP_ISLAND_GROUP, "my_game", "my_game.world:MyWorld");
        eps.add("console_scripts", "a", "mod:a");
        assert_eq!(
            eps.to_ini(),
            indoc! {"
                [ap-island]
                my_game = my_game.world:MyWorld

                [console_scripts]
                a = mod:a
                b = mod:b
            "}
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let ini = indoc! {"
            [ap-island]
            my_game = my_game.world:MyWorld

            # pytest plugins refer to a module, so there is no ':obj'
            [pytest11]
            nbval = nbval.plugin
        "};
        let parsed = parse_entry_points(ini).unwrap();
        assert_eq!(
            parsed["ap-island"],
            vec![Entrypoint {
                name: "my_game".into(),
                module: "my_game.world".into(),
                object: Some("MyWorld".into()),
            }]
        );
        assert_eq!(parsed["pytest11"][0].object, None);

        assert!(parse_entry_points("a = b\n").is_err());
    }

    #[test]
    fn test_split_entry_point() {
        assert_eq!(
            split_entry_point("my_game.world:MyWorld"),
            ("my_game.world".into(), "MyWorld".into())
        );
        assert_eq!(split_entry_point("my_game"), ("my_game".into(), String::new()));
    }

    #[test]
    fn test_validation() {
        let mut eps = EntryPoints::default();
        assert!(matches!(
            validate_entry_points(&eps),
            Err(IslandError::MissingEntryPoint)
        ));

        eps.add("console_scripts", "x", "mod:x");
        assert!(matches!(
            validate_entry_points(&eps),
            Err(IslandError::MissingEntryPoint)
        ));

        eps.add(AP_ISLAND_GROUP, "my_game", "my_game.world:MyWorld");
        assert!(validate_entry_points(&eps).is_ok());

        let mut bad = eps.clone();
        bad.add(AP_ISLAND_GROUP, "oops", "no_attribute");
        assert!(matches!(
            validate_entry_points(&bad),
            Err(IslandError::InvalidEntryPoint { .. })
        ));

        let mut bad = eps.clone();
        bad.add(AP_ISLAND_GROUP, "oops", "1mod:attr");
        assert!(validate_entry_points(&bad).is_err());
    }
}
