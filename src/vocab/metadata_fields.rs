use crate::prelude::*;

/// Parsed wheel METADATA / PKG-INFO headers.
///
/// The format claims to be an RFC 822 message, but in practice it's "whatever
/// Python's email.parser accepts": header lines, continuation lines indented
/// with whitespace, repeated keys, and an optional free-text body after the
/// first blank line. We're a little stricter than email.parser (empty field
/// names and leading continuation lines are errors) but lenient about
/// trailing newlines.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFields {
    pub fields: HashMap<String, Vec<String>>,
    pub body: Option<String>,
}

peg::parser! {
    grammar metadata_parser() for str {
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"} / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)} / expected!("field name")

        // email.parser drops " \t" after the colon but keeps other whitespace
        rule field_separator()
            = ":" [' ' | '\t']*

        rule value_piece()
            = [^ '\r' | '\n']*

        rule continuation()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        // Continuation lines keep their embedded newlines (email.parser does
        // not fold them), minus any trailing newline.
        rule field_value() -> &'input str
            = $(value_piece() ** continuation())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_owned(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        pub rule document() -> MetadataFields
            = f:fields() body:(trailing_body()?) line_ending()?
                {
                    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
                    for (name, value) in f {
                        fields.entry(name).or_default().push(value);
                    }
                    MetadataFields { fields, body }
                }
    }
}

impl MetadataFields {
    pub fn parse(input: &str) -> Result<MetadataFields> {
        Ok(metadata_parser::document(input)?)
    }

    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields.remove(key).unwrap_or_default()
    }

    pub fn maybe_take_one(&mut self, key: &str) -> Result<Option<String>> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => bail!("multiple values for singleton key {key}"),
        }
    }

    pub fn take_one(&mut self, key: &str) -> Result<String> {
        self.maybe_take_one(key)?
            .ok_or_else(|| anyhow!("missing required key {key}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_basic_parse() {
        let input = indoc! {r#"
            Metadata-Version: 2.1
            Name: pyyaml
            Version: 6.0.1
            Requires-Dist: typing-extensions ; python_version < "3.8"
            Requires-Dist: something[extra] (>=1.0)

            YAML parser and emitter.
        "#};
        let mut parsed = MetadataFields::parse(input).unwrap();
        assert_eq!(parsed.take_one("Name").unwrap(), "pyyaml");
        assert_eq!(parsed.take_one("Version").unwrap(), "6.0.1");
        assert_eq!(parsed.take_all("Requires-Dist").len(), 2);
        assert_eq!(parsed.take_all("Requires-Dist").len(), 0);
        assert_eq!(parsed.body.as_deref(), Some("YAML parser and emitter.\n"));
    }

    #[test]
    fn test_continuation_and_no_body() {
        let input = "A: b\nC: d\n   continued\n";
        let parsed = MetadataFields::parse(input).unwrap();
        assert_eq!(parsed.fields["A"], vec!["b"]);
        assert_eq!(parsed.fields["C"], vec!["d\n   continued"]);
        assert_eq!(parsed.body, None);

        let parsed = MetadataFields::parse("no: trailing newline").unwrap();
        assert_eq!(parsed.fields["no"], vec!["trailing newline"]);
    }

    #[test]
    fn test_take_one_semantics() {
        let mut parsed = MetadataFields::parse("dup: one\ndup: two\n").unwrap();
        assert!(parsed.take_one("dup").is_err());
        let mut parsed = MetadataFields::parse("x: y\n").unwrap();
        assert_eq!(parsed.maybe_take_one("absent").unwrap(), None);
        assert!(parsed.take_one("absent").is_err());
        assert_eq!(parsed.take_one("x").unwrap(), "y");
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["   leading continuation\nat: start\n", ": no name\n", "bad name: x\n"] {
            assert!(MetadataFields::parse(bad).is_err(), "{bad:?} should fail");
        }
    }
}
