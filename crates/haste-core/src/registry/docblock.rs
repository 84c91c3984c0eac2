//! Leading `/** ... */` comment parsing.

use rustc_hash::FxHashMap;

/// Directives found in a file's leading docblock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Docblock {
    directives: FxHashMap<String, String>,
}

impl Docblock {
    /// Parse the docblock at the top of `source`, if any.
    ///
    /// Only a block comment preceded by nothing but whitespace counts.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim_start_matches('\u{feff}').trim_start();
        let Some(body) = trimmed.strip_prefix("/**") else {
            return Self::default();
        };
        let Some(end) = body.find("*/") else {
            return Self::default();
        };

        let mut directives = FxHashMap::default();
        let mut current: Option<String> = None;
        for line in body[..end].lines() {
            let line = line.trim().trim_start_matches('*').trim();
            if let Some(rest) = line.strip_prefix('@') {
                let (key, value) = match rest.find(char::is_whitespace) {
                    Some(i) => (&rest[..i], rest[i..].trim()),
                    None => (rest, ""),
                };
                directives.insert(key.to_string(), value.to_string());
                current = Some(key.to_string());
            } else if !line.is_empty() {
                // Continuation lines extend the previous directive.
                if let Some(key) = &current {
                    if let Some(value) = directives.get_mut(key) {
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(line);
                    }
                }
            } else {
                current = None;
            }
        }
        Self { directives }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.directives.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    /// Haste id from `@providesModule` (or its `@provides` alias).
    ///
    /// Only the first whitespace-delimited token counts.
    #[must_use]
    pub fn provides_module(&self) -> Option<String> {
        let value = self.get("providesModule").or_else(|| self.get("provides"))?;
        value
            .split_whitespace()
            .next()
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
    }

    /// `@extern` marks generated code whose requires must not be followed.
    #[must_use]
    pub fn is_extern(&self) -> bool {
        self.has("extern")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provides_module() {
        let src = "/**\n * Copyright header\n *\n * @providesModule Foo\n * @flow\n */\nrequire('x');";
        let doc = Docblock::parse(src);
        assert_eq!(doc.provides_module().as_deref(), Some("Foo"));
        assert!(doc.has("flow"));
        assert!(!doc.is_extern());
    }

    #[test]
    fn test_provides_alias_first_token() {
        let doc = Docblock::parse("/** @provides Bar.ios trailing words */");
        assert_eq!(doc.provides_module().as_deref(), Some("Bar.ios"));
    }

    #[test]
    fn test_extern() {
        let doc = Docblock::parse("  /**\n * @extern\n */");
        assert!(doc.is_extern());
    }

    #[test]
    fn test_not_leading_comment() {
        let doc = Docblock::parse("var a = 1;\n/** @providesModule Late */");
        assert_eq!(doc.provides_module(), None);
        let doc = Docblock::parse("/* @providesModule Plain */");
        assert_eq!(doc.provides_module(), None);
    }
}
