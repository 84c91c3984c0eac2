//! Source map support.

use serde_json::{json, Value};
use std::path::Path;

/// VLQ-encode a signed integer and append to output string.
fn vlq_encode(value: i64, out: &mut String) {
    const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20; // continuation bit
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

/// Number of lines in `code` as the bundle counts them.
#[must_use]
pub fn line_count(code: &str) -> u32 {
    u32::try_from(code.split('\n').count()).unwrap_or(u32::MAX)
}

/// A V3 map sending each line of `source` to itself.
#[must_use]
pub fn identity_map(source_path: &Path, source: &str) -> Value {
    let mut mappings = String::new();
    for line in 0..line_count(source) {
        if line > 0 {
            mappings.push(';');
        }
        // column 0, source 0, line delta (0 for the first, then +1), column 0
        vlq_encode(0, &mut mappings);
        vlq_encode(0, &mut mappings);
        vlq_encode(i64::from(line > 0), &mut mappings);
        vlq_encode(0, &mut mappings);
    }
    json!({
        "version": 3,
        "sources": [source_path.to_string_lossy()],
        "sourcesContent": [source],
        "names": [],
        "mappings": mappings,
    })
}

/// One section of an indexed map.
#[derive(Debug, Clone)]
pub struct Section {
    pub line: u32,
    pub map: Value,
}

/// Combine per-module maps into an indexed (sectioned) V3 map.
#[must_use]
pub fn indexed_map(file: &str, sections: &[Section]) -> Value {
    let sections: Vec<Value> = sections
        .iter()
        .map(|s| {
            json!({
                "offset": { "line": s.line, "column": 0 },
                "map": s.map,
            })
        })
        .collect();
    json!({
        "version": 3,
        "file": file,
        "sections": sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq() {
        let mut out = String::new();
        vlq_encode(0, &mut out);
        vlq_encode(1, &mut out);
        vlq_encode(-1, &mut out);
        vlq_encode(16, &mut out);
        assert_eq!(out, "ACDgB");
    }

    #[test]
    fn test_identity_map() {
        let map = identity_map(Path::new("/a.js"), "a;\nb;\nc;");
        assert_eq!(map["mappings"], "AAAA;AACA;AACA");
        assert_eq!(map["sources"][0], "/a.js");
    }

    #[test]
    fn test_indexed_map() {
        let map = indexed_map(
            "bundle.js",
            &[Section {
                line: 4,
                map: identity_map(Path::new("/a.js"), "a;"),
            }],
        );
        assert_eq!(map["sections"][0]["offset"]["line"], 4);
        assert_eq!(map["file"], "bundle.js");
    }
}
