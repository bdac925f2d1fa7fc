use serde::{Deserialize, Serialize};
use std::fmt;

/// Path delimiter used by the structure oracle between hierarchical components.
pub const DEFAULT_PATH_DELIMITER: char = '~';

/// A labeled, inclusive byte range `[start, end]` reported by the structure oracle.
///
/// `path` keeps the verbose oracle label (repeated elements still carry their `_<n>` suffix).
/// Canonicalization only happens when a span is turned into a storage or blacklist key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub path: String,
    pub tag: Option<String>,
}

impl Span {
    pub fn new(start: usize, end: usize, path: impl Into<String>) -> Self {
        Self {
            start,
            end,
            path: path.into(),
            tag: None,
        }
    }

    /// Distance between the first and last byte, the quantity bounded by `max-span-bytes`.
    pub fn width(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Number of bytes covered.
    pub fn byte_count(&self) -> usize {
        self.width() + 1
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn components(&self, delimiter: char) -> impl Iterator<Item = &str> {
        self.path.split(delimiter)
    }

    /// Last path component exactly as emitted by the oracle.
    pub fn leaf(&self, delimiter: char) -> &str {
        self.path.rsplit(delimiter).next().unwrap_or(&self.path)
    }

    /// Last path component with any `_<digits>` repetition suffix removed.
    pub fn canonical_name(&self, delimiter: char) -> &str {
        canonicalize_component(self.leaf(delimiter))
    }

    /// Bytes covered by this span, or `None` when it runs past the end of `data`.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        if self.start > self.end || self.end >= data.len() {
            return None;
        }
        Some(&data[self.start..=self.end])
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.start, self.end, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ",{tag}")?;
        }
        Ok(())
    }
}

/// Strips a trailing `_<digits>` repeated-occurrence suffix: `chunk_3` becomes `chunk`.
///
/// `chunkSize_temp` and `name_` are returned unchanged.
pub fn canonicalize_component(component: &str) -> &str {
    match component.rsplit_once('_') {
        Some((name, suffix))
            if !name.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => component,
    }
}

/// True when the component carries a `_<digits>` occurrence suffix.
pub fn is_repeated_occurrence(component: &str) -> bool {
    canonicalize_component(component).len() != component.len()
}

/// Parses one `start,end,label[,tag]` oracle line. Malformed lines yield `None`.
pub fn parse_oracle_line(line: &str) -> Option<Span> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(4, ',');
    let start = parts.next()?.trim().parse::<usize>().ok()?;
    let end = parts.next()?.trim().parse::<usize>().ok()?;
    let path = parts.next()?.trim();
    if path.is_empty() || end < start {
        return None;
    }
    let tag = parts
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Some(Span {
        start,
        end,
        path: path.to_string(),
        tag,
    })
}

/// Parses a whole oracle transcript, skipping anything that is not a span line.
pub fn parse_oracle_output(output: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    for line in output.lines() {
        match parse_oracle_line(line) {
            Some(span) => spans.push(span),
            None => {
                if !line.trim().is_empty() {
                    tracing::debug!("Skipping malformed oracle line: {line:?}");
                }
            }
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_only_digit_suffixes() {
        assert_eq!(canonicalize_component("chunk_3"), "chunk");
        assert_eq!(canonicalize_component("chunk"), "chunk");
        assert_eq!(canonicalize_component("chunkSize_temp"), "chunkSize_temp");
        assert_eq!(canonicalize_component("record_12"), "record");
        assert_eq!(canonicalize_component("name_"), "name_");
        assert_eq!(canonicalize_component("_7"), "_7");
        assert!(is_repeated_occurrence("subchunk_1"));
        assert!(!is_repeated_occurrence("subchunk"));
    }

    #[test]
    fn span_paths_keep_verbose_form() {
        let span = Span::new(45, 48, "file~chunk_1~crc");
        assert_eq!(span.leaf('~'), "crc");
        assert_eq!(span.canonical_name('~'), "crc");
        assert_eq!(span.components('~').collect::<Vec<_>>(), vec!["file", "chunk_1", "crc"]);
        assert_eq!(span.width(), 3);
        assert_eq!(span.byte_count(), 4);
    }

    #[test]
    fn parses_lines_with_and_without_tag() {
        let span = parse_oracle_line("24,24,file~chunk~ihdr~bits,Optional").unwrap();
        assert_eq!(span.start, 24);
        assert_eq!(span.end, 24);
        assert_eq!(span.path, "file~chunk~ihdr~bits");
        assert_eq!(span.tag.as_deref(), Some("Optional"));

        let span = parse_oracle_line("0,7,file~sig~btPngSignature").unwrap();
        assert_eq!(span.tag, None);
        assert_eq!(span.to_string(), "0,7,file~sig~btPngSignature");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_oracle_line("").is_none());
        assert!(parse_oracle_line("1,2").is_none());
        assert!(parse_oracle_line("a,2,file").is_none());
        assert!(parse_oracle_line("5,2,file~x").is_none());
        let spans = parse_oracle_output("garbage\n0,3,file~hdr\n\n4,x,file~bad\n4,5,file~ver\n");
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn slice_respects_file_bounds() {
        let data = [1u8, 2, 3, 4];
        assert_eq!(Span::new(1, 2, "f~a").slice(&data), Some(&data[1..=2]));
        assert_eq!(Span::new(2, 4, "f~a").slice(&data), None);
    }
}
