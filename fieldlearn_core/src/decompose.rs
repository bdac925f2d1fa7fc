use crate::span::{Span, is_repeated_occurrence};
use crate::value_store::ValueStore;

/// The two non-overlapping partitions derived from one file's oracle output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decomposition {
    /// Maximal top-level spans, no size bound.
    pub structural: Vec<Span>,
    /// Smallest spans within `max-span-bytes`, used for value extraction and mutation targeting.
    pub learning: Vec<Span>,
}

impl Decomposition {
    /// Canonical leaf names of the learning spans.
    pub fn learning_names(&self, delimiter: char) -> std::collections::BTreeSet<String> {
        self.learning
            .iter()
            .map(|s| s.canonical_name(delimiter).to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.structural.is_empty() && self.learning.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpanDecomposer {
    max_span_bytes: usize,
    delimiter: char,
}

impl SpanDecomposer {
    pub fn new(max_span_bytes: usize, delimiter: char) -> Self {
        Self {
            max_span_bytes,
            delimiter,
        }
    }

    /// Splits `raw` into its structural and learning decompositions.
    ///
    /// Every raw span wider than the bound blacklists its canonical leaf name in `store` (by size),
    /// and blacklisted names never reach the learning decomposition.
    pub fn decompose(&self, raw: &[Span], store: &mut ValueStore) -> Decomposition {
        let mut sorted = raw.to_vec();
        sorted.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        for span in sorted.iter().filter(|s| s.width() > self.max_span_bytes) {
            let name = span.canonical_name(self.delimiter);
            if store.blacklist_by_size(name) {
                tracing::debug!(
                    "Blacklisting '{name}' by size: {} bytes at {}..={}",
                    span.byte_count(),
                    span.start,
                    span.end
                );
            }
        }

        sorted.retain(|s| !self.is_duplicate_occurrence(s));

        let structural = accept_siblings(sorted.iter());

        let candidates: Vec<&Span> = sorted
            .iter()
            .filter(|s| s.width() <= self.max_span_bytes)
            .filter(|s| !store.is_blacklisted(s.canonical_name(self.delimiter)))
            .collect();
        let learning = accept_siblings(innermost(&candidates).into_iter());

        Decomposition {
            structural,
            learning,
        }
    }

    fn is_duplicate_occurrence(&self, span: &Span) -> bool {
        span.start == span.end && is_repeated_occurrence(span.leaf(self.delimiter))
    }
}

/// Greedy left-to-right scan over spans sorted by `(start asc, end desc)`: a span is accepted
/// when it starts after the end of the last accepted one.
fn accept_siblings<'a>(spans: impl Iterator<Item = &'a Span>) -> Vec<Span> {
    let mut frontier: Option<usize> = None;
    let mut accepted = Vec::new();
    for span in spans {
        if frontier.is_none_or(|f| span.start > f) {
            frontier = Some(span.end);
            accepted.push(span.clone());
        }
    }
    accepted
}

/// Spans that strictly contain no other span of the (sorted) input.
fn innermost<'a>(sorted: &[&'a Span]) -> Vec<&'a Span> {
    let mut result = Vec::with_capacity(sorted.len());
    for (i, outer) in sorted.iter().enumerate() {
        let encloses_another = sorted[i + 1..]
            .iter()
            .take_while(|inner| inner.start <= outer.end)
            .any(|inner| {
                inner.end <= outer.end && (inner.start, inner.end) != (outer.start, outer.end)
            });
        if !encloses_another {
            result.push(*outer);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(spans: &[Span]) -> Vec<(usize, usize, &str)> {
        spans
            .iter()
            .map(|s| (s.start, s.end, s.leaf('~')))
            .collect()
    }

    #[test]
    fn nested_header_splits_into_fields_and_parent() {
        let raw = vec![
            Span::new(0, 2, "file~hdr~sig"),
            Span::new(3, 5, "file~hdr~ver"),
            Span::new(0, 5, "file~hdr"),
        ];
        let mut store = ValueStore::new(30);
        let d = SpanDecomposer::new(8, '~').decompose(&raw, &mut store);
        assert_eq!(ranges(&d.learning), vec![(0, 2, "sig"), (3, 5, "ver")]);
        assert_eq!(ranges(&d.structural), vec![(0, 5, "hdr")]);
        assert!(store.blacklists().is_empty());
    }

    #[test]
    fn oversized_span_is_blacklisted_and_excluded() {
        let raw = vec![
            Span::new(0, 10, "file~payload"),
            Span::new(11, 12, "file~tail"),
        ];
        let mut store = ValueStore::new(30);
        store.insert(&["file", "other", "payload"], "00");
        let d = SpanDecomposer::new(8, '~').decompose(&raw, &mut store);
        assert!(store.blacklists().by_size.contains("payload"));
        assert!(!store.contains_name("payload"), "existing entries purged");
        assert_eq!(ranges(&d.learning), vec![(11, 12, "tail")]);
        assert_eq!(d.structural.len(), 2);
        assert!(!store.insert(&["file", "payload"], "01"));
    }

    #[test]
    fn smaller_synonym_of_blacklisted_field_stays_out() {
        let raw = vec![
            Span::new(0, 20, "file~chunk_0~data"),
            Span::new(21, 23, "file~chunk_1~data"),
        ];
        let mut store = ValueStore::new(30);
        let d = SpanDecomposer::new(8, '~').decompose(&raw, &mut store);
        assert!(store.blacklists().by_size.contains("data"));
        assert!(d.learning.is_empty());
    }

    #[test]
    fn single_byte_occurrence_leaves_are_dropped() {
        let raw = vec![
            Span::new(0, 0, "file~entries~entry_0"),
            Span::new(1, 1, "file~entries~entry_1"),
            Span::new(2, 2, "file~flag"),
        ];
        let mut store = ValueStore::new(30);
        let d = SpanDecomposer::new(8, '~').decompose(&raw, &mut store);
        assert_eq!(ranges(&d.learning), vec![(2, 2, "flag")]);
    }

    #[test]
    fn unsorted_input_and_out_of_order_siblings() {
        let raw = vec![
            Span::new(8, 11, "file~chunk_1"),
            Span::new(4, 7, "file~chunk_0"),
            Span::new(0, 3, "file~magic"),
            Span::new(4, 7, "file~chunk_0~len"),
        ];
        let mut store = ValueStore::new(30);
        let d = SpanDecomposer::new(8, '~').decompose(&raw, &mut store);
        assert_eq!(
            ranges(&d.structural),
            vec![(0, 3, "magic"), (4, 7, "chunk_0"), (8, 11, "chunk_1")]
        );
        assert_eq!(
            ranges(&d.learning),
            vec![(0, 3, "magic"), (4, 7, "chunk_0"), (8, 11, "chunk_1")]
        );
    }

    #[test]
    fn empty_input_is_a_valid_outcome() {
        let mut store = ValueStore::new(30);
        let d = SpanDecomposer::new(8, '~').decompose(&[], &mut store);
        assert!(d.is_empty());
    }

    fn arb_spans() -> impl Strategy<Value = Vec<Span>> {
        prop::collection::vec((0usize..64, 0usize..24, 0usize..6), 0..40).prop_map(|raw| {
            raw.into_iter()
                .map(|(start, len, name)| Span::new(start, start + len, format!("file~f{name}")))
                .collect()
        })
    }

    /// Top-level spans tiling `[0, n)`, each optionally split into two children.
    fn arb_covering() -> impl Strategy<Value = (usize, Vec<Span>)> {
        prop::collection::vec((1usize..20, any::<bool>()), 1..12).prop_map(|parts| {
            let mut spans = Vec::new();
            let mut offset = 0;
            for (i, (len, split)) in parts.into_iter().enumerate() {
                let end = offset + len - 1;
                spans.push(Span::new(offset, end, format!("file~el{i}")));
                if split && len > 1 {
                    let mid = offset + len / 2 - 1;
                    spans.push(Span::new(offset, mid, format!("file~el{i}~a")));
                    spans.push(Span::new(mid + 1, end, format!("file~el{i}~b")));
                }
                offset = end + 1;
            }
            spans.reverse();
            (offset, spans)
        })
    }

    proptest! {
        #[test]
        fn learning_spans_are_disjoint_and_bounded(spans in arb_spans(), max in 0usize..12) {
            let mut store = ValueStore::new(30);
            let d = SpanDecomposer::new(max, '~').decompose(&spans, &mut store);
            for (i, a) in d.learning.iter().enumerate() {
                prop_assert!(a.width() <= max);
                for b in &d.learning[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{} overlaps {}", a, b);
                }
            }
        }

        #[test]
        fn structural_spans_are_disjoint(spans in arb_spans()) {
            let mut store = ValueStore::new(30);
            let d = SpanDecomposer::new(8, '~').decompose(&spans, &mut store);
            for (i, a) in d.structural.iter().enumerate() {
                for b in &d.structural[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{} overlaps {}", a, b);
                }
            }
        }

        #[test]
        fn structural_spans_cover_a_full_covering((len, spans) in arb_covering()) {
            let mut store = ValueStore::new(30);
            let d = SpanDecomposer::new(8, '~').decompose(&spans, &mut store);
            let covered: usize = d.structural.iter().map(Span::byte_count).sum();
            prop_assert_eq!(covered, len);
            prop_assert_eq!(d.structural.first().map(|s| s.start), Some(0));
            prop_assert_eq!(d.structural.last().map(|s| s.end), Some(len - 1));
        }
    }
}
