use crate::span::Span;
use std::collections::BTreeSet;

/// Judges whether a valid mutant revealed structure its seed did not have.
///
/// A mutant is interesting when its learning decomposition contains a canonical field name that is
/// absent from the seed's own learning decomposition.
#[derive(Debug, Clone)]
pub struct NewFieldFeedback {
    known_fields: BTreeSet<String>,
    delimiter: char,
}

impl NewFieldFeedback {
    pub fn new(seed_spans: &[Span], delimiter: char) -> Self {
        Self {
            known_fields: field_names(seed_spans, delimiter),
            delimiter,
        }
    }

    /// First field of `mutant_spans` (in span order) unknown to the seed.
    pub fn is_interesting(&self, mutant_spans: &[Span]) -> Option<String> {
        mutant_spans
            .iter()
            .map(|s| s.canonical_name(self.delimiter))
            .find(|name| !self.known_fields.contains(*name))
            .map(str::to_string)
    }
}

fn field_names(spans: &[Span], delimiter: char) -> BTreeSet<String> {
    spans
        .iter()
        .map(|s| s.canonical_name(delimiter).to_string())
        .collect()
}
