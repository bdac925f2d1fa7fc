use crate::checksum::{ChecksumFingerprinter, ChecksumRegistry};
use crate::config::{FileFormat, LearnerConfig};
use crate::corpus::{MutationOperation, SpecialCorpus};
use crate::decompose::{Decomposition, SpanDecomposer};
use crate::feedback::NewFieldFeedback;
use crate::oracle::StructureOracle;
use crate::span::Span;
use crate::validator::ValidityOracle;
use crate::value_store::ValueStore;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Produces a new byte buffer from a seed.
pub trait Mutator<R: Rng + ?Sized> {
    fn mutate(&mut self, seed: &[u8], rng: &mut R) -> Result<Vec<u8>, anyhow::Error>;
}

/// Replaces exactly the inclusive range `start..=end` with independently drawn random bytes.
#[derive(Debug, Clone, Copy)]
pub struct RandomOverwriteMutator {
    pub start: usize,
    pub end: usize,
}

impl<R: Rng + ?Sized> Mutator<R> for RandomOverwriteMutator {
    fn mutate(&mut self, seed: &[u8], rng: &mut R) -> Result<Vec<u8>, anyhow::Error> {
        if self.start > self.end || self.end >= seed.len() {
            anyhow::bail!(
                "Range {}..={} is outside the {}-byte input",
                self.start,
                self.end,
                seed.len()
            );
        }
        let mut bytes = seed.to_vec();
        rng.fill_bytes(&mut bytes[self.start..=self.end]);
        Ok(bytes)
    }
}

/// Mutation success counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningStats {
    pub valid_abstractions: u64,
    pub valid_abstractions_special: u64,
    pub valid_overwrites: u64,
}

impl LearningStats {
    pub fn add(&mut self, other: &LearningStats) {
        self.valid_abstractions += other.valid_abstractions;
        self.valid_abstractions_special += other.valid_abstractions_special;
        self.valid_overwrites += other.valid_overwrites;
    }
}

/// Everything learned so far. Each worker owns a private instance; the coordinator unions them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedState {
    pub values: ValueStore,
    pub checksums: ChecksumRegistry,
    pub stats: LearningStats,
}

impl LearnedState {
    pub fn new(max_unique_values: usize) -> Self {
        Self {
            values: ValueStore::new(max_unique_values),
            checksums: ChecksumRegistry::default(),
            stats: LearningStats::default(),
        }
    }

    pub fn union(&mut self, other: LearnedState) {
        self.values.union(other.values);
        self.checksums.union(other.checksums);
        self.stats.add(&other.stats);
    }
}

/// What learning from one seed produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileReport {
    pub raw_spans: usize,
    pub learning_spans: usize,
    pub structural_spans: usize,
    pub discoveries: u64,
}

/// Drives both mutation strategies over every learning span of a seed file.
pub struct MutationEngine<'a> {
    oracle: &'a dyn StructureOracle,
    validator: &'a dyn ValidityOracle,
    config: &'a LearnerConfig,
    special: &'a SpecialCorpus,
    scratch_dir: &'a Path,
    format: FileFormat,
    decomposer: SpanDecomposer,
}

impl<'a> MutationEngine<'a> {
    pub fn new(
        oracle: &'a dyn StructureOracle,
        validator: &'a dyn ValidityOracle,
        config: &'a LearnerConfig,
        special: &'a SpecialCorpus,
        scratch_dir: &'a Path,
        format: FileFormat,
    ) -> Self {
        Self {
            oracle,
            validator,
            config,
            special,
            scratch_dir,
            format,
            decomposer: SpanDecomposer::new(config.limits.max_span_bytes, config.oracle.delimiter),
        }
    }

    fn delimiter(&self) -> char {
        self.config.oracle.delimiter
    }

    /// Decomposes `file` through the oracle. Oracle failures yield an empty decomposition.
    pub fn decompose_file(&self, file: &Path, values: &mut ValueStore) -> (Vec<Span>, Decomposition) {
        let raw = match self.oracle.parse(file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Error parsing {file:?}: {e}");
                Vec::new()
            }
        };
        let decomposition = self.decomposer.decompose(&raw, values);
        (raw, decomposition)
    }

    /// Stores the hex content of every in-bounds span of `data`.
    pub fn extract_values(&self, data: &[u8], spans: &[Span], values: &mut ValueStore) {
        for span in spans {
            let Some(bytes) = span.slice(data) else {
                tracing::debug!(
                    "Span {span} lies beyond the {}-byte file, skipping extraction",
                    data.len()
                );
                continue;
            };
            let path: Vec<&str> = span.components(self.delimiter()).collect();
            values.record(&path, &hex::encode(bytes));
        }
    }

    /// Learns from one seed: its own values and checksums, then every mutation of every span.
    ///
    /// # Errors
    /// Only when the seed itself cannot be read or no scratch space can be created. Oracle and
    /// validator failures are absorbed as zero contribution.
    pub fn learn_file<R: Rng + ?Sized>(
        &self,
        seed: &Path,
        state: &mut LearnedState,
        rng: &mut R,
    ) -> Result<FileReport, anyhow::Error> {
        let data = fs::read(seed)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file {seed:?}: {e}"))?;
        let (raw, decomposition) = self.decompose_file(seed, &mut state.values);
        let mut report = FileReport {
            raw_spans: raw.len(),
            learning_spans: decomposition.learning.len(),
            structural_spans: decomposition.structural.len(),
            discoveries: 0,
        };
        if decomposition.learning.is_empty() {
            tracing::debug!("No learnable spans in {seed:?}");
            return Ok(report);
        }

        self.extract_values(&data, &decomposition.learning, &mut state.values);
        ChecksumFingerprinter::new(&self.config.checksum, self.delimiter()).learn_file(
            &data,
            &raw,
            &decomposition.structural,
            &mut state.checksums,
        );

        let scratch = tempfile::Builder::new()
            .prefix("mutants-")
            .tempdir_in(self.scratch_dir)
            .map_err(|e| {
                anyhow::anyhow!("Failed to create scratch space in {:?}: {e}", self.scratch_dir)
            })?;
        let feedback = NewFieldFeedback::new(&decomposition.learning, self.delimiter());
        let specials_before = state.stats.valid_abstractions_special;

        for span in &decomposition.learning {
            self.abstract_span(seed, span, &feedback, scratch.path(), state);
            self.overwrite_span(seed, &data, span, &feedback, scratch.path(), state, rng);
        }

        report.discoveries = state.stats.valid_abstractions_special - specials_before;
        Ok(report)
    }

    /// Smart abstraction: retried until the first valid mutant or the attempt bound.
    fn abstract_span(
        &self,
        seed: &Path,
        span: &Span,
        feedback: &NewFieldFeedback,
        scratch: &Path,
        state: &mut LearnedState,
    ) -> bool {
        let mutant = scratch.join(format!("abstracted.{}", self.format));
        for attempt in 1..=self.config.limits.max_abstraction_attempts {
            let produced = match self.oracle.abstract_span(seed, span.start, span.end, &mutant) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(
                        "Smart abstraction attempt {attempt} for {seed:?} at {}..={} failed: {e}",
                        span.start,
                        span.end
                    );
                    false
                }
            };
            if produced && self.validator.is_valid(&mutant) {
                self.absorb_mutant(&mutant, MutationOperation::SmartAbstraction, span, feedback, state);
                state.stats.valid_abstractions += 1;
                let _ = fs::remove_file(&mutant);
                return true;
            }
            let _ = fs::remove_file(&mutant);
        }
        false
    }

    /// Random overwrite: every attempt runs, each an independent sample.
    #[allow(clippy::too_many_arguments)]
    fn overwrite_span<R: Rng + ?Sized>(
        &self,
        seed: &Path,
        data: &[u8],
        span: &Span,
        feedback: &NewFieldFeedback,
        scratch: &Path,
        state: &mut LearnedState,
        rng: &mut R,
    ) -> u32 {
        let mut mutator = RandomOverwriteMutator {
            start: span.start,
            end: span.end,
        };
        let mutant = scratch.join(format!("overwrite.{}", self.format));
        let mut valid = 0;
        for attempt in 1..=self.config.limits.max_overwrite_attempts {
            let bytes = match mutator.mutate(data, rng) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!("Skipping random overwrite for {seed:?}: {e}");
                    return valid;
                }
            };
            if let Err(e) = fs::write(&mutant, &bytes) {
                tracing::warn!("Random overwrite attempt {attempt} for {seed:?} failed: {e}");
                continue;
            }
            if self.validator.is_valid(&mutant) {
                self.absorb_mutant(&mutant, MutationOperation::RandomOverwrite, span, feedback, state);
                state.stats.valid_overwrites += 1;
                valid += 1;
            }
            let _ = fs::remove_file(&mutant);
        }
        valid
    }

    /// Re-decomposes a valid mutant, archives it if it exposed a new field, and extracts its values.
    fn absorb_mutant(
        &self,
        mutant: &Path,
        operation: MutationOperation,
        target: &Span,
        feedback: &NewFieldFeedback,
        state: &mut LearnedState,
    ) {
        let (_, decomposition) = self.decompose_file(mutant, &mut state.values);

        if let Some(field) = feedback.is_interesting(&decomposition.learning) {
            match self
                .special
                .archive(mutant, operation, &field, target.start, target.end)
            {
                Ok(_) => state.stats.valid_abstractions_special += 1,
                Err(e) => tracing::warn!("Failed to archive special mutant: {e}"),
            }
        }

        match fs::read(mutant) {
            Ok(bytes) => self.extract_values(&bytes, &decomposition.learning, &mut state.values),
            Err(e) => tracing::warn!("Error reading mutant {mutant:?}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Reports a fixed 8-byte layout; mutants whose first byte is `b'X'` also expose `extra`.
    struct FakeOracle {
        abstraction_fails_first: usize,
        abstract_calls: AtomicUsize,
    }

    impl FakeOracle {
        fn new(abstraction_fails_first: usize) -> Self {
            Self {
                abstraction_fails_first,
                abstract_calls: AtomicUsize::new(0),
            }
        }
    }

    impl StructureOracle for FakeOracle {
        fn parse(&self, file: &Path) -> Result<Vec<Span>, OracleError> {
            let data = fs::read(file).map_err(|e| OracleError::Invocation(e.to_string()))?;
            let mut spans = vec![
                Span::new(0, 7, "file~hdr"),
                Span::new(0, 3, "file~hdr~magic"),
                Span::new(4, 5, "file~hdr~ver"),
                Span::new(6, 7, "file~hdr~flags"),
            ];
            if data.first() == Some(&b'X') {
                spans.push(Span::new(8, 8, "file~extra"));
            }
            Ok(spans)
        }

        fn abstract_span(
            &self,
            file: &Path,
            start: usize,
            _end: usize,
            out: &Path,
        ) -> Result<(), OracleError> {
            let call = self.abstract_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.abstraction_fails_first {
                return Err(OracleError::Failed {
                    path: file.to_path_buf(),
                    reason: "Exited with code 1".into(),
                });
            }
            let mut data = fs::read(file).map_err(|e| OracleError::Invocation(e.to_string()))?;
            if start == 0 {
                data[0] = b'X';
            }
            fs::write(out, &data).map_err(|e| OracleError::Invocation(e.to_string()))
        }
    }

    /// Accepts a file when it starts with `MAGC` or its abstracted form `XAGC`.
    struct MagicValidator;

    impl ValidityOracle for MagicValidator {
        fn is_valid(&self, file: &Path) -> bool {
            let data = fs::read(file).unwrap_or_default();
            data.starts_with(b"MAGC") || data.starts_with(b"XAGC")
        }
    }

    fn fixture(dir: &Path) -> (PathBuf, SpecialCorpus, PathBuf) {
        let seed = dir.join("seed.png");
        fs::write(&seed, b"MAGC\x01\x00\x00\x00").unwrap();
        let scratch = dir.join("abstracted");
        fs::create_dir_all(&scratch).unwrap();
        let special = SpecialCorpus::new(dir.join("abstracted_special"), FileFormat::Png).unwrap();
        (seed, special, scratch)
    }

    #[test]
    fn overwrite_mutator_only_touches_the_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let seed = vec![0u8; 16];
        let mut mutator = RandomOverwriteMutator { start: 4, end: 7 };
        let out = mutator.mutate(&seed, &mut rng).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[0; 4]);
        assert_eq!(&out[8..], &[0; 8]);
        let out_of_range = RandomOverwriteMutator { start: 10, end: 16 }.mutate(&seed, &mut rng);
        assert!(out_of_range.is_err());
    }

    #[test]
    fn learns_seed_values_and_discovers_new_fields() {
        let dir = tempdir().unwrap();
        let (seed, special, scratch) = fixture(dir.path());
        let oracle = FakeOracle::new(0);
        let validator = MagicValidator;
        let config = LearnerConfig::default();
        let engine = MutationEngine::new(&oracle, &validator, &config, &special, &scratch, FileFormat::Png);
        let mut state = LearnedState::new(config.limits.max_unique_values);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let report = engine.learn_file(&seed, &mut state, &mut rng).unwrap();
        assert_eq!(report.learning_spans, 3);
        assert_eq!(report.structural_spans, 1);

        let magic = state.values.leaf(&["file", "hdr", "magic"]).unwrap();
        assert!(magic.contains("4d414743"), "Seed value must be learned: {magic:?}");
        assert!(magic.contains("58414743"), "Abstracted value must be learned: {magic:?}");
        assert!(state.values.leaf(&["file", "hdr", "ver"]).unwrap().contains("0100"));

        assert_eq!(state.stats.valid_abstractions, 3, "One success per span");
        assert_eq!(state.stats.valid_abstractions_special, 1);
        assert_eq!(report.discoveries, 1);
        let archived = special.entries().unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].ends_with("special_smart_abstraction_extra_0_3.png"));

        // Overwrites of `magic` break validity; `ver` and `flags` always stay valid.
        assert_eq!(state.stats.valid_overwrites, 20);
        assert_eq!(
            fs::read_dir(&scratch).unwrap().count(),
            0,
            "Scratch mutants are cleaned up"
        );
    }

    #[test]
    fn abstraction_retries_until_first_success() {
        let dir = tempdir().unwrap();
        let (seed, special, scratch) = fixture(dir.path());
        let oracle = FakeOracle::new(4);
        let validator = MagicValidator;
        let config = LearnerConfig::default();
        let engine = MutationEngine::new(&oracle, &validator, &config, &special, &scratch, FileFormat::Png);
        let mut state = LearnedState::new(30);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        engine.learn_file(&seed, &mut state, &mut rng).unwrap();

        // 4 failures + 1 success for the first span, then 1 call each for the other two.
        assert_eq!(oracle.abstract_calls.load(Ordering::SeqCst), 7);
        assert_eq!(state.stats.valid_abstractions, 3);
    }

    #[test]
    fn exhausted_abstraction_is_not_an_error() {
        let dir = tempdir().unwrap();
        let (seed, special, scratch) = fixture(dir.path());
        let oracle = FakeOracle::new(usize::MAX);
        let validator = MagicValidator;
        let mut config = LearnerConfig::default();
        config.limits.max_abstraction_attempts = 2;
        config.limits.max_overwrite_attempts = 1;
        let engine = MutationEngine::new(&oracle, &validator, &config, &special, &scratch, FileFormat::Png);
        let mut state = LearnedState::new(30);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let report = engine.learn_file(&seed, &mut state, &mut rng).unwrap();
        assert_eq!(report.discoveries, 0);
        assert_eq!(state.stats.valid_abstractions, 0);
        assert_eq!(oracle.abstract_calls.load(Ordering::SeqCst), 6);
        assert_eq!(state.stats.valid_overwrites, 2);
    }

    #[test]
    fn out_of_bounds_spans_are_skipped_during_extraction() {
        let dir = tempdir().unwrap();
        let (_, special, scratch) = fixture(dir.path());
        let oracle = FakeOracle::new(0);
        let validator = MagicValidator;
        let config = LearnerConfig::default();
        let engine = MutationEngine::new(&oracle, &validator, &config, &special, &scratch, FileFormat::Png);
        let mut values = ValueStore::new(30);
        let spans = vec![Span::new(0, 1, "file~a"), Span::new(2, 9, "file~b")];
        engine.extract_values(&[0xAB, 0xCD, 0xEF], &spans, &mut values);
        assert!(values.leaf(&["file", "a"]).unwrap().contains("abcd"));
        assert!(values.leaf(&["file", "b"]).is_none());
    }

    #[test]
    fn unreadable_seed_is_an_error() {
        let dir = tempdir().unwrap();
        let (_, special, scratch) = fixture(dir.path());
        let oracle = FakeOracle::new(0);
        let validator = MagicValidator;
        let config = LearnerConfig::default();
        let engine = MutationEngine::new(&oracle, &validator, &config, &special, &scratch, FileFormat::Png);
        let mut state = LearnedState::new(30);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let err = engine
            .learn_file(&dir.path().join("missing.png"), &mut state, &mut rng)
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read seed file"));
    }
}
