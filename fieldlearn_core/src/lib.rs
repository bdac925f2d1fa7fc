pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod decompose;
pub mod executor;
pub mod feedback;
pub mod mutator;
pub mod oracle;
pub mod report;
pub mod span;
pub mod validator;
pub mod value_store;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCounters};
pub use checksum::{ChecksumAlgorithm, ChecksumFingerprinter, ChecksumRegistry};
pub use config::{FileFormat, LearnerConfig, RunConfig, RunContext};
pub use coordinator::{CorpusCoordinator, RunSummary, StopTrigger};
pub use corpus::{CorpusError, MutationOperation, SpecialCorpus};
pub use decompose::{Decomposition, SpanDecomposer};
pub use executor::{CommandExecutor, CommandExecutorConfig, ExecutionStatus};
pub use feedback::NewFieldFeedback;
pub use mutator::{LearnedState, LearningStats, MutationEngine, Mutator, RandomOverwriteMutator};
pub use oracle::{CommandStructureOracle, OracleError, StructureOracle};
pub use report::{FileResultLogger, ReportError};
pub use span::Span;
pub use validator::{FormatValidator, ValidityOracle};
pub use value_store::{Blacklists, ValueStore};
