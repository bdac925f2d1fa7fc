use crate::config::FileFormat;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while enumerating seeds or archiving special mutants.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The seed or archive path exists but is a regular file.
    #[error("Corpus path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),

    /// Reading a directory or copying a mutant failed.
    /// Contains a string describing the underlying I/O error.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Lists the regular, non-hidden files directly inside `dir`, sorted by path.
///
/// A missing directory is an empty corpus.
pub fn list_seed_files(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.exists() {
        tracing::debug!("Seed directory {dir:?} does not exist, nothing to walk");
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        return Err(CorpusError::NotADirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry_result in fs::read_dir(dir)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed directory {dir:?}: {e}")))?
    {
        let entry = entry_result.map_err(|e| {
            CorpusError::Io(format!("Error reading entry in seed directory {dir:?}: {e}"))
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'))
        {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Mutation strategy that produced a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOperation {
    SmartAbstraction,
    RandomOverwrite,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::SmartAbstraction => "smart_abstraction",
            MutationOperation::RandomOverwrite => "random_overwrite",
        }
    }
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory of mutants that exposed fields absent from their seed.
///
/// Entries are named `special_<operation>_<field>_<start>_<end>.<format>`; a later discovery with
/// the same key replaces the earlier file.
#[derive(Debug, Clone)]
pub struct SpecialCorpus {
    dir: PathBuf,
    extension: &'static str,
}

impl SpecialCorpus {
    pub const FILE_PREFIX: &'static str = "special";

    pub fn new(dir: PathBuf, format: FileFormat) -> Result<Self, CorpusError> {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create special corpus directory at {dir:?}: {e}"
                ))
            })?;
        } else if !dir.is_dir() {
            return Err(CorpusError::NotADirectory(dir));
        }
        Ok(Self {
            dir,
            extension: format.as_str(),
        })
    }

    pub fn entry_path(
        &self,
        operation: MutationOperation,
        field: &str,
        start: usize,
        end: usize,
    ) -> PathBuf {
        let field: String = field
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!(
            "{}_{operation}_{field}_{start}_{end}.{}",
            Self::FILE_PREFIX,
            self.extension
        ))
    }

    /// Copies `mutant` into the archive and returns its new path.
    pub fn archive(
        &self,
        mutant: &Path,
        operation: MutationOperation,
        field: &str,
        start: usize,
        end: usize,
    ) -> Result<PathBuf, CorpusError> {
        let target = self.entry_path(operation, field, start, end);
        fs::copy(mutant, &target).map_err(|e| {
            CorpusError::Io(format!("Failed to archive {mutant:?} to {target:?}: {e}"))
        })?;
        tracing::debug!("New field '{field}' found by {operation}, saved to {target:?}");
        Ok(target)
    }

    pub fn entries(&self) -> Result<Vec<PathBuf>, CorpusError> {
        list_seed_files(&self.dir)
    }
}
