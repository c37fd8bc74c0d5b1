//! Read-only access to a permutation-indexed RDF store.
//!
//! The engine consumes this crate purely through the [`Index`] facade: six
//! permutations with block-level scans and per-relation metadata, a sorted
//! persistent vocabulary, optional pattern data (the predicate sets backing
//! the pattern trick) and an optional text index. How the data is laid out
//! behind the facade is no concern of the planner or the operators.

mod builder;
mod metadata;
mod permutation;
mod scan;
mod store;
mod text;
mod vocabulary;

pub use builder::{IndexBuilder, IndexConfig};
pub use metadata::RelationMetadata;
pub use permutation::Permutation;
pub use scan::{Block, ScanBlocks, ScanSpec};
pub use store::{Index, PatternId};
pub use text::{TextIndex, WordPosting};
pub use vocabulary::Vocabulary;

/// Errors raised by index construction and lookup.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Malformed term in input data: {0}")]
    BadTerm(#[from] rdf_model::TermError),

    #[error("Permutation {0} is not enabled in this index")]
    PermutationDisabled(Permutation),

    #[error("Index has no pattern data (built without patterns)")]
    NoPatternData,

    #[error("Index has no text index")]
    NoTextIndex,
}

pub type IndexResult<T> = Result<T, IndexError>;
