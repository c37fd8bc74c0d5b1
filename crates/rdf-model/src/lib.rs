//! RDF term model shared by the index and the query engine.
//!
//! The central type is [`Id`], a 64-bit tagged value that represents any RDF
//! term the engine can touch: entries of the persistent vocabulary, entries of
//! a per-query [`LocalVocab`], inlined numeric values, dates, and the special
//! `Undefined` marker used for SPARQL's "no binding".
//!
//! [`Term`] is the owned, string-level representation used at the vocabulary
//! boundary and in result export.

mod id;
mod local_vocab;
mod term;

pub use id::{Date, GeoPoint, Id, Tag, MAX_INLINE_INT, MIN_INLINE_INT};
pub use local_vocab::{LocalVocab, LocalVocabMerger, MergeSide};
pub use term::{xsd, Term, TermError};
