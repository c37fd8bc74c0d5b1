//! Owned RDF terms at the string level.
//!
//! [`Term`] is the representation exchanged with the vocabulary and the
//! export layer. Inside the engine everything is an [`Id`]; terms only appear
//! when strings enter (index build, VALUES, BIND results) or leave (export).

use std::fmt;

use crate::id::{Date, Id};

pub mod xsd {
    pub const INT: &str = "http://www.w3.org/2001/XMLSchema#int";
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    pub const DATE: &str = "http://www.w3.org/2001/XMLSchema#date";
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TermError {
    #[error("Malformed term: {0}")]
    Malformed(String),

    #[error("Unterminated literal: {0}")]
    UnterminatedLiteral(String),
}

/// An RDF term in its lexical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Iri(String),
    Literal {
        lexical: String,
        language: Option<String>,
        datatype: Option<String>,
    },
    BlankNode(String),
}

impl Term {
    pub fn iri(iri: impl Into<String>) -> Term {
        Term::Iri(iri.into())
    }

    pub fn literal(lexical: impl Into<String>) -> Term {
        Term::Literal {
            lexical: lexical.into(),
            language: None,
            datatype: None,
        }
    }

    pub fn literal_lang(lexical: impl Into<String>, lang: impl Into<String>) -> Term {
        Term::Literal {
            lexical: lexical.into(),
            language: Some(lang.into()),
            datatype: None,
        }
    }

    pub fn literal_typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Term {
        Term::Literal {
            lexical: lexical.into(),
            language: None,
            datatype: Some(datatype.into()),
        }
    }

    pub fn blank(label: impl Into<String>) -> Term {
        Term::BlankNode(label.into())
    }

    /// Parse the Turtle-style form used throughout the engine:
    /// `<iri>`, `"lexical"`, `"lexical"@lang`, `"lexical"^^<datatype>`,
    /// `_:label`.
    pub fn parse(input: &str) -> Result<Term, TermError> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix('<') {
            let iri = rest
                .strip_suffix('>')
                .ok_or_else(|| TermError::Malformed(input.to_string()))?;
            return Ok(Term::iri(iri));
        }
        if let Some(label) = input.strip_prefix("_:") {
            if label.is_empty() {
                return Err(TermError::Malformed(input.to_string()));
            }
            return Ok(Term::blank(label));
        }
        if let Some(rest) = input.strip_prefix('"') {
            let end = rest
                .rfind('"')
                .ok_or_else(|| TermError::UnterminatedLiteral(input.to_string()))?;
            let lexical = &rest[..end];
            let suffix = &rest[end + 1..];
            if suffix.is_empty() {
                return Ok(Term::literal(lexical));
            }
            if let Some(lang) = suffix.strip_prefix('@') {
                return Ok(Term::literal_lang(lexical, lang));
            }
            if let Some(dt) = suffix.strip_prefix("^^<") {
                let dt = dt
                    .strip_suffix('>')
                    .ok_or_else(|| TermError::Malformed(input.to_string()))?;
                return Ok(Term::literal_typed(lexical, dt));
            }
            return Err(TermError::Malformed(input.to_string()));
        }
        Err(TermError::Malformed(input.to_string()))
    }

    /// The language tag of a literal, if any.
    pub fn language(&self) -> Option<&str> {
        match self {
            Term::Literal { language, .. } => language.as_deref(),
            _ => None,
        }
    }

    /// If this term is a typed literal of a recognized datatype, its inline
    /// [`Id`] encoding. Other terms go through a vocabulary instead.
    pub fn value_id(&self) -> Option<Id> {
        let Term::Literal {
            lexical,
            language: None,
            datatype: Some(datatype),
        } = self
        else {
            return None;
        };
        match datatype.as_str() {
            xsd::INT | xsd::INTEGER => lexical.parse::<i64>().ok().and_then(Id::int),
            xsd::DECIMAL | xsd::DOUBLE => lexical.parse::<f64>().ok().map(Id::double),
            xsd::BOOLEAN => match lexical.as_str() {
                "true" | "1" => Some(Id::bool(true)),
                "false" | "0" => Some(Id::bool(false)),
                _ => None,
            },
            xsd::DATE => parse_date(lexical).map(Id::date),
            _ => None,
        }
    }
}

fn parse_date(lexical: &str) -> Option<Date> {
    let (year_part, rest) = if let Some(stripped) = lexical.strip_prefix('-') {
        let (y, r) = stripped.split_once('-')?;
        (format!("-{y}"), r)
    } else {
        let (y, r) = lexical.split_once('-')?;
        (y.to_string(), r)
    };
    let (month, day) = rest.split_once('-')?;
    Some(Date {
        year: year_part.parse().ok()?,
        month: month.parse().ok()?,
        day: day.parse().ok()?,
    })
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Literal {
                lexical,
                language: Some(lang),
                ..
            } => write!(f, "\"{lexical}\"@{lang}"),
            Term::Literal {
                lexical,
                datatype: Some(dt),
                ..
            } => write!(f, "\"{lexical}\"^^<{dt}>"),
            Term::Literal { lexical, .. } => write!(f, "\"{lexical}\""),
            Term::BlankNode(label) => write!(f, "_:{label}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for input in [
            "<http://example.org/s>",
            "\"plain\"",
            "\"hallo\"@de",
            "\"42\"^^<http://www.w3.org/2001/XMLSchema#int>",
            "_:b0",
        ] {
            let term = Term::parse(input).unwrap();
            assert_eq!(term.to_string(), input);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Term::parse("http://no-brackets").is_err());
        assert!(Term::parse("\"unterminated").is_err());
        assert!(Term::parse("_:").is_err());
    }

    #[test]
    fn numeric_literals_inline() {
        let term = Term::literal_typed("42", xsd::INTEGER);
        assert_eq!(term.value_id().unwrap().as_int(), Some(42));
        let term = Term::literal_typed("2.5", xsd::DOUBLE);
        assert_eq!(term.value_id().unwrap().as_double(), Some(2.5));
        let term = Term::literal_typed("true", xsd::BOOLEAN);
        assert_eq!(term.value_id().unwrap().as_bool(), Some(true));
        // Language-tagged literals never inline.
        assert_eq!(Term::literal_lang("42", "en").value_id(), None);
    }

    #[test]
    fn date_literal_inline() {
        let term = Term::literal_typed("2024-06-01", xsd::DATE);
        let date = term.value_id().unwrap().as_date().unwrap();
        assert_eq!((date.year, date.month, date.day), (2024, 6, 1));
    }
}
