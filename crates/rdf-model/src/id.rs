//! Tagged 64-bit term identifiers.
//!
//! An [`Id`] packs a 4-bit type tag and a 60-bit payload into one `u64`. The
//! raw `u64` order *is* the internal sort order of all tables and permutation
//! indexes: the tag occupies the high bits and every payload encoding below is
//! order-preserving within its tag. `Undefined` carries tag 0 and therefore
//! sorts before everything else, which the UNDEF-aware join algorithms rely
//! on.
//!
//! Semantic comparison (used by filters) is a different relation: values of
//! different tags are incomparable unless both are numeric, and `Undefined`
//! compares as "unknown". See [`Id::compare_values`].

use std::cmp::Ordering;
use std::fmt;

const TAG_SHIFT: u32 = 60;
const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Number of payload bits available to inlined integers.
const INT_BITS: u32 = 60;
/// Largest integer representable inline.
pub const MAX_INLINE_INT: i64 = (1 << (INT_BITS - 1)) - 1;
/// Smallest integer representable inline.
pub const MIN_INLINE_INT: i64 = -(1 << (INT_BITS - 1));

/// The type tag of an [`Id`]. Discriminant order is the internal sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tag {
    /// SPARQL "no binding". Sorts before everything.
    Undefined = 0,
    Bool = 1,
    Int = 2,
    Double = 3,
    Date = 4,
    GeoPoint = 5,
    /// Index into the persistent vocabulary. Payload order equals the
    /// lexicographic order of the vocabulary entries.
    VocabIndex = 6,
    /// Index into a per-query [`crate::LocalVocab`].
    LocalVocabIndex = 7,
    /// Index into the text-record collection of the text index.
    TextRecordIndex = 8,
    BlankNodeIndex = 9,
}

impl Tag {
    fn from_bits(bits: u64) -> Tag {
        match bits {
            0 => Tag::Undefined,
            1 => Tag::Bool,
            2 => Tag::Int,
            3 => Tag::Double,
            4 => Tag::Date,
            5 => Tag::GeoPoint,
            6 => Tag::VocabIndex,
            7 => Tag::LocalVocabIndex,
            8 => Tag::TextRecordIndex,
            _ => Tag::BlankNodeIndex,
        }
    }
}

/// A date as stored inline in an [`Id`]: (year, month, day), proleptic
/// Gregorian, year range ±2^18.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

/// A WGS-84 point stored inline with fixed-point coordinates
/// (1e-6 degree resolution).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// 64-bit tagged term identifier.
///
/// Derived `Ord` on the raw bits is the internal sort order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const UNDEFINED: Id = Id(0);

    fn new(tag: Tag, payload: u64) -> Id {
        debug_assert!(payload <= PAYLOAD_MASK);
        Id(((tag as u64) << TAG_SHIFT) | payload)
    }

    pub fn tag(self) -> Tag {
        Tag::from_bits(self.0 >> TAG_SHIFT)
    }

    pub fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn is_undefined(self) -> bool {
        self == Id::UNDEFINED
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Id {
        Id(bits)
    }

    // ---- constructors ------------------------------------------------------

    pub fn bool(value: bool) -> Id {
        Id::new(Tag::Bool, value as u64)
    }

    /// Inline an integer. Returns `None` if it does not fit into 60 bits.
    pub fn int(value: i64) -> Option<Id> {
        if !(MIN_INLINE_INT..=MAX_INLINE_INT).contains(&value) {
            return None;
        }
        // Offset-binary keeps the payload order equal to the numeric order.
        let biased = (value - MIN_INLINE_INT) as u64;
        Some(Id::new(Tag::Int, biased))
    }

    /// Inline a double, shifting out the low 4 mantissa bits. The encoding is
    /// order-preserving; the value round-trips with 4 bits of precision loss.
    pub fn double(value: f64) -> Id {
        let bits = value.to_bits();
        // Standard order-preserving transform: positives get the sign bit
        // flipped, negatives get all bits flipped.
        let ordered = if bits >> 63 == 0 {
            bits ^ (1 << 63)
        } else {
            !bits
        };
        Id::new(Tag::Double, ordered >> 4)
    }

    pub fn date(date: Date) -> Id {
        let year = (date.year as i64 - MIN_DATE_YEAR) as u64;
        let payload = (year << 9) | ((date.month as u64) << 5) | date.day as u64;
        Id::new(Tag::Date, payload)
    }

    pub fn geo_point(point: GeoPoint) -> Id {
        let lat = ((point.lat + 90.0) * 1e6) as u64 & ((1 << 28) - 1);
        let lng = ((point.lng + 180.0) * 1e6) as u64 & ((1 << 29) - 1);
        Id::new(Tag::GeoPoint, (lat << 29) | lng)
    }

    pub fn vocab_index(index: u64) -> Id {
        Id::new(Tag::VocabIndex, index)
    }

    pub fn local_vocab_index(index: u64) -> Id {
        Id::new(Tag::LocalVocabIndex, index)
    }

    pub fn text_record_index(index: u64) -> Id {
        Id::new(Tag::TextRecordIndex, index)
    }

    pub fn blank_node_index(index: u64) -> Id {
        Id::new(Tag::BlankNodeIndex, index)
    }

    // ---- accessors ---------------------------------------------------------

    pub fn as_bool(self) -> Option<bool> {
        (self.tag() == Tag::Bool).then(|| self.payload() != 0)
    }

    pub fn as_int(self) -> Option<i64> {
        (self.tag() == Tag::Int).then(|| self.payload() as i64 + MIN_INLINE_INT)
    }

    pub fn as_double(self) -> Option<f64> {
        if self.tag() != Tag::Double {
            return None;
        }
        let ordered = self.payload() << 4;
        let bits = if ordered >> 63 == 1 {
            ordered ^ (1 << 63)
        } else {
            !ordered
        };
        Some(f64::from_bits(bits))
    }

    pub fn as_date(self) -> Option<Date> {
        if self.tag() != Tag::Date {
            return None;
        }
        let payload = self.payload();
        Some(Date {
            year: ((payload >> 9) as i64 + MIN_DATE_YEAR) as i32,
            month: ((payload >> 5) & 0xf) as u8,
            day: (payload & 0x1f) as u8,
        })
    }

    pub fn vocab_index_value(self) -> Option<u64> {
        (self.tag() == Tag::VocabIndex).then(|| self.payload())
    }

    pub fn local_vocab_index_value(self) -> Option<u64> {
        (self.tag() == Tag::LocalVocabIndex).then(|| self.payload())
    }

    pub fn text_record_index_value(self) -> Option<u64> {
        (self.tag() == Tag::TextRecordIndex).then(|| self.payload())
    }

    /// Numeric view shared by `Int` and `Double` ids.
    pub fn as_numeric(self) -> Option<f64> {
        match self.tag() {
            Tag::Int => self.as_int().map(|i| i as f64),
            Tag::Double => self.as_double(),
            _ => None,
        }
    }

    // ---- comparison --------------------------------------------------------

    /// Three-valued semantic comparison for filter evaluation.
    ///
    /// `None` means "incomparable": at least one side is `Undefined`, or the
    /// tags differ and the values are not both numeric.
    pub fn compare_values(self, other: Id) -> Option<Ordering> {
        if self.is_undefined() || other.is_undefined() {
            return None;
        }
        if self.tag() == other.tag() {
            return Some(self.cmp(&other));
        }
        match (self.as_numeric(), other.as_numeric()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }
}

const MIN_DATE_YEAR: i64 = -(1 << 17);

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Undefined => write!(f, "Id(UNDEF)"),
            Tag::Bool => write!(f, "Id(Bool:{})", self.payload() != 0),
            Tag::Int => write!(f, "Id(Int:{})", self.as_int().unwrap_or(0)),
            Tag::Double => write!(f, "Id(Double:{})", self.as_double().unwrap_or(f64::NAN)),
            Tag::Date => write!(f, "Id(Date:{:?})", self.as_date()),
            Tag::GeoPoint => write!(f, "Id(GeoPoint:{:#x})", self.payload()),
            Tag::VocabIndex => write!(f, "Id(V:{})", self.payload()),
            Tag::LocalVocabIndex => write!(f, "Id(L:{})", self.payload()),
            Tag::TextRecordIndex => write!(f, "Id(T:{})", self.payload()),
            Tag::BlankNodeIndex => write!(f, "Id(B:{})", self.payload()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_is_minimum() {
        for id in [
            Id::bool(false),
            Id::int(-5).unwrap(),
            Id::double(-1.0e300),
            Id::vocab_index(0),
            Id::blank_node_index(0),
        ] {
            assert!(Id::UNDEFINED < id);
        }
    }

    #[test]
    fn int_roundtrip_and_order() {
        let values = [MIN_INLINE_INT, -17, -1, 0, 1, 42, MAX_INLINE_INT];
        for window in values.windows(2) {
            let a = Id::int(window[0]).unwrap();
            let b = Id::int(window[1]).unwrap();
            assert!(a < b);
            assert_eq!(a.as_int(), Some(window[0]));
        }
        assert_eq!(Id::int(MAX_INLINE_INT + 1), None);
        assert_eq!(Id::int(MIN_INLINE_INT - 1), None);
    }

    #[test]
    fn double_order_preserved() {
        let values = [-1.0e12, -2.5, -0.0, 0.0, 1.0, 3.5, 7.0e9];
        for window in values.windows(2) {
            assert!(Id::double(window[0]) <= Id::double(window[1]));
        }
        // 4 bits of mantissa are shifted out, exactly representable values
        // with short mantissas survive.
        assert_eq!(Id::double(2.5).as_double(), Some(2.5));
    }

    #[test]
    fn date_roundtrip() {
        let date = Date { year: 2024, month: 2, day: 29 };
        assert_eq!(Id::date(date).as_date(), Some(date));
        let earlier = Date { year: -44, month: 3, day: 15 };
        assert!(Id::date(earlier) < Id::date(date));
    }

    #[test]
    fn cross_tag_numeric_comparison() {
        let int = Id::int(3).unwrap();
        let double = Id::double(3.5);
        assert_eq!(int.compare_values(double), Some(Ordering::Less));
        assert_eq!(double.compare_values(int), Some(Ordering::Greater));
        assert_eq!(
            Id::int(4).unwrap().compare_values(Id::double(4.0)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn incomparable_tags() {
        assert_eq!(Id::vocab_index(1).compare_values(Id::int(1).unwrap()), None);
        assert_eq!(Id::UNDEFINED.compare_values(Id::UNDEFINED), None);
        assert_eq!(Id::UNDEFINED.compare_values(Id::bool(true)), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn int_id_order_matches_value_order(
                a in MIN_INLINE_INT..=MAX_INLINE_INT,
                b in MIN_INLINE_INT..=MAX_INLINE_INT,
            ) {
                let (ia, ib) = (Id::int(a).unwrap(), Id::int(b).unwrap());
                prop_assert_eq!(ia.cmp(&ib), a.cmp(&b));
                prop_assert_eq!(ia.as_int(), Some(a));
            }

            #[test]
            fn double_id_order_matches_value_order(a in -1.0e300f64..1.0e300, b in -1.0e300f64..1.0e300) {
                let (da, db) = (Id::double(a), Id::double(b));
                if a < b {
                    prop_assert!(da <= db);
                } else if b < a {
                    prop_assert!(db <= da);
                }
            }
        }
    }
}
