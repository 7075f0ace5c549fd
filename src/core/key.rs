//! Total ordering over BSON values so primary ids can key `BTreeMap`s.
//!
//! Values are ranked by BSON type first, then compared within the type.
//! Numeric types are deliberately kept distinct (an `Int32` id never equals
//! an `Int64` id), matching raw-document equality on the wire.

use std::cmp::Ordering;

use bson::{doc, Bson, Document};

/// A document's primary id, ordered and comparable.
#[derive(Clone, Debug)]
pub struct DocumentKey(Bson);

impl DocumentKey {
    pub fn new(value: Bson) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Bson {
        &self.0
    }

    pub fn into_value(self) -> Bson {
        self.0
    }

    /// Query filter selecting exactly this document by `_id`.
    pub fn id_filter(&self) -> Document {
        doc! { "_id": self.0.clone() }
    }
}

impl From<Bson> for DocumentKey {
    fn from(value: Bson) -> Self {
        Self(value)
    }
}

impl From<&Bson> for DocumentKey {
    fn from(value: &Bson) -> Self {
        Self(value.clone())
    }
}

impl PartialEq for DocumentKey {
    fn eq(&self, other: &Self) -> bool {
        cmp_bson(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for DocumentKey {}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_bson(&self.0, &other.0)
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Undefined => 1,
        Bson::Null => 2,
        Bson::Double(_) => 3,
        Bson::Int32(_) => 4,
        Bson::Int64(_) => 5,
        Bson::Decimal128(_) => 6,
        Bson::String(_) => 7,
        Bson::Symbol(_) => 8,
        Bson::Document(_) => 9,
        Bson::Array(_) => 10,
        Bson::Binary(_) => 11,
        Bson::ObjectId(_) => 12,
        Bson::Boolean(_) => 13,
        Bson::DateTime(_) => 14,
        Bson::Timestamp(_) => 15,
        Bson::RegularExpression(_) => 16,
        Bson::JavaScriptCode(_) => 17,
        Bson::JavaScriptCodeWithScope(_) => 18,
        Bson::DbPointer(_) => 19,
        Bson::MaxKey => 20,
    }
}

pub(crate) fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::Double(x), Bson::Double(y)) => x.total_cmp(y),
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::Decimal128(x), Bson::Decimal128(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => cmp_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = cmp_bson(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => {
            (u8::from(x.subtype), &x.bytes).cmp(&(u8::from(y.subtype), &y.bytes))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            (&x.pattern, &x.options).cmp(&(&y.pattern, &y.options))
        }
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.cmp(y),
        (Bson::JavaScriptCodeWithScope(x), Bson::JavaScriptCodeWithScope(y)) => {
            x.code.cmp(&y.code).then_with(|| cmp_documents(&x.scope, &y.scope))
        }
        // Remaining same-rank pairs are unit-like or too exotic to order by
        // value; fall back to a stable textual comparison.
        _ => format!("{a:?}").cmp(&format!("{b:?}")),
    }
}

fn cmp_documents(a: &Document, b: &Document) -> Ordering {
    for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
        let key = ak.cmp(bk);
        if key != Ordering::Equal {
            return key;
        }
        let value = cmp_bson(av, bv);
        if value != Ordering::Equal {
            return value;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_types_are_distinct() {
        assert_ne!(
            DocumentKey::new(Bson::Int32(1)),
            DocumentKey::new(Bson::Int64(1))
        );
        assert_eq!(
            DocumentKey::new(Bson::Int64(1)),
            DocumentKey::new(Bson::Int64(1))
        );
    }

    #[test]
    fn ordering_is_total_across_types() {
        let mut keys = vec![
            DocumentKey::new(Bson::String("b".into())),
            DocumentKey::new(Bson::Int32(3)),
            DocumentKey::new(Bson::Null),
            DocumentKey::new(Bson::String("a".into())),
            DocumentKey::new(Bson::Int32(1)),
        ];
        keys.sort();
        assert_eq!(keys[0].value(), &Bson::Null);
        assert_eq!(keys[1].value(), &Bson::Int32(1));
        assert_eq!(keys[2].value(), &Bson::Int32(3));
        assert_eq!(keys[3].value(), &Bson::String("a".into()));
        assert_eq!(keys[4].value(), &Bson::String("b".into()));
    }

    #[test]
    fn id_filter_selects_by_id() {
        let key = DocumentKey::new(Bson::Int32(7));
        assert_eq!(key.id_filter(), doc! { "_id": 7 });
    }
}
