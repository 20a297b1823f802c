//! Ref visibility: hiding refs from advertisement and from clients' reach.

use gitwire_hash::ObjectId;
use gitwire_protocol::Ref;
use std::sync::Arc;

/// A reference record as seen by visibility predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// The object id the reference points to, null for unborn refs.
    pub id: ObjectId,
    /// The fully qualified reference name.
    pub name: String,
}

impl RefRecord {
    /// Create a new reference record.
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// A predicate that decides whether a ref must be hidden.
pub type HiddenRefPredicate = dyn Fn(&RefRecord) -> bool + Send + Sync;

/// A predicate hiding nothing.
pub fn hide_nothing() -> Arc<HiddenRefPredicate> {
    Arc::new(|_record: &RefRecord| false)
}

/// Filter `refs` through the hidden predicate, preserving order.
pub fn visible_refs(refs: Vec<Ref>, hidden: &HiddenRefPredicate) -> Vec<Ref> {
    refs.into_iter()
        .filter(|reference| {
            let record = RefRecord::new(
                reference.target_id().unwrap_or_else(ObjectId::null),
                reference.name().to_string(),
            );
            !hidden(&record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[byte; 20])
    }

    #[test]
    fn hidden_refs_are_filtered_in_order() {
        let refs = vec![
            Ref::Direct {
                full_ref_name: "refs/heads/main".into(),
                object: oid(1),
            },
            Ref::Direct {
                full_ref_name: "refs/internal/secret".into(),
                object: oid(2),
            },
            Ref::Direct {
                full_ref_name: "refs/tags/v1".into(),
                object: oid(3),
            },
        ];
        let visible = visible_refs(refs, &|record: &RefRecord| {
            record.name.starts_with("refs/internal/")
        });
        let names: Vec<_> = visible.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["refs/heads/main", "refs/tags/v1"]);
    }

    #[test]
    fn hide_nothing_keeps_everything() {
        let refs = vec![Ref::Direct {
            full_ref_name: "refs/heads/main".into(),
            object: oid(1),
        }];
        assert_eq!(visible_refs(refs.clone(), &*hide_nothing()), refs);
    }
}
