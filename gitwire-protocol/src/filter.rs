//! Object filter specifications, `filter <spec>` on the wire.
//!
//! A filter tells the pack-writer side which objects it may omit; the parse
//! side models just enough to keep capability negotiation consistent and to
//! reject ambiguous requests.

use crate::error::Error;

/// A bitmask of object types a filter may omit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeMask(u8);

impl TypeMask {
    /// Omit nothing.
    pub const NONE: TypeMask = TypeMask(0);
    /// Blobs may be omitted.
    pub const BLOBS: TypeMask = TypeMask(1);
    /// Trees may be omitted.
    pub const TREES: TypeMask = TypeMask(2);

    /// `true` if `other`'s bits are all set in `self`.
    pub fn contains(&self, other: TypeMask) -> bool {
        self.0 & other.0 == other.0
    }

    fn union(self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 | other.0)
    }
}

/// A parsed object filter.
///
/// [`FilterSpec::NO_FILTER`] is the identity: nothing may be omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterSpec {
    /// Types the pack writer may omit entirely.
    pub omit: TypeMask,
    /// Omit blobs larger than this many bytes.
    pub blob_limit: Option<u64>,
    /// Omit trees at or beyond this depth.
    pub tree_depth: Option<u32>,
}

impl FilterSpec {
    /// The identity filter.
    pub const NO_FILTER: FilterSpec = FilterSpec {
        omit: TypeMask::NONE,
        blob_limit: None,
        tree_depth: None,
    };

    /// `true` if this filter omits nothing.
    pub fn is_no_filter(&self) -> bool {
        *self == Self::NO_FILTER
    }

    /// Parse the `<spec>` part of a `filter <spec>` line.
    ///
    /// Recognized forms: `blob:none`, `blob:limit=<n>[kmg]`, `tree:<depth>`
    /// and `combine:<spec>+<spec>...`. Anything else is a protocol error
    /// naming the offending input.
    pub fn parse(spec: &[u8]) -> Result<Self, Error> {
        if let Some(rest) = spec.strip_prefix(b"combine:") {
            let mut combined = FilterSpec::NO_FILTER;
            for part in rest.split(|&b| b == b'+') {
                let parsed = Self::parse_single(part)?;
                combined = combined.merge(parsed);
            }
            return Ok(combined);
        }
        Self::parse_single(spec)
    }

    fn parse_single(spec: &[u8]) -> Result<Self, Error> {
        if spec == b"blob:none" {
            return Ok(FilterSpec {
                omit: TypeMask::BLOBS,
                ..Self::NO_FILTER
            });
        }
        if let Some(limit) = spec.strip_prefix(b"blob:limit=") {
            let limit = parse_size(limit)
                .ok_or_else(|| Error::protocol("invalid blob size limit", spec))?;
            return Ok(FilterSpec {
                blob_limit: Some(limit),
                ..Self::NO_FILTER
            });
        }
        if let Some(depth) = spec.strip_prefix(b"tree:") {
            let depth = std::str::from_utf8(depth)
                .ok()
                .and_then(|d| d.parse::<u32>().ok())
                .ok_or_else(|| Error::protocol("invalid tree depth", spec))?;
            return Ok(FilterSpec {
                omit: if depth == 0 { TypeMask::TREES.union(TypeMask::BLOBS) } else { TypeMask::NONE },
                tree_depth: Some(depth),
                ..Self::NO_FILTER
            });
        }
        Err(Error::protocol("unrecognized filter", spec))
    }

    /// Render as the `<spec>` form sent on a `filter` line.
    pub fn to_wire(&self) -> String {
        let mut parts = Vec::new();
        if self.omit.contains(TypeMask::BLOBS) && self.tree_depth.is_none() {
            parts.push("blob:none".to_string());
        }
        if let Some(limit) = self.blob_limit {
            parts.push(format!("blob:limit={limit}"));
        }
        if let Some(depth) = self.tree_depth {
            parts.push(format!("tree:{depth}"));
        }
        match parts.len() {
            0 => String::new(),
            1 => parts.remove(0),
            _ => format!("combine:{}", parts.join("+")),
        }
    }

    fn merge(self, other: FilterSpec) -> FilterSpec {
        FilterSpec {
            omit: self.omit.union(other.omit),
            blob_limit: match (self.blob_limit, other.blob_limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            tree_depth: match (self.tree_depth, other.tree_depth) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// Parse a decimal size with an optional `k`/`m`/`g` suffix.
fn parse_size(input: &[u8]) -> Option<u64> {
    if input.is_empty() {
        return None;
    }
    let (digits, multiplier) = match input.last() {
        Some(b'k') => (&input[..input.len() - 1], 1024),
        Some(b'm') => (&input[..input.len() - 1], 1024 * 1024),
        Some(b'g') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let value: u64 = std::str::from_utf8(digits).ok()?.parse().ok()?;
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blob_none() {
        let filter = FilterSpec::parse(b"blob:none").unwrap();
        assert!(filter.omit.contains(TypeMask::BLOBS));
        assert!(!filter.is_no_filter());
    }

    #[test]
    fn blob_limit_with_suffix() {
        let filter = FilterSpec::parse(b"blob:limit=1k").unwrap();
        assert_eq!(filter.blob_limit, Some(1024));
        let filter = FilterSpec::parse(b"blob:limit=512").unwrap();
        assert_eq!(filter.blob_limit, Some(512));
    }

    #[test]
    fn tree_depth() {
        let filter = FilterSpec::parse(b"tree:0").unwrap();
        assert_eq!(filter.tree_depth, Some(0));
        assert!(filter.omit.contains(TypeMask::TREES));
    }

    #[test]
    fn combine_takes_the_stricter_limits() {
        let filter = FilterSpec::parse(b"combine:blob:limit=1m+blob:limit=1k").unwrap();
        assert_eq!(filter.blob_limit, Some(1024));
    }

    #[test]
    fn unknown_filters_are_protocol_errors_naming_the_spec() {
        let err = FilterSpec::parse(b"sparse:oid=abc").unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("sparse:oid=abc"), "{rendered}");
    }

    #[test]
    fn wire_round_trip() {
        for spec in ["blob:none", "blob:limit=512", "tree:3"] {
            let parsed = FilterSpec::parse(spec.as_bytes()).unwrap();
            assert_eq!(parsed.to_wire(), spec);
        }
    }

    #[test]
    fn no_filter_is_the_identity() {
        assert!(FilterSpec::default().is_no_filter());
        assert_eq!(FilterSpec::default(), FilterSpec::NO_FILTER);
    }
}
