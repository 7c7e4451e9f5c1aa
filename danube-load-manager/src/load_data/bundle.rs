use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{LoadManagerError, Result};

pub const FULL_RANGE_LOWER: u32 = 0x0000_0000;
pub const FULL_RANGE_UPPER: u32 = 0xFFFF_FFFF;

/// A slice of the namespace hash space, both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: u32,
    pub upper: u32,
}

impl KeyRange {
    pub fn new(lower: u32, upper: u32) -> Result<Self> {
        if lower > upper {
            return Err(LoadManagerError::InvalidBundle(format!(
                "lower bound 0x{:02X} is above upper bound 0x{:02X}",
                lower, upper
            )));
        }
        Ok(KeyRange { lower, upper })
    }

    pub fn full() -> Self {
        KeyRange {
            lower: FULL_RANGE_LOWER,
            upper: FULL_RANGE_UPPER,
        }
    }

    /// Number of hash values covered by the range.
    pub fn width(&self) -> u64 {
        self.upper as u64 - self.lower as u64 + 1
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.lower <= hash && hash <= self.upper
    }

    /// Splits the range in two contiguous halves, `None` if it holds a single hash value.
    pub fn split(&self) -> Option<(KeyRange, KeyRange)> {
        if self.lower == self.upper {
            return None;
        }
        let mid = self.lower + (self.upper - self.lower) / 2;
        Some((
            KeyRange {
                lower: self.lower,
                upper: mid,
            },
            KeyRange {
                lower: mid + 1,
                upper: self.upper,
            },
        ))
    }

    /// Divides the range in `count` contiguous parts of (almost) equal width.
    pub fn partition(&self, count: u32) -> Vec<KeyRange> {
        let count = (count.max(1) as u64).min(self.width());
        let step = self.width() / count;
        let mut ranges = Vec::with_capacity(count as usize);
        let mut lower = self.lower as u64;
        for i in 0..count {
            let upper = if i == count - 1 {
                self.upper as u64
            } else {
                lower + step - 1
            };
            ranges.push(KeyRange {
                lower: lower as u32,
                upper: upper as u32,
            });
            lower = upper + 1;
        }
        ranges
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}-0x{:02X}", self.lower, self.upper)
    }
}

impl FromStr for KeyRange {
    type Err = LoadManagerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LoadManagerError::InvalidBundle(format!("invalid key range: {}", s));

        let (lower, upper) = s.split_once('-').ok_or_else(invalid)?;
        let parse = |bound: &str| {
            let digits = bound
                .strip_prefix("0x")
                .or_else(|| bound.strip_prefix("0X"))
                .ok_or_else(invalid)?;
            u32::from_str_radix(digits, 16).map_err(|_| invalid())
        };

        KeyRange::new(parse(lower)?, parse(upper)?)
    }
}

/// A bundle is identified by its namespace and key range: `{namespace}/0x{lower}-0x{upper}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespaceBundle {
    pub namespace: String,
    pub range: KeyRange,
}

impl NamespaceBundle {
    pub fn new(namespace: &str, range: KeyRange) -> Self {
        NamespaceBundle {
            namespace: namespace.to_owned(),
            range,
        }
    }

    pub fn id(&self) -> String {
        self.to_string()
    }

    /// The two children replacing this bundle after a split.
    pub fn split(&self) -> Option<(NamespaceBundle, NamespaceBundle)> {
        let (low, high) = self.range.split()?;
        Some((
            NamespaceBundle::new(&self.namespace, low),
            NamespaceBundle::new(&self.namespace, high),
        ))
    }
}

impl fmt::Display for NamespaceBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.range)
    }
}

impl FromStr for NamespaceBundle {
    type Err = LoadManagerError;

    // the namespace may contain '/', the range is always the last segment
    fn from_str(s: &str) -> Result<Self> {
        let (namespace, range) = s
            .rsplit_once('/')
            .filter(|(ns, _)| !ns.is_empty())
            .ok_or_else(|| LoadManagerError::InvalidBundle(format!("invalid bundle: {}", s)))?;

        Ok(NamespaceBundle::new(namespace, range.parse()?))
    }
}

/// The bundle topology of a namespace, kept as a single document in the metadata store
/// so that replacing a parent with its children is one atomic write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceBundles {
    pub namespace: String,
    /// the range covered by the whole namespace
    pub full_range: KeyRange,
    /// sorted, contiguous, non-overlapping
    pub bundles: Vec<KeyRange>,
    pub version: u64,
}

impl NamespaceBundles {
    pub fn new(namespace: &str, full_range: KeyRange, initial_bundles: u32) -> Self {
        NamespaceBundles {
            namespace: namespace.to_owned(),
            full_range,
            bundles: full_range.partition(initial_bundles),
            version: 0,
        }
    }

    pub fn bundles(&self) -> impl Iterator<Item = NamespaceBundle> + '_ {
        self.bundles
            .iter()
            .map(|range| NamespaceBundle::new(&self.namespace, *range))
    }

    pub fn contains(&self, bundle: &NamespaceBundle) -> bool {
        bundle.namespace == self.namespace && self.bundles.binary_search(&bundle.range).is_ok()
    }

    /// The active bundle owning the hash.
    pub fn find_bundle(&self, hash: u32) -> Option<NamespaceBundle> {
        self.bundles
            .iter()
            .find(|range| range.contains(hash))
            .map(|range| NamespaceBundle::new(&self.namespace, *range))
    }

    /// Replaces the parent with its two children, keeping the cover invariant.
    pub fn replace_with_children(
        &mut self,
        parent: &NamespaceBundle,
    ) -> Result<(NamespaceBundle, NamespaceBundle)> {
        let position = self
            .bundles
            .binary_search(&parent.range)
            .map_err(|_| {
                LoadManagerError::InvalidBundle(format!(
                    "bundle {} is not active in namespace {}",
                    parent, self.namespace
                ))
            })?;

        let (low, high) = parent.split().ok_or_else(|| {
            LoadManagerError::InvalidBundle(format!("bundle {} can't be split", parent))
        })?;

        self.bundles
            .splice(position..=position, [low.range, high.range]);
        self.version += 1;

        Ok((low, high))
    }

    /// Checks that the bundles cover the full range with no gap and no overlap.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(LoadManagerError::InvalidBundle(format!(
                "namespace {}: {}",
                self.namespace, reason
            )))
        };

        let (Some(first), Some(last)) = (self.bundles.first(), self.bundles.last()) else {
            return invalid("no bundles".to_string());
        };
        if first.lower != self.full_range.lower || last.upper != self.full_range.upper {
            return invalid("bundles don't cover the full range".to_string());
        }
        for pair in self.bundles.windows(2) {
            if pair[0].upper as u64 + 1 != pair[1].lower as u64 {
                return invalid(format!("gap or overlap between {} and {}", pair[0], pair[1]));
            }
        }
        Ok(())
    }
}

/// Owner of a bundle as published by the leader. `owner == None` is the explicit
/// "unassigned, pending placement" state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOwnership {
    pub owner: Option<String>,
    /// time of the last transition (assigned or unassigned), in milliseconds
    pub since_ms: u64,
}

impl BundleOwnership {
    pub fn assigned(broker_id: &str, since_ms: u64) -> Self {
        BundleOwnership {
            owner: Some(broker_id.to_owned()),
            since_ms,
        }
    }

    pub fn unassigned(since_ms: u64) -> Self {
        BundleOwnership {
            owner: None,
            since_ms,
        }
    }

    pub fn is_owned_by(&self, broker_id: &str) -> bool {
        self.owner.as_deref() == Some(broker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_partitions_parent_range() {
        let range = KeyRange::new(0x00, 0xFF).unwrap();
        let (low, high) = range.split().unwrap();

        assert_eq!(low, KeyRange::new(0x00, 0x7F).unwrap());
        assert_eq!(high, KeyRange::new(0x80, 0xFF).unwrap());
        assert_eq!(low.width() + high.width(), range.width());
        assert_eq!(low.upper + 1, high.lower);
    }

    #[test]
    fn split_full_and_odd_ranges() {
        for range in [
            KeyRange::full(),
            KeyRange::new(0x10, 0x11).unwrap(),
            KeyRange::new(0x03, 0x0B).unwrap(),
            KeyRange::new(0xFFFF_FFFE, 0xFFFF_FFFF).unwrap(),
        ] {
            let (low, high) = range.split().unwrap();
            assert_eq!(low.lower, range.lower);
            assert_eq!(high.upper, range.upper);
            assert_eq!(low.upper as u64 + 1, high.lower as u64);
            assert!(low.width() >= 1 && high.width() >= 1);
        }
    }

    #[test]
    fn single_hash_range_is_indivisible() {
        let range = KeyRange::new(0x42, 0x42).unwrap();
        assert!(range.split().is_none());
    }

    #[test]
    fn invalid_range_is_rejected() {
        assert!(KeyRange::new(0x80, 0x7F).is_err());
        assert!("0x80-0x7F".parse::<KeyRange>().is_err());
        assert!("80-FF".parse::<KeyRange>().is_err());
    }

    #[test]
    fn bundle_id_format_and_parse() {
        let bundle = NamespaceBundle::new("ns1", KeyRange::new(0x00, 0xFF).unwrap());
        assert_eq!(bundle.id(), "ns1/0x00-0xFF");

        let parsed: NamespaceBundle = "tenant/ns1/0x80-0xFFFFFFFF".parse().unwrap();
        assert_eq!(parsed.namespace, "tenant/ns1");
        assert_eq!(parsed.range, KeyRange::new(0x80, 0xFFFF_FFFF).unwrap());

        assert!("0x00-0xFF".parse::<NamespaceBundle>().is_err());
    }

    #[test]
    fn partition_covers_range() {
        let bundles = NamespaceBundles::new("ns1", KeyRange::full(), 4);
        assert_eq!(bundles.bundles.len(), 4);
        bundles.validate().unwrap();

        let single = NamespaceBundles::new("ns1", KeyRange::full(), 1);
        assert_eq!(single.bundles, vec![KeyRange::full()]);
    }

    #[test]
    fn replace_with_children_keeps_cover() {
        let mut bundles = NamespaceBundles::new("ns1", KeyRange::new(0x00, 0xFF).unwrap(), 2);
        let parent = bundles.bundles().next().unwrap();
        assert_eq!(parent.id(), "ns1/0x00-0x7F");

        let (low, high) = bundles.replace_with_children(&parent).unwrap();

        assert_eq!(low.id(), "ns1/0x00-0x3F");
        assert_eq!(high.id(), "ns1/0x40-0x7F");
        assert_eq!(bundles.bundles.len(), 3);
        assert_eq!(bundles.version, 1);
        assert!(!bundles.contains(&parent));
        bundles.validate().unwrap();

        // the parent is gone, a second split of it must fail
        assert!(bundles.replace_with_children(&parent).is_err());
    }

    #[test]
    fn find_bundle_by_hash() {
        let bundles = NamespaceBundles::new("ns1", KeyRange::new(0x00, 0xFF).unwrap(), 2);
        assert_eq!(bundles.find_bundle(0x90).unwrap().id(), "ns1/0x80-0xFF");
        assert!(bundles.find_bundle(0x100).is_none());
    }

    #[test]
    fn validate_detects_gaps() {
        let mut bundles = NamespaceBundles::new("ns1", KeyRange::new(0x00, 0xFF).unwrap(), 2);
        bundles.bundles[1].lower = 0x81;
        assert!(bundles.validate().is_err());
    }
}
