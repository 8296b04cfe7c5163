//! Key domains and partition planning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ledgerbatch_core::ValueObject;

/// Inclusive key range handled by exactly one executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    lower: u64,
    upper: u64,
    label: String,
}

impl ValueObject for Partition {}

impl Partition {
    pub fn new(lower: u64, upper: u64, label: impl Into<String>) -> Result<Self, PartitionError> {
        if lower > upper {
            return Err(PartitionError::InvertedBounds { lower, upper });
        }
        Ok(Self {
            lower,
            upper,
            label: label.into(),
        })
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of keys in the range (never zero).
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    pub fn contains(&self, key: u64) -> bool {
        self.lower <= key && key <= self.upper
    }
}

impl core::fmt::Display for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}[{}-{}]", self.label, self.lower, self.upper)
    }
}

/// Inclusive key domain to be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDomain {
    lower: u64,
    upper: u64,
}

impl KeyDomain {
    pub fn new(lower: u64, upper: u64) -> Result<Self, PartitionError> {
        if lower > upper {
            return Err(PartitionError::InvertedBounds { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// Domain `[1, n]` from an item-count estimate.
    pub fn from_estimate(n: u64) -> Result<Self, PartitionError> {
        if n == 0 {
            return Err(PartitionError::EmptyDomain);
        }
        Self::new(1, n)
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Number of keys. `u128` because `[0, u64::MAX]` has 2^64 keys.
    pub fn size(&self) -> u128 {
        u128::from(self.upper) - u128::from(self.lower) + 1
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("lower bound {lower} is above upper bound {upper}")]
    InvertedBounds { lower: u64, upper: u64 },

    #[error("key domain is empty")]
    EmptyDomain,

    #[error("partition count must be at least 1")]
    ZeroPartitions,

    #[error("partition range width must be at least 1")]
    ZeroWidth,
}

/// How ranges are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Widths differ by at most one.
    #[default]
    Balanced,
    /// Every range has this width, except the last which ends at the domain's
    /// upper bound.
    FixedWidth(u64),
}

/// Splits a [`KeyDomain`] into disjoint, contiguous [`Partition`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Partitioner {
    strategy: PartitionStrategy,
}

impl Partitioner {
    pub fn balanced() -> Self {
        Self {
            strategy: PartitionStrategy::Balanced,
        }
    }

    pub fn fixed_width(width: u64) -> Self {
        Self {
            strategy: PartitionStrategy::FixedWidth(width),
        }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Produce at most `count` partitions labelled `partition0..`, in
    /// ascending key order, whose union is exactly `domain`.
    pub fn plan(&self, domain: KeyDomain, count: usize) -> Result<Vec<Partition>, PartitionError> {
        if count == 0 {
            return Err(PartitionError::ZeroPartitions);
        }

        let size = domain.size();
        let count = count as u128;

        let widths: Vec<u128> = match self.strategy {
            PartitionStrategy::Balanced => {
                let parts = count.min(size);
                let base = size / parts;
                let rem = size % parts;
                (0..parts).map(|i| if i < rem { base + 1 } else { base }).collect()
            }
            PartitionStrategy::FixedWidth(width) => {
                if width == 0 {
                    return Err(PartitionError::ZeroWidth);
                }
                let width = u128::from(width);
                let parts = count.min(size.div_ceil(width));
                let mut widths = vec![width; parts as usize];
                // The last range absorbs whatever the fixed ranges left over.
                if let Some(last) = widths.last_mut() {
                    *last = size - width * (parts - 1);
                }
                widths
            }
        };

        let mut partitions = Vec::with_capacity(widths.len());
        let mut lower = u128::from(domain.lower());
        for (i, width) in widths.into_iter().enumerate() {
            let upper = lower + width - 1;
            partitions.push(Partition {
                lower: lower as u64,
                upper: upper as u64,
                label: format!("partition{i}"),
            });
            lower = upper + 1;
        }

        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bounds(parts: &[Partition]) -> Vec<(u64, u64)> {
        parts.iter().map(|p| (p.lower(), p.upper())).collect()
    }

    #[test]
    fn fixed_width_over_one_to_hundred() {
        let domain = KeyDomain::from_estimate(100).unwrap();
        let parts = Partitioner::fixed_width(25).plan(domain, 4).unwrap();
        assert_eq!(bounds(&parts), vec![(1, 25), (26, 50), (51, 75), (76, 100)]);
        assert_eq!(parts[2].label(), "partition2");
    }

    #[test]
    fn fixed_width_last_range_stretches() {
        let domain = KeyDomain::new(1, 110).unwrap();
        let parts = Partitioner::fixed_width(25).plan(domain, 4).unwrap();
        assert_eq!(bounds(&parts), vec![(1, 25), (26, 50), (51, 75), (76, 110)]);
    }

    #[test]
    fn fixed_width_uses_fewer_partitions_when_domain_is_small() {
        let domain = KeyDomain::new(1, 30).unwrap();
        let parts = Partitioner::fixed_width(25).plan(domain, 4).unwrap();
        assert_eq!(bounds(&parts), vec![(1, 25), (26, 30)]);
    }

    #[test]
    fn balanced_spreads_the_remainder() {
        let domain = KeyDomain::new(1, 10).unwrap();
        let parts = Partitioner::balanced().plan(domain, 3).unwrap();
        assert_eq!(bounds(&parts), vec![(1, 4), (5, 7), (8, 10)]);
    }

    #[test]
    fn more_partitions_than_keys() {
        let domain = KeyDomain::new(7, 8).unwrap();
        let parts = Partitioner::balanced().plan(domain, 5).unwrap();
        assert_eq!(bounds(&parts), vec![(7, 7), (8, 8)]);
    }

    #[test]
    fn full_u64_domain_does_not_overflow() {
        let domain = KeyDomain::new(0, u64::MAX).unwrap();
        let parts = Partitioner::balanced().plan(domain, 2).unwrap();
        assert_eq!(parts[0].lower(), 0);
        assert_eq!(parts[1].upper(), u64::MAX);
        assert_eq!(parts[0].upper() + 1, parts[1].lower());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(KeyDomain::new(5, 4), Err(PartitionError::InvertedBounds { lower: 5, upper: 4 }));
        assert_eq!(KeyDomain::from_estimate(0), Err(PartitionError::EmptyDomain));

        let domain = KeyDomain::new(1, 10).unwrap();
        assert_eq!(Partitioner::balanced().plan(domain, 0), Err(PartitionError::ZeroPartitions));
        assert_eq!(Partitioner::fixed_width(0).plan(domain, 2), Err(PartitionError::ZeroWidth));
    }

    #[test]
    fn contains_is_inclusive() {
        let p = Partition::new(10, 20, "p").unwrap();
        assert!(p.contains(10));
        assert!(p.contains(20));
        assert!(!p.contains(21));
        assert_eq!(p.len(), 11);
        assert_eq!(p.to_string(), "p[10-20]");
    }

    fn any_strategy() -> impl Strategy<Value = PartitionStrategy> {
        prop_oneof![
            Just(PartitionStrategy::Balanced),
            (1u64..500).prop_map(PartitionStrategy::FixedWidth),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: partitions are disjoint, contiguous, ascending and cover
        /// the domain exactly, with at most `count` of them.
        #[test]
        fn plan_covers_domain(
            lower in 0u64..10_000,
            span in 0u64..10_000,
            count in 1usize..64,
            strategy in any_strategy(),
        ) {
            let domain = KeyDomain::new(lower, lower + span).unwrap();
            let parts = Partitioner { strategy }.plan(domain, count).unwrap();

            prop_assert!(!parts.is_empty());
            prop_assert!(parts.len() <= count);
            prop_assert_eq!(parts[0].lower(), domain.lower());
            prop_assert_eq!(parts[parts.len() - 1].upper(), domain.upper());
            for pair in parts.windows(2) {
                prop_assert_eq!(pair[0].upper() + 1, pair[1].lower());
            }
            let covered: u128 = parts.iter().map(|p| u128::from(p.len())).sum();
            prop_assert_eq!(covered, domain.size());

            if strategy == PartitionStrategy::Balanced {
                let min = parts.iter().map(Partition::len).min().unwrap();
                let max = parts.iter().map(Partition::len).max().unwrap();
                prop_assert!(max - min <= 1);
            }
        }
    }
}
