//! Tier descriptors and range planning
//!
//! Ranges are clamped to the document count, so a short input simply emits
//! fewer tiers. The last tier absorbs any documents past its boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Name of a ranking tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Immediate,
    Refined,
    Complete,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Immediate => "immediate",
            TierName::Refined => "refined",
            TierName::Complete => "complete",
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static (name, boundary, priority) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDescriptor {
    pub name: TierName,
    /// Cumulative document count covered once this tier finishes
    pub boundary: usize,
    /// Lower runs first
    pub priority: u8,
}

impl TierDescriptor {
    pub fn new(name: TierName, boundary: usize, priority: u8) -> Self {
        Self {
            name,
            boundary,
            priority,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierPlanError {
    #[error("at least one tier is required")]
    Empty,

    #[error("tier {0} has a zero boundary")]
    ZeroBoundary(TierName),

    #[error("priority {0} is used by more than one tier")]
    DuplicatePriority(u8),

    #[error("tier {tier} boundary {boundary} does not exceed the previous boundary {previous}")]
    NotIncreasing {
        tier: TierName,
        boundary: usize,
        previous: usize,
    },
}

/// Validated tier layout, ordered by priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPlan {
    tiers: Vec<TierDescriptor>,
}

impl TierPlan {
    pub fn new(mut tiers: Vec<TierDescriptor>) -> Result<Self, TierPlanError> {
        if tiers.is_empty() {
            return Err(TierPlanError::Empty);
        }

        tiers.sort_by_key(|t| t.priority);

        let mut previous: Option<&TierDescriptor> = None;
        for tier in &tiers {
            if tier.boundary == 0 {
                return Err(TierPlanError::ZeroBoundary(tier.name));
            }
            if let Some(prev) = previous {
                if prev.priority == tier.priority {
                    return Err(TierPlanError::DuplicatePriority(tier.priority));
                }
                if tier.boundary <= prev.boundary {
                    return Err(TierPlanError::NotIncreasing {
                        tier: tier.name,
                        boundary: tier.boundary,
                        previous: prev.boundary,
                    });
                }
            }
            previous = Some(tier);
        }

        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[TierDescriptor] {
        &self.tiers
    }

    /// Non-empty document ranges for `total` documents, in run order
    ///
    /// Every range satisfies `start < end <= total`.
    pub fn ranges(&self, total: usize) -> Vec<(TierDescriptor, Range<usize>)> {
        let last = self.tiers.len() - 1;
        let mut start = 0;
        let mut ranges = Vec::with_capacity(self.tiers.len());

        for (idx, tier) in self.tiers.iter().enumerate() {
            let end = if idx == last {
                total
            } else {
                tier.boundary.min(total)
            };
            let begin = start.min(total);

            if begin < end {
                ranges.push((*tier, begin..end));
            }
            start = end.max(start);
        }

        ranges
    }
}

impl Default for TierPlan {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierDescriptor::new(TierName::Immediate, 50, 1),
                TierDescriptor::new(TierName::Refined, 200, 2),
                TierDescriptor::new(TierName::Complete, 600, 3),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ranges: &[(TierDescriptor, Range<usize>)]) -> Vec<TierName> {
        ranges.iter().map(|(t, _)| t.name).collect()
    }

    #[test]
    fn test_boundary_safety() {
        let plan = TierPlan::default();

        for n in [0, 1, 49, 50, 51, 199, 200, 201, 600] {
            let ranges = plan.ranges(n);
            let mut covered = 0;
            for (_, range) in &ranges {
                assert!(range.start < range.end, "empty range for n={}", n);
                assert!(range.end <= n, "range past end for n={}", n);
                assert_eq!(range.start, covered, "gap or overlap for n={}", n);
                covered = range.end;
            }
            assert_eq!(covered, n);
        }
    }

    #[test]
    fn test_tier_counts() {
        let plan = TierPlan::default();

        assert!(plan.ranges(0).is_empty());
        assert_eq!(names(&plan.ranges(10)), vec![TierName::Immediate]);
        assert_eq!(names(&plan.ranges(50)), vec![TierName::Immediate]);
        assert_eq!(
            names(&plan.ranges(51)),
            vec![TierName::Immediate, TierName::Refined]
        );
        assert_eq!(plan.ranges(200).len(), 2);
        assert_eq!(plan.ranges(201).len(), 3);

        let ranges = plan.ranges(600);
        assert_eq!(ranges[0].1, 0..50);
        assert_eq!(ranges[1].1, 50..200);
        assert_eq!(ranges[2].1, 200..600);
    }

    #[test]
    fn test_last_tier_absorbs_remainder() {
        let ranges = TierPlan::default().ranges(750);
        assert_eq!(ranges[2].1, 200..750);
    }

    #[test]
    fn test_plan_sorted_by_priority() {
        let plan = TierPlan::new(vec![
            TierDescriptor::new(TierName::Complete, 600, 3),
            TierDescriptor::new(TierName::Immediate, 50, 1),
        ])
        .unwrap();

        assert_eq!(plan.tiers()[0].name, TierName::Immediate);
    }

    #[test]
    fn test_invalid_plans() {
        assert_eq!(TierPlan::new(vec![]), Err(TierPlanError::Empty));
        assert!(matches!(
            TierPlan::new(vec![TierDescriptor::new(TierName::Immediate, 0, 1)]),
            Err(TierPlanError::ZeroBoundary(_))
        ));
        assert!(matches!(
            TierPlan::new(vec![
                TierDescriptor::new(TierName::Immediate, 50, 1),
                TierDescriptor::new(TierName::Refined, 40, 2),
            ]),
            Err(TierPlanError::NotIncreasing { .. })
        ));
        assert!(matches!(
            TierPlan::new(vec![
                TierDescriptor::new(TierName::Immediate, 50, 1),
                TierDescriptor::new(TierName::Refined, 200, 1),
            ]),
            Err(TierPlanError::DuplicatePriority(1))
        ));
    }

    #[test]
    fn test_tier_name_serde() {
        assert_eq!(
            serde_json::to_string(&TierName::Refined).unwrap(),
            "\"refined\""
        );
        assert_eq!(TierName::Complete.to_string(), "complete");
    }
}
