use std::sync::Arc;

/// Anything that can be placed in a [`WeightableGroup`].
pub trait Weighted {
    /// Selection weight. Zero or less excludes the item.
    fn weight(&self) -> i32;
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> i32 {
        (**self).weight()
    }
}

/// Immutable snapshot of weighted items with O(log n) weighted selection.
///
/// Built once from a list of items and never mutated; a change in the item
/// set means building a new group. Items with a non-positive weight are
/// dropped, the rest keep their input order. Weights are divided by their
/// GCD and prefix-summed into `ladder`, so `ladder[i]` is the cumulative
/// reduced weight of items `0..=i` and `sum == ladder[last]`.
///
/// Seed `s` in `[0, sum)` selects the item whose slot range
/// `[ladder[i-1], ladder[i])` contains `s`, so every seed value maps to
/// exactly one slot and each item owns as many slots as its reduced weight.
#[derive(Debug, Clone)]
pub struct WeightableGroup<T> {
    items: Vec<T>,
    ladder: Vec<i64>,
    sum: i64,
}

impl<T: Weighted> WeightableGroup<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        let items: Vec<T> = items.into_iter().filter(|item| item.weight() > 0).collect();

        match items.len() {
            0 => Self {
                items,
                ladder: Vec::new(),
                sum: 0,
            },
            1 => Self {
                items,
                ladder: vec![1],
                sum: 1,
            },
            _ => {
                let divisor = items
                    .iter()
                    .map(|item| item.weight() as i64)
                    .fold(0, gcd)
                    .max(1);

                let mut ladder = Vec::with_capacity(items.len());
                let mut sum = 0i64;
                for item in &items {
                    sum += item.weight() as i64 / divisor;
                    ladder.push(sum);
                }

                Self { items, ladder, sum }
            }
        }
    }
}

impl<T> WeightableGroup<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            ladder: Vec::new(),
            sum: 0,
        }
    }

    /// Selects the item owning slot `seed`.
    ///
    /// Seeds outside `[0, sum)` are folded back with `|seed| mod sum`, which
    /// lets callers pass a wrapping counter or raw random value. Returns
    /// `None` only for an empty group.
    pub fn get(&self, seed: i64) -> Option<&T> {
        match self.items.len() {
            0 => None,
            1 => self.items.first(),
            _ => {
                let slot = if seed < 0 || seed >= self.sum {
                    (seed.unsigned_abs() % self.sum as u64) as i64
                } else {
                    seed
                };
                let idx = self.ladder.partition_point(|&cumulative| cumulative <= slot);
                self.items.get(idx)
            }
        }
    }

    /// Total number of slots after GCD reduction.
    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn ladder(&self) -> &[i64] {
        &self.ladder
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Default for WeightableGroup<T> {
    fn default() -> Self {
        Self::empty()
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use proptest::prelude::*;

    fn group(weights: &[i32]) -> WeightableGroup<Provider> {
        WeightableGroup::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| Provider::new(format!("10.0.0.{}:7000", i), *w)),
        )
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(0, 30), 30);
        assert_eq!(gcd(30, 20), 10);
        assert_eq!(gcd(7, 13), 1);
    }

    #[test]
    fn test_empty_group() {
        let g = group(&[]);
        assert!(g.is_empty());
        assert_eq!(g.sum(), 0);
        assert!(g.get(0).is_none());
        assert!(g.get(-5).is_none());
        assert!(g.get(i64::MAX).is_none());
    }

    #[test]
    fn test_non_positive_weights_are_dropped() {
        let g = group(&[0, -3, 0]);
        assert!(g.is_empty());
        assert!(g.get(1).is_none());

        let g = group(&[0, 40, -1, 60]);
        assert_eq!(g.len(), 2);
        assert_eq!(g.items()[0].addr, "10.0.0.1:7000");
        assert_eq!(g.items()[1].addr, "10.0.0.3:7000");
    }

    #[test]
    fn test_singleton_group_always_selects_it() {
        let g = group(&[0, 37]);
        assert_eq!(g.sum(), 1);
        for seed in [i64::MIN, -1, 0, 1, 2, 1_000_000, i64::MAX] {
            assert_eq!(g.get(seed).unwrap().addr, "10.0.0.1:7000");
        }
    }

    #[test]
    fn test_ladder_is_gcd_reduced() {
        let g = group(&[20, 40, 60]);
        assert_eq!(g.ladder(), &[1, 3, 6]);
        assert_eq!(g.sum(), 6);

        let g = group(&[3, 5]);
        assert_eq!(g.ladder(), &[3, 8]);
    }

    #[test]
    fn test_slot_mapping() {
        let g = group(&[10, 20, 30]);
        let picks: Vec<_> = (0..g.sum())
            .map(|seed| g.get(seed).unwrap().addr.clone())
            .collect();
        assert_eq!(
            picks,
            vec![
                "10.0.0.0:7000",
                "10.0.0.1:7000",
                "10.0.0.1:7000",
                "10.0.0.2:7000",
                "10.0.0.2:7000",
                "10.0.0.2:7000",
            ]
        );
    }

    #[test]
    fn test_out_of_range_seeds_are_normalized() {
        let g = group(&[1, 2]);
        assert_eq!(g.get(-1).unwrap().addr, g.get(1).unwrap().addr);
        assert_eq!(g.get(3).unwrap().addr, g.get(0).unwrap().addr);
        assert_eq!(g.get(7).unwrap().addr, g.get(1).unwrap().addr);
        assert!(g.get(i64::MIN).is_some());
        assert!(g.get(i64::MAX).is_some());
    }

    proptest! {
        #[test]
        fn prop_ladder_invariants(weights in prop::collection::vec(-10i32..=100, 0..32)) {
            let g = group(&weights);
            let positive = weights.iter().filter(|w| **w > 0).count();
            prop_assert_eq!(g.len(), positive);

            let ladder = g.ladder();
            prop_assert!(ladder.windows(2).all(|w| w[0] <= w[1]));
            if positive > 0 {
                prop_assert_eq!(g.sum(), *ladder.last().unwrap());
            } else {
                prop_assert_eq!(g.sum(), 0);
            }
        }

        #[test]
        fn prop_every_slot_maps_to_a_member(
            weights in prop::collection::vec(1i32..=100, 2..16),
            seed in any::<i64>(),
        ) {
            let g = group(&weights);
            prop_assert!(g.get(seed).is_some());
        }

        #[test]
        fn prop_slot_counts_match_reduced_weights(weights in prop::collection::vec(1i32..=100, 2..16)) {
            let g = group(&weights);
            let divisor = weights.iter().map(|w| *w as i64).fold(0, gcd);

            let mut counts = vec![0i64; g.len()];
            for seed in 0..g.sum() {
                let picked = g.get(seed).unwrap();
                let idx = g.iter().position(|p| std::ptr::eq(p, picked)).unwrap();
                counts[idx] += 1;
            }
            for (count, weight) in counts.iter().zip(&weights) {
                prop_assert_eq!(*count, *weight as i64 / divisor);
            }
        }
    }
}
