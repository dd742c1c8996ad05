use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

/// Checks every structural invariant the array promises between operations.
fn validate<K: Ord + Copy + Default + std::fmt::Debug>(pma: &PackedMemoryArray<K>) {
    assert!(pma.capacity().is_power_of_two(), "capacity must stay a power of two");
    assert!(pma.capacity() >= pma.len(), "capacity must cover the element count");
    assert_eq!(
        pma.segment_size() << pma.tree_height(),
        pma.capacity(),
        "segment size and tree height must derive from the same capacity"
    );
    assert_eq!(pma.capacity() % pma.segment_size(), 0);
    assert!(pma.number_of_segments() >= 2);

    // Occupied slots left to right must be sorted and must account for len().
    let mut occupied = 0usize;
    let mut prev: Option<K> = None;
    for i in 0..pma.capacity() {
        if pma.is_occupied(i).unwrap() {
            occupied += 1;
            let key = pma.get(i).unwrap().expect("occupied slot must hold a key");
            if let Some(p) = prev {
                assert!(p <= key, "keys must be non-decreasing at slot {i}");
            }
            prev = Some(key);
        } else {
            assert_eq!(pma.get(i).unwrap(), None, "free slot {i} must read as empty");
        }
    }
    assert_eq!(occupied, pma.len(), "len() must match the occupancy map");

    // Thresholds: monotonic across heights, leaf upper exactly 1.0.
    let h = pma.tree_height();
    assert_eq!(pma.upper_density_threshold(0).unwrap(), 1.0);
    for a in 0..h {
        assert!(
            pma.upper_density_threshold(a).unwrap() >= pma.upper_density_threshold(a + 1).unwrap()
        );
        assert!(
            pma.lower_density_threshold(a).unwrap() <= pma.lower_density_threshold(a + 1).unwrap()
        );
    }
    for a in 0..=h {
        assert!(pma.upper_density_threshold(a).unwrap() > pma.lower_density_threshold(a).unwrap());
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insert(i64),
    Erase(i64),
    Contains(i64),
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    // A narrow key range keeps duplicate runs and erase hits common.
    let key = -25i64..=25;
    let op = prop_oneof![
        55 => key.clone().prop_map(Op::Insert),
        30 => key.clone().prop_map(Op::Erase),
        15 => key.prop_map(Op::Contains),
    ];
    prop::collection::vec(op, 0..=600)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_multiset_equivalence(initial in 0usize..=64, ops in ops_strategy()) {
        let mut pma: PackedMemoryArray<i64> = PackedMemoryArray::with_capacity(initial);
        let mut model: BTreeMap<i64, usize> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key) => {
                    pma.insert(key);
                    *model.entry(key).or_insert(0) += 1;
                }
                Op::Erase(key) => {
                    let present = match model.get_mut(&key) {
                        Some(count) => {
                            *count -= 1;
                            if *count == 0 {
                                model.remove(&key);
                            }
                            true
                        }
                        None => false,
                    };
                    prop_assert_eq!(pma.erase(key), present);
                }
                Op::Contains(key) => {
                    prop_assert_eq!(pma.contains(key), model.contains_key(&key));
                }
            }

            let total: usize = model.values().sum();
            prop_assert_eq!(pma.len(), total);
        }

        validate(&pma);
        let got: Vec<i64> = pma.iter().collect();
        let expected: Vec<i64> = model
            .iter()
            .flat_map(|(k, count)| std::iter::repeat(*k).take(*count))
            .collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_insert_only_sorted(keys in prop::collection::vec(any::<i64>(), 0..=400)) {
        let mut pma: PackedMemoryArray<i64> = PackedMemoryArray::new();
        for &key in &keys {
            pma.insert(key);
        }
        validate(&pma);

        let mut expected = keys;
        expected.sort_unstable();
        let got: Vec<i64> = pma.iter().collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_round_trip_empties(keys in prop::collection::vec(any::<i64>(), 0..=200)) {
        let mut pma: PackedMemoryArray<i64> = PackedMemoryArray::with_capacity(4);
        for &key in &keys {
            pma.insert(key);
        }
        for &key in &keys {
            prop_assert!(pma.erase(key));
        }
        prop_assert_eq!(pma.len(), 0);
        prop_assert_eq!(pma.iter().count(), 0);
        prop_assert!(pma.capacity() >= 4);
        validate(&pma);
    }

    #[test]
    fn prop_predecessor_matches_model(
        keys in prop::collection::vec(-100i64..=100, 0..=100),
        probe in -110i64..=110,
    ) {
        let mut pma: PackedMemoryArray<i64> = PackedMemoryArray::new();
        for &key in &keys {
            pma.insert(key);
        }

        let expected = keys.iter().copied().filter(|&k| k < probe).max();
        let got = pma.predecessor(probe).map(|i| pma.get(i).unwrap().unwrap());
        prop_assert_eq!(got, expected);
    }
}
