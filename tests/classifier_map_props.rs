//! Property tests for the classifier-name map

use std::collections::BTreeSet;

use multitarea::{ClassifierNameMap, PRETRAIN_CLASSIFIER};
use proptest::prelude::*;

fn name_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}", 0..12)
}

proptest! {
    /// Indices are always 0..K-1 with no gaps and the pretrain classifier
    /// at index 0.
    #[test]
    fn indices_are_gapless(names in name_strategy()) {
        let mut map = ClassifierNameMap::fresh();
        map.assign(names.iter().map(String::as_str));

        prop_assert_eq!(map.index_of(PRETRAIN_CLASSIFIER), Some(0));
        let mut indices: Vec<usize> = map.iter().map(|(_, i)| i).collect();
        indices.sort_unstable();
        let expected: Vec<usize> = (0..map.len()).collect();
        prop_assert_eq!(indices, expected);
    }

    /// Re-assigning the same names changes nothing.
    #[test]
    fn assignment_is_idempotent(names in name_strategy()) {
        let mut map = ClassifierNameMap::fresh();
        map.assign(names.iter().map(String::as_str));
        let before: Vec<(String, usize)> =
            map.iter().map(|(n, i)| (n.to_string(), i)).collect();

        map.assign(names.iter().map(String::as_str));
        let after: Vec<(String, usize)> =
            map.iter().map(|(n, i)| (n.to_string(), i)).collect();
        prop_assert_eq!(before, after);
    }

    /// Earlier assignments survive later waves of new names.
    #[test]
    fn later_waves_preserve_existing(first in name_strategy(), second in name_strategy()) {
        let mut map = ClassifierNameMap::fresh();
        map.assign(first.iter().map(String::as_str));
        let snapshot: Vec<(String, usize)> =
            map.iter().map(|(n, i)| (n.to_string(), i)).collect();

        map.assign(second.iter().map(String::as_str));
        for (name, idx) in snapshot {
            prop_assert_eq!(map.index_of(&name), Some(idx));
        }
        // Every name from both waves is present.
        let all: BTreeSet<&String> = first.iter().chain(second.iter()).collect();
        for name in all {
            prop_assert!(map.index_of(name).is_some());
        }
    }

    /// The map round-trips through its JSON file unchanged.
    #[test]
    fn disk_roundtrip_is_lossless(names in name_strategy()) {
        let dir = tempfile::tempdir().unwrap();
        let mut map = ClassifierNameMap::fresh();
        map.assign(names.iter().map(String::as_str));
        map.save(dir.path()).unwrap();

        let reloaded = ClassifierNameMap::load_or_init(dir.path(), false).unwrap();
        prop_assert_eq!(reloaded, map);
    }
}
