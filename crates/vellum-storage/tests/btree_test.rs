//! End-to-end tests for the B+ tree over a disk-backed buffer pool.
//!
//! Trees are built with a fanout of 4 so a few dozen keys already produce
//! multi-level structures, exercising split, shift, replenish, and
//! coalesce paths. The invariant checker walks every page after the
//! heavier scenarios.

use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use vellum_buffer::{BufferPool, BufferPoolConfig, DiskManager};
use vellum_common::page::PageId;
use vellum_storage::page::{page_kind, InternalRef, LeafRef, PageKind};
use vellum_storage::{
    bootstrap_index, BPlusTree, GenericComparator, GenericKey, KeyComparator, OrdComparator,
};

type TestTree = BPlusTree<i64, u64, OrdComparator>;

fn create_tree(num_frames: usize, leaf_max: usize, internal_max: usize) -> (TestTree, Arc<BufferPool>, TempDir) {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::open(dir.path().join("tree.db"), false).unwrap());
    let bpm = Arc::new(BufferPool::new(
        BufferPoolConfig {
            num_frames,
            replacer_k: 2,
        },
        disk,
    ));
    bootstrap_index(&bpm).unwrap();
    let tree = BPlusTree::new(bpm.clone(), OrdComparator, leaf_max, internal_max);
    (tree, bpm, dir)
}

fn insert_all(tree: &TestTree, keys: impl IntoIterator<Item = i64>) {
    for key in keys {
        assert!(tree.insert(&key, &(key as u64)).unwrap(), "insert {key}");
    }
}

fn collect_keys(tree: &TestTree) -> Vec<i64> {
    tree.iter().unwrap().map(|e| e.unwrap().0).collect()
}

/// Walks every page and asserts the structural invariants: size bounds
/// (root excepted), in-page key ordering, and a strictly ascending leaf
/// chain.
fn check_invariants(tree: &TestTree, bpm: &BufferPool) {
    let root_id = tree.root_page_id().unwrap();
    if root_id.is_valid() {
        check_page(bpm, root_id, true);
    }
    let keys = collect_keys(tree);
    assert!(
        keys.windows(2).all(|w| w[0] < w[1]),
        "leaf chain out of order: {keys:?}"
    );
}

fn check_page(bpm: &BufferPool, page_id: PageId, is_root: bool) {
    let guard = bpm.fetch_page_basic(page_id).unwrap();
    let children = guard.with_data(|data| match page_kind(data.as_slice()) {
        PageKind::Leaf => {
            let leaf = LeafRef::<i64, u64>::new(data.as_slice());
            assert!(leaf.size() <= leaf.max_size(), "leaf {page_id} overfull");
            if !is_root {
                assert!(
                    leaf.size() >= leaf.min_size(),
                    "leaf {page_id} underfull: {} < {}",
                    leaf.size(),
                    leaf.min_size()
                );
            }
            for i in 1..leaf.size() {
                assert!(leaf.key_at(i - 1) < leaf.key_at(i), "leaf {page_id} unsorted");
            }
            Vec::new()
        }
        PageKind::Internal => {
            let page = InternalRef::<i64>::new(data.as_slice());
            assert!(page.size() <= page.max_size(), "internal {page_id} overfull");
            if is_root {
                assert!(page.size() >= 2, "internal root {page_id} should have collapsed");
            } else {
                assert!(
                    page.size() >= page.min_size(),
                    "internal {page_id} underfull: {} < {}",
                    page.size(),
                    page.min_size()
                );
            }
            for i in 2..page.size() {
                assert!(
                    page.key_at(i - 1) < page.key_at(i),
                    "internal {page_id} unsorted"
                );
            }
            (0..page.size()).map(|i| page.child_at(i)).collect()
        }
        _ => panic!("unexpected page kind in tree at {page_id}"),
    });
    drop(guard);
    for child in children {
        check_page(bpm, child, false);
    }
}

#[test]
fn test_point_lookups_after_inserts() {
    let (tree, bpm, _dir) = create_tree(64, 4, 4);

    insert_all(&tree, [5, 9, 1, 13, 17, 21, 25]);

    for key in [5i64, 9, 1, 13, 17, 21, 25] {
        assert_eq!(tree.get_value(&key).unwrap(), vec![key as u64], "get {key}");
    }
    assert!(tree.get_value(&100).unwrap().is_empty());

    check_invariants(&tree, &bpm);
    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_remove_keeps_tree_balanced() {
    let (tree, bpm, _dir) = create_tree(64, 4, 4);

    insert_all(&tree, [5, 9, 1, 13, 17, 21, 25]);

    assert!(tree.remove(&13).unwrap());
    assert!(tree.get_value(&13).unwrap().is_empty());
    assert_eq!(collect_keys(&tree), vec![1, 5, 9, 17, 21, 25]);

    check_invariants(&tree, &bpm);
}

#[test]
fn test_sequential_insert_reverse_remove_empties_tree() {
    let (tree, bpm, _dir) = create_tree(64, 4, 4);

    insert_all(&tree, 1..=100);
    check_invariants(&tree, &bpm);

    for key in (1..=100).rev() {
        assert!(tree.remove(&key).unwrap(), "remove {key}");
    }

    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.root_page_id().unwrap(), PageId::INVALID);
    assert!(tree.get_value(&50).unwrap().is_empty());
    assert!(collect_keys(&tree).is_empty());

    // The tree grows again from scratch.
    insert_all(&tree, [3, 1, 2]);
    assert_eq!(collect_keys(&tree), vec![1, 2, 3]);
    check_invariants(&tree, &bpm);
}

#[test]
fn test_duplicate_insert_rejected() {
    let (tree, _bpm, _dir) = create_tree(64, 4, 4);

    assert!(tree.insert(&5, &1).unwrap());
    assert!(!tree.insert(&5, &2).unwrap());
    assert_eq!(tree.get_value(&5).unwrap(), vec![1]);
}

#[test]
fn test_random_inserts_then_removals_match_model() {
    let (tree, bpm, _dir) = create_tree(128, 4, 4);
    let mut rng = rand::rng();
    let mut model = BTreeMap::new();

    for _ in 0..2_000 {
        let key = rng.random_range(0..300i64);
        if rng.random_bool(0.6) {
            let value = key as u64;
            assert_eq!(
                tree.insert(&key, &value).unwrap(),
                model.insert(key, value).is_none(),
                "insert {key}"
            );
        } else {
            assert_eq!(
                tree.remove(&key).unwrap(),
                model.remove(&key).is_some(),
                "remove {key}"
            );
        }
    }

    for key in 0..300i64 {
        let expected: Vec<u64> = model.get(&key).copied().into_iter().collect();
        assert_eq!(tree.get_value(&key).unwrap(), expected, "get {key}");
    }
    assert_eq!(
        collect_keys(&tree),
        model.keys().copied().collect::<Vec<_>>()
    );

    check_invariants(&tree, &bpm);
    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_shuffled_insert_and_partial_remove() {
    let (tree, bpm, _dir) = create_tree(128, 4, 4);
    let mut rng = rand::rng();

    let mut keys: Vec<i64> = (0..200).collect();
    keys.shuffle(&mut rng);
    insert_all(&tree, keys.iter().copied());
    check_invariants(&tree, &bpm);

    let mut odds: Vec<i64> = (0..200).filter(|k| k % 2 == 1).collect();
    odds.shuffle(&mut rng);
    for key in odds {
        assert!(tree.remove(&key).unwrap(), "remove {key}");
    }

    let evens: Vec<i64> = (0..200).filter(|k| k % 2 == 0).collect();
    assert_eq!(collect_keys(&tree), evens);
    for key in 0..200i64 {
        let hit = tree.get_value(&key).unwrap();
        if key % 2 == 0 {
            assert_eq!(hit, vec![key as u64]);
        } else {
            assert!(hit.is_empty());
        }
    }
    check_invariants(&tree, &bpm);
}

#[test]
fn test_small_pool_forces_eviction_during_tree_ops() {
    // With only 16 frames the working set of a 500-key tree does not fit;
    // descent and structure changes continuously evict and re-read pages.
    let (tree, bpm, _dir) = create_tree(16, 4, 4);

    insert_all(&tree, 0..500);
    for key in (0..500).step_by(7) {
        assert_eq!(tree.get_value(&key).unwrap(), vec![key as u64]);
    }
    check_invariants(&tree, &bpm);
    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_iter_from_positions_at_first_geq() {
    let (tree, _bpm, _dir) = create_tree(64, 4, 4);
    insert_all(&tree, (0..100).map(|k| k * 2)); // evens 0..198

    let from_ten: Vec<i64> = tree.iter_from(&10).unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(from_ten.first(), Some(&10));
    assert_eq!(from_ten.len(), 95);

    // An absent key positions at its successor.
    let from_eleven: Vec<i64> = tree.iter_from(&11).unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(from_eleven.first(), Some(&12));

    // Past the maximum key the iterator is immediately exhausted.
    let mut past_end = tree.iter_from(&10_000).unwrap();
    assert!(past_end.next().is_none());
    assert!(past_end.is_end());
}

#[test]
fn test_iter_on_empty_tree() {
    let (tree, _bpm, _dir) = create_tree(64, 4, 4);
    assert!(tree.iter().unwrap().next().is_none());
}

#[test]
fn test_prefix_lookup_with_custom_comparator() {
    // Composite 16-byte keys: an 8-byte user id followed by an 8-byte
    // sequence number. The default comparator keeps entries unique; a
    // prefix comparator groups them by user id at lookup time.
    #[derive(Clone)]
    struct UserIdComparator;
    impl KeyComparator<GenericKey<16>> for UserIdComparator {
        fn compare(&self, a: &GenericKey<16>, b: &GenericKey<16>) -> Ordering {
            a.as_bytes()[..8].cmp(&b.as_bytes()[..8])
        }
    }

    fn composite(user: i64, seq: u64) -> GenericKey<16> {
        let user_key = GenericKey::<16>::from_i64(user);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&user_key.as_bytes()[..8]);
        bytes[8..].copy_from_slice(&seq.to_be_bytes());
        GenericKey::from_slice(&bytes)
    }

    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::open(dir.path().join("composite.db"), false).unwrap());
    let bpm = Arc::new(BufferPool::new(
        BufferPoolConfig {
            num_frames: 64,
            replacer_k: 2,
        },
        disk,
    ));
    bootstrap_index(&bpm).unwrap();
    let tree: BPlusTree<GenericKey<16>, u64, GenericComparator<16>> =
        BPlusTree::new(bpm, GenericComparator, 4, 4);

    for user in 0..8i64 {
        for seq in 0..5u64 {
            assert!(tree
                .insert(&composite(user, seq), &(user as u64 * 100 + seq))
                .unwrap());
        }
    }

    // Point lookup under the default comparator hits exactly one entry.
    assert_eq!(tree.get_value(&composite(3, 2)).unwrap(), vec![302]);

    // Prefix lookup returns the whole group, across leaf boundaries.
    let group = tree
        .get_value_with(&composite(3, 0), &UserIdComparator)
        .unwrap();
    assert_eq!(group, vec![300, 301, 302, 303, 304]);
}

#[test]
fn test_concurrent_inserts_partitioned() {
    let (tree, bpm, _dir) = create_tree(256, 4, 4);
    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 250;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = i * THREADS + t;
                    assert!(tree.insert(&key, &(key as u64)).unwrap());
                }
            });
        }
    });

    assert_eq!(
        collect_keys(&tree),
        (0..THREADS * PER_THREAD).collect::<Vec<_>>()
    );
    check_invariants(&tree, &bpm);
    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_concurrent_readers_over_static_tree() {
    let (tree, bpm, _dir) = create_tree(128, 4, 4);
    insert_all(&tree, 0..400);

    std::thread::scope(|scope| {
        for t in 0..4i64 {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..400i64 {
                    let key = (i + t * 100) % 400;
                    assert_eq!(tree.get_value(&key).unwrap(), vec![key as u64]);
                }
            });
        }
    });

    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_concurrent_disjoint_removals() {
    let (tree, bpm, _dir) = create_tree(256, 4, 4);
    insert_all(&tree, 0..800);

    std::thread::scope(|scope| {
        for t in 0..4i64 {
            let tree = &tree;
            scope.spawn(move || {
                // Each thread removes its own residue class.
                for i in 0..200i64 {
                    let key = i * 4 + t;
                    if key % 2 == 1 {
                        assert!(tree.remove(&key).unwrap());
                    }
                }
            });
        }
    });

    let evens: Vec<i64> = (0..800).filter(|k| k % 2 == 0).collect();
    assert_eq!(collect_keys(&tree), evens);
    check_invariants(&tree, &bpm);
    assert_eq!(bpm.total_pin_count(), 0);
}

#[test]
fn test_debug_structure_renders_every_level() {
    let (tree, _bpm, _dir) = create_tree(64, 4, 4);
    insert_all(&tree, 0..30);

    let rendered = tree.debug_structure().unwrap();
    assert!(rendered.contains("internal"));
    assert!(rendered.contains("leaf"));

    let (empty_tree, _bpm2, _dir2) = create_tree(16, 4, 4);
    assert_eq!(empty_tree.debug_structure().unwrap(), "(empty)");
}
