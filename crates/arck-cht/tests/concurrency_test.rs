//! Concurrency tests for arck-cht
//!
//! Readers, writers, movers and resizers run against shared tables; every
//! check is an observation a file system would depend on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use arck_cht::{ChainHash, ChtError, ChtOptions, DstMode};
use parking_lot::Mutex;

const MAX: usize = 255;

fn manual_options() -> ChtOptions {
    ChtOptions {
        auto_resize: false,
        migrate_step: 0,
        ..ChtOptions::default()
    }
}

/// Resizes started and finished underneath readers and writers are invisible
#[test]
fn stress_resize_is_transparent() {
    let table = Arc::new(ChainHash::new(2, manual_options()));
    for i in 0..128u64 {
        table.insert(format!("pinned{i}").as_bytes(), MAX, i, i).unwrap();
    }
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let table = table.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for i in 0..128u64 {
                        let got = table.lookup(format!("pinned{i}").as_bytes(), MAX).unwrap();
                        assert_eq!(got, Some((i, i)));
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..3u64)
        .map(|w| {
            let table = table.clone();
            thread::spawn(move || {
                for round in 0..20u64 {
                    for i in 0..50u64 {
                        let key = format!("w{w}-{i}");
                        table.insert(key.as_bytes(), MAX, round, i).unwrap();
                    }
                    for i in 0..50u64 {
                        let key = format!("w{w}-{i}");
                        assert_eq!(table.remove(key.as_bytes(), MAX).unwrap(), Some((round, i)));
                    }
                }
                for i in 0..10u64 {
                    table
                        .insert(format!("w{w}-final{i}").as_bytes(), MAX, w, i)
                        .unwrap();
                }
            })
        })
        .collect();

    let resizer = {
        let table = table.clone();
        thread::spawn(move || {
            for _ in 0..6 {
                table.start_resize().unwrap();
                while table.migrate(1) > 0 {
                    thread::yield_now();
                }
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    resizer.join().unwrap();
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(table.nbuckets(), 128);
    assert_eq!(table.len(), 128 + 30);
    for w in 0..3u64 {
        for i in 0..10u64 {
            let key = format!("w{w}-final{i}");
            assert_eq!(table.lookup(key.as_bytes(), MAX).unwrap(), Some((w, i)));
        }
    }
}

/// An entry bounced between two tables is always seen in exactly one of them
#[test]
fn stress_replace_from_is_atomic_to_readers() {
    let a = Arc::new(ChainHash::new(4, manual_options()));
    let b = Arc::new(ChainHash::new(4, manual_options()));
    a.insert(b"wanderer", MAX, 77, 0).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (a, b, done) = (a.clone(), b.clone(), done.clone());
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let (in_a, in_b) =
                        ChainHash::lookup_pair(&a, b"wanderer", &b, b"wanderer", MAX).unwrap();
                    assert!(
                        in_a.is_some() ^ in_b.is_some(),
                        "entry seen in a={in_a:?} b={in_b:?}"
                    );
                }
            })
        })
        .collect();

    let resizer = {
        let (a, b) = (a.clone(), b.clone());
        thread::spawn(move || {
            for _ in 0..4 {
                a.resize().unwrap();
                b.start_resize().unwrap();
                while b.migrate(1) > 0 {
                    thread::yield_now();
                }
            }
        })
    };

    for round in 0..2000u64 {
        let (src, dst) = if round % 2 == 0 { (&a, &b) } else { (&b, &a) };
        let moved = ChainHash::replace_from(
            dst,
            b"wanderer",
            DstMode::MustNotExist,
            src,
            b"wanderer",
            77,
            round,
            MAX,
        )
        .unwrap();
        assert_eq!(moved.item.values(), (77, round));
    }
    resizer.join().unwrap();
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(a.lookup(b"wanderer", MAX).unwrap(), Some((77, 1999)));
    assert_eq!(b.lookup(b"wanderer", MAX).unwrap(), None);
    assert_eq!((a.len(), b.len()), (1, 0));
}

/// Two threads moving the same key to different places: exactly one wins
#[test]
fn stress_competing_moves_of_one_key() {
    for _ in 0..200 {
        let src = Arc::new(ChainHash::new(4, manual_options()));
        let left = Arc::new(ChainHash::new(4, manual_options()));
        let right = Arc::new(ChainHash::new(4, manual_options()));
        src.insert(b"contested", MAX, 1, 0).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let spawn_mover = |dst: Arc<ChainHash>| {
            let (src, barrier) = (src.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                ChainHash::replace_from(
                    &dst,
                    b"moved",
                    DstMode::MustNotExist,
                    &src,
                    b"contested",
                    1,
                    0,
                    MAX,
                )
            })
        };
        let l = spawn_mover(left.clone());
        let r = spawn_mover(right.clone());
        let results = [l.join().unwrap(), r.join().unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ChtError::NotFound))));
        assert_eq!(left.len() + right.len(), 1);
        assert!(src.is_empty());
    }
}

/// Minimal directory tree: one table per directory, `val` = child inode,
/// `val2` = 1 for directories. Renames take a tree-wide mutex and refuse to
/// move a directory beneath itself, then move the entry with `replace_from`.
struct Tree {
    dirs: Vec<ChainHash>,
    parents: Mutex<HashMap<u64, u64>>,
}

#[derive(Debug, PartialEq)]
enum RenameError {
    Loop,
    Table(ChtError),
}

impl Tree {
    const ROOT: u64 = 0;

    fn new(ndirs: usize) -> Self {
        Self {
            dirs: (0..ndirs).map(|_| ChainHash::new(8, manual_options())).collect(),
            parents: Mutex::new(HashMap::new()),
        }
    }

    fn mkdir(&self, parent: u64, name: &[u8], ino: u64) {
        self.dirs[parent as usize].insert(name, MAX, ino, 1).unwrap();
        self.parents.lock().insert(ino, parent);
    }

    fn rename(
        &self,
        src_dir: u64,
        src_name: &[u8],
        dst_dir: u64,
        dst_name: &[u8],
    ) -> Result<(), RenameError> {
        let mut parents = self.parents.lock();
        let (ino, kind) = self.dirs[src_dir as usize]
            .lookup(src_name, MAX)
            .map_err(RenameError::Table)?
            .ok_or(RenameError::Table(ChtError::NotFound))?;

        let mut cursor = dst_dir;
        loop {
            if cursor == ino {
                return Err(RenameError::Loop);
            }
            if cursor == Self::ROOT {
                break;
            }
            cursor = parents[&cursor];
        }

        ChainHash::replace_from(
            &self.dirs[dst_dir as usize],
            dst_name,
            DstMode::MustNotExist,
            &self.dirs[src_dir as usize],
            src_name,
            ino,
            kind,
            MAX,
        )
        .map_err(RenameError::Table)?;
        parents.insert(ino, dst_dir);
        Ok(())
    }

    /// Every directory reaches the root without revisiting a node.
    fn assert_acyclic(&self) {
        let parents = self.parents.lock();
        for &start in parents.keys() {
            let mut cursor = start;
            let mut steps = 0;
            while cursor != Self::ROOT {
                cursor = parents[&cursor];
                steps += 1;
                assert!(steps <= parents.len(), "cycle through inode {start}");
            }
        }
    }
}

/// `rename /1 /a/b/1` racing `rename /a /1/2/a`: one must fail, and the
/// tree must stay a tree.
#[test]
fn stress_concurrent_cross_renames_stay_acyclic() {
    for _ in 0..200 {
        let tree = Arc::new(Tree::new(5));
        tree.mkdir(Tree::ROOT, b"1", 1);
        tree.mkdir(Tree::ROOT, b"a", 2);
        tree.mkdir(2, b"b", 3);
        tree.mkdir(1, b"2", 4);
        let barrier = Arc::new(Barrier::new(2));

        let first = {
            let (tree, barrier) = (tree.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                tree.rename(Tree::ROOT, b"1", 3, b"1")
            })
        };
        let second = {
            let (tree, barrier) = (tree.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                tree.rename(Tree::ROOT, b"a", 4, b"a")
            })
        };
        let results = [first.join().unwrap(), second.join().unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(RenameError::Loop)));
        tree.assert_acyclic();
        assert_eq!(tree.dirs[Tree::ROOT as usize].len(), 1);
    }
}

/// Two movers cross the same pair of tables in opposite directions with no
/// lock of their own. Bucket locking alone must keep them from deadlocking
/// and keep every key in exactly one table.
#[test]
fn stress_opposite_moves_between_two_tables() {
    const ROUNDS: u64 = 5_000;
    let left = Arc::new(ChainHash::new(1, manual_options()));
    let right = Arc::new(ChainHash::new(1, manual_options()));
    left.insert(b"x", MAX, 1, 0).unwrap();
    right.insert(b"y", MAX, 2, 0).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let mover = |key: &'static [u8], home: Arc<ChainHash>, away: Arc<ChainHash>| {
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for round in 0..ROUNDS {
                ChainHash::replace_from(&away, key, DstMode::MustNotExist, &home, key, round, 0, MAX)
                    .unwrap();
                ChainHash::replace_from(&home, key, DstMode::MustNotExist, &away, key, round, 1, MAX)
                    .unwrap();
            }
        })
    };
    let forth = mover(b"x", left.clone(), right.clone());
    let back = mover(b"y", right.clone(), left.clone());
    forth.join().unwrap();
    back.join().unwrap();

    assert_eq!(left.lookup(b"x", MAX).unwrap(), Some((ROUNDS - 1, 1)));
    assert_eq!(right.lookup(b"y", MAX).unwrap(), Some((ROUNDS - 1, 1)));
    assert_eq!(left.lookup(b"y", MAX).unwrap(), None);
    assert_eq!(right.lookup(b"x", MAX).unwrap(), None);
    assert_eq!((left.len(), right.len()), (1, 1));
}
