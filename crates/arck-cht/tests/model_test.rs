//! Property tests: random operation sequences checked against a BTreeMap.

use std::collections::{BTreeMap, BTreeSet};

use arck_cht::{ChainHash, ChtError, ChtOptions, DirentIter, DstMode, END_OF_DIR};
use proptest::prelude::*;

const MAX: usize = 255;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, u64),
    Remove(u8),
    Lookup(u8),
    Move(u8, u8, bool),
    StartResize,
    Migrate(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (0u8..24).prop_map(Op::Remove),
        2 => (0u8..24).prop_map(Op::Lookup),
        2 => (0u8..24, 0u8..24, any::<bool>()).prop_map(|(a, b, o)| Op::Move(a, b, o)),
        1 => Just(Op::StartResize),
        1 => (1u8..4).prop_map(Op::Migrate),
    ]
}

fn key(k: u8) -> Vec<u8> {
    format!("key-{k}").into_bytes()
}

fn collect_keys(table: &ChainHash) -> BTreeSet<Vec<u8>> {
    let mut out = BTreeSet::new();
    let mut prev: Option<Vec<u8>> = None;
    while let Some(k) = table.enumerate(prev.as_deref(), MAX).unwrap() {
        assert!(out.insert(k.clone()), "key {k:?} enumerated twice");
        prev = Some(k);
    }
    out
}

fn collect_dirents(table: &ChainHash) -> BTreeMap<Vec<u8>, u64> {
    let mut out = BTreeMap::new();
    let mut offset = 0;
    let mut buf = [0u8; 80];
    while offset != END_OF_DIR {
        let n = table.getdents(MAX, &mut offset, &mut buf).unwrap();
        for rec in DirentIter::new(&buf[..n]) {
            assert!(out.insert(rec.name.to_vec(), rec.ino).is_none());
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn prop_table_matches_model(ops in proptest::collection::vec(op(), 1..120)) {
        let table = ChainHash::new(2, ChtOptions {
            auto_resize: false,
            migrate_step: 0,
            ..ChtOptions::default()
        });
        let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let got = table.insert(&key(k), MAX, v, 0).map(|_| ());
                    if model.contains_key(&key(k)) {
                        prop_assert_eq!(got, Err(ChtError::AlreadyExists));
                    } else {
                        prop_assert_eq!(got, Ok(()));
                        model.insert(key(k), v);
                    }
                }
                Op::Remove(k) => {
                    let got = table.remove(&key(k), MAX).unwrap().map(|(v, _)| v);
                    prop_assert_eq!(got, model.remove(&key(k)));
                }
                Op::Lookup(k) => {
                    let got = table.lookup(&key(k), MAX).unwrap().map(|(v, _)| v);
                    prop_assert_eq!(got, model.get(&key(k)).copied());
                }
                Op::Move(a, b, overwrite) => {
                    let mode = if overwrite { DstMode::Overwrite } else { DstMode::MustNotExist };
                    let src_val = model.get(&key(a)).copied();
                    let got = ChainHash::replace_from(&table, &key(b), mode, &table, &key(a), 5, 0, MAX)
                        .map(|r| r.displaced.map(|(v, _)| v));
                    match src_val {
                        None => prop_assert_eq!(got, Err(ChtError::NotFound)),
                        Some(_) if a == b => {
                            prop_assert_eq!(got, Ok(None));
                            model.insert(key(a), 5);
                        }
                        Some(_) => {
                            let dst = model.get(&key(b)).copied();
                            match (overwrite, dst) {
                                (false, Some(_)) => prop_assert_eq!(got, Err(ChtError::AlreadyExists)),
                                (true, None) => prop_assert_eq!(got, Err(ChtError::DestinationMissing)),
                                _ => {
                                    prop_assert_eq!(got, Ok(dst));
                                    model.remove(&key(a));
                                    model.insert(key(b), 5);
                                }
                            }
                        }
                    }
                }
                Op::StartResize => {
                    table.start_resize().unwrap();
                }
                Op::Migrate(n) => {
                    table.migrate(n as usize);
                }
            }
            prop_assert_eq!(table.len(), model.len());
        }

        let expected: BTreeSet<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(collect_keys(&table), expected);
        prop_assert_eq!(collect_dirents(&table), model);
    }

    #[test]
    fn prop_clamped_keys_are_equivalent(name in "[a-z]{1,12}", tail in "[a-z]{0,6}") {
        let table = ChainHash::new(4, ChtOptions::default());
        let mut padded = name.clone().into_bytes();
        padded.push(0);
        padded.extend_from_slice(tail.as_bytes());

        table.insert(&padded, MAX, 9, 0).unwrap();
        prop_assert_eq!(table.lookup(name.as_bytes(), MAX).unwrap(), Some((9, 0)));
        prop_assert_eq!(table.insert(name.as_bytes(), MAX, 1, 0).unwrap_err(), ChtError::AlreadyExists);
    }
}
