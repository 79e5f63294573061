//! Ordered enumeration that survives concurrent resizes.
//!
//! Entries are visited by split order: the bit-reversed hash, shifted
//! right by one so it never reaches `END_OF_DIR`. Bucket `i` of a
//! `2^k`-bucket array holds exactly the keys whose order has `reverse_k(i)`
//! in its top `k` bits, and doubling the array splits that range in two.
//! A cursor is therefore just "the last order (and key) returned" and
//! stays meaningful no matter how many resizes happen between calls.

use std::sync::Arc;

use crate::bucket::ChItem;
use crate::dirent::{self, END_OF_DIR};
use crate::table::{ChainHash, Layout};
use crate::{clamp_key, fnv1a_hash, ChtError, Result};

const MAX_ORDER: u64 = u64::MAX >> 1;

#[inline]
pub(crate) fn split_order(hash: u64) -> u64 {
    hash.reverse_bits() >> 1
}

/// Bucket index holding split-order position `position` of a `2^bits` array.
#[inline]
fn reverse_bits_k(position: u64, bits: u32) -> usize {
    if bits == 0 {
        0
    } else {
        (position.reverse_bits() >> (64 - bits)) as usize
    }
}

#[derive(Clone, Copy)]
enum Cursor<'k> {
    /// Entries with order >= the given one.
    From(u64),
    /// Entries strictly after (order, key).
    After(u64, &'k [u8]),
}

impl Cursor<'_> {
    fn order(&self) -> u64 {
        match *self {
            Cursor::From(order) | Cursor::After(order, _) => order,
        }
    }

    fn admits(&self, order: u64, key: &[u8]) -> bool {
        match *self {
            Cursor::From(from) => order >= from,
            Cursor::After(after, prev) => (order, key) > (after, prev),
        }
    }
}

struct Entry {
    order: u64,
    item: Arc<ChItem>,
}

impl ChainHash {
    /// Entries of the first non-empty logical bucket at or after `cursor`,
    /// sorted by (order, key). Empty once the table is exhausted.
    fn next_group(&self, cursor: Cursor<'_>) -> Result<Vec<Entry>> {
        if cursor.order() > MAX_ORDER {
            return Ok(Vec::new());
        }
        'retry: loop {
            let snap = self.snapshot();
            let (base, newer) = match &*snap.layout {
                Layout::Stable(array) => (array, None),
                Layout::Resizing { old, new, .. } => (old, Some(new)),
                Layout::Dead => return Err(ChtError::Dead),
            };
            let bits = base.bits();
            let first = cursor.order() >> (63 - bits);

            for position in first..(1u64 << bits) {
                let index = reverse_bits_k(position, bits);
                let mut guards = Vec::with_capacity(3);
                guards.push(base.bucket(index).read());
                if let Some(new) = newer {
                    guards.push(new.bucket(index).read());
                    guards.push(new.bucket(index + base.len()).read());
                }
                if self.generation() != snap.seq {
                    drop(guards);
                    self.wait_for_layout(snap.seq);
                    continue 'retry;
                }

                let mut group: Vec<Entry> = guards
                    .iter()
                    .filter(|chain| !chain.dead)
                    .flat_map(|chain| chain.items.iter())
                    .filter_map(|item| {
                        let order = split_order(item.hash());
                        cursor.admits(order, item.key()).then(|| Entry {
                            order,
                            item: item.clone(),
                        })
                    })
                    .collect();
                drop(guards);

                if !group.is_empty() {
                    group.sort_by(|a, b| (a.order, a.item.key()).cmp(&(b.order, b.item.key())));
                    return Ok(group);
                }
            }
            return Ok(Vec::new());
        }
    }

    /// The key following `prev` in enumeration order, or the first key when
    /// `prev` is `None`. Returns `None` at the end.
    ///
    /// Keys present for the whole walk are returned exactly once, even if
    /// the table is resized in between.
    pub fn enumerate(&self, prev: Option<&[u8]>, max_size: usize) -> Result<Option<Vec<u8>>> {
        let cursor = match prev {
            None => Cursor::From(0),
            Some(prev) => {
                let prev = clamp_key(prev, max_size);
                Cursor::After(split_order(fnv1a_hash(prev)), prev)
            }
        };
        Ok(self
            .next_group(cursor)?
            .first()
            .map(|entry| clamp_key(entry.item.key(), max_size).to_vec()))
    }

    /// Fill `buf` with `linux_dirent64` records starting at `*offset`.
    ///
    /// `*offset` starts at 0 and is advanced past every record written;
    /// it becomes `END_OF_DIR` once the table is exhausted. Entries sharing
    /// one position are emitted together or not at all. Returns the bytes
    /// written, or `BufferTooSmall` if not even the next group fits.
    pub fn getdents(&self, max_size: usize, offset: &mut u64, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        while *offset != END_OF_DIR {
            let group = self.next_group(Cursor::From(*offset))?;
            if group.is_empty() {
                *offset = END_OF_DIR;
                break;
            }

            let mut rest = &group[..];
            while let Some(first) = rest.first() {
                let len = rest.iter().take_while(|e| e.order == first.order).count();
                let (run, tail) = rest.split_at(len);
                rest = tail;

                let need: usize = run
                    .iter()
                    .map(|e| {
                        let name = dirent::fit_name(clamp_key(e.item.key(), max_size));
                        dirent::reclen(name.len())
                    })
                    .sum();
                if written + need > buf.len() {
                    return if written == 0 {
                        Err(ChtError::BufferTooSmall)
                    } else {
                        Ok(written)
                    };
                }

                let next_off = first.order + 1;
                for entry in run {
                    let name = dirent::fit_name(clamp_key(entry.item.key(), max_size));
                    written += dirent::encode(&mut buf[written..], entry.item.val(), next_off, name)
                        .ok_or(ChtError::BufferTooSmall)?;
                }
                *offset = next_off;
            }
        }
        Ok(written)
    }
}
