//! `linux_dirent64` records as produced by `ChainHash::getdents`.
//!
//! Layout (native endian): `d_ino: u64`, `d_off: i64`, `d_reclen: u16`,
//! `d_type: u8`, then the NUL-terminated name, padded to 8 bytes.

/// Offset value meaning the enumeration has finished.
pub const END_OF_DIR: u64 = u64::MAX;

/// `DT_UNKNOWN`; callers stat the inode for the real type.
pub const DT_UNKNOWN: u8 = 0;

const NAME_OFFSET: usize = 19;

/// Longest name a record can carry with `d_reclen` still fitting a `u16`.
pub const DIRENT_NAME_MAX: usize = u16::MAX as usize - NAME_OFFSET - 8;

/// `name` cut to what a record can hold.
pub fn fit_name(name: &[u8]) -> &[u8] {
    &name[..name.len().min(DIRENT_NAME_MAX)]
}

/// Size of the record holding a name of `name_len` bytes.
pub fn reclen(name_len: usize) -> usize {
    (NAME_OFFSET + name_len + 1 + 7) & !7
}

/// Write one record at the start of `buf`. Returns the bytes used, or
/// `None` if the record does not fit.
pub(crate) fn encode(buf: &mut [u8], ino: u64, next_off: u64, name: &[u8]) -> Option<usize> {
    let len = reclen(name.len());
    if buf.len() < len || len > u16::MAX as usize {
        return None;
    }
    let rec = &mut buf[..len];
    rec[0..8].copy_from_slice(&ino.to_ne_bytes());
    rec[8..16].copy_from_slice(&next_off.to_ne_bytes());
    rec[16..18].copy_from_slice(&(len as u16).to_ne_bytes());
    rec[18] = DT_UNKNOWN;
    rec[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    rec[NAME_OFFSET + name.len()..].fill(0);
    Some(len)
}

/// A decoded record borrowed from a getdents buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDirent<'a> {
    pub ino: u64,
    pub next_off: u64,
    pub reclen: u16,
    pub d_type: u8,
    pub name: &'a [u8],
}

/// Walks the records of a filled getdents buffer.
pub struct DirentIter<'a> {
    buf: &'a [u8],
}

impl<'a> DirentIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for DirentIter<'a> {
    type Item = RawDirent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NAME_OFFSET + 1 {
            return None;
        }
        let ino = u64::from_ne_bytes(self.buf[0..8].try_into().ok()?);
        let next_off = u64::from_ne_bytes(self.buf[8..16].try_into().ok()?);
        let reclen = u16::from_ne_bytes(self.buf[16..18].try_into().ok()?);
        let d_type = self.buf[18];
        let len = reclen as usize;
        if len < NAME_OFFSET + 1 || len > self.buf.len() {
            return None;
        }
        let raw_name = &self.buf[NAME_OFFSET..len];
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let rec = RawDirent {
            ino,
            next_off,
            reclen,
            d_type,
            name: &raw_name[..name_len],
        };
        self.buf = &self.buf[len..];
        Some(rec)
    }
}
