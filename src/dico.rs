//! Dictionary codec — the typed (section, key) → bytes map carried by every
//! logical record.
//!
//! # On-disk layout (per item, all integers little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   type       primitive width tag (see TYPE_*)
//!    1      1   section    key-space partition within one record
//!    2      2   key        (LE u16)
//!    4      2   size       payload bytes that follow (LE u16)
//!    6   size   data
//! ```
//!
//! The item count is NOT part of the dictionary bytes: it lives in the
//! enclosing record header, and the Fletcher-32 of the serialized items is
//! carried there too. Duplicates are allowed and insertion order is
//! preserved on both sides.
//!
//! Readers reject items whose declared `size` does not match the declared
//! primitive width. String items terminate at `size` bytes; no NUL byte is
//! required or stored.

use crate::error::{FsaError, FsaResult};

// Primitive type tags. Frozen.
pub const TYPE_U8: u8 = 1;
pub const TYPE_U16: u8 = 2;
pub const TYPE_U32: u8 = 3;
pub const TYPE_U64: u8 = 4;
pub const TYPE_DATA: u8 = 5;
pub const TYPE_STRING: u8 = 6;

/// Dictionary sections used by object records.
pub const SECTION_STDATTR: u8 = 0;
pub const SECTION_XATTR: u8 = 1;
pub const SECTION_WINATTR: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicoItem {
    pub dtype: u8,
    pub section: u8,
    pub key: u16,
    pub data: Vec<u8>,
}

/// Ordered multimap of typed items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dico {
    items: Vec<DicoItem>,
}

impl Dico {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Writers ──────────────────────────────────────────────────────────────

    pub fn add_raw(&mut self, section: u8, key: u16, dtype: u8, data: &[u8]) {
        self.items.push(DicoItem {
            dtype,
            section,
            key,
            data: data.to_vec(),
        });
    }

    pub fn add_u8(&mut self, section: u8, key: u16, v: u8) {
        self.add_raw(section, key, TYPE_U8, &[v]);
    }

    pub fn add_u16(&mut self, section: u8, key: u16, v: u16) {
        self.add_raw(section, key, TYPE_U16, &v.to_le_bytes());
    }

    pub fn add_u32(&mut self, section: u8, key: u16, v: u32) {
        self.add_raw(section, key, TYPE_U32, &v.to_le_bytes());
    }

    pub fn add_u64(&mut self, section: u8, key: u16, v: u64) {
        self.add_raw(section, key, TYPE_U64, &v.to_le_bytes());
    }

    pub fn add_data(&mut self, section: u8, key: u16, data: &[u8]) {
        self.add_raw(section, key, TYPE_DATA, data);
    }

    pub fn add_string(&mut self, section: u8, key: u16, s: &str) {
        self.add_raw(section, key, TYPE_STRING, s.as_bytes());
    }

    // ── Readers ──────────────────────────────────────────────────────────────

    /// First item matching (section, key), if any.
    pub fn get_raw(&self, section: u8, key: u16) -> Option<&DicoItem> {
        self.items
            .iter()
            .find(|it| it.section == section && it.key == key)
    }

    fn get_typed(&self, section: u8, key: u16, dtype: u8, width: usize) -> FsaResult<&[u8]> {
        let item = self
            .get_raw(section, key)
            .ok_or_else(|| FsaError::NotFound(format!("dico item section={section} key={key}")))?;
        if item.dtype != dtype || item.data.len() != width {
            return Err(FsaError::WrongType(format!(
                "dico item section={section} key={key}: type={} size={}",
                item.dtype,
                item.data.len()
            )));
        }
        Ok(&item.data)
    }

    pub fn get_u8(&self, section: u8, key: u16) -> FsaResult<u8> {
        Ok(self.get_typed(section, key, TYPE_U8, 1)?[0])
    }

    pub fn get_u16(&self, section: u8, key: u16) -> FsaResult<u16> {
        let b = self.get_typed(section, key, TYPE_U16, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&self, section: u8, key: u16) -> FsaResult<u32> {
        let b = self.get_typed(section, key, TYPE_U32, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&self, section: u8, key: u16) -> FsaResult<u64> {
        let b = self.get_typed(section, key, TYPE_U64, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn get_data(&self, section: u8, key: u16) -> FsaResult<&[u8]> {
        let item = self
            .get_raw(section, key)
            .ok_or_else(|| FsaError::NotFound(format!("dico item section={section} key={key}")))?;
        Ok(&item.data)
    }

    pub fn get_string(&self, section: u8, key: u16) -> FsaResult<String> {
        let data = self.get_data(section, key)?;
        String::from_utf8(data.to_vec())
            .map_err(|_| FsaError::WrongType(format!("dico item section={section} key={key}: not utf-8")))
    }

    pub fn count_all(&self) -> usize {
        self.items.len()
    }

    pub fn count_section(&self, section: u8) -> usize {
        self.items.iter().filter(|it| it.section == section).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DicoItem> {
        self.items.iter()
    }

    // ── Serialization ────────────────────────────────────────────────────────

    /// Serialize all items in insertion order. The enclosing record carries
    /// the item count and the Fletcher-32 of these bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let total: usize = self.items.iter().map(|it| 6 + it.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for it in &self.items {
            out.push(it.dtype);
            out.push(it.section);
            out.extend_from_slice(&it.key.to_le_bytes());
            out.extend_from_slice(&(it.data.len() as u16).to_le_bytes());
            out.extend_from_slice(&it.data);
        }
        out
    }

    /// Parse `itemcount` items out of `bytes`.
    ///
    /// Rejects truncated buffers and items whose size contradicts their
    /// declared primitive width.
    pub fn deserialize(bytes: &[u8], itemcount: u16) -> FsaResult<Dico> {
        let mut dico = Dico::new();
        let mut pos = 0usize;
        for _ in 0..itemcount {
            if pos + 6 > bytes.len() {
                return Err(FsaError::Corrupt("dico item header truncated".into()));
            }
            let dtype = bytes[pos];
            let section = bytes[pos + 1];
            let key = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]);
            let size = u16::from_le_bytes([bytes[pos + 4], bytes[pos + 5]]) as usize;
            pos += 6;
            if pos + size > bytes.len() {
                return Err(FsaError::Corrupt("dico item data truncated".into()));
            }
            let expected = match dtype {
                TYPE_U8 => Some(1),
                TYPE_U16 => Some(2),
                TYPE_U32 => Some(4),
                TYPE_U64 => Some(8),
                _ => None,
            };
            if let Some(w) = expected {
                if size != w {
                    return Err(FsaError::WrongType(format!(
                        "dico item key={key}: declared width {size} for type {dtype}"
                    )));
                }
            }
            dico.add_raw(section, key, dtype, &bytes[pos..pos + size]);
            pos += size;
        }
        if pos != bytes.len() {
            return Err(FsaError::Corrupt(format!(
                "dico has {} trailing bytes after {itemcount} items",
                bytes.len() - pos
            )));
        }
        Ok(dico)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn typed_roundtrip() {
        let mut d = Dico::new();
        d.add_u8(0, 1, 0x42);
        d.add_u16(0, 2, 0xBEEF);
        d.add_u32(1, 3, 0xDEAD_BEEF);
        d.add_u64(1, 4, u64::MAX - 1);
        d.add_string(0, 5, "a/path/with spaces");
        d.add_data(2, 6, &[0, 1, 2, 3]);

        let bytes = d.serialize();
        let back = Dico::deserialize(&bytes, d.count_all() as u16).unwrap();
        assert_eq!(back.get_u8(0, 1).unwrap(), 0x42);
        assert_eq!(back.get_u16(0, 2).unwrap(), 0xBEEF);
        assert_eq!(back.get_u32(1, 3).unwrap(), 0xDEAD_BEEF);
        assert_eq!(back.get_u64(1, 4).unwrap(), u64::MAX - 1);
        assert_eq!(back.get_string(0, 5).unwrap(), "a/path/with spaces");
        assert_eq!(back.get_data(2, 6).unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut d = Dico::new();
        d.add_string(1, 7, "first");
        d.add_string(1, 7, "second");
        let bytes = d.serialize();
        let back = Dico::deserialize(&bytes, 2).unwrap();
        assert_eq!(back.count_all(), 2);
        // the first occurrence wins on lookup
        assert_eq!(back.get_string(1, 7).unwrap(), "first");
        let vals: Vec<_> = back.iter().map(|it| it.data.clone()).collect();
        assert_eq!(vals, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn width_mismatch_rejected() {
        // hand-build an item claiming TYPE_U32 with 2 bytes of data
        let bad = [TYPE_U32, 0, 1, 0, 2, 0, 0xAA, 0xBB];
        assert!(matches!(
            Dico::deserialize(&bad, 1),
            Err(FsaError::WrongType(_))
        ));
    }

    #[test]
    fn wrong_width_getter_rejected() {
        let mut d = Dico::new();
        d.add_u16(0, 1, 7);
        assert!(matches!(d.get_u32(0, 1), Err(FsaError::WrongType(_))));
    }

    #[test]
    fn truncated_rejected() {
        let mut d = Dico::new();
        d.add_u64(0, 1, 42);
        let bytes = d.serialize();
        assert!(Dico::deserialize(&bytes[..bytes.len() - 1], 1).is_err());
    }

    #[test]
    fn count_section() {
        let mut d = Dico::new();
        d.add_u8(0, 1, 1);
        d.add_u8(0, 2, 2);
        d.add_u8(1, 1, 3);
        assert_eq!(d.count_section(0), 2);
        assert_eq!(d.count_section(1), 1);
        assert_eq!(d.count_section(2), 0);
    }

    proptest! {
        #[test]
        fn arbitrary_data_roundtrip(
            entries in proptest::collection::vec(
                (any::<u8>(), any::<u16>(), proptest::collection::vec(any::<u8>(), 0..256)),
                0..32,
            )
        ) {
            let mut d = Dico::new();
            for (section, key, data) in &entries {
                d.add_data(*section, *key, data);
            }
            let bytes = d.serialize();
            let back = Dico::deserialize(&bytes, entries.len() as u16).unwrap();
            prop_assert_eq!(back.count_all(), entries.len());
            for (it, (section, key, data)) in back.iter().zip(entries.iter()) {
                prop_assert_eq!(it.section, *section);
                prop_assert_eq!(it.key, *key);
                prop_assert_eq!(&it.data, data);
            }
        }
    }
}
