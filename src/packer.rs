//! Small-file packer: groups many small regular files into one shared data
//! block so they compress together instead of one block per tiny file.
//!
//! Save side accumulates (attributes, content) pairs until either the file
//! count or the byte ceiling is reached, then emits all the OBJT records
//! (each patched with the group count and its slice offset) followed by a
//! single Todo block holding the concatenated contents. Restore side
//! collects the same records plus the decompressed block and slices it
//! back into per-file payloads.

use crate::dico::{Dico, SECTION_STDATTR};
use crate::error::{FsaError, FsaResult};
use crate::keys::object;
use crate::options::{DEF_BLKSIZE, MAX_SMALLFILECOUNT};
use crate::queue::{BlockInfo, ItemState, Queue};

// ── Save side ────────────────────────────────────────────────────────────────

pub struct GroupPacker {
    max_count: usize,
    max_bytes: usize,
    files: Vec<(Dico, Vec<u8>)>,
    used: usize,
}

impl Default for GroupPacker {
    fn default() -> Self {
        Self::new(MAX_SMALLFILECOUNT, DEF_BLKSIZE as usize)
    }
}

impl GroupPacker {
    pub fn new(max_count: usize, max_bytes: usize) -> GroupPacker {
        GroupPacker {
            max_count,
            max_bytes,
            files: Vec::new(),
            used: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    /// Whether one more file of `size` bytes fits in the current group.
    pub fn would_fit(&self, size: usize) -> bool {
        self.files.len() < self.max_count && self.used + size <= self.max_bytes
    }

    /// Add a small file. The dictionary must already carry the standard
    /// attributes (path, mode, times, md5, …); the group fields are
    /// patched in at flush time.
    pub fn add(&mut self, dico: Dico, data: Vec<u8>) {
        self.used += data.len();
        self.files.push((dico, data));
    }

    /// Emit the group: `count` OBJT records, then one Todo block carrying
    /// the concatenated file contents. No-op on an empty group.
    pub fn flush(&mut self, queue: &Queue, fsindex: u16) -> FsaResult<()> {
        if self.files.is_empty() {
            return Ok(());
        }

        let count = self.files.len() as u32;
        let mut payload = Vec::with_capacity(self.used);

        for (mut dico, data) in self.files.drain(..) {
            dico.add_u32(SECTION_STDATTR, object::MULTIFILESCOUNT, count);
            dico.add_u64(SECTION_STDATTR, object::MULTIFILESOFFSET, payload.len() as u64);
            payload.extend_from_slice(&data);
            queue.add_header(dico, crate::record::headtype::OBJT, fsindex)?;
        }
        self.used = 0;

        queue.add_block(
            BlockInfo {
                data: payload,
                fsindex,
                offset: 0,
                sumok: true,
                ..Default::default()
            },
            ItemState::Todo,
        )?;
        Ok(())
    }
}

// ── Restore side ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct GroupUnpacker {
    headers: Vec<Dico>,
    block: Vec<u8>,
}

impl GroupUnpacker {
    pub fn new() -> GroupUnpacker {
        GroupUnpacker::default()
    }

    pub fn add_header(&mut self, dico: Dico) {
        self.headers.push(dico);
    }

    pub fn set_data_block(&mut self, data: Vec<u8>) {
        self.block = data;
    }

    pub fn count(&self) -> usize {
        self.headers.len()
    }

    /// Slice out file `i` of the group. Range errors mean the shared block
    /// was corrupted; they are per-file failures, not fatal.
    pub fn get_file(&self, i: usize) -> FsaResult<(&Dico, &[u8])> {
        let dico = self
            .headers
            .get(i)
            .ok_or_else(|| FsaError::InvalidArg(format!("group has no file {i}")))?;
        let offset = dico.get_u64(SECTION_STDATTR, object::MULTIFILESOFFSET)? as usize;
        let size = dico.get_u64(SECTION_STDATTR, object::SIZE)? as usize;
        let end = offset
            .checked_add(size)
            .filter(|&e| e <= self.block.len())
            .ok_or_else(|| {
                FsaError::Corrupt(format!(
                    "packed file {i} range {offset}+{size} exceeds shared block of {} bytes",
                    self.block.len()
                ))
            })?;
        Ok((dico, &self.block[offset..end]))
    }
}
