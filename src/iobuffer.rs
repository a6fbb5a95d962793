//! Bounded buffer of fixed-size byte blocks between the logical-record
//! layer and the FEC layer.
//!
//! Two producer/consumer disciplines share one store:
//!
//! - **FEC mode** — [`IoBuffer::write_fec_block`] pushes exactly one fully
//!   populated block (K×4096 bytes); [`IoBuffer::read_fec_block`] pops one
//!   at a time. Used on the restore path (decoder → records) and by the
//!   save-side encoder reading whole frames.
//! - **Raw mode** — [`IoBuffer::write_raw`] appends an arbitrary byte run,
//!   packing into the tail block and allocating as needed;
//!   [`IoBuffer::read_raw`] pulls byte runs across block boundaries.
//!
//! Producers over capacity and consumers on empty wait on one condition
//! variable with a one-second timeout; the run status is checked after
//! every wake so an abort never strands a thread. `set_end_of_buffer`
//! marks the tail block drainable regardless of fill and wakes everybody;
//! reads that exhaust the store afterwards return `EndOfFile`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{FsaError, FsaResult};
use crate::status::{Status, WAIT_TIMEOUT};

struct IoBlock {
    data: Vec<u8>,
    bytes_used: usize,
    bytes_ptr: usize,
    eof: bool,
}

struct Inner {
    blocks: VecDeque<IoBlock>,
    end_of_buffer: bool,
}

pub struct IoBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    blocks_maxcnt: usize,
    block_size: usize,
    status: Arc<Status>,
}

impl IoBuffer {
    pub fn new(blocks_maxcnt: usize, block_size: usize, status: Arc<Status>) -> Arc<IoBuffer> {
        Arc::new(IoBuffer {
            inner: Mutex::new(Inner {
                blocks: VecDeque::new(),
                end_of_buffer: false,
            }),
            cond: Condvar::new(),
            blocks_maxcnt,
            block_size,
            status,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// True once the end flag is set and every block has been drained.
    pub fn is_end_of_buffer(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.end_of_buffer && inner.blocks.is_empty()
    }

    /// Mark the tail block drainable and refuse further writes.
    pub fn set_end_of_buffer(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tail) = inner.blocks.back_mut() {
            tail.eof = true;
        }
        inner.end_of_buffer = true;
        drop(inner);
        self.cond.notify_all();
    }

    fn check_running(&self) -> FsaResult<()> {
        if self.status.is_running() {
            Ok(())
        } else {
            Err(FsaError::Closed("iobuffer: operation is stopping".into()))
        }
    }

    // ── FEC mode ─────────────────────────────────────────────────────────────

    /// Push one complete block of exactly `block_size` bytes.
    /// `bytes_used` records how much of it is meaningful.
    pub fn write_fec_block(&self, data: &[u8], bytes_used: u32) -> FsaResult<()> {
        if data.len() != self.block_size {
            return Err(FsaError::InvalidArg(format!(
                "fec block is {} bytes, iobuffer wants {}",
                data.len(),
                self.block_size
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.end_of_buffer {
                return Err(FsaError::EndOfFile);
            }
            if inner.blocks.len() < self.blocks_maxcnt {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }

        inner.blocks.push_back(IoBlock {
            data: data.to_vec(),
            bytes_used: bytes_used as usize,
            bytes_ptr: 0,
            eof: false,
        });
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Pop one block into `buf` (must be `block_size` bytes). Only full or
    /// eof-marked head blocks are handed out; the fill level is returned.
    pub fn read_fec_block(&self, buf: &mut [u8]) -> FsaResult<u32> {
        if buf.len() != self.block_size {
            return Err(FsaError::InvalidArg(format!(
                "fec buffer is {} bytes, iobuffer wants {}",
                buf.len(),
                self.block_size
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            let head_ready = inner
                .blocks
                .front()
                .map(|b| b.bytes_used == self.block_size || b.eof)
                .unwrap_or(false);
            if head_ready {
                let block = inner.blocks.pop_front().unwrap();
                buf.copy_from_slice(&block.data);
                let used = block.bytes_used as u32;
                drop(inner);
                self.cond.notify_all();
                return Ok(used);
            }
            if inner.end_of_buffer && inner.blocks.is_empty() {
                return Err(FsaError::EndOfFile);
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }
    }

    // ── Raw mode ─────────────────────────────────────────────────────────────

    /// Append an arbitrary byte run, packing into the tail block and
    /// growing the list (bounded) as needed.
    pub fn write_raw(&self, mut data: &[u8]) -> FsaResult<()> {
        while !data.is_empty() {
            let mut inner = self.inner.lock().unwrap();

            let tail_full = inner
                .blocks
                .back()
                .map(|b| b.bytes_used == self.block_size)
                .unwrap_or(true);

            if tail_full {
                loop {
                    if inner.end_of_buffer {
                        return Err(FsaError::EndOfFile);
                    }
                    if inner.blocks.len() < self.blocks_maxcnt {
                        break;
                    }
                    let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
                    inner = guard;
                    self.check_running()?;
                }
                inner.blocks.push_back(IoBlock {
                    data: vec![0u8; self.block_size],
                    bytes_used: 0,
                    bytes_ptr: 0,
                    eof: false,
                });
            }

            let block_size = self.block_size;
            let tail = inner.blocks.back_mut().unwrap();
            let space = block_size - tail.bytes_used;
            let take = space.min(data.len());
            tail.data[tail.bytes_used..tail.bytes_used + take].copy_from_slice(&data[..take]);
            tail.bytes_used += take;
            data = &data[take..];

            drop(inner);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Fill `buf` completely from the head of the store, crossing block
    /// boundaries. Returns `EndOfFile` if the buffer drains first.
    pub fn read_raw(&self, buf: &mut [u8]) -> FsaResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let mut inner = self.inner.lock().unwrap();

            loop {
                let has_data = inner
                    .blocks
                    .front()
                    .map(|b| b.bytes_used > b.bytes_ptr)
                    .unwrap_or(false);
                if has_data {
                    break;
                }
                // a fully consumed head block can be retired even before eof
                let consumed_head = inner
                    .blocks
                    .front()
                    .map(|b| b.bytes_ptr == b.bytes_used && (b.bytes_used == self.block_size || b.eof))
                    .unwrap_or(false);
                if consumed_head {
                    inner.blocks.pop_front();
                    drop(inner);
                    self.cond.notify_all();
                    inner = self.inner.lock().unwrap();
                    continue;
                }
                if inner.end_of_buffer && inner.blocks.is_empty() {
                    return Err(FsaError::EndOfFile);
                }
                let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
                inner = guard;
                self.check_running()?;
            }

            let block_size = self.block_size;
            let mut retire = false;
            {
                let head = inner.blocks.front_mut().unwrap();
                let avail = head.bytes_used - head.bytes_ptr;
                let take = avail.min(buf.len() - filled);
                buf[filled..filled + take]
                    .copy_from_slice(&head.data[head.bytes_ptr..head.bytes_ptr + take]);
                head.bytes_ptr += take;
                filled += take;
                if head.bytes_ptr == head.bytes_used && (head.bytes_used == block_size || head.eof) {
                    retire = true;
                }
            }
            if retire {
                inner.blocks.pop_front();
            }
            drop(inner);
            self.cond.notify_all();
        }
        Ok(())
    }
}
