//! Bounded, order-preserving work queue between the walker/driver and the
//! serialization threads.
//!
//! Items are headers (dictionary + head type + fs index, always ready) and
//! data blocks (ready once a compression worker has transformed them). The
//! consumer always sees items in insertion order: `dequeue_first` blocks on
//! the head until it is Done, so workers may finish out of order without
//! reordering the archive byte stream.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::status::{Status, WAIT_TIMEOUT};

// ── BlockInfo ────────────────────────────────────────────────────────────────

/// One data block travelling through the pipeline.
///
/// On the save path `data` holds plaintext when enqueued Todo and the
/// archived bytes (compressed, possibly encrypted) once a worker marks it
/// Done. On the restore path the direction is reversed.
#[derive(Debug, Clone, Default)]
pub struct BlockInfo {
    pub data: Vec<u8>,
    /// Uncompressed payload size.
    pub realsize: u32,
    /// Offset of this block inside its file (large-file chains).
    pub offset: u64,
    /// Bytes actually stored in the archive (post compress + encrypt).
    pub arsize: u32,
    /// Compressed size before encryption.
    pub compsize: u32,
    /// Fletcher-32 of the archived bytes.
    pub arcsum: u32,
    pub compress_algo: u16,
    pub encrypt_algo: u16,
    pub fsindex: u16,
    /// Restore path: false when the archive checksum already failed and the
    /// payload has been replaced with zeroes.
    pub sumok: bool,
}

// ── Items ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Todo,
    InProgress,
    Done,
}

#[derive(Debug)]
enum Payload {
    Header {
        dico: Dico,
        headtype: u32,
        fsindex: u16,
    },
    Block(BlockInfo),
}

#[derive(Debug)]
struct Item {
    id: u64,
    state: ItemState,
    payload: Payload,
}

/// What `dequeue_first` hands to the consumer.
#[derive(Debug)]
pub enum QueueItem {
    Header {
        dico: Dico,
        headtype: u32,
        fsindex: u16,
    },
    Block(BlockInfo),
}

/// Peeked head summary for `check_next_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextItem {
    Header { headtype: u32, fsindex: u16 },
    Block,
}

/// Ticket handed to a worker that claimed a Todo block.
#[derive(Debug)]
pub struct BlockClaim {
    id: u64,
    pub info: BlockInfo,
}

// ── Queue ────────────────────────────────────────────────────────────────────

struct Inner {
    items: VecDeque<Item>,
    next_id: u64,
    end_of_queue: bool,
}

pub struct Queue {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
    status: Arc<Status>,
}

impl Queue {
    pub fn new(capacity: usize, status: Arc<Status>) -> Arc<Queue> {
        Arc::new(Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                next_id: 1,
                end_of_queue: false,
            }),
            cond: Condvar::new(),
            capacity,
            status,
        })
    }

    fn check_running(&self) -> FsaResult<()> {
        if self.status.is_running() {
            Ok(())
        } else {
            Err(FsaError::Closed("queue: operation is stopping".into()))
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Number of blocks still waiting for a worker.
    pub fn count_todo(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .items
            .iter()
            .filter(|it| it.state == ItemState::Todo)
            .count()
    }

    pub fn set_end_of_queue(&self) {
        self.inner.lock().unwrap().end_of_queue = true;
        self.cond.notify_all();
    }

    /// True once the end flag is set and every item has been consumed.
    pub fn is_end_of_queue(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.end_of_queue && inner.items.is_empty()
    }

    // ── Producer side ────────────────────────────────────────────────────────

    fn wait_for_room<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, Inner>,
    ) -> FsaResult<std::sync::MutexGuard<'a, Inner>> {
        loop {
            if inner.end_of_queue {
                return Err(FsaError::EndOfFile);
            }
            if inner.items.len() < self.capacity {
                return Ok(inner);
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }
    }

    /// Enqueue a header item; headers are born Done.
    pub fn add_header(&self, dico: Dico, headtype: u32, fsindex: u16) -> FsaResult<()> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_for_room(inner)?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push_back(Item {
            id,
            state: ItemState::Done,
            payload: Payload::Header {
                dico,
                headtype,
                fsindex,
            },
        });
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Enqueue a data block in the given state (Todo = transformation
    /// pending, Done = ready for the consumer as-is).
    pub fn add_block(&self, info: BlockInfo, state: ItemState) -> FsaResult<()> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_for_room(inner)?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push_back(Item {
            id,
            state,
            payload: Payload::Block(info),
        });
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    // ── Worker side ──────────────────────────────────────────────────────────

    /// Claim the first Todo block, marking it InProgress. Blocks until one
    /// is available; `EndOfFile` once the queue is finished and drained of
    /// Todo work.
    pub fn get_next_block_todo(&self) -> FsaResult<BlockClaim> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.iter_mut().find(|it| it.state == ItemState::Todo) {
                item.state = ItemState::InProgress;
                let id = item.id;
                // move the payload out, leaving an empty placeholder
                let info = match &mut item.payload {
                    Payload::Block(b) => std::mem::take(b),
                    Payload::Header { .. } => unreachable!("headers are never Todo"),
                };
                drop(inner);
                return Ok(BlockClaim { id, info });
            }
            if inner.end_of_queue {
                return Err(FsaError::EndOfFile);
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }
    }

    /// Publish the transformed payload of a previously claimed block and
    /// mark it Done.
    pub fn replace_block(&self, claim: BlockClaim, info: BlockInfo) -> FsaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner
            .items
            .iter_mut()
            .find(|it| it.id == claim.id)
            .ok_or_else(|| FsaError::NotFound(format!("queue item {} vanished", claim.id)))?;
        item.payload = Payload::Block(info);
        item.state = ItemState::Done;
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    // ── Consumer side ────────────────────────────────────────────────────────

    fn wait_head_done<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, Inner>,
    ) -> FsaResult<std::sync::MutexGuard<'a, Inner>> {
        loop {
            match inner.items.front() {
                Some(item) if item.state == ItemState::Done => return Ok(inner),
                Some(_) => {}
                None if inner.end_of_queue => return Err(FsaError::EndOfFile),
                None => {}
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }
    }

    /// Pop the head item once it is Done, preserving insertion order.
    pub fn dequeue_first(&self) -> FsaResult<QueueItem> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_head_done(inner)?;
        let item = inner.items.pop_front().unwrap();
        drop(inner);
        self.cond.notify_all();
        Ok(match item.payload {
            Payload::Header {
                dico,
                headtype,
                fsindex,
            } => QueueItem::Header {
                dico,
                headtype,
                fsindex,
            },
            Payload::Block(info) => QueueItem::Block(info),
        })
    }

    /// Dequeue expecting a header; a block at the head is an error (and is
    /// consumed, so the caller can resynchronize).
    pub fn dequeue_header(&self) -> FsaResult<(Dico, u32, u16)> {
        match self.dequeue_first()? {
            QueueItem::Header {
                dico,
                headtype,
                fsindex,
            } => Ok((dico, headtype, fsindex)),
            QueueItem::Block(_) => Err(FsaError::WrongType(
                "expected a header at the queue head, found a block".into(),
            )),
        }
    }

    /// Dequeue expecting a data block.
    pub fn dequeue_block(&self) -> FsaResult<BlockInfo> {
        match self.dequeue_first()? {
            QueueItem::Block(info) => Ok(info),
            QueueItem::Header { .. } => Err(FsaError::WrongType(
                "expected a block at the queue head, found a header".into(),
            )),
        }
    }

    /// Peek at the head item (waiting until it is Done) without removing it.
    pub fn check_next_item(&self) -> FsaResult<NextItem> {
        let inner = self.inner.lock().unwrap();
        let inner = self.wait_head_done(inner)?;
        let item = inner.items.front().unwrap();
        Ok(match &item.payload {
            Payload::Header {
                headtype, fsindex, ..
            } => NextItem::Header {
                headtype: *headtype,
                fsindex: *fsindex,
            },
            Payload::Block(_) => NextItem::Block,
        })
    }

    /// Pop the head item regardless of its state. Only valid when no
    /// worker pool is attached (metadata-only readers): an InProgress head
    /// would otherwise be ripped out from under its worker.
    pub fn take_first_any(&self) -> FsaResult<QueueItem> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.cond.notify_all();
                return Ok(match item.payload {
                    Payload::Header {
                        dico,
                        headtype,
                        fsindex,
                    } => QueueItem::Header {
                        dico,
                        headtype,
                        fsindex,
                    },
                    Payload::Block(info) => QueueItem::Block(info),
                });
            }
            if inner.end_of_queue {
                return Err(FsaError::EndOfFile);
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_TIMEOUT).unwrap();
            inner = guard;
            self.check_running()?;
        }
    }

    /// Drop the head item (used to skip garbage during resynchronization).
    pub fn destroy_first(&self) -> FsaResult<()> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_head_done(inner)?;
        inner.items.pop_front();
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn queue(cap: usize) -> Arc<Queue> {
        Queue::new(cap, Status::new())
    }

    fn block(tag: u8) -> BlockInfo {
        BlockInfo {
            data: vec![tag; 8],
            realsize: 8,
            sumok: true,
            ..Default::default()
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let q = queue(16);
        q.add_header(Dico::new(), 0x11, 0).unwrap();
        q.add_block(block(1), ItemState::Done).unwrap();
        q.add_header(Dico::new(), 0x22, 1).unwrap();
        q.set_end_of_queue();

        assert!(matches!(
            q.dequeue_first().unwrap(),
            QueueItem::Header { headtype: 0x11, .. }
        ));
        assert!(matches!(q.dequeue_first().unwrap(), QueueItem::Block(_)));
        assert!(matches!(
            q.dequeue_first().unwrap(),
            QueueItem::Header { headtype: 0x22, .. }
        ));
        assert!(matches!(q.dequeue_first(), Err(FsaError::EndOfFile)));
    }

    #[test]
    fn consumer_blocks_until_head_done() {
        let q = queue(16);
        q.add_block(block(7), ItemState::Todo).unwrap();

        let q2 = Arc::clone(&q);
        let worker = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            let claim = q2.get_next_block_todo().unwrap();
            let mut info = claim.info.clone();
            info.data = vec![0xFF; 8];
            q2.replace_block(claim, info).unwrap();
        });

        // dequeue_first must wait for the worker even though the item exists
        let item = q.dequeue_first().unwrap();
        match item {
            QueueItem::Block(info) => assert_eq!(info.data, vec![0xFF; 8]),
            _ => panic!("expected block"),
        }
        worker.join().unwrap();
    }

    #[test]
    fn workers_claim_in_order_but_finish_out_of_order() {
        let q = queue(16);
        q.add_block(block(1), ItemState::Todo).unwrap();
        q.add_block(block(2), ItemState::Todo).unwrap();

        let c1 = q.get_next_block_todo().unwrap();
        let c2 = q.get_next_block_todo().unwrap();
        assert_eq!(c1.info.data[0], 1);
        assert_eq!(c2.info.data[0], 2);

        // complete in reverse order
        let i2 = c2.info.clone();
        q.replace_block(c2, i2).unwrap();
        let i1 = c1.info.clone();
        q.replace_block(c1, i1).unwrap();

        // consumer still sees insertion order
        match q.dequeue_first().unwrap() {
            QueueItem::Block(info) => assert_eq!(info.data[0], 1),
            _ => panic!(),
        }
        match q.dequeue_first().unwrap() {
            QueueItem::Block(info) => assert_eq!(info.data[0], 2),
            _ => panic!(),
        }
    }

    #[test]
    fn capacity_bounds_producers() {
        let q = queue(2);
        q.add_header(Dico::new(), 1, 0).unwrap();
        q.add_header(Dico::new(), 2, 0).unwrap();

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            q2.add_header(Dico::new(), 3, 0).unwrap();
        });
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(q.count(), 2);
        q.dequeue_first().unwrap();
        producer.join().unwrap();
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn peek_and_destroy() {
        let q = queue(8);
        q.add_header(Dico::new(), 0x99, 3).unwrap();
        q.add_block(block(4), ItemState::Done).unwrap();
        assert_eq!(
            q.check_next_item().unwrap(),
            NextItem::Header {
                headtype: 0x99,
                fsindex: 3
            }
        );
        q.destroy_first().unwrap();
        assert_eq!(q.check_next_item().unwrap(), NextItem::Block);
    }

    #[test]
    fn todo_claim_ends_cleanly() {
        let q = queue(8);
        q.set_end_of_queue();
        assert!(matches!(q.get_next_block_todo(), Err(FsaError::EndOfFile)));
    }
}
