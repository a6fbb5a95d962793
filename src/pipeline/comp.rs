//! Compression and decompression worker pools.
//!
//! Workers claim Todo blocks from the shared queue, transform them in
//! place, and mark them Done. They may finish out of order; the queue
//! reveals items to the consumer in insertion order regardless, which
//! keeps the archive byte stream deterministic for any worker count.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::checksum::fletcher32;
use crate::codec::{get_codec, get_codec_by_id, CompressAlgo};
use crate::crypto::{self, EncryptAlgo};
use crate::error::{FsaError, FsaResult};
use crate::queue::{BlockInfo, Queue};
use crate::status::{RunState, Status};

/// Transform one plaintext block into its archived form: compress (falling
/// back to verbatim storage when that does not shrink it), optionally
/// encrypt, and checksum the final bytes.
pub fn compress_block(
    info: &mut BlockInfo,
    algo: CompressAlgo,
    level: i32,
    key: Option<&[u8; 32]>,
) -> FsaResult<()> {
    let plain = std::mem::take(&mut info.data);
    info.realsize = plain.len() as u32;

    let codec = get_codec(algo);
    let (mut out, stored_algo) = match codec.compress(&plain, level) {
        Ok(c) if c.len() < plain.len() => (c, algo),
        // growth or codec failure: store the original bytes
        _ => (plain, CompressAlgo::None),
    };
    info.compsize = out.len() as u32;
    info.compress_algo = stored_algo.wire_id();

    match key {
        Some(k) => {
            out = crypto::encrypt(k, &out)
                .map_err(|e| FsaError::Write(format!("block encryption: {e}")))?;
            info.encrypt_algo = EncryptAlgo::Aes256.wire_id();
        }
        None => {
            info.encrypt_algo = EncryptAlgo::None.wire_id();
        }
    }

    info.arsize = out.len() as u32;
    info.arcsum = fletcher32(&out);
    info.sumok = true;
    info.data = out;
    Ok(())
}

/// Transform one archived block back into plaintext.
///
/// A block whose archive checksum already failed arrives zeroed with
/// `sumok == false` and passes through untouched; the object-level
/// integrity check decides what happens to the containing file. Decrypt
/// or decompress failures degrade the block the same way instead of
/// stopping the pipeline.
pub fn decompress_block(info: &mut BlockInfo, key: Option<&[u8; 32]>) -> FsaResult<()> {
    if !info.sumok {
        return Ok(());
    }

    let archived = std::mem::take(&mut info.data);

    let compressed = match EncryptAlgo::from_wire_id(info.encrypt_algo) {
        Some(EncryptAlgo::None) => archived,
        Some(EncryptAlgo::Aes256) => {
            let k = match key {
                Some(k) => k,
                None => {
                    crate::errmsg!("block is encrypted but no password was provided");
                    degrade(info);
                    return Ok(());
                }
            };
            match crypto::decrypt(k, &archived) {
                Ok(c) => c,
                Err(_) => {
                    crate::errmsg!("cannot decrypt block at offset {}", info.offset);
                    degrade(info);
                    return Ok(());
                }
            }
        }
        None => {
            crate::errmsg!("unknown encryption algorithm id {}", info.encrypt_algo);
            degrade(info);
            return Ok(());
        }
    };

    let codec = match get_codec_by_id(info.compress_algo) {
        Ok(c) => c,
        Err(e) => {
            crate::errmsg!("{e}");
            degrade(info);
            return Ok(());
        }
    };

    match codec.decompress(&compressed, info.realsize as usize) {
        Ok(plain) if plain.len() == info.realsize as usize => {
            info.data = plain;
        }
        Ok(plain) => {
            crate::errmsg!(
                "block at offset {} decompressed to {} bytes, expected {}",
                info.offset,
                plain.len(),
                info.realsize
            );
            degrade(info);
        }
        Err(e) => {
            crate::errmsg!("cannot decompress block at offset {}: {e}", info.offset);
            degrade(info);
        }
    }
    Ok(())
}

fn degrade(info: &mut BlockInfo) {
    info.data = vec![0u8; info.realsize as usize];
    info.sumok = false;
}

enum Direction {
    Compress {
        algo: CompressAlgo,
        level: i32,
    },
    Decompress,
}

fn worker_loop(queue: Arc<Queue>, status: Arc<Status>, dir: Direction, key: Option<[u8; 32]>) {
    status.enter_secondary();
    loop {
        let mut claim = match queue.get_next_block_todo() {
            Ok(c) => c,
            Err(FsaError::EndOfFile) | Err(FsaError::Closed(_)) => break,
            Err(e) => {
                status.set(RunState::Failed, &format!("worker claim failed: {e}"));
                break;
            }
        };

        let mut info = std::mem::take(&mut claim.info);
        let res = match &dir {
            Direction::Compress { algo, level } => {
                compress_block(&mut info, *algo, *level, key.as_ref())
            }
            Direction::Decompress => decompress_block(&mut info, key.as_ref()),
        };

        if let Err(e) = res {
            status.set(RunState::Failed, &format!("block transform failed: {e}"));
            break;
        }
        if let Err(e) = queue.replace_block(claim, info) {
            status.set(RunState::Failed, &format!("queue replace failed: {e}"));
            break;
        }
        if !status.is_running() {
            break;
        }
    }
    status.leave_secondary();
}

/// Spawn the save-side compressor pool.
pub fn spawn_compressors(
    queue: &Arc<Queue>,
    status: &Arc<Status>,
    jobs: u32,
    algo: CompressAlgo,
    level: i32,
    key: Option<[u8; 32]>,
) -> Vec<JoinHandle<()>> {
    (0..jobs)
        .map(|i| {
            let queue = Arc::clone(queue);
            let status = Arc::clone(status);
            std::thread::Builder::new()
                .name(format!("compress-{i}"))
                .spawn(move || worker_loop(queue, status, Direction::Compress { algo, level }, key))
                .expect("spawn compressor thread")
        })
        .collect()
}

/// Spawn the restore-side decompressor pool.
pub fn spawn_decompressors(
    queue: &Arc<Queue>,
    status: &Arc<Status>,
    jobs: u32,
    key: Option<[u8; 32]>,
) -> Vec<JoinHandle<()>> {
    (0..jobs)
        .map(|i| {
            let queue = Arc::clone(queue);
            let status = Arc::clone(status);
            std::thread::Builder::new()
                .name(format!("decompress-{i}"))
                .spawn(move || worker_loop(queue, status, Direction::Decompress, key))
                .expect("spawn decompressor thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo_block(data: Vec<u8>) -> BlockInfo {
        BlockInfo {
            data,
            fsindex: 0,
            offset: 0,
            ..Default::default()
        }
    }

    #[test]
    fn compress_then_decompress() {
        let mut info = todo_block(vec![0x41; 4096]);
        compress_block(&mut info, CompressAlgo::Zstd, 3, None).unwrap();
        assert_eq!(info.realsize, 4096);
        assert_eq!(info.compress_algo, CompressAlgo::Zstd.wire_id());
        assert!(info.arsize < 4096);
        assert_eq!(info.arcsum, fletcher32(&info.data));

        decompress_block(&mut info, None).unwrap();
        assert!(info.sumok);
        assert_eq!(info.data, vec![0x41; 4096]);
    }

    #[test]
    fn incompressible_data_stored_verbatim() {
        let data: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut info = todo_block(data.clone());
        compress_block(&mut info, CompressAlgo::Lz4, 0, None).unwrap();
        // high-entropy input must fall back to "none"
        if info.compress_algo == CompressAlgo::None.wire_id() {
            assert_eq!(info.data, data);
            assert_eq!(info.arsize as usize, data.len());
        }
        decompress_block(&mut info, None).unwrap();
        assert_eq!(info.data, data);
    }

    #[test]
    fn encrypted_roundtrip() {
        let key = crate::crypto::derive_key("secret-pass", 42).unwrap();
        let mut info = todo_block(vec![7u8; 2048]);
        compress_block(&mut info, CompressAlgo::Lz4, 0, Some(&key)).unwrap();
        assert_eq!(info.encrypt_algo, EncryptAlgo::Aes256.wire_id());

        decompress_block(&mut info, Some(&key)).unwrap();
        assert!(info.sumok);
        assert_eq!(info.data, vec![7u8; 2048]);
    }

    #[test]
    fn wrong_key_degrades_block() {
        let key = crate::crypto::derive_key("secret-pass", 42).unwrap();
        let bad = crate::crypto::derive_key("other-passw", 42).unwrap();
        let mut info = todo_block(vec![7u8; 512]);
        compress_block(&mut info, CompressAlgo::Lz4, 0, Some(&key)).unwrap();

        decompress_block(&mut info, Some(&bad)).unwrap();
        assert!(!info.sumok);
        assert_eq!(info.data, vec![0u8; 512]);
    }

    #[test]
    fn pre_degraded_block_passes_through() {
        let mut info = BlockInfo {
            data: vec![0u8; 128],
            realsize: 128,
            sumok: false,
            ..Default::default()
        };
        decompress_block(&mut info, None).unwrap();
        assert!(!info.sumok);
        assert_eq!(info.data.len(), 128);
    }

    #[test]
    fn pool_transforms_queue_items_in_order() {
        use crate::queue::{ItemState, QueueItem};

        let status = Status::new();
        let queue = Queue::new(32, Arc::clone(&status));
        let workers = spawn_compressors(&queue, &status, 4, CompressAlgo::Lz4, 0, None);

        for i in 0..16u8 {
            queue
                .add_block(todo_block(vec![i; 1024]), ItemState::Todo)
                .unwrap();
        }
        queue.set_end_of_queue();

        for i in 0..16u8 {
            let mut info = match queue.dequeue_first().unwrap() {
                QueueItem::Block(b) => b,
                _ => panic!("expected block"),
            };
            decompress_block(&mut info, None).unwrap();
            assert_eq!(info.data, vec![i; 1024], "order must be preserved");
        }

        for w in workers {
            w.join().unwrap();
        }
    }
}
