//! Save-side serialization threads: queue → iobuffer, and
//! iobuffer → FEC encoder → volume writer.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::error::FsaError;
use crate::fec::{FecCodec, FRAME_PAYLOAD_SIZE};
use crate::iobuffer::IoBuffer;
use crate::queue::{Queue, QueueItem};
use crate::record;
use crate::status::{RunState, Status};
use crate::volume::VolumeWriter;

/// Drain the queue in insertion order into the iobuffer, serializing
/// headers as logical records and blocks as BLKH + payload.
pub fn spawn_queue_to_iobuffer(
    queue: Arc<Queue>,
    iob: Arc<IoBuffer>,
    status: Arc<Status>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("queue2iobuf".into())
        .spawn(move || {
            status.enter_secondary();
            loop {
                match queue.dequeue_first() {
                    Ok(QueueItem::Header {
                        dico,
                        headtype,
                        fsindex,
                    }) => {
                        if let Err(e) = record::write_record(&iob, &dico, headtype, fsindex) {
                            status.set(RunState::Failed, &format!("record write failed: {e}"));
                            break;
                        }
                    }
                    Ok(QueueItem::Block(info)) => {
                        if let Err(e) = super::write_block_item(&iob, &info) {
                            status.set(RunState::Failed, &format!("block write failed: {e}"));
                            break;
                        }
                    }
                    Err(FsaError::EndOfFile) => break,
                    Err(FsaError::Closed(_)) => break,
                    Err(e) => {
                        status.set(RunState::Failed, &format!("queue dequeue failed: {e}"));
                        break;
                    }
                }
            }
            iob.set_end_of_buffer();
            crate::msg!(2, "thread queue2iobuf: exit");
            status.leave_secondary();
        })
        .expect("spawn queue2iobuf thread")
}

/// Summary returned by the volume-writer thread on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteSummary {
    pub frames_written: u64,
    pub bytes_written: u64,
}

pub struct WriterConfig {
    pub basepath: PathBuf,
    pub archid: u32,
    pub ecclevel: u32,
    pub overwrite: bool,
    pub splitsize: u64,
}

/// Pull full frames from the iobuffer, FEC-encode them, and append them to
/// the archive volumes. Owns the volume writer and the encoder; on abort
/// or failure it removes every volume this process created.
pub fn spawn_iobuffer_to_volume(
    iob: Arc<IoBuffer>,
    status: Arc<Status>,
    config: WriterConfig,
) -> (JoinHandle<()>, Receiver<WriteSummary>) {
    let (tx, rx) = bounded(1);
    let handle = std::thread::Builder::new()
        .name("iobuf2volume".into())
        .spawn(move || {
            status.enter_secondary();

            let codec = match FecCodec::new(config.ecclevel) {
                Ok(c) => c,
                Err(e) => {
                    status.set(RunState::Failed, &format!("fec init failed: {e}"));
                    status.leave_secondary();
                    return;
                }
            };

            let mut writer = VolumeWriter::new(
                &config.basepath,
                config.archid,
                config.ecclevel,
                config.overwrite,
                config.splitsize,
            );
            let mut summary = WriteSummary::default();
            let mut frame = vec![0u8; FRAME_PAYLOAD_SIZE];
            let mut clean = false;

            loop {
                let bytesused = match iob.read_fec_block(&mut frame) {
                    Ok(n) => n,
                    Err(FsaError::EndOfFile) => {
                        clean = true;
                        break;
                    }
                    Err(FsaError::Closed(_)) => break,
                    Err(e) => {
                        status.set(RunState::Failed, &format!("iobuffer read failed: {e}"));
                        break;
                    }
                };

                let encoded = match codec.encode_frame(&frame) {
                    Ok(enc) => enc,
                    Err(e) => {
                        status.set(RunState::Failed, &format!("fec encode failed: {e}"));
                        break;
                    }
                };

                if let Err(e) = writer.write_block(&encoded, bytesused) {
                    status.set(RunState::Failed, &format!("volume write failed: {e}"));
                    break;
                }
                summary.frames_written += 1;
                summary.bytes_written += encoded.len() as u64;

                if !status.is_running() {
                    break;
                }
            }

            if clean && status.is_running() {
                if let Err(e) = writer.finish() {
                    status.set(RunState::Failed, &format!("volume close failed: {e}"));
                }
            }
            if !status.is_running() {
                // abort safety: no partial archive may survive
                writer.delete_all();
            }

            let _ = tx.send(summary);
            crate::msg!(2, "thread iobuf2volume: exit");
            status.leave_secondary();
        })
        .expect("spawn iobuf2volume thread");
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dico::Dico;
    use crate::options::FEC_IOBUFSIZE;
    use crate::queue::{BlockInfo, ItemState};
    use crate::record::headtype;
    use tempfile::TempDir;

    // end-to-end over the save half: queue → iobuffer → fec → volumes
    #[test]
    fn save_half_produces_readable_volumes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("arch.fsa");

        let status = Status::new();
        let queue = Queue::new(32, Arc::clone(&status));
        let iob = IoBuffer::new(FEC_IOBUFSIZE, FRAME_PAYLOAD_SIZE, Arc::clone(&status));

        let t1 = spawn_queue_to_iobuffer(Arc::clone(&queue), Arc::clone(&iob), Arc::clone(&status));
        let (t2, rx) = spawn_iobuffer_to_volume(
            Arc::clone(&iob),
            Arc::clone(&status),
            WriterConfig {
                basepath: base.clone(),
                archid: crate::volume::generate_id(),
                ecclevel: 1,
                overwrite: false,
                splitsize: 0,
            },
        );

        let mut dico = Dico::new();
        dico.add_u32(0, 1, 77);
        queue.add_header(dico, headtype::FSIN, 0).unwrap();

        let payload = vec![0x33u8; 1000];
        let info = BlockInfo {
            data: payload.clone(),
            realsize: 1000,
            arsize: 1000,
            compsize: 1000,
            arcsum: crate::checksum::fletcher32(&payload),
            compress_algo: crate::codec::ALGO_NONE,
            encrypt_algo: crate::crypto::CRYPTO_NONE,
            fsindex: 0,
            offset: 0,
            sumok: true,
        };
        queue.add_block(info, ItemState::Done).unwrap();
        queue.set_end_of_queue();

        t1.join().unwrap();
        t2.join().unwrap();
        let summary = rx.recv().unwrap();
        assert!(summary.frames_written >= 1);
        assert!(base.exists());
        assert!(status.is_running());
    }
}
