//! Restore-side deserialization threads: volume reader → FEC decoder →
//! iobuffer, and iobuffer → queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::error::FsaError;
use crate::fec::{FecCodec, FRAME_PAYLOAD_SIZE};
use crate::iobuffer::IoBuffer;
use crate::queue::{ItemState, Queue};
use crate::record::{self, headtype, FSID_NULL};
use crate::status::{RunState, Status};
use crate::volume::VolumeReader;

/// Summary returned by the volume-reader thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadSummary {
    pub frames_read: u64,
    pub frames_repaired: u64,
    pub frames_unrecoverable: u64,
    pub skipped_bytes: u64,
}

/// Pull FEC-encoded frames from the archive volumes, repair them, and push
/// the recovered payloads into the iobuffer. Owns the volume reader and
/// the decoder. An unrecoverable frame is logged and dropped; the record
/// layer downstream resynchronizes over the hole.
pub fn spawn_volume_to_iobuffer(
    mut reader: VolumeReader,
    iob: Arc<IoBuffer>,
    status: Arc<Status>,
) -> (JoinHandle<()>, Receiver<ReadSummary>) {
    let (tx, rx) = bounded(1);
    let handle = std::thread::Builder::new()
        .name("volume2iobuf".into())
        .spawn(move || {
            status.enter_secondary();
            let mut summary = ReadSummary::default();

            let codec = match FecCodec::new(reader.ecclevel()) {
                Ok(c) => c,
                Err(e) => {
                    status.set(RunState::Failed, &format!("fec init failed: {e}"));
                    iob.set_end_of_buffer();
                    let _ = tx.send(summary);
                    status.leave_secondary();
                    return;
                }
            };

            let mut encoded = vec![0u8; codec.encoded_size()];
            let mut blocknum: u64 = 0;
            loop {
                let bytesused = match reader.read_block(&mut encoded) {
                    Ok(n) => n,
                    Err(FsaError::EndOfFile) => break,
                    Err(e) => {
                        status.set(RunState::Failed, &format!("volume read failed: {e}"));
                        break;
                    }
                };

                match codec.decode_frame(&encoded) {
                    Ok(decoded) => {
                        summary.frames_read += 1;
                        if decoded.bad_packets > 0 {
                            summary.frames_repaired += 1;
                            crate::errmsg!(
                                "error correction fixed all corruptions in frame {blocknum}: \
                                 {} bad packets out of {}",
                                decoded.bad_packets,
                                codec.n()
                            );
                        }
                        if let Err(e) = iob.write_fec_block(&decoded.payload, bytesused) {
                            if !matches!(e, FsaError::EndOfFile) {
                                status.set(
                                    RunState::Failed,
                                    &format!("iobuffer write failed: {e}"),
                                );
                            }
                            break;
                        }
                    }
                    Err(FsaError::Corrupt(msg)) => {
                        summary.frames_unrecoverable += 1;
                        crate::errmsg!("cannot fix corruptions in frame {blocknum}: {msg}");
                    }
                    Err(e) => {
                        status.set(RunState::Failed, &format!("fec decode failed: {e}"));
                        break;
                    }
                }
                blocknum += 1;

                if !status.is_running() {
                    break;
                }
            }

            summary.skipped_bytes = reader.skipped_bytes;
            iob.set_end_of_buffer();
            let _ = tx.send(summary);
            crate::msg!(2, "thread volume2iobuf: exit");
            status.leave_secondary();
        })
        .expect("spawn volume2iobuf thread");
    (handle, rx)
}

/// Parse logical records out of the iobuffer and enqueue them. Data blocks
/// belonging to selected filesystems are enqueued Todo (decompression
/// pending) unless their checksum already failed; blocks of unselected
/// filesystems are consumed and dropped to keep the stream aligned.
pub fn spawn_iobuffer_to_queue(
    iob: Arc<IoBuffer>,
    queue: Arc<Queue>,
    status: Arc<Status>,
    fs_selected: Arc<Vec<bool>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("iobuf2queue".into())
        .spawn(move || {
            status.enter_secondary();

            let selected = |fsindex: u16| -> bool {
                fsindex != FSID_NULL
                    && fs_selected.get(fsindex as usize).copied().unwrap_or(false)
            };

            loop {
                let rec = match record::read_record(&iob) {
                    Ok(r) => r,
                    Err(FsaError::EndOfFile) => break,
                    Err(FsaError::Closed(_)) => break,
                    Err(e) => {
                        status.set(RunState::Failed, &format!("record read failed: {e}"));
                        break;
                    }
                };

                if rec.headtype == headtype::BLKH {
                    let info = match super::read_block_payload(&iob, &rec.dico, rec.fsindex) {
                        Ok(i) => i,
                        Err(FsaError::EndOfFile) => break,
                        Err(e) => {
                            crate::errmsg!("skipping unreadable data block: {e}");
                            continue;
                        }
                    };
                    if selected(rec.fsindex) {
                        let state = if info.sumok {
                            ItemState::Todo
                        } else {
                            ItemState::Done
                        };
                        if queue.add_block(info, state).is_err() {
                            break;
                        }
                    }
                } else {
                    // global records go to everyone, local ones only when
                    // their filesystem was selected
                    if rec.fsindex == FSID_NULL || selected(rec.fsindex) {
                        if queue
                            .add_header(rec.dico, rec.headtype, rec.fsindex)
                            .is_err()
                        {
                            break;
                        }
                    }
                }

                if !status.is_running() {
                    break;
                }
            }

            queue.set_end_of_queue();
            crate::msg!(2, "thread iobuf2queue: exit");
            status.leave_secondary();
        })
        .expect("spawn iobuf2queue thread")
}
