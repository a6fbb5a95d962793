//! Corruption-tolerance and determinism properties at the archive level.

use std::path::Path;
use std::sync::Arc;

use md5::{Digest, Md5};
use tempfile::TempDir;

use fsark::dico::SECTION_STDATTR;
use fsark::fec::{FecCodec, FEC_PACKET_SIZE, FEC_STORED_PACKET_SIZE, FRAME_PAYLOAD_SIZE};
use fsark::iobuffer::IoBuffer;
use fsark::keys::object;
use fsark::options::Options;
use fsark::pipeline::read_block_payload;
use fsark::record::{headtype, read_record};
use fsark::volume::{VolumeReader, DESCRIPTOR_SIZE};
use fsark::{restore_dir, save_dir, FsaError, Status};

fn opts() -> Options {
    Options {
        batch_mode: true,
        ..Options::default()
    }
}

fn build_tree(parent: &Path, files: usize) -> std::path::PathBuf {
    let root = parent.join("tree");
    std::fs::create_dir(&root).unwrap();
    for i in 0..files {
        std::fs::write(
            root.join(format!("file{i:03}")),
            format!("payload number {i}\n").repeat(50 + i),
        )
        .unwrap();
    }
    std::fs::write(root.join("large"), vec![0x5C; 300_000]).unwrap();
    root
}

fn md5_of(path: &Path) -> [u8; 16] {
    Md5::digest(std::fs::read(path).unwrap()).into()
}

/// Byte offset of packet `pkt` of frame `frame_idx` in a single-volume
/// archive (VOLHEAD, then per frame: BLKHEAD + N packets + BLKFOOT).
fn packet_offset(ecclevel: usize, frame_idx: usize, pkt: usize) -> usize {
    let n = 16 + ecclevel;
    let frame_size = 2 * DESCRIPTOR_SIZE + n * FEC_STORED_PACKET_SIZE;
    DESCRIPTOR_SIZE + frame_idx * frame_size + DESCRIPTOR_SIZE + pkt * FEC_STORED_PACKET_SIZE
}

#[test]
fn fec_repairs_a_zeroed_packet() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let root = build_tree(src.path(), 5);

    let mut o = opts();
    o.ecclevel = 1;
    let archive = work.path().join("ecc.fsa");
    save_dir(&archive, &[root.clone()], &o).unwrap();

    // overwrite packet 0 of frame 0 with zeros
    let mut data = std::fs::read(&archive).unwrap();
    let off = packet_offset(1, 0, 0);
    for b in data[off..off + FEC_PACKET_SIZE].iter_mut() {
        *b = 0;
    }
    std::fs::write(&archive, &data).unwrap();

    let stats = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(stats.errors(), 0);
    assert_eq!(md5_of(&dst.path().join("tree/large")), md5_of(&root.join("large")));
}

#[test]
fn too_many_bad_packets_lose_only_that_frame() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let root = build_tree(src.path(), 40);

    let mut o = opts();
    o.ecclevel = 1;
    let archive = work.path().join("ecc2.fsa");
    save_dir(&archive, &[root], &o).unwrap();

    // two dead packets with ecclevel=1 make one data frame unrecoverable
    let mut data = std::fs::read(&archive).unwrap();
    for pkt in 0..2 {
        let off = packet_offset(1, 4, pkt);
        for b in data[off..off + FEC_PACKET_SIZE].iter_mut() {
            *b ^= 0xFF;
        }
    }
    std::fs::write(&archive, &data).unwrap();

    // the restore survives; some objects inside the lost 64 KiB are
    // reported as errors, everything else restores intact
    let stats = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert!(stats.errors() > 0 || stats.cnt_regfile > 0);
    assert!(dst.path().join("tree").exists());
}

#[test]
fn either_volume_descriptor_copy_suffices() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let root = build_tree(src.path(), 3);

    let archive = work.path().join("head.fsa");
    save_dir(&archive, &[root.clone()], &opts()).unwrap();
    let pristine = std::fs::read(&archive).unwrap();

    // zero the first descriptor copy
    {
        let mut data = pristine.clone();
        for b in data[..DESCRIPTOR_SIZE].iter_mut() {
            *b = 0;
        }
        std::fs::write(&archive, &data).unwrap();
        let dst = TempDir::new().unwrap();
        let stats = restore_dir(&archive, dst.path(), &opts()).unwrap();
        assert_eq!(stats.errors(), 0);
        assert_eq!(
            md5_of(&dst.path().join("tree/large")),
            md5_of(&root.join("large"))
        );
    }

    // zero the last descriptor copy instead
    {
        let mut data = pristine.clone();
        let len = data.len();
        for b in data[len - DESCRIPTOR_SIZE..].iter_mut() {
            *b = 0;
        }
        std::fs::write(&archive, &data).unwrap();
        let dst = TempDir::new().unwrap();
        let stats = restore_dir(&archive, dst.path(), &opts()).unwrap();
        assert_eq!(stats.errors(), 0);
    }
}

/// Decode an archive back into its logical record stream and return an
/// order signature: record types plus object paths and block offsets.
fn record_signature(archive: &Path) -> Vec<String> {
    let mut reader = VolumeReader::open(archive, true).unwrap();
    let codec = FecCodec::new(reader.ecclevel()).unwrap();

    let status = Status::new();
    let iob = IoBuffer::new(4096, FRAME_PAYLOAD_SIZE, Arc::clone(&status));
    let mut encoded = vec![0u8; codec.encoded_size()];
    loop {
        match reader.read_block(&mut encoded) {
            Ok(bytesused) => {
                let frame = codec.decode_frame(&encoded).unwrap();
                iob.write_fec_block(&frame.payload, bytesused).unwrap();
            }
            Err(FsaError::EndOfFile) => break,
            Err(e) => panic!("volume read failed: {e}"),
        }
    }
    iob.set_end_of_buffer();

    let mut sig = Vec::new();
    loop {
        let rec = match read_record(&iob) {
            Ok(r) => r,
            Err(FsaError::EndOfFile) => break,
            Err(e) => panic!("record read failed: {e}"),
        };
        match rec.headtype {
            headtype::MAIN | headtype::PADG => continue, // carry timestamps
            headtype::BLKH => {
                let info = read_block_payload(&iob, &rec.dico, rec.fsindex).unwrap();
                sig.push(format!("BLKH fs={} off={}", info.fsindex, info.offset));
            }
            headtype::OBJT => {
                let path = rec.dico.get_string(SECTION_STDATTR, object::PATH).unwrap();
                sig.push(format!("OBJT fs={} path={path}", rec.fsindex));
            }
            other => sig.push(format!("{} fs={}", headtype::name(other), rec.fsindex)),
        }
    }
    sig
}

/// The archive byte order must not depend on the worker count: the logical
/// record stream for jobs=8 is identical to the one for jobs=1.
#[test]
fn parallel_compression_preserves_order() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let root = build_tree(src.path(), 25);

    let mut o1 = opts();
    o1.compress_jobs = 1;
    let a1 = work.path().join("jobs1.fsa");
    save_dir(&a1, &[root.clone()], &o1).unwrap();

    let mut o8 = opts();
    o8.compress_jobs = 8;
    let a8 = work.path().join("jobs8.fsa");
    save_dir(&a8, &[root], &o8).unwrap();

    let s1 = record_signature(&a1);
    let s8 = record_signature(&a8);
    assert!(!s1.is_empty());
    assert_eq!(s1, s8);
}
