//! The producer/consumer pipeline threads.
//!
//! Save path: driver → queue → [compressors] → queue-to-iobuffer →
//! iobuffer → FEC encoder + volume writer.
//! Restore path: volume reader + FEC decoder → iobuffer →
//! iobuffer-to-queue → [decompressors] → queue → driver.
//!
//! Threads communicate failure exclusively through the shared status word;
//! end-of-stream flows through end-of-queue / end-of-buffer flags so that
//! consumers always drain before stopping.

pub mod comp;
pub mod rest;
pub mod save;

use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::iobuffer::IoBuffer;
use crate::keys::blockhead;
use crate::options::MAX_BLKSIZE;
use crate::queue::BlockInfo;
use crate::record::{self, headtype};

/// Serialize one data block: a BLKH record describing it, then the raw
/// archived bytes.
pub fn write_block_item(iob: &IoBuffer, info: &BlockInfo) -> FsaResult<()> {
    if info.arsize == 0 {
        return Err(FsaError::InvalidArg("data block is empty".into()));
    }

    let mut dico = Dico::new();
    dico.add_u64(0, blockhead::BLOCKOFFSET, info.offset);
    dico.add_u32(0, blockhead::REALSIZE, info.realsize);
    dico.add_u32(0, blockhead::ARSIZE, info.arsize);
    dico.add_u32(0, blockhead::COMPSIZE, info.compsize);
    dico.add_u32(0, blockhead::ARCSUM, info.arcsum);
    dico.add_u16(0, blockhead::COMPRESSALGO, info.compress_algo);
    dico.add_u16(0, blockhead::ENCRYPTALGO, info.encrypt_algo);

    record::write_record(iob, &dico, headtype::BLKH, info.fsindex)?;
    iob.write_raw(&info.data)?;
    Ok(())
}

/// Consume the payload following a BLKH record and rebuild the BlockInfo.
///
/// The archived bytes are always read (the stream must stay aligned even
/// for filesystems the caller will skip). A Fletcher-32 mismatch zeroes
/// the payload and clears `sumok` instead of failing, so one corrupt block
/// costs one file, not the archive.
pub fn read_block_payload(iob: &IoBuffer, dico: &Dico, fsindex: u16) -> FsaResult<BlockInfo> {
    let offset = dico.get_u64(0, blockhead::BLOCKOFFSET)?;
    let realsize = dico.get_u32(0, blockhead::REALSIZE)?;
    let arsize = dico.get_u32(0, blockhead::ARSIZE)?;
    let compsize = dico.get_u32(0, blockhead::COMPSIZE)?;
    let arcsum = dico.get_u32(0, blockhead::ARCSUM)?;
    let compress_algo = dico.get_u16(0, blockhead::COMPRESSALGO)?;
    let encrypt_algo = dico.get_u16(0, blockhead::ENCRYPTALGO)?;

    if realsize > MAX_BLKSIZE {
        return Err(FsaError::Corrupt(format!(
            "block header declares a {realsize}-byte block, cap is {MAX_BLKSIZE}"
        )));
    }

    let mut data = vec![0u8; arsize as usize];
    iob.read_raw(&mut data)?;

    let mut info = BlockInfo {
        data,
        realsize,
        offset,
        arsize,
        compsize,
        arcsum,
        compress_algo,
        encrypt_algo,
        fsindex,
        sumok: true,
    };

    if crate::checksum::fletcher32(&info.data) != arcsum {
        crate::errmsg!("block at offset {offset} is corrupt (bad archive checksum)");
        info.data = vec![0u8; realsize as usize];
        info.sumok = false;
    }

    Ok(info)
}
