//! Logical record codec — tagged header + dictionary pairs flowing through
//! the iobuffer.
//!
//! # On-disk layout (24-byte header, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic1     = 0x31486C46 ("FlH1")
//!    4      4   headtype   record tag (see [`headtype`])
//!    8      2   fsindex    owning filesystem, 0xFFFF = global
//!   10      2   itemcount  dictionary items that follow
//!   12      4   dicolen    serialized dictionary bytes
//!   16      4   dicosum    Fletcher-32 of the dictionary bytes
//!   20      4   magic2     = 0x32486C46 ("FlH2")
//! ```
//!
//! Two magics frame the header so that rubbish injected in the middle of a
//! header cannot masquerade as a valid one. The reader resynchronizes one
//! byte at a time on any framing or checksum failure and reports how many
//! bytes it had to skip.

use crate::checksum::fletcher32;
use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::iobuffer::IoBuffer;

pub const MAGIC_RECHEAD1: u32 = 0x3148_6C46; // "FlH1"
pub const MAGIC_RECHEAD2: u32 = 0x3248_6C46; // "FlH2"

pub const RECORD_HEADER_SIZE: usize = 24;

/// `fsindex` sentinel: record is global, not tied to one filesystem.
pub const FSID_NULL: u16 = 0xFFFF;

/// Upper bound accepted for one serialized dictionary. A header claiming
/// more is treated as corruption and resynchronization continues.
pub const MAX_DICOLEN: u32 = 16 * 1024 * 1024;

/// Logical record tags (little-endian ASCII).
pub mod headtype {
    /// Archive main header, first record of the first volume.
    pub const MAIN: u32 = 0x6843_7241;
    /// Padding separating the copies of the main header.
    pub const PADG: u32 = 0x6744_6150;
    /// Disk layout (partition tables), after the main header.
    pub const DILA: u32 = 0x614C_6944;
    /// Filesystem info, one per filesystem at the start of the archive.
    pub const FSIN: u32 = 0x6E49_7346;
    /// Filesystem begin, one per filesystem where its contents start.
    pub const FSYB: u32 = 0x7359_7346;
    /// Dirs info, for directory archives.
    pub const DIRS: u32 = 0x7352_6944;
    /// Object header, one per filesystem entry.
    pub const OBJT: u32 = 0x744A_624F;
    /// Data block header, followed by the raw archived bytes.
    pub const BLKH: u32 = 0x684B_6C42;
    /// File footer closing a large-file block chain.
    pub const FILF: u32 = 0x664C_6946;
    /// Data end, one per filesystem after its contents.
    pub const DATF: u32 = 0x6E45_6144;

    pub fn name(t: u32) -> &'static str {
        match t {
            MAIN => "MAIN",
            PADG => "PADG",
            DILA => "DILA",
            FSIN => "FSIN",
            FSYB => "FSYB",
            DIRS => "DIRS",
            OBJT => "OBJT",
            BLKH => "BLKH",
            FILF => "FILF",
            DATF => "DATF",
            _ => "????",
        }
    }
}

/// One decoded logical record.
#[derive(Debug)]
pub struct Record {
    pub headtype: u32,
    pub fsindex: u16,
    pub dico: Dico,
    /// Bytes discarded while resynchronizing before this record.
    pub skipped_bytes: u64,
}

/// Serialize `dico` and write one record into the iobuffer.
pub fn write_record(iob: &IoBuffer, dico: &Dico, headtype: u32, fsindex: u16) -> FsaResult<()> {
    let count = dico.count_all();
    if count > u16::MAX as usize {
        return Err(FsaError::InvalidArg(format!(
            "dictionary has {count} items, record header caps at {}",
            u16::MAX
        )));
    }
    let body = dico.serialize();
    if body.len() > MAX_DICOLEN as usize {
        return Err(FsaError::InvalidArg(format!(
            "dictionary serializes to {} bytes, cap is {MAX_DICOLEN}",
            body.len()
        )));
    }

    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC_RECHEAD1.to_le_bytes());
    header[4..8].copy_from_slice(&headtype.to_le_bytes());
    header[8..10].copy_from_slice(&fsindex.to_le_bytes());
    header[10..12].copy_from_slice(&(count as u16).to_le_bytes());
    header[12..16].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[16..20].copy_from_slice(&fletcher32(&body).to_le_bytes());
    header[20..24].copy_from_slice(&MAGIC_RECHEAD2.to_le_bytes());

    iob.write_raw(&header)?;
    iob.write_raw(&body)?;
    Ok(())
}

/// Read the next valid record, resynchronizing byte-by-byte over anything
/// that does not parse. `EndOfFile` propagates from the iobuffer when the
/// stream is exhausted mid-search.
pub fn read_record(iob: &IoBuffer) -> FsaResult<Record> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let mut skipped: u64 = 0;

    loop {
        iob.read_raw(&mut header)?;

        // slide forward until both magics frame the header
        loop {
            let magic1 = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let magic2 = u32::from_le_bytes(header[20..24].try_into().unwrap());
            if magic1 == MAGIC_RECHEAD1 && magic2 == MAGIC_RECHEAD2 {
                break;
            }
            header.copy_within(1.., 0);
            iob.read_raw(&mut header[RECORD_HEADER_SIZE - 1..])?;
            skipped += 1;
        }

        let headtype = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let fsindex = u16::from_le_bytes(header[8..10].try_into().unwrap());
        let itemcount = u16::from_le_bytes(header[10..12].try_into().unwrap());
        let dicolen = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let dicosum = u32::from_le_bytes(header[16..20].try_into().unwrap());

        // implausible length: treat the whole header as corruption
        if dicolen > MAX_DICOLEN || (itemcount as u32).saturating_mul(6) > dicolen {
            skipped += RECORD_HEADER_SIZE as u64;
            continue;
        }

        let mut body = vec![0u8; dicolen as usize];
        iob.read_raw(&mut body)?;

        if fletcher32(&body) != dicosum {
            crate::errmsg!("logical record with a bad dictionary checksum: ignoring it");
            skipped += (RECORD_HEADER_SIZE + body.len()) as u64;
            continue;
        }

        let dico = match Dico::deserialize(&body, itemcount) {
            Ok(d) => d,
            Err(_) => {
                crate::errmsg!("logical record with an inconsistent dictionary: ignoring it");
                skipped += (RECORD_HEADER_SIZE + body.len()) as u64;
                continue;
            }
        };

        if skipped > 0 {
            crate::errmsg!("skipped {skipped} bytes to find the next logical record");
        }

        return Ok(Record {
            headtype,
            fsindex,
            dico,
            skipped_bytes: skipped,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use std::sync::Arc;

    fn iobuf() -> Arc<IoBuffer> {
        IoBuffer::new(64, 4096, Status::new())
    }

    fn sample_dico() -> Dico {
        let mut d = Dico::new();
        d.add_u32(0, 1, 0xC0FFEE);
        d.add_string(0, 2, "etc/passwd");
        d
    }

    #[test]
    fn write_then_read() {
        let iob = iobuf();
        write_record(&iob, &sample_dico(), headtype::OBJT, 2).unwrap();
        iob.set_end_of_buffer();

        let rec = read_record(&iob).unwrap();
        assert_eq!(rec.headtype, headtype::OBJT);
        assert_eq!(rec.fsindex, 2);
        assert_eq!(rec.skipped_bytes, 0);
        assert_eq!(rec.dico.get_u32(0, 1).unwrap(), 0xC0FFEE);
        assert_eq!(rec.dico.get_string(0, 2).unwrap(), "etc/passwd");
    }

    #[test]
    fn resync_over_injected_garbage() {
        let iob = iobuf();
        write_record(&iob, &sample_dico(), headtype::FSIN, 0).unwrap();
        iob.write_raw(&[0x55; 37]).unwrap(); // rubbish between two records
        write_record(&iob, &sample_dico(), headtype::OBJT, 1).unwrap();
        iob.set_end_of_buffer();

        let first = read_record(&iob).unwrap();
        assert_eq!(first.headtype, headtype::FSIN);
        let second = read_record(&iob).unwrap();
        assert_eq!(second.headtype, headtype::OBJT);
        assert_eq!(second.skipped_bytes, 37);
    }

    #[test]
    fn corrupt_dico_is_skipped() {
        let iob = iobuf();

        // hand-craft a record whose dicosum does not match
        let dico = sample_dico();
        let body = dico.serialize();
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC_RECHEAD1.to_le_bytes());
        header[4..8].copy_from_slice(&headtype::OBJT.to_le_bytes());
        header[8..10].copy_from_slice(&1u16.to_le_bytes());
        header[10..12].copy_from_slice(&(dico.count_all() as u16).to_le_bytes());
        header[12..16].copy_from_slice(&(body.len() as u32).to_le_bytes());
        header[16..20].copy_from_slice(&0xBAD0_BAD0u32.to_le_bytes());
        header[20..24].copy_from_slice(&MAGIC_RECHEAD2.to_le_bytes());
        iob.write_raw(&header).unwrap();
        iob.write_raw(&body).unwrap();

        write_record(&iob, &sample_dico(), headtype::DATF, 3).unwrap();
        iob.set_end_of_buffer();

        let rec = read_record(&iob).unwrap();
        assert_eq!(rec.headtype, headtype::DATF);
        assert!(rec.skipped_bytes > 0);
    }

    #[test]
    fn eof_propagates() {
        let iob = iobuf();
        iob.write_raw(&[0u8; 10]).unwrap(); // not even a full header
        iob.set_end_of_buffer();
        assert!(matches!(read_record(&iob), Err(FsaError::EndOfFile)));
    }

    #[test]
    fn empty_dico_record() {
        let iob = iobuf();
        write_record(&iob, &Dico::new(), headtype::FSYB, 7).unwrap();
        iob.set_end_of_buffer();
        let rec = read_record(&iob).unwrap();
        assert_eq!(rec.headtype, headtype::FSYB);
        assert_eq!(rec.dico.count_all(), 0);
    }
}
