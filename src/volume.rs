//! Low-level archive volume management: reading and writing volume files,
//! duplicated volume descriptors, and splitting.
//!
//! It must never be possible to lose a whole volume because one critical
//! header got corrupted, so two copies of the volume descriptor are
//! written: at the very beginning and at the very end of each volume. The
//! volume is readable if at least one of them is good. Data blocks get the
//! same treatment with a BLKHEAD descriptor in front and a BLKFOOT behind.
//!
//! # Descriptor layout (32 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic   = 0x31417346 ("FsA1")
//!    4      4   archid  random id binding volumes to one archive
//!    8      4   csum    Fletcher-32 of the 18 payload bytes
//!   12      2   type    1=VOLHEAD 2=VOLFOOT 3=BLKHEAD 4=BLKFOOT
//!   14     18   payload (see [`DescPayload`])
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::checksum::fletcher32;
use crate::error::{FsaError, FsaResult};
use crate::options::{version_string, CURRENT_VERSION};
use crate::queue::Queue;

pub const MAGIC_VOLUME: u32 = 0x3141_7346; // "FsA1"
pub const DESCRIPTOR_SIZE: usize = 32;
const PAYLOAD_SIZE: usize = 18;

pub const DESC_VOLHEAD: u16 = 1;
pub const DESC_VOLFOOT: u16 = 2;
pub const DESC_BLKHEAD: u16 = 3;
pub const DESC_BLKFOOT: u16 = 4;

// ── Descriptor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescPayload {
    Volume {
        volnum: u32,
        minver: u64,
        ecclevel: u32,
        lastvol: bool,
    },
    Block {
        blknum: u64,
        blkid: u32,
        bytesused: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub archid: u32,
    pub dtype: u16,
    pub payload: DescPayload,
}

impl Descriptor {
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut payload = [0u8; PAYLOAD_SIZE];
        match &self.payload {
            DescPayload::Volume {
                volnum,
                minver,
                ecclevel,
                lastvol,
            } => {
                payload[0..4].copy_from_slice(&volnum.to_le_bytes());
                payload[4..12].copy_from_slice(&minver.to_le_bytes());
                payload[12..16].copy_from_slice(&ecclevel.to_le_bytes());
                payload[16] = *lastvol as u8;
            }
            DescPayload::Block {
                blknum,
                blkid,
                bytesused,
            } => {
                payload[0..8].copy_from_slice(&blknum.to_le_bytes());
                payload[8..12].copy_from_slice(&blkid.to_le_bytes());
                payload[12..16].copy_from_slice(&bytesused.to_le_bytes());
            }
        }

        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_VOLUME.to_le_bytes());
        buf[4..8].copy_from_slice(&self.archid.to_le_bytes());
        buf[8..12].copy_from_slice(&fletcher32(&payload).to_le_bytes());
        buf[12..14].copy_from_slice(&self.dtype.to_le_bytes());
        buf[14..32].copy_from_slice(&payload);
        buf
    }

    /// Parse and validate magic + checksum. Archive-id matching is the
    /// caller's business (volume 0 defines it).
    pub fn from_bytes(buf: &[u8; DESCRIPTOR_SIZE]) -> Option<Descriptor> {
        if LittleEndian::read_u32(&buf[0..4]) != MAGIC_VOLUME {
            return None;
        }
        let archid = LittleEndian::read_u32(&buf[4..8]);
        let csum = LittleEndian::read_u32(&buf[8..12]);
        let dtype = LittleEndian::read_u16(&buf[12..14]);
        let payload = &buf[14..32];
        if fletcher32(payload) != csum {
            return None;
        }
        let payload = match dtype {
            DESC_VOLHEAD | DESC_VOLFOOT => DescPayload::Volume {
                volnum: LittleEndian::read_u32(&payload[0..4]),
                minver: LittleEndian::read_u64(&payload[4..12]),
                ecclevel: LittleEndian::read_u32(&payload[12..16]),
                lastvol: payload[16] != 0,
            },
            DESC_BLKHEAD | DESC_BLKFOOT => DescPayload::Block {
                blknum: LittleEndian::read_u64(&payload[0..8]),
                blkid: LittleEndian::read_u32(&payload[8..12]),
                bytesused: LittleEndian::read_u32(&payload[12..16]),
            },
            _ => return None,
        };
        Some(Descriptor {
            archid,
            dtype,
            payload,
        })
    }
}

/// Random 32-bit id derived from a fresh UUID.
pub fn generate_id() -> u32 {
    let uuid = Uuid::new_v4();
    u32::from_le_bytes(uuid.as_bytes()[0..4].try_into().unwrap())
}

/// Path of volume `volnum` for a given first-volume path:
/// `backup.fsa`, then `backup.f01`, `backup.f02`, …
pub fn volume_path(basepath: &Path, volnum: u32) -> PathBuf {
    if volnum == 0 {
        return basepath.to_path_buf();
    }
    let stem = basepath
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| basepath.to_string_lossy().into_owned());
    basepath.with_file_name(format!("{stem}.f{volnum:02}"))
}

fn write_all_diagnosed(file: &mut File, path: &Path, buf: &[u8]) -> FsaResult<()> {
    match file.write_all(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
            let hint = match nix::sys::statvfs::fstatvfs(&*file) {
                Ok(sv) => {
                    let free = sv.blocks_free() as u64 * sv.fragment_size() as u64;
                    format!(
                        "{} ({free} bytes free on device; on FAT filesystems the \
                         2 GiB per-file ceiling is a common cause — use a split size)",
                        path.display()
                    )
                }
                Err(_) => path.display().to_string(),
            };
            Err(FsaError::NoSpace(hint))
        }
        Err(e) => Err(FsaError::Write(format!("{}: {e}", path.display()))),
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct VolumeWriter {
    file: Option<File>,
    archid: u32,
    curvol: u32,
    curblock: u64,
    ecclevel: u32,
    overwrite: bool,
    splitsize: u64,
    basepath: PathBuf,
    volpath: PathBuf,
    /// Every volume created by this process, for delete-all on abort.
    vollist: Vec<PathBuf>,
}

impl VolumeWriter {
    pub fn new(
        basepath: &Path,
        archid: u32,
        ecclevel: u32,
        overwrite: bool,
        splitsize: u64,
    ) -> VolumeWriter {
        VolumeWriter {
            file: None,
            archid,
            curvol: 0,
            curblock: 0,
            ecclevel,
            overwrite,
            splitsize,
            basepath: basepath.to_path_buf(),
            volpath: basepath.to_path_buf(),
            vollist: Vec::new(),
        }
    }

    pub fn archid(&self) -> u32 {
        self.archid
    }

    fn volume_descriptor(&self, dtype: u16, lastvol: bool) -> Descriptor {
        Descriptor {
            archid: self.archid,
            dtype,
            payload: DescPayload::Volume {
                volnum: self.curvol,
                minver: CURRENT_VERSION,
                ecclevel: self.ecclevel,
                lastvol,
            },
        }
    }

    fn open_volume(&mut self) -> FsaResult<()> {
        match std::fs::symlink_metadata(&self.volpath) {
            Ok(md) if !md.is_file() => {
                return Err(FsaError::WrongType(format!(
                    "{} already exists and is not a regular file",
                    self.volpath.display()
                )));
            }
            Ok(_) if !self.overwrite => {
                return Err(FsaError::Exists(format!(
                    "{} already exists, remove it first or pass --overwrite",
                    self.volpath.display()
                )));
            }
            _ => {}
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.volpath)
            .map_err(|e| FsaError::Open(format!("{}: {e}", self.volpath.display())))?;

        self.vollist.push(self.volpath.clone());

        let head = self.volume_descriptor(DESC_VOLHEAD, false).to_bytes();
        write_all_diagnosed(&mut file, &self.volpath, &head)?;
        self.file = Some(file);
        Ok(())
    }

    fn close_volume(&mut self, lastvol: bool) -> FsaResult<()> {
        let mut file = match self.file.take() {
            Some(f) => f,
            None => return Err(FsaError::InvalidArg("volume is not open".into())),
        };

        let foot = self.volume_descriptor(DESC_VOLFOOT, lastvol).to_bytes();
        write_all_diagnosed(&mut file, &self.volpath, &foot)?;

        // rewrite the head copy with the final lastvol flag
        let head = self.volume_descriptor(DESC_VOLHEAD, lastvol).to_bytes();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| FsaError::Seek(format!("{}: {e}", self.volpath.display())))?;
        write_all_diagnosed(&mut file, &self.volpath, &head)?;

        file.sync_all()
            .map_err(|e| FsaError::Write(format!("fsync {}: {e}", self.volpath.display())))?;
        Ok(())
    }

    fn split_check(&mut self, incoming: usize) -> FsaResult<bool> {
        if self.splitsize == 0 {
            return Ok(false);
        }
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(false),
        };
        let pos = file
            .stream_position()
            .map_err(|e| FsaError::Seek(e.to_string()))?;
        Ok(pos + incoming as u64 + DESCRIPTOR_SIZE as u64 > self.splitsize)
    }

    /// Write one FEC-encoded frame wrapped in BLKHEAD/BLKFOOT descriptors,
    /// rotating volumes when the split size would be exceeded.
    pub fn write_block(&mut self, data: &[u8], bytesused: u32) -> FsaResult<()> {
        if self.split_check(data.len() + DESCRIPTOR_SIZE)? {
            self.close_volume(false)?;
            self.curvol += 1;
            self.volpath = volume_path(&self.basepath, self.curvol);
        }

        if self.file.is_none() {
            crate::msg!(1, "creating volume {:03}: [{}]", self.curvol, self.volpath.display());
            self.open_volume()?;
        }

        let desc = Descriptor {
            archid: self.archid,
            dtype: DESC_BLKHEAD,
            payload: DescPayload::Block {
                blknum: self.curblock,
                blkid: generate_id(),
                bytesused,
            },
        };
        self.curblock += 1;

        let mut head = desc.to_bytes();
        let file = self.file.as_mut().unwrap();
        write_all_diagnosed(file, &self.volpath, &head)?;
        write_all_diagnosed(file, &self.volpath, data)?;
        head[12..14].copy_from_slice(&DESC_BLKFOOT.to_le_bytes());
        let file = self.file.as_mut().unwrap();
        write_all_diagnosed(file, &self.volpath, &head)?;
        Ok(())
    }

    /// Close the final volume with `lastvol` set.
    pub fn finish(&mut self) -> FsaResult<()> {
        if self.file.is_none() {
            // an archive with no block yet still needs its first volume
            self.open_volume()?;
        }
        self.close_volume(true)
    }

    /// Remove every volume created by this process (abort path).
    pub fn delete_all(&mut self) {
        if self.file.is_some() {
            let _ = self.close_volume(false);
        }
        for path in std::mem::take(&mut self.vollist) {
            match std::fs::remove_file(&path) {
                Ok(()) => crate::errmsg!("removed {}", path.display()),
                Err(e) => crate::errmsg!("cannot remove {}: {e}", path.display()),
            }
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct VolumeReader {
    file: Option<File>,
    archid: u32,
    curvol: u32,
    ecclevel: u32,
    lastvol: bool,
    batch_mode: bool,
    basepath: PathBuf,
    volpath: PathBuf,
    /// Drained before prompting so the prompt is not garbled by workers.
    drain_queue: Option<Arc<Queue>>,
    /// Total bytes skipped by block-level resynchronization.
    pub skipped_bytes: u64,
}

impl VolumeReader {
    /// Open volume 0 and learn the archive id and ecc level from its
    /// descriptor.
    pub fn open(basepath: &Path, batch_mode: bool) -> FsaResult<VolumeReader> {
        let mut reader = VolumeReader {
            file: None,
            archid: 0,
            curvol: 0,
            ecclevel: 0,
            lastvol: false,
            batch_mode,
            basepath: basepath.to_path_buf(),
            volpath: basepath.to_path_buf(),
            drain_queue: None,
            skipped_bytes: 0,
        };
        reader.open_volume()?;
        Ok(reader)
    }

    pub fn set_drain_queue(&mut self, queue: Arc<Queue>) {
        self.drain_queue = Some(queue);
    }

    pub fn archid(&self) -> u32 {
        self.archid
    }

    pub fn ecclevel(&self) -> u32 {
        self.ecclevel
    }

    /// Wait for a usable path to the current volume, prompting on stdin
    /// when the file is missing (unless batch mode).
    fn wait_for_volume(&mut self) -> FsaResult<()> {
        loop {
            match std::fs::metadata(&self.volpath) {
                Ok(md) if md.is_file() => return Ok(()),
                Ok(_) => {
                    return Err(FsaError::WrongType(format!(
                        "{} is not a regular file",
                        self.volpath.display()
                    )))
                }
                Err(_) if self.batch_mode => {
                    return Err(FsaError::NotFound(format!(
                        "volume {} not found: {}",
                        self.curvol,
                        self.volpath.display()
                    )))
                }
                Err(_) => {
                    // let the pipeline drain so the prompt is readable
                    if let Some(q) = &self.drain_queue {
                        while q.count() > 0 {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                        }
                    }
                    let _ = io::stdout().flush();
                    let _ = io::stderr().flush();
                    println!(
                        "File [{}] is not found, please type the path to volume {}:",
                        self.volpath.display(),
                        self.curvol
                    );
                    print!("New path:> ");
                    let _ = io::stdout().flush();
                    let mut line = String::new();
                    io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .map_err(|e| FsaError::Read(format!("reading volume prompt: {e}")))?;
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        return Err(FsaError::Open("no alternative volume provided".into()));
                    }
                    self.volpath = PathBuf::from(trimmed);
                }
            }
        }
    }

    /// Open the current volume, validating one of the two descriptor
    /// copies, the volume number, the format version and the archive id.
    fn open_volume(&mut self) -> FsaResult<()> {
        self.wait_for_volume()?;

        let mut file = File::open(&self.volpath)
            .map_err(|e| FsaError::Open(format!("{}: {e}", self.volpath.display())))?;
        let md = file
            .metadata()
            .map_err(|e| FsaError::Stat(format!("{}: {e}", self.volpath.display())))?;
        if md.len() < (2 * DESCRIPTOR_SIZE) as u64 {
            return Err(FsaError::Read(format!(
                "{} is too small to be an archive volume",
                self.volpath.display()
            )));
        }

        // read both descriptor copies; either one is enough
        let mut copies = [[0u8; DESCRIPTOR_SIZE]; 2];
        file.seek(SeekFrom::Start(md.len() - DESCRIPTOR_SIZE as u64))
            .map_err(|e| FsaError::Seek(e.to_string()))?;
        file.read_exact(&mut copies[1])
            .map_err(|e| FsaError::Read(format!("volume footer: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| FsaError::Seek(e.to_string()))?;
        file.read_exact(&mut copies[0])
            .map_err(|e| FsaError::Read(format!("volume header: {e}")))?;

        let mut found = None;
        for (i, raw) in copies.iter().enumerate() {
            match Descriptor::from_bytes(raw) {
                Some(d)
                    if matches!(d.dtype, DESC_VOLHEAD | DESC_VOLFOOT)
                        && matches!(d.payload, DescPayload::Volume { .. }) =>
                {
                    found = Some(d);
                    break;
                }
                _ => crate::errmsg!("the volume descriptor (copy {i}) is invalid"),
            }
        }
        let desc = found.ok_or_else(|| {
            FsaError::Corrupt(format!(
                "both volume descriptors of {} are invalid; the file is corrupt \
                 or not an archive volume",
                self.volpath.display()
            ))
        })?;

        let (volnum, minver, ecclevel, lastvol) = match desc.payload {
            DescPayload::Volume {
                volnum,
                minver,
                ecclevel,
                lastvol,
            } => (volnum, minver, ecclevel, lastvol),
            DescPayload::Block { .. } => unreachable!(),
        };

        if volnum != self.curvol {
            return Err(FsaError::WrongVolume(format!(
                "found volume {volnum}, expected {}",
                self.curvol
            )));
        }
        if CURRENT_VERSION < minver {
            return Err(FsaError::WrongVersion(format!(
                "this archive requires version {} (this build is {})",
                version_string(minver),
                version_string(CURRENT_VERSION)
            )));
        }
        if self.curvol == 0 {
            self.archid = desc.archid;
        } else if desc.archid != self.archid {
            return Err(FsaError::WrongArchive(format!(
                "unexpected archive id: found={:08x} expected={:08x}",
                desc.archid, self.archid
            )));
        }

        self.ecclevel = ecclevel;
        self.lastvol = lastvol;
        self.file = Some(file);
        Ok(())
    }

    fn close_volume(&mut self) {
        self.file = None;
    }

    fn rotate_volume(&mut self) {
        self.close_volume();
        self.curvol += 1;
        self.volpath = volume_path(&self.basepath, self.curvol);
    }

    fn descriptor_matches(&self, raw: &[u8; DESCRIPTOR_SIZE], dtype: u16) -> Option<Descriptor> {
        Descriptor::from_bytes(raw)
            .filter(|d| d.archid == self.archid && d.dtype == dtype)
    }

    /// Read the next data block of exactly `buf.len()` payload bytes.
    ///
    /// Accepts a block when either its BLKHEAD or its BLKFOOT descriptor
    /// validates. Rotates to the next volume at a VOLFOOT (or on an
    /// unexpected end of file), returning `EndOfFile` past the last
    /// volume. Anything unrecognized is skipped one byte at a time.
    pub fn read_block(&mut self, buf: &mut [u8]) -> FsaResult<u32> {
        let datsize = buf.len();
        let totalsize = datsize + 2 * DESCRIPTOR_SIZE;
        let mut blkbuf = vec![0u8; totalsize];
        let mut skipped_here: u64 = 0;

        loop {
            if self.file.is_none() {
                crate::msg!(1, "opening volume {:03}: [{}]", self.curvol, self.volpath.display());
                self.open_volume()?;
            }
            let file = self.file.as_mut().unwrap();

            let curpos = file
                .stream_position()
                .map_err(|e| FsaError::Seek(e.to_string()))?;

            blkbuf.fill(0);
            let mut end_of_vol = false;
            let mut got = 0usize;
            while got < totalsize {
                match file.read(&mut blkbuf[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(e) => return Err(FsaError::Read(e.to_string())),
                }
            }
            let short_read = got < totalsize;

            let head: [u8; DESCRIPTOR_SIZE] = blkbuf[..DESCRIPTOR_SIZE].try_into().unwrap();
            let foot: [u8; DESCRIPTOR_SIZE] = blkbuf
                [DESCRIPTOR_SIZE + datsize..totalsize]
                .try_into()
                .unwrap();

            // end of this volume: clean VOLFOOT marker or unexpected EOF
            if let Some(_d) = self.descriptor_matches(&head, DESC_VOLFOOT) {
                end_of_vol = true;
            } else if short_read {
                crate::errmsg!(
                    "unexpected end of volume {} before its footer",
                    self.volpath.display()
                );
                end_of_vol = true;
            }

            if end_of_vol {
                let last = self.lastvol;
                self.close_volume();
                if last {
                    if skipped_here > 0 {
                        self.skipped_bytes += skipped_here;
                    }
                    return Err(FsaError::EndOfFile);
                }
                self.rotate_volume();
                continue;
            }

            // accept the block if either framing descriptor survives
            let desc = self
                .descriptor_matches(&head, DESC_BLKHEAD)
                .or_else(|| self.descriptor_matches(&foot, DESC_BLKFOOT));

            match desc {
                Some(d) => {
                    let bytesused = match d.payload {
                        DescPayload::Block { bytesused, .. } => bytesused,
                        DescPayload::Volume { .. } => 0,
                    };
                    buf.copy_from_slice(&blkbuf[DESCRIPTOR_SIZE..DESCRIPTOR_SIZE + datsize]);
                    if skipped_here > 0 {
                        crate::errmsg!(
                            "skipped {skipped_here} bytes to find a valid data block in volume {}",
                            self.volpath.display()
                        );
                        self.skipped_bytes += skipped_here;
                    }
                    return Ok(bytesused);
                }
                None => {
                    // resynchronize one byte forward
                    let file = self.file.as_mut().unwrap();
                    file.seek(SeekFrom::Start(curpos + 1))
                        .map_err(|e| FsaError::Seek(e.to_string()))?;
                    skipped_here += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frame(tag: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn descriptor_roundtrip() {
        let d = Descriptor {
            archid: 0xCAFE_F00D,
            dtype: DESC_VOLHEAD,
            payload: DescPayload::Volume {
                volnum: 3,
                minver: CURRENT_VERSION,
                ecclevel: 2,
                lastvol: true,
            },
        };
        let bytes = d.to_bytes();
        assert_eq!(Descriptor::from_bytes(&bytes).unwrap(), d);

        let b = Descriptor {
            archid: 1,
            dtype: DESC_BLKFOOT,
            payload: DescPayload::Block {
                blknum: 42,
                blkid: 7,
                bytesused: 999,
            },
        };
        assert_eq!(Descriptor::from_bytes(&b.to_bytes()).unwrap(), b);
    }

    #[test]
    fn descriptor_rejects_corruption() {
        let d = Descriptor {
            archid: 5,
            dtype: DESC_VOLFOOT,
            payload: DescPayload::Volume {
                volnum: 0,
                minver: CURRENT_VERSION,
                ecclevel: 0,
                lastvol: false,
            },
        };
        let mut bytes = d.to_bytes();
        bytes[20] ^= 0xFF; // payload bit flip breaks the checksum
        assert!(Descriptor::from_bytes(&bytes).is_none());
    }

    #[test]
    fn volume_paths() {
        let base = Path::new("/tmp/backup.fsa");
        assert_eq!(volume_path(base, 0), PathBuf::from("/tmp/backup.fsa"));
        assert_eq!(volume_path(base, 1), PathBuf::from("/tmp/backup.f01"));
        assert_eq!(volume_path(base, 12), PathBuf::from("/tmp/backup.f12"));
        assert_eq!(volume_path(base, 120), PathBuf::from("/tmp/backup.f120"));
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        let mut w = VolumeWriter::new(&base, generate_id(), 1, false, 0);
        let f1 = frame(1, 500);
        let f2 = frame(2, 500);
        w.write_block(&f1, 500).unwrap();
        w.write_block(&f2, 123).unwrap();
        w.finish().unwrap();

        let mut r = VolumeReader::open(&base, true).unwrap();
        assert_eq!(r.ecclevel(), 1);
        let mut buf = vec![0u8; 500];
        assert_eq!(r.read_block(&mut buf).unwrap(), 500);
        assert_eq!(buf, f1);
        assert_eq!(r.read_block(&mut buf).unwrap(), 123);
        assert_eq!(buf, f2);
        assert!(matches!(r.read_block(&mut buf), Err(FsaError::EndOfFile)));
    }

    #[test]
    fn survives_zeroed_front_descriptor() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 0);
        let f1 = frame(9, 256);
        w.write_block(&f1, 256).unwrap();
        w.finish().unwrap();

        // zero the first descriptor copy; the footer copy must carry the volume
        let mut data = std::fs::read(&base).unwrap();
        for b in data[..DESCRIPTOR_SIZE].iter_mut() {
            *b = 0;
        }
        std::fs::write(&base, &data).unwrap();

        let mut r = VolumeReader::open(&base, true).unwrap();
        let mut buf = vec![0u8; 256];
        // the zeroed VOLHEAD also hides the first BLKHEAD offset, so the
        // reader has to resynchronize, but the data must survive
        assert_eq!(r.read_block(&mut buf).unwrap(), 256);
        assert_eq!(buf, f1);
    }

    #[test]
    fn splits_volumes_and_reads_them_back() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 1500);
        let frames: Vec<Vec<u8>> = (0..5).map(|i| frame(i as u8, 600)).collect();
        for f in &frames {
            w.write_block(f, 600).unwrap();
        }
        w.finish().unwrap();

        assert!(volume_path(&base, 1).exists());

        let mut r = VolumeReader::open(&base, true).unwrap();
        let mut buf = vec![0u8; 600];
        for f in &frames {
            assert_eq!(r.read_block(&mut buf).unwrap(), 600);
            assert_eq!(&buf, f);
        }
        assert!(matches!(r.read_block(&mut buf), Err(FsaError::EndOfFile)));
    }

    #[test]
    fn refuses_existing_archive_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");
        std::fs::write(&base, b"anything").unwrap();

        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 0);
        assert!(matches!(
            w.write_block(&frame(0, 64), 64),
            Err(FsaError::Exists(_))
        ));

        let mut w = VolumeWriter::new(&base, generate_id(), 0, true, 0);
        w.write_block(&frame(0, 64), 64).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn delete_all_removes_created_volumes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 800);
        for i in 0..4 {
            w.write_block(&frame(i as u8, 400), 400).unwrap();
        }
        w.delete_all();
        assert!(!base.exists());
        assert!(!volume_path(&base, 1).exists());
    }

    #[test]
    fn missing_volume_in_batch_mode_fails() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("absent.fsa");
        assert!(matches!(
            VolumeReader::open(&base, true),
            Err(FsaError::NotFound(_))
        ));
    }

    #[test]
    fn wrong_archid_between_volumes_is_fatal() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        // build a two-volume archive
        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 800);
        for i in 0..4 {
            w.write_block(&frame(i as u8, 400), 400).unwrap();
        }
        w.finish().unwrap();
        let vol1 = volume_path(&base, 1);
        assert!(vol1.exists());

        // replace volume 1 with one from a different archive
        let other_base = dir.path().join("other.fsa");
        let mut w2 = VolumeWriter::new(&other_base, generate_id(), 0, false, 800);
        for i in 0..4 {
            w2.write_block(&frame(i as u8, 400), 400).unwrap();
        }
        w2.finish().unwrap();
        std::fs::remove_file(&vol1).unwrap();
        std::fs::copy(volume_path(&other_base, 1), &vol1).unwrap();

        let mut r = VolumeReader::open(&base, true).unwrap();
        let mut buf = vec![0u8; 400];
        let mut res = Ok(0u32);
        for _ in 0..8 {
            res = r.read_block(&mut buf);
            if res.is_err() {
                break;
            }
        }
        assert!(matches!(res, Err(FsaError::WrongArchive(_))));
    }

    #[test]
    fn resync_over_garbage_between_blocks() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test.fsa");

        let mut w = VolumeWriter::new(&base, generate_id(), 0, false, 0);
        let f1 = frame(3, 200);
        let f2 = frame(4, 200);
        w.write_block(&f1, 200).unwrap();
        w.write_block(&f2, 200).unwrap();
        w.finish().unwrap();

        // splice rubbish between the two block frames
        let data = std::fs::read(&base).unwrap();
        let block_len = 2 * DESCRIPTOR_SIZE + 200;
        let insert_at = DESCRIPTOR_SIZE + block_len;
        let mut patched = Vec::new();
        patched.extend_from_slice(&data[..insert_at]);
        patched.extend_from_slice(&[0xEE; 17]);
        patched.extend_from_slice(&data[insert_at..]);
        std::fs::write(&base, &patched).unwrap();

        let mut r = VolumeReader::open(&base, true).unwrap();
        let mut buf = vec![0u8; 200];
        assert_eq!(r.read_block(&mut buf).unwrap(), 200);
        assert_eq!(buf, f1);
        assert_eq!(r.read_block(&mut buf).unwrap(), 200);
        assert_eq!(buf, f2);
        assert_eq!(r.skipped_bytes, 17);
    }
}
