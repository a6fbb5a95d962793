//! Restore driver: reads the archive stream, recreates filesystems, and
//! materializes every object with its attributes.
//!
//! The volume reader, FEC decoder, record parser and decompressor pool
//! run on secondary threads; the driver is the main-thread consumer that
//! walks the record stream in order. Per-object problems are counted and
//! survived; wrong volume / wrong archive / wrong version / wrong
//! password stop the run before anything is written.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use filetime::FileTime;
use nix::sys::stat::{mknod, Mode, SFlag};

use crate::crypto::{self, EncryptAlgo};
use crate::datafile::DataFile;
use crate::dico::{Dico, SECTION_STDATTR, SECTION_XATTR};
use crate::error::{FsaError, FsaResult};
use crate::exclude::is_excluded;
use crate::fec::FRAME_PAYLOAD_SIZE;
use crate::fsys::{self, FsInfo, FsType, MkfsOverrides};
use crate::iobuffer::IoBuffer;
use crate::keys::{archtype, filefoot, linktarget, mainhead, object, ObjType, FILEFLAG_SPARSE};
use crate::options::{Options, CURRENT_VERSION, FEC_IOBUFSIZE, MAX_FSPERARCH, MAX_QUEUESIZE};
use crate::packer::GroupUnpacker;
use crate::pipeline::comp::spawn_decompressors;
use crate::pipeline::rest::{spawn_iobuffer_to_queue, spawn_volume_to_iobuffer, ReadSummary};
use crate::queue::{NextItem, Queue};
use crate::record::headtype;
use crate::status::{RunState, Status};
use crate::volume::VolumeReader;

// ── Specs & stats ────────────────────────────────────────────────────────────

/// One `id=N,dest=/dev/...` argument of restore-fs.
#[derive(Debug, Clone, Default)]
pub struct RestoreSpec {
    pub id: u16,
    pub dest: String,
    pub mkfs: Option<String>,
    pub overrides: MkfsOverrides,
}

impl RestoreSpec {
    /// Parse `id=0,dest=/dev/sda1[,mkfs=ext4][,mkfsopt=...][,label=...][,uuid=...]`.
    pub fn parse(arg: &str) -> FsaResult<RestoreSpec> {
        let mut spec = RestoreSpec::default();
        let mut have_id = false;
        for part in arg.split(',') {
            let (k, v) = part.split_once('=').ok_or_else(|| {
                FsaError::InvalidArg(format!("bad restore spec item \"{part}\" in \"{arg}\""))
            })?;
            match k {
                "id" => {
                    spec.id = v
                        .parse()
                        .map_err(|_| FsaError::InvalidArg(format!("bad filesystem id \"{v}\"")))?;
                    have_id = true;
                }
                "dest" => spec.dest = v.to_string(),
                "mkfs" => spec.mkfs = Some(v.to_string()),
                "mkfsopt" => spec.overrides.mkfs_options = Some(v.to_string()),
                "label" => spec.overrides.label = Some(v.to_string()),
                "uuid" => spec.overrides.uuid = Some(v.to_string()),
                _ => {
                    return Err(FsaError::InvalidArg(format!(
                        "unknown restore spec key \"{k}\""
                    )))
                }
            }
        }
        if !have_id || spec.dest.is_empty() {
            return Err(FsaError::InvalidArg(format!(
                "restore spec \"{arg}\" needs at least id= and dest="
            )));
        }
        if (spec.id as usize) >= MAX_FSPERARCH {
            return Err(FsaError::InvalidArg(format!(
                "filesystem id {} out of range",
                spec.id
            )));
        }
        Ok(spec)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub cnt_regfile: u64,
    pub cnt_dir: u64,
    pub cnt_symlink: u64,
    pub cnt_hardlink: u64,
    pub cnt_special: u64,
    pub err_regfile: u64,
    pub err_dir: u64,
    pub err_symlink: u64,
    pub err_special: u64,
    pub err_other: u64,
}

impl RestoreStats {
    pub fn errors(&self) -> u64 {
        self.err_regfile + self.err_dir + self.err_symlink + self.err_special + self.err_other
    }

    pub fn print(&self) {
        crate::errmsg!(
            "regfiles={}, directories={}, symlinks={}, hardlinks={}, specials={}",
            self.cnt_regfile,
            self.cnt_dir,
            self.cnt_symlink,
            self.cnt_hardlink,
            self.cnt_special
        );
        if self.errors() > 0 {
            crate::errmsg!(
                "errors: regfiles={}, directories={}, symlinks={}, specials={}, other={}",
                self.err_regfile,
                self.err_dir,
                self.err_symlink,
                self.err_special,
                self.err_other
            );
        }
    }

    fn add(&mut self, other: &RestoreStats) {
        self.cnt_regfile += other.cnt_regfile;
        self.cnt_dir += other.cnt_dir;
        self.cnt_symlink += other.cnt_symlink;
        self.cnt_hardlink += other.cnt_hardlink;
        self.cnt_special += other.cnt_special;
        self.err_regfile += other.err_regfile;
        self.err_dir += other.err_dir;
        self.err_symlink += other.err_symlink;
        self.err_special += other.err_special;
        self.err_other += other.err_other;
    }
}

// ── Archive opening ──────────────────────────────────────────────────────────

pub struct OpenedArchive {
    pub status: Arc<Status>,
    pub queue: Arc<Queue>,
    pub main: Dico,
    pub key: Option<[u8; 32]>,
    threads: Vec<JoinHandle<()>>,
    reader_rx: crossbeam_channel::Receiver<ReadSummary>,
}

/// Open the archive, start the read pipeline for the selected filesystem
/// set, read the main header and verify the password.
pub fn open_archive(
    archive: &Path,
    opts: &Options,
    selected: Vec<bool>,
) -> FsaResult<OpenedArchive> {
    let status = Status::new();
    let queue = Queue::new(MAX_QUEUESIZE, Arc::clone(&status));
    let iob = IoBuffer::new(FEC_IOBUFSIZE, FRAME_PAYLOAD_SIZE, Arc::clone(&status));

    let mut reader = VolumeReader::open(archive, opts.batch_mode)?;
    reader.set_drain_queue(Arc::clone(&queue));

    let mut threads = Vec::new();
    let (t, reader_rx) = spawn_volume_to_iobuffer(reader, Arc::clone(&iob), Arc::clone(&status));
    threads.push(t);
    threads.push(spawn_iobuffer_to_queue(
        Arc::clone(&iob),
        Arc::clone(&queue),
        Arc::clone(&status),
        Arc::new(selected),
    ));

    let opened = (|| -> FsaResult<OpenedArchive> {
        // first of up to three padded copies of the main header
        let main = loop {
            let (dico, ht, _) = queue.dequeue_header()?;
            match ht {
                headtype::MAIN => break dico,
                headtype::PADG => continue,
                other => {
                    crate::errmsg!(
                        "unexpected record before the archive header: {}",
                        headtype::name(other)
                    );
                    continue;
                }
            }
        };
        // consume the remaining copies so the stream starts clean
        while let Ok(NextItem::Header { headtype: ht, .. }) = queue.check_next_item() {
            if ht == headtype::MAIN || ht == headtype::PADG {
                queue.destroy_first()?;
            } else {
                break;
            }
        }

        let minver = main.get_u64(0, mainhead::MINVERSION).unwrap_or(0);
        if CURRENT_VERSION < minver {
            return Err(FsaError::WrongVersion(format!(
                "archive requires version {}",
                crate::options::version_string(minver)
            )));
        }

        // password check before a single object is restored
        let encrypt_algo = main.get_u16(0, mainhead::ENCRYPTALGO).unwrap_or(0);
        let key = match EncryptAlgo::from_wire_id(encrypt_algo) {
            Some(EncryptAlgo::Aes256) => {
                let pass = opts.encrypt_pass.as_deref().ok_or_else(|| {
                    FsaError::WrongArchive("archive is encrypted, a password is required".into())
                })?;
                let archid = main.get_u32(0, mainhead::ARCHIVEID).map_err(|_| {
                    FsaError::Corrupt("main header is missing the archive id".into())
                })?;
                let key = crypto::derive_key(pass, archid)
                    .map_err(|e| FsaError::InvalidArg(e.to_string()))?;
                let md5: [u8; 16] = main
                    .get_data(0, mainhead::PASSCHECK_MD5)?
                    .try_into()
                    .map_err(|_| FsaError::Corrupt("malformed password check".into()))?;
                let crypt = main.get_data(0, mainhead::PASSCHECK_CRYPT)?;
                crypto::verify_passcheck(&key, &md5, crypt)
                    .map_err(|_| FsaError::WrongArchive("wrong password".into()))?;
                Some(key)
            }
            _ => {
                if opts.encrypt_pass.is_some() {
                    crate::errmsg!("archive is not encrypted, ignoring the password");
                }
                None
            }
        };

        Ok(OpenedArchive {
            status: Arc::clone(&status),
            queue: Arc::clone(&queue),
            main,
            key,
            threads: Vec::new(),
            reader_rx: reader_rx.clone(),
        })
    })();

    match opened {
        Ok(mut oa) => {
            oa.threads = threads;
            Ok(oa)
        }
        Err(e) => {
            status.set(RunState::Failed, "archive open failed");
            for t in threads {
                let _ = t.join();
            }
            Err(e)
        }
    }
}

impl OpenedArchive {
    pub fn spawn_decompressors(&mut self, jobs: u32) {
        self.threads
            .extend(spawn_decompressors(&self.queue, &self.status, jobs, self.key));
    }

    /// Stop the pipeline and wait for every thread.
    pub fn finish(self) -> FsaResult<ReadSummary> {
        if self.status.is_running() {
            self.status.set(RunState::Finished, "restore driver done");
        }
        for t in self.threads {
            let _ = t.join();
        }
        let failed = self.status.get() == RunState::Failed;
        let summary = self.reader_rx.recv().unwrap_or_default();
        if summary.skipped_bytes > 0 {
            crate::errmsg!("{} bytes skipped over corrupt areas", summary.skipped_bytes);
        }
        if failed {
            return Err(FsaError::Unknown("a pipeline thread failed".into()));
        }
        Ok(summary)
    }
}

// ── Attribute helpers ────────────────────────────────────────────────────────

fn lchown(path: &Path, uid: u32, gid: u32) -> FsaResult<()> {
    let cp = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsaError::InvalidArg("path contains NUL".into()))?;
    let res = unsafe { libc::lchown(cp.as_ptr(), uid, gid) };
    if res < 0 {
        return Err(FsaError::Write(format!(
            "lchown {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Apply xattrs, ownership, permissions and times from an object record.
/// Times come last so the earlier changes cannot bump them.
fn restore_attrs(fullpath: &Path, dico: &Dico, is_symlink: bool) -> FsaResult<()> {
    let mut i = 0u16;
    loop {
        let name = match dico.get_raw(SECTION_XATTR, 2 * i) {
            Some(item) => String::from_utf8_lossy(&item.data).into_owned(),
            None => break,
        };
        match dico.get_raw(SECTION_XATTR, 2 * i + 1) {
            Some(value) => {
                if let Err(e) = crate::xattr::set_xattr(fullpath, &name, &value.data) {
                    crate::msg!(1, "{e}");
                }
            }
            None => crate::errmsg!("xattr {name} has no value item"),
        }
        i += 1;
    }

    let uid = dico.get_u32(SECTION_STDATTR, object::UID)?;
    let gid = dico.get_u32(SECTION_STDATTR, object::GID)?;
    if let Err(e) = lchown(fullpath, uid, gid) {
        crate::msg!(1, "{e}");
    }

    if !is_symlink {
        let mode = dico.get_u32(SECTION_STDATTR, object::MODE)?;
        std::fs::set_permissions(fullpath, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| FsaError::Write(format!("chmod {}: {e}", fullpath.display())))?;
    }

    let atime = dico.get_u64(SECTION_STDATTR, object::ATIME).unwrap_or(0);
    let mtime = dico.get_u64(SECTION_STDATTR, object::MTIME).unwrap_or(0);
    filetime::set_symlink_file_times(
        fullpath,
        FileTime::from_unix_time(atime as i64, 0),
        FileTime::from_unix_time(mtime as i64, 0),
    )
    .map_err(|e| FsaError::Write(format!("utimes {}: {e}", fullpath.display())))?;

    Ok(())
}

/// Capture the parent directory's times before creating a child so they
/// can be propagated unchanged afterwards.
fn capture_parent_times(path: &Path) -> Option<(PathBuf, FileTime, FileTime)> {
    let parent = path.parent()?;
    let md = std::fs::metadata(parent).ok()?;
    Some((
        parent.to_path_buf(),
        FileTime::from_last_access_time(&md),
        FileTime::from_last_modification_time(&md),
    ))
}

fn restore_parent_times(times: Option<(PathBuf, FileTime, FileTime)>) {
    if let Some((parent, atime, mtime)) = times {
        if let Err(e) = filetime::set_file_times(&parent, atime, mtime) {
            crate::msg!(1, "cannot restore times of {}: {e}", parent.display());
        }
    }
}

/// Reject relative paths that would escape the destination tree.
fn safe_join(destdir: &Path, relpath: &str) -> FsaResult<PathBuf> {
    let rel = relpath.trim_start_matches('/');
    if rel.split('/').any(|c| c == "..") {
        return Err(FsaError::InvalidArg(format!(
            "archive contains an unsafe path: {relpath}"
        )));
    }
    Ok(destdir.join(rel))
}

// ── Extractor ────────────────────────────────────────────────────────────────

struct Extractor<'a> {
    queue: &'a Queue,
    status: &'a Status,
    opts: &'a Options,
    destdir: PathBuf,
    fstype: FsType,
    stats: RestoreStats,
}

impl<'a> Extractor<'a> {
    fn new(
        queue: &'a Queue,
        status: &'a Status,
        opts: &'a Options,
        destdir: &Path,
        fstype: FsType,
    ) -> Extractor<'a> {
        Extractor {
            queue,
            status,
            opts,
            destdir: destdir.to_path_buf(),
            fstype,
            stats: RestoreStats::default(),
        }
    }

    /// Consume object records until the filesystem's DATF record,
    /// skipping anything unexpected (corruption resynchronization).
    fn extract_objects(&mut self) -> FsaResult<()> {
        loop {
            if !self.status.is_running() {
                return Err(FsaError::Closed("restore interrupted".into()));
            }
            match self.queue.check_next_item() {
                Ok(NextItem::Header {
                    headtype: headtype::OBJT,
                    ..
                }) => {
                    let (dico, _, _) = self.queue.dequeue_header()?;
                    self.restore_object(dico)?;
                }
                Ok(NextItem::Header {
                    headtype: headtype::DATF,
                    ..
                }) => {
                    self.queue.dequeue_header()?;
                    return Ok(());
                }
                Ok(other) => {
                    crate::errmsg!("unexpected item in archive, skipping: {other:?}");
                    self.queue.destroy_first()?;
                    self.stats.err_other += 1;
                }
                Err(FsaError::EndOfFile) => {
                    crate::errmsg!("archive ended before the end-of-data record");
                    self.stats.err_other += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn restore_object(&mut self, dico: Dico) -> FsaResult<()> {
        let relpath = match dico.get_string(SECTION_STDATTR, object::PATH) {
            Ok(p) => p,
            Err(e) => {
                crate::errmsg!("object record without a path: {e}");
                self.stats.err_other += 1;
                return Ok(());
            }
        };
        let otype = dico
            .get_u32(SECTION_STDATTR, object::OBJTYPE)
            .ok()
            .and_then(ObjType::from_u32);
        let otype = match otype {
            Some(t) => t,
            None => {
                crate::errmsg!("object [{relpath}] has an unknown type");
                self.stats.err_other += 1;
                return Ok(());
            }
        };
        let fullpath = match safe_join(&self.destdir, &relpath) {
            Ok(p) => p,
            Err(e) => {
                crate::errmsg!("{e}");
                self.stats.err_other += 1;
                // a regfile with blocks still has to be drained
                if otype == ObjType::RegFileUnique {
                    return self.restore_regfile_unique(None, &relpath, &dico);
                }
                return Ok(());
            }
        };

        crate::msg!(1, "restoring {:<8} [{relpath}]", otype.name());

        match otype {
            ObjType::Dir => self.restore_dir_object(&fullpath, &relpath, &dico),
            ObjType::Symlink => self.restore_symlink(&fullpath, &relpath, &dico),
            ObjType::Hardlink => self.restore_hardlink(&fullpath, &relpath, &dico),
            ObjType::CharDev | ObjType::BlockDev | ObjType::Fifo | ObjType::Socket => {
                self.restore_special(&fullpath, &relpath, &dico, otype)
            }
            ObjType::RegFileUnique => self.restore_regfile_unique(Some(&fullpath), &relpath, &dico),
            ObjType::RegFileMulti => self.restore_regfile_multi(dico),
        }
    }

    fn excluded(&self, relpath: &str) -> bool {
        is_excluded(&self.opts.exclude, relpath)
    }

    fn restore_dir_object(&mut self, fullpath: &Path, relpath: &str, dico: &Dico) -> FsaResult<()> {
        if self.excluded(relpath) {
            return Ok(());
        }
        let parent = capture_parent_times(fullpath);
        let res = std::fs::create_dir_all(fullpath)
            .map_err(|e| FsaError::Write(format!("mkdir {}: {e}", fullpath.display())))
            .and_then(|()| restore_attrs(fullpath, dico, false));
        restore_parent_times(parent);
        match res {
            Ok(()) => {
                self.stats.cnt_dir += 1;
            }
            Err(e) => {
                crate::errmsg!("cannot restore dir [{relpath}]: {e}");
                self.stats.err_dir += 1;
            }
        }
        Ok(())
    }

    fn restore_symlink(&mut self, fullpath: &Path, relpath: &str, dico: &Dico) -> FsaResult<()> {
        if self.excluded(relpath) {
            return Ok(());
        }
        let target = match dico.get_string(SECTION_STDATTR, object::SYMLINK) {
            Ok(t) => t,
            Err(e) => {
                crate::errmsg!("symlink [{relpath}] without a target: {e}");
                self.stats.err_symlink += 1;
                return Ok(());
            }
        };
        let parent = capture_parent_times(fullpath);
        // a leftover from an earlier restore would make the create fail
        if std::fs::symlink_metadata(fullpath).map(|m| !m.is_dir()).unwrap_or(false) {
            let _ = std::fs::remove_file(fullpath);
        }
        let res = if self.fstype == FsType::Vfat {
            // no symlinks there; substitute what the link pointed at
            let ttype = dico
                .get_u32(SECTION_STDATTR, object::LINKTARGETTYPE)
                .unwrap_or(linktarget::UNKNOWN);
            let r = if ttype == linktarget::DIR {
                std::fs::create_dir_all(fullpath)
            } else {
                std::fs::File::create(fullpath).map(|_| ())
            };
            r.map_err(|e| FsaError::Write(format!("{}: {e}", fullpath.display())))
                .and_then(|()| restore_attrs(fullpath, dico, false))
        } else {
            std::os::unix::fs::symlink(&target, fullpath)
                .map_err(|e| FsaError::Write(format!("symlink {}: {e}", fullpath.display())))
                .and_then(|()| restore_attrs(fullpath, dico, true))
        };
        restore_parent_times(parent);
        match res {
            Ok(()) => self.stats.cnt_symlink += 1,
            Err(e) => {
                crate::errmsg!("cannot restore symlink [{relpath}]: {e}");
                self.stats.err_symlink += 1;
            }
        }
        Ok(())
    }

    fn restore_hardlink(&mut self, fullpath: &Path, relpath: &str, dico: &Dico) -> FsaResult<()> {
        if self.excluded(relpath) {
            return Ok(());
        }
        let target_rel = match dico.get_string(SECTION_STDATTR, object::HARDLINK) {
            Ok(t) => t,
            Err(e) => {
                crate::errmsg!("hardlink [{relpath}] without a target: {e}");
                self.stats.err_regfile += 1;
                return Ok(());
            }
        };
        let target = match safe_join(&self.destdir, &target_rel) {
            Ok(t) => t,
            Err(e) => {
                crate::errmsg!("{e}");
                self.stats.err_regfile += 1;
                return Ok(());
            }
        };
        let parent = capture_parent_times(fullpath);
        if std::fs::symlink_metadata(fullpath).map(|m| !m.is_dir()).unwrap_or(false) {
            let _ = std::fs::remove_file(fullpath);
        }
        let res = std::fs::hard_link(&target, fullpath).map_err(|e| {
            FsaError::Write(format!(
                "link {} -> {}: {e}",
                fullpath.display(),
                target.display()
            ))
        });
        restore_parent_times(parent);
        match res {
            Ok(()) => self.stats.cnt_hardlink += 1,
            Err(e) => {
                crate::errmsg!("cannot restore hardlink [{relpath}]: {e}");
                self.stats.err_regfile += 1;
            }
        }
        Ok(())
    }

    fn restore_special(
        &mut self,
        fullpath: &Path,
        relpath: &str,
        dico: &Dico,
        otype: ObjType,
    ) -> FsaResult<()> {
        if self.excluded(relpath) {
            return Ok(());
        }
        let mode = dico.get_u32(SECTION_STDATTR, object::MODE).unwrap_or(0o600);
        let rdev = dico.get_u64(SECTION_STDATTR, object::RDEV).unwrap_or(0);
        let kind = match otype {
            ObjType::CharDev => SFlag::S_IFCHR,
            ObjType::BlockDev => SFlag::S_IFBLK,
            ObjType::Fifo => SFlag::S_IFIFO,
            _ => SFlag::S_IFSOCK,
        };
        let parent = capture_parent_times(fullpath);
        if std::fs::symlink_metadata(fullpath).map(|m| !m.is_dir()).unwrap_or(false) {
            let _ = std::fs::remove_file(fullpath);
        }
        let res = mknod(
            fullpath,
            kind,
            Mode::from_bits_truncate(mode & 0o7777),
            rdev as nix::libc::dev_t,
        )
        .map_err(|e| FsaError::Write(format!("mknod {}: {e}", fullpath.display())))
        .and_then(|()| restore_attrs(fullpath, dico, false));
        restore_parent_times(parent);
        match res {
            Ok(()) => self.stats.cnt_special += 1,
            Err(e) => {
                crate::errmsg!("cannot restore special [{relpath}]: {e}");
                self.stats.err_special += 1;
            }
        }
        Ok(())
    }

    /// Large or empty regular file: stream its block chain, verify the
    /// footer MD5, remove the file on any integrity failure.
    /// `fullpath == None` drains the blocks without touching the disk.
    fn restore_regfile_unique(
        &mut self,
        fullpath: Option<&Path>,
        relpath: &str,
        dico: &Dico,
    ) -> FsaResult<()> {
        let size = match dico.get_u64(SECTION_STDATTR, object::SIZE) {
            Ok(s) => s,
            Err(e) => {
                crate::errmsg!("regfile [{relpath}] without a size: {e}");
                self.stats.err_regfile += 1;
                return Ok(());
            }
        };
        let flags = dico.get_u64(SECTION_STDATTR, object::FLAGS).unwrap_or(0);
        let sparse = flags & FILEFLAG_SPARSE != 0;
        let excluded = fullpath.is_none() || self.excluded(relpath);

        let mut parent = None;
        let mut minor = false;
        let mut delfile = false;

        let datafile = match fullpath {
            Some(p) if !excluded => {
                if let Some(dir) = p.parent() {
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        crate::errmsg!("mkdir {}: {e}", dir.display());
                        minor = true;
                    }
                }
                parent = capture_parent_times(p);
                match DataFile::open_write(p, false, sparse) {
                    Ok(df) => Some(df),
                    Err(e) => {
                        crate::errmsg!("{e}");
                        minor = true;
                        None
                    }
                }
            }
            _ => match DataFile::open_write(Path::new("/dev/null"), true, false) {
                Ok(df) => Some(df),
                Err(_) => None,
            },
        };
        let mut datafile = datafile;

        // stream the block chain; offsets must line up exactly
        let mut filepos: u64 = 0;
        while filepos < size && !delfile {
            if !self.status.is_running() {
                return Err(FsaError::Closed("restore interrupted".into()));
            }
            let block = match self.queue.dequeue_block() {
                Ok(b) => b,
                Err(e) => {
                    crate::errmsg!("cannot read data block for [{relpath}]: {e}");
                    minor = true;
                    delfile = true;
                    break;
                }
            };
            if block.offset != filepos || block.realsize == 0 {
                crate::errmsg!(
                    "file offsets do not match for [{relpath}]: expected {filepos}, got {} ({} bytes)",
                    block.offset,
                    block.realsize
                );
                minor = true;
                delfile = true;
                break;
            }
            if !block.sumok {
                // zeroed payload keeps offsets aligned; the footer check
                // below decides the file's fate
                minor = true;
            }
            if let Some(df) = datafile.as_mut() {
                if let Err(e) = df.write(&block.data) {
                    if matches!(e, FsaError::NoSpace(_)) {
                        return Err(e);
                    }
                    crate::errmsg!("{e}");
                    minor = true;
                    delfile = true;
                    break;
                }
            }
            filepos += block.realsize as u64;
        }

        let md5calc = match datafile {
            Some(df) => match df.close() {
                Ok(m) => Some(m),
                Err(e) => {
                    crate::errmsg!("{e}");
                    minor = true;
                    None
                }
            },
            None => None,
        };

        // empty files carry no footer
        if size > 0 && !delfile {
            match self.queue.dequeue_header() {
                Ok((foot, headtype::FILF, _)) => {
                    if !excluded {
                        let orig = foot.get_data(0, filefoot::MD5SUM).ok().map(|d| d.to_vec());
                        match (orig, md5calc) {
                            (Some(orig), Some(calc)) if orig == calc => {}
                            (orig, calc) => {
                                crate::errmsg!(
                                    "cannot restore file [{relpath}]: file is corrupt \
                                     (md5 {} expected, {} written)",
                                    orig.map(hex::encode).unwrap_or_else(|| "?".into()),
                                    calc.map(hex::encode).unwrap_or_else(|| "?".into())
                                );
                                delfile = true;
                                minor = true;
                            }
                        }
                    }
                }
                Ok((_, other, _)) => {
                    crate::errmsg!(
                        "expected a file footer for [{relpath}], found {}",
                        headtype::name(other)
                    );
                    minor = true;
                }
                Err(e) => {
                    crate::errmsg!("cannot read file footer for [{relpath}]: {e}");
                    minor = true;
                }
            }
        }
        if let Some(p) = fullpath {
            if delfile && !excluded {
                crate::errmsg!("removing {}", p.display());
                let _ = std::fs::remove_file(p);
            } else if !excluded && !minor {
                if let Err(e) = restore_attrs(p, dico, false) {
                    crate::errmsg!("cannot restore attributes of [{relpath}]: {e}");
                    minor = true;
                }
            }
        }
        restore_parent_times(parent);

        if !excluded {
            if minor {
                self.stats.err_regfile += 1;
            } else {
                self.stats.cnt_regfile += 1;
            }
        }
        Ok(())
    }

    /// A packed group: the first OBJT record arrived; collect the rest of
    /// the group and its shared block, then slice out every file.
    fn restore_regfile_multi(&mut self, first: Dico) -> FsaResult<()> {
        let count = first
            .get_u32(SECTION_STDATTR, object::MULTIFILESCOUNT)
            .map_err(|e| FsaError::Corrupt(format!("packed file without a group count: {e}")))?;

        let mut unpacker = GroupUnpacker::new();
        unpacker.add_header(first);
        for i in 1..count {
            let (dico, ht, _) = self.queue.dequeue_header().map_err(|e| {
                FsaError::Corrupt(format!("cannot read packed object {i}/{count}: {e}"))
            })?;
            if ht != headtype::OBJT {
                return Err(FsaError::Corrupt(format!(
                    "expected a packed object record, found {}",
                    headtype::name(ht)
                )));
            }
            unpacker.add_header(dico);
        }
        let block = self
            .queue
            .dequeue_block()
            .map_err(|e| FsaError::Corrupt(format!("cannot read the shared data block: {e}")))?;
        let group_ok = block.sumok;
        unpacker.set_data_block(block.data);

        for i in 0..count as usize {
            match unpacker.get_file(i) {
                Ok((dico, data)) => {
                    let dico = dico.clone();
                    let data = data.to_vec();
                    self.write_packed_file(&dico, &data, group_ok);
                }
                Err(e) => {
                    crate::errmsg!("{e}");
                    self.stats.err_regfile += 1;
                }
            }
        }
        Ok(())
    }

    fn write_packed_file(&mut self, dico: &Dico, data: &[u8], group_ok: bool) {
        let relpath = match dico.get_string(SECTION_STDATTR, object::PATH) {
            Ok(p) => p,
            Err(e) => {
                crate::errmsg!("packed object without a path: {e}");
                self.stats.err_regfile += 1;
                return;
            }
        };
        if self.excluded(&relpath) {
            return;
        }
        let fullpath = match safe_join(&self.destdir, &relpath) {
            Ok(p) => p,
            Err(e) => {
                crate::errmsg!("{e}");
                self.stats.err_regfile += 1;
                return;
            }
        };
        crate::msg!(1, "restoring regfile  [{relpath}]");

        if let Some(dir) = fullpath.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                crate::errmsg!("mkdir {}: {e}", dir.display());
                self.stats.err_regfile += 1;
                return;
            }
        }
        let parent = capture_parent_times(&fullpath);

        let write_res = (|| -> FsaResult<[u8; 16]> {
            let mut df = DataFile::open_write(&fullpath, false, false)?;
            df.write(data)?;
            df.close()
        })();

        let ok = match write_res {
            Ok(md5calc) => {
                let orig = dico.get_data(SECTION_STDATTR, object::MD5SUM).ok();
                if !group_ok || orig.map(|o| o != md5calc).unwrap_or(true) {
                    crate::errmsg!(
                        "cannot restore file [{relpath}]: the shared data block is corrupt"
                    );
                    // truncate rather than leave corrupt data behind
                    let _ = std::fs::File::create(&fullpath);
                    false
                } else {
                    match restore_attrs(&fullpath, dico, false) {
                        Ok(()) => true,
                        Err(e) => {
                            crate::errmsg!("cannot restore attributes of [{relpath}]: {e}");
                            false
                        }
                    }
                }
            }
            Err(e) => {
                crate::errmsg!("cannot write [{relpath}]: {e}");
                let _ = std::fs::remove_file(&fullpath);
                false
            }
        };
        restore_parent_times(parent);

        if ok {
            self.stats.cnt_regfile += 1;
        } else {
            self.stats.err_regfile += 1;
        }
    }
}

// ── Header stream helpers ────────────────────────────────────────────────────

/// Dequeue headers until one of the wanted types shows up, skipping (and
/// counting) anything else.
fn expect_header(queue: &Queue, wanted: &[u32], stats: &mut RestoreStats) -> FsaResult<(Dico, u32, u16)> {
    loop {
        let (dico, ht, fsindex) = queue.dequeue_header()?;
        if wanted.contains(&ht) {
            return Ok((dico, ht, fsindex));
        }
        crate::errmsg!(
            "unexpected record in archive: {} (wanted {})",
            headtype::name(ht),
            wanted.iter().map(|&w| headtype::name(w)).collect::<Vec<_>>().join("/")
        );
        stats.err_other += 1;
    }
}

// ── restore-dir ──────────────────────────────────────────────────────────────

pub fn restore_dir(archive: &Path, destdir: &Path, opts: &Options) -> FsaResult<RestoreStats> {
    opts.validate().map_err(FsaError::InvalidArg)?;
    if !destdir.is_dir() {
        return Err(FsaError::NotFound(format!(
            "{} is not a directory",
            destdir.display()
        )));
    }

    let mut selected = vec![false; MAX_FSPERARCH];
    selected[0] = true;
    let mut opened = open_archive(archive, opts, selected)?;

    let atype = opened.main.get_u32(0, mainhead::ARCHTYPE).unwrap_or(0);
    if atype != archtype::DIRECTORIES {
        let e = FsaError::WrongType(
            "this archive holds filesystems; use restore-fs instead".into(),
        );
        opened.status.set(RunState::Failed, "wrong archive type");
        let _ = opened.finish();
        return Err(e);
    }

    opened.spawn_decompressors(opts.compress_jobs);

    let mut stats = RestoreStats::default();
    let result = (|| -> FsaResult<()> {
        // the dirs-info record precedes the flat object stream
        if opened.main.get_u8(0, mainhead::HASDIRSINFO).unwrap_or(0) != 0 {
            let _ = expect_header(&opened.queue, &[headtype::DIRS], &mut stats)?;
        }
        let mut extractor = Extractor::new(
            &opened.queue,
            &opened.status,
            opts,
            destdir,
            FsType::Ext4,
        );
        extractor.extract_objects()?;
        stats.add(&extractor.stats);
        Ok(())
    })();

    match result {
        Ok(()) => {
            opened.finish()?;
            stats.print();
            Ok(stats)
        }
        Err(e) => {
            if opened.status.is_running() {
                opened.status.set(RunState::Failed, "restore driver failed");
            }
            let _ = opened.finish();
            Err(e)
        }
    }
}

// ── restore-fs ───────────────────────────────────────────────────────────────

pub fn restore_fs(archive: &Path, specs: &[RestoreSpec], opts: &Options) -> FsaResult<RestoreStats> {
    opts.validate().map_err(FsaError::InvalidArg)?;
    if specs.is_empty() {
        return Err(FsaError::InvalidArg("no filesystem selected".into()));
    }

    let mut specs = specs.to_vec();
    specs.sort_by_key(|s| s.id);
    for pair in specs.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(FsaError::InvalidArg(format!(
                "filesystem id {} selected twice",
                pair[0].id
            )));
        }
    }

    let mut selected = vec![false; MAX_FSPERARCH];
    for s in &specs {
        selected[s.id as usize] = true;
    }

    let mut opened = open_archive(archive, opts, selected)?;

    let atype = opened.main.get_u32(0, mainhead::ARCHTYPE).unwrap_or(0);
    if atype != archtype::FILESYSTEMS {
        let e = FsaError::WrongType(
            "this archive holds a directory tree; use restore-dir instead".into(),
        );
        opened.status.set(RunState::Failed, "wrong archive type");
        let _ = opened.finish();
        return Err(e);
    }
    let fscount = opened.main.get_u32(0, mainhead::FSCOUNT).unwrap_or(0);
    for s in &specs {
        if s.id as u32 >= fscount {
            let e = FsaError::InvalidArg(format!(
                "filesystem id {} does not exist (archive has {fscount})",
                s.id
            ));
            opened.status.set(RunState::Failed, "bad filesystem id");
            let _ = opened.finish();
            return Err(e);
        }
    }

    opened.spawn_decompressors(opts.compress_jobs);

    let mut stats = RestoreStats::default();
    let result = (|| -> FsaResult<()> {
        // the disk-layout record is optional and informational here
        if let Ok(NextItem::Header {
            headtype: headtype::DILA,
            ..
        }) = opened.queue.check_next_item()
        {
            opened.queue.destroy_first()?;
        }

        for spec in &specs {
            restore_one_fs(&opened, spec, opts, &mut stats)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            opened.finish()?;
            stats.print();
            Ok(stats)
        }
        Err(e) => {
            if opened.status.is_running() {
                opened.status.set(RunState::Failed, "restore driver failed");
            }
            let _ = opened.finish();
            Err(e)
        }
    }
}

fn restore_one_fs(
    opened: &OpenedArchive,
    spec: &RestoreSpec,
    opts: &Options,
    stats: &mut RestoreStats,
) -> FsaResult<()> {
    // this filesystem's info record (unselected ones were filtered out)
    let (fsin, _, fsindex) = expect_header(&opened.queue, &[headtype::FSIN], stats)?;
    if fsindex != spec.id {
        return Err(FsaError::Corrupt(format!(
            "expected filesystem {} in the stream, found {fsindex}",
            spec.id
        )));
    }
    let info = FsInfo::from_dico(&fsin)?;

    let minver = fsin.get_u64(0, crate::keys::fsinfo::MINVERSION).unwrap_or(0);
    if CURRENT_VERSION < minver {
        return Err(FsaError::WrongVersion(format!(
            "filesystem {} requires version {}",
            spec.id,
            crate::options::version_string(minver)
        )));
    }

    let family = spec.mkfs.as_deref().unwrap_or(&info.filesystem);
    let fstype = FsType::from_name(family)
        .ok_or_else(|| FsaError::WrongType(format!("unsupported filesystem \"{family}\"")))?;

    crate::msg!(
        1,
        "restoring filesystem {} ({family}) to {}",
        spec.id,
        spec.dest
    );
    fstype.mkfs(&spec.dest, &info, &spec.overrides)?;

    let (_, _, _) = expect_header(&opened.queue, &[headtype::FSYB], stats)?;

    if !fstype.has_contents() {
        // metadata-only families still close with a DATF record
        let _ = expect_header(&opened.queue, &[headtype::DATF], stats)?;
        return Ok(());
    }

    let mountpoint = PathBuf::from(format!("/tmp/fsark.{}/rest{}", std::process::id(), spec.id));
    std::fs::create_dir_all(&mountpoint)
        .map_err(|e| FsaError::Open(format!("{}: {e}", mountpoint.display())))?;
    fstype.mount(&spec.dest, &mountpoint, false)?;

    let extract_result = (|| -> FsaResult<RestoreStats> {
        let mut extractor = Extractor::new(
            &opened.queue,
            &opened.status,
            opts,
            &mountpoint,
            fstype,
        );
        extractor.extract_objects()?;
        Ok(extractor.stats)
    })();

    if let Err(e) = fsys::unmount(&mountpoint) {
        crate::errmsg!("{e}");
    }
    let _ = std::fs::remove_dir(&mountpoint);

    stats.add(&extract_result?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let s = RestoreSpec::parse("id=2,dest=/dev/sdb1,mkfs=ext4,label=root").unwrap();
        assert_eq!(s.id, 2);
        assert_eq!(s.dest, "/dev/sdb1");
        assert_eq!(s.mkfs.as_deref(), Some("ext4"));
        assert_eq!(s.overrides.label.as_deref(), Some("root"));

        assert!(RestoreSpec::parse("dest=/dev/sdb1").is_err());
        assert!(RestoreSpec::parse("id=1").is_err());
        assert!(RestoreSpec::parse("id=1,dest=/x,bogus=1").is_err());
        assert!(RestoreSpec::parse("id=999,dest=/x").is_err());
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let dest = Path::new("/mnt/restore");
        assert_eq!(
            safe_join(dest, "etc/passwd").unwrap(),
            PathBuf::from("/mnt/restore/etc/passwd")
        );
        assert_eq!(
            safe_join(dest, "/leading/slash").unwrap(),
            PathBuf::from("/mnt/restore/leading/slash")
        );
        assert!(safe_join(dest, "../outside").is_err());
        assert!(safe_join(dest, "a/../../b").is_err());
    }
}
