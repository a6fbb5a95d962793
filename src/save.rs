//! Save driver: walks filesystems or directory trees and feeds the
//! pipeline that turns them into an archive.
//!
//! The walker runs on the main thread and produces object records and
//! Todo data blocks; the compressor pool, the serializer thread and the
//! volume-writer thread do the rest. Small regular files are grouped by
//! the packer; large files become chains of independently compressed
//! blocks closed by an MD5 footer.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use md5::{Digest, Md5};
use walkdir::WalkDir;

use crate::crypto::{self, EncryptAlgo};
use crate::dico::{Dico, SECTION_STDATTR, SECTION_XATTR};
use crate::error::{FsaError, FsaResult};
use crate::exclude::is_excluded;
use crate::fec::FRAME_PAYLOAD_SIZE;
use crate::fsys;
use crate::iobuffer::IoBuffer;
use crate::keys::{archtype, dirsinfo, linktarget, mainhead, object, ObjType, FILEFLAG_SPARSE};
use crate::layout;
use crate::options::{
    Options, COST_PER_FILE, CURRENT_VERSION, DEF_BLKSIZE, FEC_IOBUFSIZE, MAINHEAD_COPIES,
    MAINHEAD_PADDING, MAX_QUEUESIZE, MAX_SMALLFILESIZE,
};
use crate::packer::GroupPacker;
use crate::pipeline::comp::spawn_compressors;
use crate::pipeline::save::{
    spawn_iobuffer_to_volume, spawn_queue_to_iobuffer, WriteSummary, WriterConfig,
};
use crate::queue::{BlockInfo, ItemState, Queue};
use crate::record::{headtype, FSID_NULL};
use crate::status::{RunState, Status};
use crate::volume::generate_id;

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct SaveStats {
    pub cnt_regfile: u64,
    pub cnt_dir: u64,
    pub cnt_symlink: u64,
    pub cnt_hardlink: u64,
    pub cnt_special: u64,
    pub err_regfile: u64,
    pub err_dir: u64,
    pub err_symlink: u64,
    pub err_special: u64,
}

impl SaveStats {
    pub fn errors(&self) -> u64 {
        self.err_regfile + self.err_dir + self.err_symlink + self.err_special
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
                "errors: regfiles={}, directories={}, symlinks={}, specials={}",
                self.err_regfile,
                self.err_dir,
                self.err_symlink,
                self.err_special
            );
        }
    }
}

/// Append the `.fsa` extension when the user left it off.
pub fn force_fsa_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "fsa" => path.to_path_buf(),
        _ => {
            let mut s = path.as_os_str().to_owned();
            s.push(".fsa");
            PathBuf::from(s)
        }
    }
}

// ── Pipeline bring-up ────────────────────────────────────────────────────────

struct SavePipeline {
    status: Arc<Status>,
    queue: Arc<Queue>,
    threads: Vec<JoinHandle<()>>,
    writer_rx: crossbeam_channel::Receiver<WriteSummary>,
}

fn start_save_pipeline(
    archive: &Path,
    opts: &Options,
    archid: u32,
    key: Option<[u8; 32]>,
) -> SavePipeline {
    let status = Status::new();
    let queue = Queue::new(MAX_QUEUESIZE, Arc::clone(&status));
    let iob = IoBuffer::new(FEC_IOBUFSIZE, FRAME_PAYLOAD_SIZE, Arc::clone(&status));

    let mut threads = spawn_compressors(
        &queue,
        &status,
        opts.compress_jobs,
        opts.compress_algo,
        opts.compress_level,
        key,
    );
    threads.push(spawn_queue_to_iobuffer(
        Arc::clone(&queue),
        Arc::clone(&iob),
        Arc::clone(&status),
    ));
    let (writer, writer_rx) = spawn_iobuffer_to_volume(
        Arc::clone(&iob),
        Arc::clone(&status),
        WriterConfig {
            basepath: archive.to_path_buf(),
            archid,
            ecclevel: opts.ecclevel,
            overwrite: opts.overwrite,
            splitsize: opts.splitsize,
        },
    );
    threads.push(writer);

    SavePipeline {
        status,
        queue,
        threads,
        writer_rx,
    }
}

impl SavePipeline {
    /// Close the stream and wait for every thread; returns the writer
    /// summary when the archive survived.
    fn finish(self) -> FsaResult<WriteSummary> {
        self.queue.set_end_of_queue();
        for t in self.threads {
            let _ = t.join();
        }
        let summary = self
            .writer_rx
            .recv()
            .map_err(|_| FsaError::Unknown("volume writer vanished".into()))?;
        match self.status.get() {
            RunState::Running | RunState::Finished => Ok(summary),
            RunState::Aborted => Err(FsaError::Closed("operation aborted".into())),
            RunState::Failed => Err(FsaError::Unknown("a pipeline thread failed".into())),
        }
    }
}

// ── Main header ──────────────────────────────────────────────────────────────

fn build_main_dico(
    opts: &Options,
    archid: u32,
    arch_type: u32,
    fscount: u32,
    has_dirsinfo: bool,
    key: Option<&[u8; 32]>,
) -> FsaResult<Dico> {
    let mut d = Dico::new();
    d.add_string(0, mainhead::FILEFMTVER, "fsark-0.7");
    d.add_string(0, mainhead::PROGVERCREAT, env!("CARGO_PKG_VERSION"));
    d.add_u32(0, mainhead::ARCHIVEID, archid);
    d.add_u64(0, mainhead::CREATTIME, chrono::Utc::now().timestamp() as u64);
    d.add_string(0, mainhead::ARCHLABEL, &opts.archive_label);
    d.add_u32(0, mainhead::ARCHTYPE, arch_type);
    d.add_u32(0, mainhead::FSCOUNT, fscount);
    d.add_u16(0, mainhead::COMPRESSALGO, opts.compress_algo.wire_id());
    d.add_u32(0, mainhead::COMPRESSLEVEL, opts.compress_level as u32);
    d.add_u16(0, mainhead::ENCRYPTALGO, opts.encrypt_algo.wire_id());
    d.add_u64(0, mainhead::MINVERSION, CURRENT_VERSION);
    d.add_u8(0, mainhead::HASDIRSINFO, has_dirsinfo as u8);

    if let Some(k) = key {
        let (md5, crypt) = crypto::make_passcheck(k)
            .map_err(|e| FsaError::Unknown(format!("password check setup: {e}")))?;
        d.add_data(0, mainhead::PASSCHECK_MD5, &md5);
        d.add_data(0, mainhead::PASSCHECK_CRYPT, &crypt);
    }
    Ok(d)
}

/// Write the main header copies, each escorted by a padding record so a
/// localized corruption cannot take out every copy.
fn enqueue_main_header(queue: &Queue, main: &Dico) -> FsaResult<()> {
    for copy in 0..MAINHEAD_COPIES {
        queue.add_header(main.clone(), headtype::MAIN, FSID_NULL)?;
        if copy + 1 < MAINHEAD_COPIES {
            let mut pad = Dico::new();
            pad.add_data(0, 0, &vec![0u8; MAINHEAD_PADDING]);
            queue.add_header(pad, headtype::PADG, FSID_NULL)?;
        }
    }
    Ok(())
}

// ── Walker ───────────────────────────────────────────────────────────────────

struct Saver<'a> {
    queue: &'a Queue,
    status: &'a Status,
    opts: &'a Options,
    fsindex: u16,
    objectid: u64,
    packer: GroupPacker,
    /// (dev, inode) of multi-linked files already saved → archived path.
    hardlinks: HashMap<(u64, u64), String>,
    stats: SaveStats,
}

impl<'a> Saver<'a> {
    fn new(queue: &'a Queue, status: &'a Status, opts: &'a Options, fsindex: u16) -> Saver<'a> {
        Saver {
            queue,
            status,
            opts,
            fsindex,
            objectid: 0,
            packer: GroupPacker::default(),
            hardlinks: HashMap::new(),
            stats: SaveStats::default(),
        }
    }

    /// Standard attributes shared by every object variant.
    fn base_dico(&mut self, relpath: &str, otype: ObjType, md: &std::fs::Metadata) -> Dico {
        let mut d = Dico::new();
        d.add_u64(SECTION_STDATTR, object::OBJECTID, self.objectid);
        self.objectid += 1;
        d.add_string(SECTION_STDATTR, object::PATH, relpath);
        d.add_u32(SECTION_STDATTR, object::OBJTYPE, otype as u32);
        d.add_u32(SECTION_STDATTR, object::MODE, md.mode());
        d.add_u32(SECTION_STDATTR, object::UID, md.uid());
        d.add_u32(SECTION_STDATTR, object::GID, md.gid());
        d.add_u64(SECTION_STDATTR, object::ATIME, md.atime().max(0) as u64);
        d.add_u64(SECTION_STDATTR, object::MTIME, md.mtime().max(0) as u64);
        d.add_u64(SECTION_STDATTR, object::SIZE, md.size());
        d
    }

    fn capture_xattrs(&self, dico: &mut Dico, fullpath: &Path) {
        let names = match crate::xattr::list_xattrs(fullpath) {
            Ok(n) => n,
            Err(e) => {
                crate::msg!(1, "cannot list xattrs of {}: {e}", fullpath.display());
                return;
            }
        };
        for (i, name) in names.iter().enumerate() {
            match crate::xattr::get_xattr(fullpath, name) {
                Ok(value) => {
                    dico.add_string(SECTION_XATTR, (2 * i) as u16, name);
                    dico.add_data(SECTION_XATTR, (2 * i + 1) as u16, &value);
                }
                Err(e) => crate::msg!(1, "cannot read xattr {name} of {}: {e}", fullpath.display()),
            }
        }
    }

    /// Walk `root` depth-first, parents before children, saving every
    /// object under the relative prefix `prefix` (empty for filesystem
    /// roots, the directory basename for save-dir).
    fn save_tree(&mut self, root: &Path, prefix: &str) -> FsaResult<()> {
        let opts: &Options = self.opts;
        let patterns = &opts.exclude;
        let root_owned = root.to_path_buf();
        let prefix_owned = prefix.to_string();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .same_file_system(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let rel = entry.path().strip_prefix(&root_owned).unwrap_or(entry.path());
                if rel.as_os_str().is_empty() {
                    return true; // the root itself
                }
                let relpath = join_rel(&prefix_owned, &rel.to_string_lossy());
                !is_excluded(patterns, &relpath)
            });

        for entry in walker {
            if !self.status.is_running() {
                return Err(FsaError::Closed("save interrupted".into()));
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    crate::errmsg!("cannot walk: {e}");
                    self.stats.err_dir += 1;
                    continue;
                }
            };
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            if rel.is_empty() && prefix.is_empty() {
                continue; // filesystem root directory itself is implicit
            }
            let relpath = join_rel(prefix, &rel);
            if let Err(e) = self.save_object(entry.path(), &relpath) {
                if matches!(e, FsaError::Closed(_)) {
                    return Err(e);
                }
                crate::errmsg!("cannot save [{relpath}]: {e}");
            }
        }
        Ok(())
    }

    fn save_object(&mut self, fullpath: &Path, relpath: &str) -> FsaResult<()> {
        let md = match std::fs::symlink_metadata(fullpath) {
            Ok(m) => m,
            Err(e) => {
                self.stats.err_regfile += 1;
                return Err(FsaError::Stat(format!("{}: {e}", fullpath.display())));
            }
        };
        let ft = md.file_type();

        if ft.is_dir() {
            crate::msg!(1, "saving dir      [{relpath}]");
            let mut d = self.base_dico(relpath, ObjType::Dir, &md);
            self.capture_xattrs(&mut d, fullpath);
            self.queue.add_header(d, headtype::OBJT, self.fsindex)?;
            self.stats.cnt_dir += 1;
            return Ok(());
        }

        if ft.is_symlink() {
            crate::msg!(1, "saving symlink  [{relpath}]");
            let target = std::fs::read_link(fullpath)
                .map_err(|e| FsaError::Read(format!("readlink {}: {e}", fullpath.display())))?;
            let ttype = match std::fs::metadata(fullpath) {
                Ok(tmd) if tmd.is_dir() => linktarget::DIR,
                Ok(_) => linktarget::REGFILE,
                Err(_) => linktarget::UNKNOWN, // dangling link
            };
            let mut d = self.base_dico(relpath, ObjType::Symlink, &md);
            d.add_string(SECTION_STDATTR, object::SYMLINK, &target.to_string_lossy());
            d.add_u32(SECTION_STDATTR, object::LINKTARGETTYPE, ttype);
            self.capture_xattrs(&mut d, fullpath);
            self.queue.add_header(d, headtype::OBJT, self.fsindex)?;
            self.stats.cnt_symlink += 1;
            return Ok(());
        }

        // multi-linked non-directories become hardlink references after
        // their first occurrence
        if md.nlink() > 1 {
            let inode_key = (md.dev(), md.ino());
            if let Some(first) = self.hardlinks.get(&inode_key) {
                crate::msg!(1, "saving hardlink [{relpath}]");
                let first = first.clone();
                let mut d = self.base_dico(relpath, ObjType::Hardlink, &md);
                d.add_string(SECTION_STDATTR, object::HARDLINK, &first);
                self.queue.add_header(d, headtype::OBJT, self.fsindex)?;
                self.stats.cnt_hardlink += 1;
                return Ok(());
            }
            self.hardlinks.insert(inode_key, relpath.to_string());
        }

        if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() || ft.is_socket() {
            crate::msg!(1, "saving special  [{relpath}]");
            let otype = if ft.is_char_device() {
                ObjType::CharDev
            } else if ft.is_block_device() {
                ObjType::BlockDev
            } else if ft.is_fifo() {
                ObjType::Fifo
            } else {
                ObjType::Socket
            };
            let mut d = self.base_dico(relpath, otype, &md);
            d.add_u64(SECTION_STDATTR, object::RDEV, md.rdev());
            self.capture_xattrs(&mut d, fullpath);
            self.queue.add_header(d, headtype::OBJT, self.fsindex)?;
            self.stats.cnt_special += 1;
            return Ok(());
        }

        if ft.is_file() {
            return self.save_regfile(fullpath, relpath, &md);
        }

        Err(FsaError::WrongType(format!(
            "unsupported file type: {}",
            fullpath.display()
        )))
    }

    fn save_regfile(&mut self, fullpath: &Path, relpath: &str, md: &std::fs::Metadata) -> FsaResult<()> {
        crate::msg!(1, "saving regfile  [{relpath}]");
        let size = md.size();

        // non-empty small files share packed blocks; empty files take the
        // unique path so they need neither block nor footer
        if size > 0 && size < MAX_SMALLFILESIZE {
            return self.save_regfile_small(fullpath, relpath, md);
        }
        self.save_regfile_unique(fullpath, relpath, md)
    }

    fn save_regfile_small(
        &mut self,
        fullpath: &Path,
        relpath: &str,
        md: &std::fs::Metadata,
    ) -> FsaResult<()> {
        let data = match std::fs::read(fullpath) {
            Ok(d) => d,
            Err(e) => {
                self.stats.err_regfile += 1;
                return Err(FsaError::Read(format!("{}: {e}", fullpath.display())));
            }
        };
        let md5: [u8; 16] = Md5::digest(&data).into();

        let mut d = self.base_dico(relpath, ObjType::RegFileMulti, md);
        // size on disk may have changed since stat; the dico must match
        // the bytes that go into the shared block
        if data.len() as u64 != md.size() {
            d = patch_size(d, data.len() as u64);
        }
        d.add_data(SECTION_STDATTR, object::MD5SUM, &md5);
        d.add_u64(SECTION_STDATTR, object::FLAGS, 0);
        self.capture_xattrs(&mut d, fullpath);

        if !self.packer.would_fit(data.len()) {
            self.packer.flush(self.queue, self.fsindex)?;
        }
        self.packer.add(d, data);
        self.stats.cnt_regfile += 1;
        Ok(())
    }

    fn save_regfile_unique(
        &mut self,
        fullpath: &Path,
        relpath: &str,
        md: &std::fs::Metadata,
    ) -> FsaResult<()> {
        let size = md.size();
        let sparse = md.blocks() * 512 < size;

        let mut d = self.base_dico(relpath, ObjType::RegFileUnique, md);
        let mut flags = 0u64;
        if sparse {
            flags |= FILEFLAG_SPARSE;
        }
        d.add_u64(SECTION_STDATTR, object::FLAGS, flags);
        self.capture_xattrs(&mut d, fullpath);
        self.queue.add_header(d, headtype::OBJT, self.fsindex)?;

        if size == 0 {
            self.stats.cnt_regfile += 1;
            return Ok(());
        }

        let mut file = match File::open(fullpath) {
            Ok(f) => f,
            Err(e) => {
                self.stats.err_regfile += 1;
                return Err(FsaError::Open(format!("{}: {e}", fullpath.display())));
            }
        };

        let mut hasher = Md5::new();
        let mut offset: u64 = 0;
        let mut short_read = false;
        while offset < size {
            if !self.status.is_running() {
                return Err(FsaError::Closed("save interrupted".into()));
            }
            let want = (size - offset).min(DEF_BLKSIZE as u64) as usize;
            let mut buf = vec![0u8; want];
            let mut got = 0usize;
            while got < want {
                match file.read(&mut buf[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(e) => {
                        self.stats.err_regfile += 1;
                        return Err(FsaError::Read(format!("{}: {e}", fullpath.display())));
                    }
                }
            }
            if got < want {
                // file shrank under us; pad with zeroes so the block chain
                // still covers the announced size
                short_read = true;
            }
            hasher.update(&buf);
            self.queue.add_block(
                BlockInfo {
                    data: buf,
                    offset,
                    fsindex: self.fsindex,
                    sumok: true,
                    ..Default::default()
                },
                ItemState::Todo,
            )?;
            offset += want as u64;
        }
        if short_read {
            crate::errmsg!("file [{relpath}] shrank while being read, padded with zeroes");
            self.stats.err_regfile += 1;
        }

        let md5: [u8; 16] = hasher.finalize().into();
        let mut foot = Dico::new();
        foot.add_data(0, crate::keys::filefoot::MD5SUM, &md5);
        self.queue.add_header(foot, headtype::FILF, self.fsindex)?;

        self.stats.cnt_regfile += 1;
        Ok(())
    }

    fn finish_fs(&mut self) -> FsaResult<()> {
        self.packer.flush(self.queue, self.fsindex)?;
        let mut d = Dico::new();
        d.add_u32(0, 1, 0);
        self.queue.add_header(d, headtype::DATF, self.fsindex)?;
        Ok(())
    }
}

fn join_rel(prefix: &str, rel: &str) -> String {
    if prefix.is_empty() {
        rel.to_string()
    } else if rel.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{rel}")
    }
}

/// Rebuild a dico with a corrected SIZE item (items are append-only).
fn patch_size(old: Dico, size: u64) -> Dico {
    let mut d = Dico::new();
    for it in old.iter() {
        if it.section == SECTION_STDATTR && it.key == object::SIZE {
            d.add_u64(SECTION_STDATTR, object::SIZE, size);
        } else {
            d.add_raw(it.section, it.key, it.dtype, &it.data);
        }
    }
    d
}

/// Rough cost of a tree for progress/info purposes.
fn estimate_cost(root: &Path) -> u64 {
    let mut cost = 0u64;
    for entry in WalkDir::new(root)
        .follow_links(false)
        .same_file_system(true)
        .into_iter()
        .flatten()
    {
        cost += COST_PER_FILE;
        if let Ok(md) = entry.metadata() {
            if md.is_file() {
                cost += md.size();
            }
        }
    }
    cost
}

fn derive_save_key(opts: &Options, archid: u32) -> FsaResult<Option<[u8; 32]>> {
    match (&opts.encrypt_algo, &opts.encrypt_pass) {
        (EncryptAlgo::None, _) => Ok(None),
        (EncryptAlgo::Aes256, Some(pass)) => {
            let key = crypto::derive_key(pass, archid)
                .map_err(|e| FsaError::InvalidArg(e.to_string()))?;
            Ok(Some(key))
        }
        (EncryptAlgo::Aes256, None) => Err(FsaError::InvalidArg(
            "encryption requested without a password".into(),
        )),
    }
}

// ── save-dir ─────────────────────────────────────────────────────────────────

pub fn save_dir(archive: &Path, dirs: &[PathBuf], opts: &Options) -> FsaResult<SaveStats> {
    opts.validate().map_err(FsaError::InvalidArg)?;
    let archive = force_fsa_extension(archive);
    let archid = generate_id();
    let key = derive_save_key(opts, archid)?;

    for dir in dirs {
        if !dir.is_dir() {
            return Err(FsaError::NotFound(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
    }

    let pipeline = start_save_pipeline(&archive, opts, archid, key);
    let queue = Arc::clone(&pipeline.queue);
    let status = Arc::clone(&pipeline.status);

    let result = (|| -> FsaResult<SaveStats> {
        let main = build_main_dico(
            opts,
            archid,
            archtype::DIRECTORIES,
            0,
            true,
            key.as_ref(),
        )?;
        enqueue_main_header(&queue, &main)?;

        let total_cost: u64 = dirs.iter().map(|d| estimate_cost(d)).sum();
        let mut dirs_dico = Dico::new();
        dirs_dico.add_u64(0, dirsinfo::TOTALCOST, total_cost);
        queue.add_header(dirs_dico, headtype::DIRS, 0)?;

        let mut saver = Saver::new(&queue, &status, opts, 0);
        for dir in dirs {
            let prefix = dir
                .canonicalize()
                .unwrap_or_else(|_| dir.clone())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            saver.save_tree(dir, &prefix)?;
        }
        saver.finish_fs()?;
        Ok(saver.stats)
    })();

    match result {
        Ok(stats) => {
            let summary = pipeline.finish()?;
            crate::msg!(
                1,
                "archive written: {} frames, {} bytes",
                summary.frames_written,
                summary.bytes_written
            );
            stats.print();
            Ok(stats)
        }
        Err(e) => {
            if status.is_running() {
                status.set(RunState::Failed, "save driver failed");
            }
            let _ = pipeline.finish();
            Err(e)
        }
    }
}

// ── save-fs ──────────────────────────────────────────────────────────────────

/// Mountpoint root used for temporary mounts of this process.
fn work_mountpoint(tag: &str, idx: usize) -> PathBuf {
    PathBuf::from(format!("/tmp/fsark.{}/{tag}{idx}", std::process::id()))
}

/// Derive the whole-disk path of a partition device
/// (`/dev/sda2` → `/dev/sda`, `/dev/nvme0n1p3` → `/dev/nvme0n1`).
fn parent_disk(device: &str) -> String {
    let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
    let trimmed = trimmed.strip_suffix('p').unwrap_or(trimmed);
    if trimmed.len() > "/dev/".len() {
        trimmed.to_string()
    } else {
        device.to_string()
    }
}

/// Find where a device is currently mounted, if anywhere.
fn find_mountpoint(device: &str) -> Option<PathBuf> {
    let mounts = std::fs::read_to_string("/proc/self/mounts").ok()?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let dev = fields.next()?;
        let mnt = fields.next()?;
        if dev == device {
            return Some(PathBuf::from(mnt));
        }
    }
    None
}

pub fn save_fs(archive: &Path, devices: &[String], opts: &Options) -> FsaResult<SaveStats> {
    opts.validate().map_err(FsaError::InvalidArg)?;
    if devices.is_empty() {
        return Err(FsaError::InvalidArg("no filesystem to save".into()));
    }
    let archive = force_fsa_extension(archive);
    let archid = generate_id();
    let key = derive_save_key(opts, archid)?;

    // probe everything before writing a single byte
    let mut probed = Vec::new();
    for dev in devices {
        probed.push(fsys::probe_device(dev)?);
    }

    let pipeline = start_save_pipeline(&archive, opts, archid, key);
    let queue = Arc::clone(&pipeline.queue);
    let status = Arc::clone(&pipeline.status);

    let result = (|| -> FsaResult<SaveStats> {
        let main = build_main_dico(
            opts,
            archid,
            archtype::FILESYSTEMS,
            devices.len() as u32,
            false,
            key.as_ref(),
        )?;
        enqueue_main_header(&queue, &main)?;

        // capture the partition tables of the disks involved
        let mut disks: Vec<String> = devices.iter().map(|d| parent_disk(d)).collect();
        disks.sort();
        disks.dedup();
        let layouts: Vec<_> = disks.iter().map(|d| layout::capture_disk_layout(d)).collect();
        queue.add_header(layout::layout_to_dico(&layouts), headtype::DILA, FSID_NULL)?;

        let mut totals = SaveStats::default();
        for (idx, (fstype, mut info)) in probed.into_iter().enumerate() {
            let fsindex = idx as u16;
            crate::msg!(
                1,
                "saving filesystem {idx} ({}) from {}",
                fstype.name(),
                info.original_device
            );

            let mountpoint = work_mountpoint("save", idx);
            let mut mounted = false;
            if fstype.has_contents() {
                std::fs::create_dir_all(&mountpoint)
                    .map_err(|e| FsaError::Open(format!("{}: {e}", mountpoint.display())))?;
                match fstype.mount(&info.original_device, &mountpoint, true) {
                    Ok(()) => mounted = true,
                    Err(mount_err) => {
                        // device is busy when already mounted: walk it
                        // through a read-only bind mount instead
                        match find_mountpoint(&info.original_device) {
                            Some(existing) => {
                                fsys::bind_mount_ro(&existing, &mountpoint)?;
                                mounted = true;
                            }
                            None => return Err(mount_err),
                        }
                    }
                }
                fsys::fill_space_stats(&mut info, &mountpoint)?;
                info.total_cost = estimate_cost(&mountpoint);
                info.mount_info = "ro".into();
            }

            let fs_result = (|| -> FsaResult<SaveStats> {
                queue.add_header(info.to_dico(), headtype::FSIN, fsindex)?;
                queue.add_header(Dico::new(), headtype::FSYB, fsindex)?;

                let mut saver = Saver::new(&queue, &status, opts, fsindex);
                if fstype.has_contents() {
                    saver.save_tree(&mountpoint, "")?;
                }
                saver.finish_fs()?;
                Ok(saver.stats)
            })();

            if mounted {
                if let Err(e) = fsys::unmount(&mountpoint) {
                    crate::errmsg!("{e}");
                }
                let _ = std::fs::remove_dir(&mountpoint);
            }

            let stats = fs_result?;
            totals.cnt_regfile += stats.cnt_regfile;
            totals.cnt_dir += stats.cnt_dir;
            totals.cnt_symlink += stats.cnt_symlink;
            totals.cnt_hardlink += stats.cnt_hardlink;
            totals.cnt_special += stats.cnt_special;
            totals.err_regfile += stats.err_regfile;
            totals.err_dir += stats.err_dir;
            totals.err_symlink += stats.err_symlink;
            totals.err_special += stats.err_special;
        }
        Ok(totals)
    })();

    match result {
        Ok(stats) => {
            let summary = pipeline.finish()?;
            crate::msg!(
                1,
                "archive written: {} frames, {} bytes",
                summary.frames_written,
                summary.bytes_written
            );
            stats.print();
            Ok(stats)
        }
        Err(e) => {
            if status.is_running() {
                status.set(RunState::Failed, "save driver failed");
            }
            let _ = pipeline.finish();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsa_extension_forced() {
        assert_eq!(
            force_fsa_extension(Path::new("/x/backup")),
            PathBuf::from("/x/backup.fsa")
        );
        assert_eq!(
            force_fsa_extension(Path::new("/x/backup.fsa")),
            PathBuf::from("/x/backup.fsa")
        );
        assert_eq!(
            force_fsa_extension(Path::new("/x/backup.tar")),
            PathBuf::from("/x/backup.tar.fsa")
        );
    }

    #[test]
    fn parent_disk_derivation() {
        assert_eq!(parent_disk("/dev/sda2"), "/dev/sda");
        assert_eq!(parent_disk("/dev/nvme0n1p3"), "/dev/nvme0n1");
        assert_eq!(parent_disk("/dev/sda"), "/dev/sda");
    }

    #[test]
    fn rel_path_joining() {
        assert_eq!(join_rel("", "a/b"), "a/b");
        assert_eq!(join_rel("top", "a/b"), "top/a/b");
        assert_eq!(join_rel("top", ""), "top");
    }

    #[test]
    fn size_patching() {
        let mut d = Dico::new();
        d.add_string(SECTION_STDATTR, object::PATH, "x");
        d.add_u64(SECTION_STDATTR, object::SIZE, 10);
        d.add_u32(SECTION_STDATTR, object::MODE, 0o644);
        let d = patch_size(d, 42);
        assert_eq!(d.get_u64(SECTION_STDATTR, object::SIZE).unwrap(), 42);
        assert_eq!(d.get_string(SECTION_STDATTR, object::PATH).unwrap(), "x");
        assert_eq!(d.count_all(), 3);
    }
}
