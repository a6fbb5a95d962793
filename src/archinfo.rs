//! Metadata-only archive operations: `archive-info`,
//! `show-partition-table` and `restore-partition-table`.
//!
//! These open the read pipeline without a decompressor pool and skim the
//! header stream, discarding data blocks unread. The run is stopped early
//! once everything wanted has been seen.

use std::path::Path;

use chrono::DateTime;
use serde::Serialize;

use crate::codec::CompressAlgo;
use crate::crypto::EncryptAlgo;
use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::fsys::FsInfo;
use crate::keys::{archtype, mainhead};
use crate::layout::{self, LayoutMap};
use crate::options::{version_string, Options, MAX_FSPERARCH};
use crate::queue::QueueItem;
use crate::record::headtype;
use crate::restore::{open_archive, OpenedArchive, RestoreSpec};
use crate::status::RunState;

struct ArchiveScan {
    main: Dico,
    fsinfos: Vec<(u16, FsInfo)>,
    layouts: Vec<LayoutMap>,
}

/// Skim the archive for its main header, filesystem-info records and the
/// disk layout. `need_fsinfo` stops the scan at the layout record when
/// only the partition tables are wanted.
fn scan_archive(archive: &Path, opts: &Options, need_fsinfo: bool) -> FsaResult<ArchiveScan> {
    let opened: OpenedArchive = open_archive(archive, opts, vec![true; MAX_FSPERARCH])?;

    let main = opened.main.clone();
    let fscount = main.get_u32(0, mainhead::FSCOUNT).unwrap_or(0) as usize;
    let atype = main.get_u32(0, mainhead::ARCHTYPE).unwrap_or(0);

    let mut fsinfos = Vec::new();
    let mut layouts = Vec::new();

    loop {
        let done_fsinfo = !need_fsinfo || atype != archtype::FILESYSTEMS || fsinfos.len() >= fscount;
        let done_layout = atype != archtype::FILESYSTEMS || !layouts.is_empty();
        if done_fsinfo && done_layout {
            break;
        }
        match opened.queue.take_first_any() {
            Ok(QueueItem::Header {
                dico,
                headtype: headtype::FSIN,
                fsindex,
            }) => match FsInfo::from_dico(&dico) {
                Ok(info) => fsinfos.push((fsindex, info)),
                Err(e) => crate::errmsg!("unreadable filesystem info record: {e}"),
            },
            Ok(QueueItem::Header {
                dico,
                headtype: headtype::DILA,
                ..
            }) => match layout::layout_from_dico(&dico) {
                Ok(l) => layouts = l,
                Err(e) => crate::errmsg!("unreadable disk layout record: {e}"),
            },
            Ok(_) => {}
            Err(FsaError::EndOfFile) => break,
            Err(e) => {
                let _ = opened.finish();
                return Err(e);
            }
        }
    }

    opened.status.set(RunState::Finished, "metadata scan done");
    opened.finish()?;
    Ok(ArchiveScan {
        main,
        fsinfos,
        layouts,
    })
}

// ── archive-info ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FsInfoJson {
    id: u16,
    filesystem: String,
    label: String,
    uuid: String,
    original_device: String,
    bytes_total: u64,
    bytes_used: u64,
    mount_info: String,
}

#[derive(Serialize)]
struct ArchiveInfoJson {
    format: String,
    creator_version: String,
    archive_id: String,
    label: String,
    created: i64,
    archive_type: String,
    compression: String,
    encryption: String,
    filesystem_count: u32,
    filesystems: Vec<FsInfoJson>,
}

fn archtype_name(t: u32) -> &'static str {
    match t {
        archtype::FILESYSTEMS => "filesystems",
        archtype::DIRECTORIES => "directories",
        _ => "unknown",
    }
}

pub fn archive_info(archive: &Path, opts: &Options, json: bool) -> FsaResult<()> {
    let scan = scan_archive(archive, opts, true)?;
    let main = &scan.main;

    let fmt = main.get_string(0, mainhead::FILEFMTVER).unwrap_or_default();
    let creator = main.get_string(0, mainhead::PROGVERCREAT).unwrap_or_default();
    let archid = main.get_u32(0, mainhead::ARCHIVEID).unwrap_or(0);
    let label = main.get_string(0, mainhead::ARCHLABEL).unwrap_or_default();
    let created = main.get_u64(0, mainhead::CREATTIME).unwrap_or(0) as i64;
    let atype = main.get_u32(0, mainhead::ARCHTYPE).unwrap_or(0);
    let fscount = main.get_u32(0, mainhead::FSCOUNT).unwrap_or(0);
    let minver = main.get_u64(0, mainhead::MINVERSION).unwrap_or(0);
    let compress = main
        .get_u16(0, mainhead::COMPRESSALGO)
        .ok()
        .and_then(CompressAlgo::from_wire_id)
        .map(|a| a.name())
        .unwrap_or("unknown");
    let complevel = main.get_u32(0, mainhead::COMPRESSLEVEL).unwrap_or(0);
    let encrypt = main
        .get_u16(0, mainhead::ENCRYPTALGO)
        .ok()
        .and_then(EncryptAlgo::from_wire_id)
        .map(|a| a.name())
        .unwrap_or("unknown");

    if json {
        let doc = ArchiveInfoJson {
            format: fmt,
            creator_version: creator,
            archive_id: format!("{archid:08x}"),
            label,
            created,
            archive_type: archtype_name(atype).to_string(),
            compression: format!("{compress}:{complevel}"),
            encryption: encrypt.to_string(),
            filesystem_count: fscount,
            filesystems: scan
                .fsinfos
                .iter()
                .map(|(id, info)| FsInfoJson {
                    id: *id,
                    filesystem: info.filesystem.clone(),
                    label: info.label.clone(),
                    uuid: info.uuid.clone(),
                    original_device: info.original_device.clone(),
                    bytes_total: info.bytes_total,
                    bytes_used: info.bytes_used,
                    mount_info: info.mount_info.clone(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&doc).unwrap());
        return Ok(());
    }

    let date = DateTime::from_timestamp(created, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| created.to_string());

    println!("====================== archive information ======================");
    println!("Archive format:         \t{fmt}");
    println!("Archive created with:   \t{creator}");
    println!("Archive id:             \t{archid:08x}");
    println!("Archive label:          \t{label}");
    println!("Archive creation date:  \t{date}");
    println!("Archive type:           \t{}", archtype_name(atype));
    println!("Minimum version to read:\t{}", version_string(minver));
    println!("Compression:            \t{compress} (level {complevel})");
    println!("Encryption:             \t{encrypt}");
    if atype == archtype::FILESYSTEMS {
        println!("Filesystems count:      \t{fscount}");
    }

    for (id, info) in &scan.fsinfos {
        println!();
        println!("===================== filesystem information ====================");
        println!("Filesystem id in archive:\t{id}");
        println!("Filesystem format:      \t{}", info.filesystem);
        println!("Filesystem label:       \t{}", info.label);
        println!("Filesystem uuid:        \t{}", info.uuid);
        println!("Original device:        \t{}", info.original_device);
        println!(
            "Original filesystem size:\t{}",
            crate::devinfo::format_size(info.bytes_total)
        );
        println!(
            "Space used in filesystem:\t{}",
            crate::devinfo::format_size(info.bytes_used)
        );
        println!("Mount information:      \t{}", info.mount_info);
    }
    Ok(())
}

// ── partition tables ─────────────────────────────────────────────────────────

pub fn show_partition_table(archive: &Path, opts: &Options) -> FsaResult<()> {
    let scan = scan_archive(archive, opts, false)?;
    if scan.layouts.is_empty() {
        println!("this archive carries no partition-table information");
        return Ok(());
    }
    layout::print_layouts(&scan.layouts);
    Ok(())
}

/// Show what would be written where. Writing partition tables to disk is
/// the job of an external partitioner fed with the printed dump.
pub fn restore_partition_table(
    archive: &Path,
    specs: &[RestoreSpec],
    opts: &Options,
) -> FsaResult<()> {
    let scan = scan_archive(archive, opts, false)?;
    if scan.layouts.is_empty() {
        return Err(FsaError::NotFound(
            "this archive carries no partition-table information".into(),
        ));
    }
    for spec in specs {
        let map = scan.layouts.get(spec.id as usize).ok_or_else(|| {
            FsaError::InvalidArg(format!(
                "no partition table {} in archive (found {})",
                spec.id,
                scan.layouts.len()
            ))
        })?;
        let source = map.get("disk", "path").unwrap_or("?");
        println!("table {} (captured from {source}) -> {}", spec.id, spec.dest);
        if let Some(lines) = map.get_int("table", "lines") {
            for l in 0..lines {
                if let Some(text) = map.get("table", &l.to_string()) {
                    println!("  {text}");
                }
            }
        }
    }
    println!("feed the dump above to sfdisk to apply it");
    Ok(())
}
