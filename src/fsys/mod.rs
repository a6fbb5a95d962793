//! Filesystem family dispatch: probing, recreating (`mkfs`), mounting and
//! unmounting the filesystems the archiver can capture.
//!
//! Every family exposes the same capability set behind [`FsType`]; the
//! actual `mkfs` tools and the mount syscall are external collaborators,
//! so each family mostly knows how to build a correct command line from a
//! captured [`FsInfo`] plus user overrides. Command construction is pure
//! and unit-tested; execution requires root and real block devices.

mod ext;
mod swap;
mod vfat;

use std::path::Path;
use std::process::Command;

use nix::mount::{mount, umount, MsFlags};

use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::keys::fsinfo;
use crate::options::CURRENT_VERSION;

// ── FsInfo ───────────────────────────────────────────────────────────────────

/// Per-filesystem metadata captured at save time and replayed at restore
/// time. Serialized into the FSIN record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub filesystem: String,
    pub label: String,
    pub uuid: String,
    pub bytes_total: u64,
    pub bytes_used: u64,
    pub block_size: u32,
    pub features: String,
    pub original_device: String,
    pub mount_info: String,
    pub total_cost: u64,
}

impl FsInfo {
    pub fn to_dico(&self) -> Dico {
        let mut d = Dico::new();
        d.add_string(0, fsinfo::FILESYSTEM, &self.filesystem);
        d.add_string(0, fsinfo::FSLABEL, &self.label);
        d.add_string(0, fsinfo::FSUUID, &self.uuid);
        d.add_u64(0, fsinfo::BYTESTOTAL, self.bytes_total);
        d.add_u64(0, fsinfo::BYTESUSED, self.bytes_used);
        d.add_u32(0, fsinfo::BLOCKSIZE, self.block_size);
        d.add_string(0, fsinfo::FEATURES, &self.features);
        d.add_string(0, fsinfo::ORIGDEV, &self.original_device);
        d.add_string(0, fsinfo::MOUNTINFO, &self.mount_info);
        d.add_u64(0, fsinfo::TOTALCOST, self.total_cost);
        d.add_u64(0, fsinfo::MINVERSION, CURRENT_VERSION);
        d
    }

    pub fn from_dico(d: &Dico) -> FsaResult<FsInfo> {
        Ok(FsInfo {
            filesystem: d.get_string(0, fsinfo::FILESYSTEM)?,
            label: d.get_string(0, fsinfo::FSLABEL).unwrap_or_default(),
            uuid: d.get_string(0, fsinfo::FSUUID).unwrap_or_default(),
            bytes_total: d.get_u64(0, fsinfo::BYTESTOTAL).unwrap_or(0),
            bytes_used: d.get_u64(0, fsinfo::BYTESUSED).unwrap_or(0),
            block_size: d.get_u32(0, fsinfo::BLOCKSIZE).unwrap_or(0),
            features: d.get_string(0, fsinfo::FEATURES).unwrap_or_default(),
            original_device: d.get_string(0, fsinfo::ORIGDEV).unwrap_or_default(),
            mount_info: d.get_string(0, fsinfo::MOUNTINFO).unwrap_or_default(),
            total_cost: d.get_u64(0, fsinfo::TOTALCOST).unwrap_or(0),
        })
    }
}

/// User overrides for `mkfs` at restore time.
#[derive(Debug, Clone, Default)]
pub struct MkfsOverrides {
    pub mkfs_options: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
}

// ── FsType ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Vfat,
    Swap,
    /// Placeholder family: metadata only, no contents, no mkfs.
    Empty,
}

impl FsType {
    pub fn from_name(name: &str) -> Option<FsType> {
        match name {
            "ext2" => Some(FsType::Ext2),
            "ext3" => Some(FsType::Ext3),
            "ext4" => Some(FsType::Ext4),
            "vfat" | "fat" | "msdos" => Some(FsType::Vfat),
            "swap" => Some(FsType::Swap),
            "empty" => Some(FsType::Empty),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Vfat => "vfat",
            FsType::Swap => "swap",
            FsType::Empty => "empty",
        }
    }

    /// Whether this family has file contents to walk and restore.
    pub fn has_contents(self) -> bool {
        !matches!(self, FsType::Swap | FsType::Empty)
    }

    /// Mount options the restorer must honor: (required, forbidden).
    pub fn required_mount_options(self) -> (&'static [&'static str], &'static [&'static str]) {
        match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => (&["ro"], &[]),
            FsType::Vfat => (&["ro"], &["utf8"]),
            FsType::Swap | FsType::Empty => (&[], &[]),
        }
    }

    /// Build the `mkfs` command line (program + arguments) for this family.
    pub fn mkfs_command(
        self,
        device: &str,
        info: &FsInfo,
        overrides: &MkfsOverrides,
    ) -> FsaResult<Vec<String>> {
        match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
                ext::mkfs_command(self, device, info, overrides)
            }
            FsType::Vfat => vfat::mkfs_command(device, info, overrides),
            FsType::Swap => swap::mkfs_command(device, info, overrides),
            FsType::Empty => Err(FsaError::InvalidArg(
                "the empty placeholder family has no mkfs".into(),
            )),
        }
    }

    /// Run `mkfs` for this family on `device`.
    pub fn mkfs(self, device: &str, info: &FsInfo, overrides: &MkfsOverrides) -> FsaResult<()> {
        if self == FsType::Empty {
            return Ok(());
        }
        let cmdline = self.mkfs_command(device, info, overrides)?;
        crate::msg!(1, "running: {}", cmdline.join(" "));
        let output = Command::new(&cmdline[0])
            .args(&cmdline[1..])
            .output()
            .map_err(|e| {
                FsaError::NotFound(format!(
                    "{} not found or not runnable ({e}); install the matching \
                     filesystem tools package",
                    cmdline[0]
                ))
            })?;
        if !output.status.success() {
            return Err(FsaError::Unknown(format!(
                "{} failed: {}",
                cmdline[0],
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Mount `device` at `target` for this family.
    pub fn mount(self, device: &str, target: &Path, read_only: bool) -> FsaResult<()> {
        if !self.has_contents() {
            return Err(FsaError::WrongType(format!(
                "{} filesystems are not mountable",
                self.name()
            )));
        }
        let mut flags = MsFlags::empty();
        if read_only {
            flags |= MsFlags::MS_RDONLY | MsFlags::MS_NOATIME;
        }
        mount(
            Some(device),
            target,
            Some(self.name()),
            flags,
            None::<&str>,
        )
        .map_err(|e| FsaError::Open(format!("mount {} on {}: {e}", device, target.display())))
    }
}

/// Bind-mount an already mounted tree read-only at `target` so that a live
/// filesystem can be walked without racing remounts.
pub fn bind_mount_ro(source: &Path, target: &Path) -> FsaResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        FsaError::Open(format!(
            "bind mount {} on {}: {e}",
            source.display(),
            target.display()
        ))
    })?;
    // read-only needs a remount pass on Linux
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| FsaError::Open(format!("remount ro {}: {e}", target.display())))
}

pub fn unmount(target: &Path) -> FsaResult<()> {
    umount(target).map_err(|e| FsaError::Unknown(format!("umount {}: {e}", target.display())))
}

// ── Probing ──────────────────────────────────────────────────────────────────

/// Parse `blkid -o export` output into (TYPE, LABEL, UUID).
fn parse_blkid_export(out: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut fstype = None;
    let mut label = None;
    let mut uuid = None;
    for line in out.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key {
                "TYPE" => fstype = Some(value.to_string()),
                "LABEL" => label = Some(value.to_string()),
                "UUID" => uuid = Some(value.to_string()),
                _ => {}
            }
        }
    }
    (fstype, label, uuid)
}

/// Probe a block device: identify the family and collect label/UUID.
pub fn probe_device(device: &str) -> FsaResult<(FsType, FsInfo)> {
    let output = Command::new("blkid")
        .args(["-o", "export", device])
        .output()
        .map_err(|e| FsaError::NotFound(format!("blkid not runnable: {e}")))?;
    if !output.status.success() {
        return Err(FsaError::Stat(format!(
            "blkid could not identify {device}"
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    let (fstype, label, uuid) = parse_blkid_export(&text);
    let name = fstype.ok_or_else(|| FsaError::Stat(format!("no filesystem type on {device}")))?;
    let fstype = FsType::from_name(&name).ok_or_else(|| {
        FsaError::WrongType(format!("unsupported filesystem \"{name}\" on {device}"))
    })?;

    let info = FsInfo {
        filesystem: name,
        label: label.unwrap_or_default(),
        uuid: uuid.unwrap_or_default(),
        original_device: device.to_string(),
        ..Default::default()
    };
    Ok((fstype, info))
}

/// Fill space statistics from a mounted tree.
pub fn fill_space_stats(info: &mut FsInfo, mountpoint: &Path) -> FsaResult<()> {
    let sv = nix::sys::statvfs::statvfs(mountpoint)
        .map_err(|e| FsaError::Stat(format!("statvfs {}: {e}", mountpoint.display())))?;
    let frsize = sv.fragment_size() as u64;
    info.bytes_total = sv.blocks() as u64 * frsize;
    info.bytes_used = (sv.blocks() as u64 - sv.blocks_free() as u64) * frsize;
    info.block_size = sv.block_size() as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_names_roundtrip() {
        for t in [
            FsType::Ext2,
            FsType::Ext3,
            FsType::Ext4,
            FsType::Vfat,
            FsType::Swap,
            FsType::Empty,
        ] {
            assert_eq!(FsType::from_name(t.name()), Some(t));
        }
        assert_eq!(FsType::from_name("msdos"), Some(FsType::Vfat));
        assert_eq!(FsType::from_name("zfs"), None);
    }

    #[test]
    fn fsinfo_dico_roundtrip() {
        let info = FsInfo {
            filesystem: "ext4".into(),
            label: "rootfs".into(),
            uuid: "0a1b2c3d-1111-2222-3333-444455556666".into(),
            bytes_total: 1 << 30,
            bytes_used: 1 << 28,
            block_size: 4096,
            features: "has_journal,extent".into(),
            original_device: "/dev/sda2".into(),
            mount_info: "rw,relatime".into(),
            total_cost: 12345,
        };
        let d = info.to_dico();
        assert_eq!(FsInfo::from_dico(&d).unwrap(), info);
    }

    #[test]
    fn blkid_export_parsing() {
        let out = "DEVNAME=/dev/sda1\nUUID=abcd-1234\nTYPE=vfat\nLABEL=BOOT\n";
        let (t, l, u) = parse_blkid_export(out);
        assert_eq!(t.as_deref(), Some("vfat"));
        assert_eq!(l.as_deref(), Some("BOOT"));
        assert_eq!(u.as_deref(), Some("abcd-1234"));
    }

    #[test]
    fn contents_and_mount_rules() {
        assert!(FsType::Ext4.has_contents());
        assert!(!FsType::Swap.has_contents());
        assert!(FsType::Swap.mount("/dev/null", Path::new("/tmp"), true).is_err());
        let (req, _) = FsType::Ext4.required_mount_options();
        assert!(req.contains(&"ro"));
    }
}
