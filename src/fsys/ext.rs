//! ext2/ext3/ext4 family: mkfs command construction.

use super::{FsInfo, FsType, MkfsOverrides};
use crate::error::{FsaError, FsaResult};

pub(super) fn mkfs_command(
    fstype: FsType,
    device: &str,
    info: &FsInfo,
    overrides: &MkfsOverrides,
) -> FsaResult<Vec<String>> {
    let program = match fstype {
        FsType::Ext2 => "mkfs.ext2",
        FsType::Ext3 => "mkfs.ext3",
        FsType::Ext4 => "mkfs.ext4",
        _ => return Err(FsaError::InvalidArg("not an ext family".into())),
    };

    let mut cmd = vec![program.to_string(), "-F".to_string(), "-q".to_string()];

    if info.block_size > 0 {
        cmd.push("-b".into());
        cmd.push(info.block_size.to_string());
    }

    let label = overrides.label.as_deref().unwrap_or(&info.label);
    if !label.is_empty() {
        cmd.push("-L".into());
        cmd.push(label.to_string());
    }

    let uuid = overrides.uuid.as_deref().unwrap_or(&info.uuid);
    if !uuid.is_empty() {
        cmd.push("-U".into());
        cmd.push(uuid.to_string());
    }

    // captured feature list, e.g. "has_journal,extent,64bit"
    if !info.features.is_empty() {
        cmd.push("-O".into());
        cmd.push(info.features.clone());
    }

    if let Some(extra) = &overrides.mkfs_options {
        cmd.extend(extra.split_whitespace().map(String::from));
    }

    cmd.push(device.to_string());
    Ok(cmd)
}
