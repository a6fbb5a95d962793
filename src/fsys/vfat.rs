//! vfat family: mkfs command construction (mkdosfs from dosfstools).

use super::{FsInfo, MkfsOverrides};
use crate::error::FsaResult;

pub(super) fn mkfs_command(
    device: &str,
    info: &FsInfo,
    overrides: &MkfsOverrides,
) -> FsaResult<Vec<String>> {
    let mut cmd = vec!["mkdosfs".to_string()];

    let label = overrides.label.as_deref().unwrap_or(&info.label);
    if !label.is_empty() {
        cmd.push("-n".into());
        cmd.push(label.to_string());
    }

    // vfat "UUID" is the volume serial, printed as XXXX-XXXX
    let uuid = overrides.uuid.as_deref().unwrap_or(&info.uuid);
    let serial: String = uuid.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if serial.len() == 8 {
        cmd.push("-i".into());
        cmd.push(serial);
    }

    if let Some(extra) = &overrides.mkfs_options {
        cmd.extend(extra.split_whitespace().map(String::from));
    }

    cmd.push(device.to_string());
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_is_restored_from_uuid() {
        let info = FsInfo {
            filesystem: "vfat".into(),
            label: "BOOT".into(),
            uuid: "1A2B-3C4D".into(),
            ..Default::default()
        };
        let cmd = mkfs_command("/dev/sda1", &info, &MkfsOverrides::default()).unwrap();
        assert_eq!(cmd[0], "mkdosfs");
        assert!(cmd.contains(&"BOOT".to_string()));
        assert!(cmd.contains(&"1A2B3C4D".to_string()));
        assert_eq!(cmd.last().unwrap(), "/dev/sda1");
    }

    #[test]
    fn malformed_serial_is_dropped() {
        let info = FsInfo {
            uuid: "not-a-serial-at-all".into(),
            ..Default::default()
        };
        let cmd = mkfs_command("/dev/sda1", &info, &MkfsOverrides::default()).unwrap();
        assert!(!cmd.contains(&"-i".to_string()));
    }
}
