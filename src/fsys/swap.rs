//! swap family: metadata-only, recreated with mkswap.

use super::{FsInfo, MkfsOverrides};
use crate::error::FsaResult;

pub(super) fn mkfs_command(
    device: &str,
    info: &FsInfo,
    overrides: &MkfsOverrides,
) -> FsaResult<Vec<String>> {
    let mut cmd = vec!["mkswap".to_string()];

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
    fn label_and_uuid_carried() {
        let info = FsInfo {
            filesystem: "swap".into(),
            label: "swap0".into(),
            uuid: "99998888-7777-6666-5555-444433332222".into(),
            ..Default::default()
        };
        let cmd = mkfs_command("/dev/sda3", &info, &MkfsOverrides::default()).unwrap();
        assert_eq!(cmd[0], "mkswap");
        assert!(cmd.contains(&"swap0".to_string()));
        assert!(cmd.contains(&info.uuid));
    }
}
