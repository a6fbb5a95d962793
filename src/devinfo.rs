//! Block-device enumeration for the `probe` operation.
//!
//! Reads `/proc/partitions` for the device list and `/sys/block` for the
//! details the kernel exposes without root.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{FsaError, FsaResult};

#[derive(Debug, Clone, Default)]
pub struct BlockDevice {
    pub name: String,
    /// Whole disk (true) or partition (false).
    pub is_disk: bool,
    pub size_bytes: u64,
    pub model: String,
}

fn sys_block_read(dev: &str, file: &str) -> Option<String> {
    let path = format!("/sys/block/{dev}/{file}");
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Enumerate devices from `/proc/partitions`.
pub fn list_block_devices() -> FsaResult<Vec<BlockDevice>> {
    let text = std::fs::read_to_string("/proc/partitions")
        .map_err(|e| FsaError::Read(format!("/proc/partitions: {e}")))?;

    let mut devices = Vec::new();
    for line in text.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let blocks: u64 = fields[2].parse().unwrap_or(0);
        let name = fields[3].to_string();

        // a name present under /sys/block is a whole disk
        let is_disk = Path::new(&format!("/sys/block/{name}")).exists();
        let model = if is_disk {
            sys_block_read(&name, "device/model").unwrap_or_default()
        } else {
            String::new()
        };

        devices.push(BlockDevice {
            name,
            is_disk,
            size_bytes: blocks * 1024,
            model,
        });
    }
    Ok(devices)
}

/// Human-readable size, binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Render the probe listing.
pub fn print_probe(details: bool) -> FsaResult<()> {
    let devices = list_block_devices()?;

    let mut out = String::new();
    writeln!(out, "[======DISKS======]").unwrap();
    for d in devices.iter().filter(|d| d.is_disk) {
        writeln!(
            out,
            "[{:<10}] [{:<20}] [{:>12}]",
            d.name,
            d.model,
            format_size(d.size_bytes)
        )
        .unwrap();
    }
    writeln!(out, "[====PARTITIONS===]").unwrap();
    for d in devices.iter().filter(|d| !d.is_disk) {
        if details {
            let probed = crate::fsys::probe_device(&format!("/dev/{}", d.name)).ok();
            let (fs, label) = probed
                .map(|(_, i)| (i.filesystem, i.label))
                .unwrap_or_default();
            writeln!(
                out,
                "[{:<10}] [{:>12}] [{:<8}] [{:<16}]",
                d.name,
                format_size(d.size_bytes),
                fs,
                label
            )
            .unwrap();
        } else {
            writeln!(out, "[{:<10}] [{:>12}]", d.name, format_size(d.size_bytes)).unwrap();
        }
    }
    print!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }
}
