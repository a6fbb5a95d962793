//! Disk-layout capture: a two-level string map per disk with a canonical
//! text serialization, stored inside the DILA record.
//!
//! The dump format is one `val(key1,key2)=(data)` line per entry. Keys and
//! values must not contain parentheses, commas or newlines; the writers in
//! this crate only emit device names, numbers and partition-table text
//! that satisfy this.

use std::process::Command;

use crate::dico::Dico;
use crate::error::{FsaError, FsaResult};
use crate::keys::layout;

// ── LayoutMap ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutMap {
    items: Vec<(String, String, String)>,
}

impl LayoutMap {
    pub fn new() -> LayoutMap {
        LayoutMap::default()
    }

    /// Set (key1, key2) to `value`, replacing an existing entry.
    pub fn set(&mut self, key1: &str, key2: &str, value: &str) {
        for (k1, k2, v) in self.items.iter_mut() {
            if k1 == key1 && k2 == key2 {
                *v = value.to_string();
                return;
            }
        }
        self.items
            .push((key1.to_string(), key2.to_string(), value.to_string()));
    }

    pub fn set_int(&mut self, key1: &str, key2: &str, value: i64) {
        self.set(key1, key2, &value.to_string());
    }

    pub fn get(&self, key1: &str, key2: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k1, k2, _)| k1 == key1 && k2 == key2)
            .map(|(_, _, v)| v.as_str())
    }

    pub fn get_int(&self, key1: &str, key2: &str) -> Option<i64> {
        self.get(key1, key2).and_then(|v| v.parse().ok())
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.items
            .iter()
            .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
    }

    /// Canonical text form: one `val(k1,k2)=(data)` line per entry.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (k1, k2, v) in &self.items {
            out.push_str(&format!("val({k1},{k2})=({v})\n"));
        }
        out
    }

    /// Parse the canonical text form; malformed lines are ignored.
    pub fn parse(text: &str) -> LayoutMap {
        let mut map = LayoutMap::new();
        for line in text.lines() {
            let Some(rest) = line.strip_prefix("val(") else {
                continue;
            };
            let Some((keys, rest)) = rest.split_once(")=(") else {
                continue;
            };
            let Some(value) = rest.strip_suffix(')') else {
                continue;
            };
            let Some((k1, k2)) = keys.split_once(',') else {
                continue;
            };
            map.set(k1, k2, value);
        }
        map
    }
}

// ── DILA record conversion ───────────────────────────────────────────────────

pub fn layout_to_dico(disks: &[LayoutMap]) -> Dico {
    let mut d = Dico::new();
    d.add_u32(0, layout::PTCOUNT, disks.len() as u32);
    for (i, map) in disks.iter().enumerate() {
        d.add_string(layout::SECTION_TABLES, i as u16, &map.dump());
    }
    d
}

pub fn layout_from_dico(d: &Dico) -> FsaResult<Vec<LayoutMap>> {
    let count = d.get_u32(0, layout::PTCOUNT)?;
    let mut disks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let text = d.get_string(layout::SECTION_TABLES, i as u16).map_err(|_| {
            FsaError::Corrupt(format!("disk layout record is missing table {i}"))
        })?;
        disks.push(LayoutMap::parse(&text));
    }
    Ok(disks)
}

// ── Capture ──────────────────────────────────────────────────────────────────

/// Capture the partition table of one disk into a LayoutMap.
///
/// The table text comes from `sfdisk --dump`; a disk without a readable
/// table yields a map with the device name only.
pub fn capture_disk_layout(disk: &str) -> LayoutMap {
    let mut map = LayoutMap::new();
    map.set("disk", "path", disk);

    if let Ok(output) = Command::new("sfdisk").args(["--dump", disk]).output() {
        if output.status.success() {
            let dump = String::from_utf8_lossy(&output.stdout);
            for (i, line) in dump.lines().enumerate() {
                map.set("table", &i.to_string(), line);
            }
            map.set_int("table", "lines", dump.lines().count() as i64);
        }
    }
    map
}

/// Render captured layouts for `show-partition-table`.
pub fn print_layouts(disks: &[LayoutMap]) {
    for (i, map) in disks.iter().enumerate() {
        let path = map.get("disk", "path").unwrap_or("?");
        println!("── disk {i}: {path} ─────────────────────────────");
        if let Some(lines) = map.get_int("table", "lines") {
            for l in 0..lines {
                if let Some(text) = map.get("table", &l.to_string()) {
                    println!("  {text}");
                }
            }
        } else {
            println!("  (no partition table captured)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_parse_roundtrip() {
        let mut map = LayoutMap::new();
        map.set("disk", "path", "/dev/sda");
        map.set_int("disk", "size", 500107862016);
        map.set("part1", "type", "83");
        let back = LayoutMap::parse(&map.dump());
        assert_eq!(back, map);
        assert_eq!(back.get_int("disk", "size"), Some(500107862016));
    }

    #[test]
    fn set_replaces_existing() {
        let mut map = LayoutMap::new();
        map.set("a", "b", "1");
        map.set("a", "b", "2");
        assert_eq!(map.count(), 1);
        assert_eq!(map.get("a", "b"), Some("2"));
    }

    #[test]
    fn malformed_lines_ignored() {
        let map = LayoutMap::parse("garbage\nval(a,b)=(ok)\nval(broken\n");
        assert_eq!(map.count(), 1);
        assert_eq!(map.get("a", "b"), Some("ok"));
    }

    #[test]
    fn dico_roundtrip() {
        let mut d0 = LayoutMap::new();
        d0.set("disk", "path", "/dev/sda");
        let mut d1 = LayoutMap::new();
        d1.set("disk", "path", "/dev/sdb");
        d1.set("part1", "start", "2048");

        let dico = layout_to_dico(&[d0.clone(), d1.clone()]);
        let back = layout_from_dico(&dico).unwrap();
        assert_eq!(back, vec![d0, d1]);
    }
}
