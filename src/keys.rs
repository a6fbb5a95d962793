//! Frozen dictionary key numbers, grouped by the record type that carries
//! them. Values are written to disk as `u16`; they are permanent.

/// Keys of the MAIN archive header.
pub mod mainhead {
    pub const FILEFMTVER: u16 = 1;
    pub const PROGVERCREAT: u16 = 2;
    pub const ARCHIVEID: u16 = 3;
    pub const CREATTIME: u16 = 4;
    pub const ARCHLABEL: u16 = 5;
    pub const ARCHTYPE: u16 = 6;
    pub const FSCOUNT: u16 = 7;
    pub const COMPRESSALGO: u16 = 8;
    pub const COMPRESSLEVEL: u16 = 9;
    pub const ENCRYPTALGO: u16 = 10;
    pub const PASSCHECK_MD5: u16 = 11;
    pub const PASSCHECK_CRYPT: u16 = 12;
    pub const MINVERSION: u16 = 13;
    pub const HASDIRSINFO: u16 = 14;
}

/// Keys of OBJT object records (section 0, standard attributes).
pub mod object {
    pub const OBJECTID: u16 = 1;
    pub const PATH: u16 = 2;
    pub const OBJTYPE: u16 = 3;
    pub const SYMLINK: u16 = 4;
    pub const HARDLINK: u16 = 5;
    pub const RDEV: u16 = 6;
    pub const MODE: u16 = 7;
    pub const SIZE: u16 = 8;
    pub const UID: u16 = 9;
    pub const GID: u16 = 10;
    pub const ATIME: u16 = 11;
    pub const MTIME: u16 = 12;
    pub const MD5SUM: u16 = 13;
    pub const MULTIFILESCOUNT: u16 = 14;
    pub const MULTIFILESOFFSET: u16 = 15;
    pub const LINKTARGETTYPE: u16 = 16;
    pub const FLAGS: u16 = 17;
}

/// Keys of BLKH block headers.
pub mod blockhead {
    pub const REALSIZE: u16 = 1;
    pub const BLOCKOFFSET: u16 = 2;
    pub const COMPRESSALGO: u16 = 3;
    pub const ENCRYPTALGO: u16 = 4;
    pub const ARSIZE: u16 = 5;
    pub const COMPSIZE: u16 = 6;
    pub const ARCSUM: u16 = 7;
}

/// Keys of FILF file footers.
pub mod filefoot {
    pub const MD5SUM: u16 = 1;
}

/// Keys of FSIN filesystem-info records.
pub mod fsinfo {
    pub const FILESYSTEM: u16 = 1;
    pub const MNTPATH: u16 = 2;
    pub const BYTESTOTAL: u16 = 3;
    pub const BYTESUSED: u16 = 4;
    pub const FSLABEL: u16 = 5;
    pub const FSUUID: u16 = 6;
    pub const ORIGDEV: u16 = 7;
    pub const MOUNTINFO: u16 = 8;
    pub const MINVERSION: u16 = 9;
    pub const TOTALCOST: u16 = 10;
    pub const BLOCKSIZE: u16 = 11;
    pub const FEATURES: u16 = 12;
}

/// Keys of DIRS dirs-info records.
pub mod dirsinfo {
    pub const TOTALCOST: u16 = 1;
}

/// Keys of DILA disk-layout records.
pub mod layout {
    pub const PTCOUNT: u16 = 1;
    /// Section 1 items: one serialized partition-table map per disk,
    /// keyed by disk index.
    pub const SECTION_TABLES: u8 = 1;
}

/// Archive types stored under `mainhead::ARCHTYPE`.
pub mod archtype {
    pub const FILESYSTEMS: u32 = 1;
    pub const DIRECTORIES: u32 = 2;
}

/// Object variants stored under `object::OBJTYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjType {
    Dir = 1,
    Symlink = 2,
    Hardlink = 3,
    CharDev = 4,
    BlockDev = 5,
    Fifo = 6,
    Socket = 7,
    RegFileUnique = 8,
    RegFileMulti = 9,
}

impl ObjType {
    pub fn from_u32(v: u32) -> Option<ObjType> {
        match v {
            1 => Some(ObjType::Dir),
            2 => Some(ObjType::Symlink),
            3 => Some(ObjType::Hardlink),
            4 => Some(ObjType::CharDev),
            5 => Some(ObjType::BlockDev),
            6 => Some(ObjType::Fifo),
            7 => Some(ObjType::Socket),
            8 => Some(ObjType::RegFileUnique),
            9 => Some(ObjType::RegFileMulti),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjType::Dir => "dir",
            ObjType::Symlink => "symlink",
            ObjType::Hardlink => "hardlink",
            ObjType::CharDev => "chardev",
            ObjType::BlockDev => "blockdev",
            ObjType::Fifo => "fifo",
            ObjType::Socket => "socket",
            ObjType::RegFileUnique => "regfile",
            ObjType::RegFileMulti => "regfile-packed",
        }
    }
}

/// Object flag bits stored under `object::FLAGS`.
pub const FILEFLAG_SPARSE: u64 = 1 << 0;

/// `object::LINKTARGETTYPE` values: what a symlink pointed at, so that a
/// target filesystem without symlink support can substitute sensibly.
pub mod linktarget {
    pub const UNKNOWN: u32 = 0;
    pub const DIR: u32 = 1;
    pub const REGFILE: u32 = 2;
}
