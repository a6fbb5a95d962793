//! Extended-attribute access through the l*xattr syscall family (the `l`
//! variants so symlinks are never followed).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{FsaError, FsaResult};

fn cpath(path: &Path) -> FsaResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsaError::InvalidArg(format!("path contains NUL: {}", path.display())))
}

/// List extended attribute names. Unsupported filesystems yield an empty
/// list instead of an error.
pub fn list_xattrs(path: &Path) -> FsaResult<Vec<String>> {
    let cp = cpath(path)?;

    let size = unsafe { libc::llistxattr(cp.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::ENOTSUP || errno == libc::ENOSYS {
            return Ok(Vec::new());
        }
        return Err(FsaError::Stat(format!(
            "llistxattr {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    if size == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; size as usize];
    let size = unsafe { libc::llistxattr(cp.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if size < 0 {
        return Err(FsaError::Stat(format!(
            "llistxattr {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    buf.truncate(size as usize);

    Ok(buf
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

pub fn get_xattr(path: &Path, name: &str) -> FsaResult<Vec<u8>> {
    let cp = cpath(path)?;
    let cn = CString::new(name)
        .map_err(|_| FsaError::InvalidArg(format!("xattr name contains NUL: {name}")))?;

    let size = unsafe { libc::lgetxattr(cp.as_ptr(), cn.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(FsaError::Stat(format!(
            "lgetxattr {} {name}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    let mut buf = vec![0u8; size as usize];
    let size = unsafe {
        libc::lgetxattr(
            cp.as_ptr(),
            cn.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if size < 0 {
        return Err(FsaError::Stat(format!(
            "lgetxattr {} {name}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    buf.truncate(size as usize);
    Ok(buf)
}

pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> FsaResult<()> {
    let cp = cpath(path)?;
    let cn = CString::new(name)
        .map_err(|_| FsaError::InvalidArg(format!("xattr name contains NUL: {name}")))?;

    let res = unsafe {
        libc::lsetxattr(
            cp.as_ptr(),
            cn.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if res < 0 {
        return Err(FsaError::Write(format!(
            "lsetxattr {} {name}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_when_supported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"x").unwrap();

        // user xattrs may be unsupported on the test filesystem; skip then
        if set_xattr(&path, "user.fsark_test", b"value").is_err() {
            return;
        }
        let names = list_xattrs(&path).unwrap();
        assert!(names.iter().any(|n| n == "user.fsark_test"));
        assert_eq!(get_xattr(&path, "user.fsark_test").unwrap(), b"value");
    }

    #[test]
    fn listing_plain_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();
        list_xattrs(&path).unwrap();
    }
}
