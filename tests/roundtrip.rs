//! End-to-end save-dir / restore-dir round trips over real temp trees.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tempfile::TempDir;

use fsark::options::Options;
use fsark::{restore_dir, save_dir, CompressAlgo, EncryptAlgo, FsaError};

fn opts() -> Options {
    Options {
        batch_mode: true,
        ..Options::default()
    }
}

fn md5_of(path: &Path) -> [u8; 16] {
    Md5::digest(std::fs::read(path).unwrap()).into()
}

/// A small tree covering the interesting object kinds:
/// a tiny file, a symlink, and a file one byte past a block boundary.
fn build_sample_tree(parent: &Path) -> PathBuf {
    let root = parent.join("d");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("a"), b"hello\n\0\0").unwrap();
    std::os::unix::fs::symlink("d/a", root.join("b")).unwrap();
    std::fs::write(root.join("c"), vec![0xAA; 262_145]).unwrap();
    root
}

#[test]
fn sample_tree_roundtrip() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let root = build_sample_tree(src.path());

    let archive = work.path().join("sample.fsa");
    let stats = save_dir(&archive, &[root.clone()], &opts()).unwrap();
    assert_eq!(stats.errors(), 0);
    assert_eq!(stats.cnt_regfile, 2);
    assert_eq!(stats.cnt_symlink, 1);
    assert_eq!(stats.cnt_dir, 1);

    let rstats = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(rstats.errors(), 0);

    let out = dst.path().join("d");
    assert_eq!(std::fs::read(out.join("a")).unwrap(), b"hello\n\0\0");
    assert_eq!(
        std::fs::read_link(out.join("b")).unwrap(),
        PathBuf::from("d/a")
    );
    assert_eq!(md5_of(&out.join("c")), md5_of(&root.join("c")));
    assert_eq!(
        std::fs::metadata(out.join("c")).unwrap().len(),
        262_145
    );
}

#[test]
fn attributes_survive() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("tree");
    std::fs::create_dir(&root).unwrap();
    let file = root.join("script.sh");
    std::fs::write(&file, b"#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o751)).unwrap();
    let old = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_times(&file, old, old).unwrap();

    let archive = work.path().join("attrs.fsa");
    save_dir(&archive, &[root], &opts()).unwrap();
    restore_dir(&archive, dst.path(), &opts()).unwrap();

    let restored = dst.path().join("tree/script.sh");
    let md = std::fs::metadata(&restored).unwrap();
    assert_eq!(md.permissions().mode() & 0o7777, 0o751);
    assert_eq!(md.mtime(), 1_600_000_000);
}

#[test]
fn hardlink_pair_shares_inode() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("links");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("x"), b"shared content").unwrap();
    std::fs::hard_link(root.join("x"), root.join("y")).unwrap();

    let archive = work.path().join("links.fsa");
    let stats = save_dir(&archive, &[root], &opts()).unwrap();
    assert_eq!(stats.cnt_hardlink, 1);

    restore_dir(&archive, dst.path(), &opts()).unwrap();
    let x = std::fs::metadata(dst.path().join("links/x")).unwrap();
    let y = std::fs::metadata(dst.path().join("links/y")).unwrap();
    assert_eq!(x.ino(), y.ino());
    assert_eq!(
        std::fs::read(dst.path().join("links/y")).unwrap(),
        b"shared content"
    );
}

#[test]
fn many_small_files_pack_into_groups() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("many");
    std::fs::create_dir(&root).unwrap();
    // enough files to roll over the per-group count limit
    for i in 0..600 {
        std::fs::write(root.join(format!("f{i:04}")), format!("content {i}")).unwrap();
    }

    let archive = work.path().join("many.fsa");
    let stats = save_dir(&archive, &[root], &opts()).unwrap();
    assert_eq!(stats.cnt_regfile, 600);

    let rstats = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(rstats.cnt_regfile, 600);
    assert_eq!(rstats.errors(), 0);
    for i in (0..600).step_by(97) {
        assert_eq!(
            std::fs::read_to_string(dst.path().join(format!("many/f{i:04}"))).unwrap(),
            format!("content {i}")
        );
    }
}

#[test]
fn empty_and_boundary_files() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("edge");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("empty"), b"").unwrap();
    // exactly at the small-file limit: takes the unique-file path
    std::fs::write(root.join("at_limit"), vec![7u8; 131_072]).unwrap();
    std::fs::write(root.join("under_limit"), vec![8u8; 131_071]).unwrap();

    let archive = work.path().join("edge.fsa");
    save_dir(&archive, &[root.clone()], &opts()).unwrap();
    restore_dir(&archive, dst.path(), &opts()).unwrap();

    let out = dst.path().join("edge");
    assert_eq!(std::fs::metadata(out.join("empty")).unwrap().len(), 0);
    assert_eq!(md5_of(&out.join("at_limit")), md5_of(&root.join("at_limit")));
    assert_eq!(
        md5_of(&out.join("under_limit")),
        md5_of(&root.join("under_limit"))
    );
}

#[test]
fn sparse_file_content_preserved() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("sp");
    std::fs::create_dir(&root).unwrap();
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::File::create(root.join("holes")).unwrap();
        f.write_all(b"start").unwrap();
        f.seek(SeekFrom::Start(1 << 20)).unwrap();
        f.write_all(b"end").unwrap();
    }

    let archive = work.path().join("sp.fsa");
    save_dir(&archive, &[root.clone()], &opts()).unwrap();
    restore_dir(&archive, dst.path(), &opts()).unwrap();

    let restored = dst.path().join("sp/holes");
    assert_eq!(md5_of(&restored), md5_of(&root.join("holes")));
    assert_eq!(
        std::fs::metadata(&restored).unwrap().len(),
        (1 << 20) + 3
    );
}

#[test]
fn exclusion_patterns_apply() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("tree");
    std::fs::create_dir_all(root.join("cache")).unwrap();
    std::fs::write(root.join("keep.txt"), b"keep").unwrap();
    std::fs::write(root.join("drop.tmp"), b"drop").unwrap();
    std::fs::write(root.join("cache/deep"), b"drop too").unwrap();

    let mut o = opts();
    o.exclude = vec!["*.tmp".into(), "cache".into()];
    let archive = work.path().join("ex.fsa");
    save_dir(&archive, &[root], &o).unwrap();
    restore_dir(&archive, dst.path(), &opts()).unwrap();

    assert!(dst.path().join("tree/keep.txt").exists());
    assert!(!dst.path().join("tree/drop.tmp").exists());
    assert!(!dst.path().join("tree/cache").exists());
}

#[test]
fn encrypted_roundtrip_and_wrong_password() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("secret");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("data"), b"confidential bytes").unwrap();

    let mut save_opts = opts();
    save_opts.encrypt_algo = EncryptAlgo::Aes256;
    save_opts.encrypt_pass = Some("correct-horse".into());
    let archive = work.path().join("enc.fsa");
    save_dir(&archive, &[root], &save_opts).unwrap();

    // wrong password fails before anything lands in the destination
    let mut bad = opts();
    bad.encrypt_pass = Some("wrong-battery".into());
    let err = restore_dir(&archive, dst.path(), &bad).unwrap_err();
    assert!(matches!(err, FsaError::WrongArchive(_)), "got {err}");
    assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);

    // no password at all is refused the same way
    let err = restore_dir(&archive, dst.path(), &opts()).unwrap_err();
    assert!(matches!(err, FsaError::WrongArchive(_)));

    let mut good = opts();
    good.encrypt_pass = Some("correct-horse".into());
    restore_dir(&archive, dst.path(), &good).unwrap();
    assert_eq!(
        std::fs::read(dst.path().join("secret/data")).unwrap(),
        b"confidential bytes"
    );
}

#[test]
fn split_archive_roundtrip() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("big");
    std::fs::create_dir(&root).unwrap();
    // incompressible-ish payload so the volume count is predictable
    let mut state = 0x1234_5678_9ABC_DEF0u64;
    let data: Vec<u8> = (0..5 * 1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    std::fs::write(root.join("blob"), &data).unwrap();

    let mut o = opts();
    o.splitsize = 1024 * 1024;
    o.compress_algo = CompressAlgo::None;
    let archive = work.path().join("split.fsa");
    save_dir(&archive, &[root.clone()], &o).unwrap();

    // 5 MiB of data + FEC expansion at 1 MiB per volume
    let volumes = std::fs::read_dir(work.path()).unwrap().count();
    assert!(volumes >= 5, "expected at least 5 volumes, got {volumes}");

    restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(md5_of(&dst.path().join("big/blob")), md5_of(&root.join("blob")));
}

#[test]
fn multiple_source_dirs() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let one = src.path().join("one");
    let two = src.path().join("two");
    std::fs::create_dir(&one).unwrap();
    std::fs::create_dir(&two).unwrap();
    std::fs::write(one.join("a"), b"first").unwrap();
    std::fs::write(two.join("b"), b"second").unwrap();

    let archive = work.path().join("multi.fsa");
    save_dir(&archive, &[one, two], &opts()).unwrap();
    restore_dir(&archive, dst.path(), &opts()).unwrap();

    assert_eq!(std::fs::read(dst.path().join("one/a")).unwrap(), b"first");
    assert_eq!(std::fs::read(dst.path().join("two/b")).unwrap(), b"second");
}

#[test]
fn fifo_roundtrip() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let root = src.path().join("special");
    std::fs::create_dir(&root).unwrap();
    nix::unistd::mkfifo(
        &root.join("pipe"),
        nix::sys::stat::Mode::from_bits_truncate(0o640),
    )
    .unwrap();

    let archive = work.path().join("fifo.fsa");
    let stats = save_dir(&archive, &[root], &opts()).unwrap();
    assert_eq!(stats.cnt_special, 1);

    restore_dir(&archive, dst.path(), &opts()).unwrap();
    use std::os::unix::fs::FileTypeExt;
    let md = std::fs::symlink_metadata(dst.path().join("special/pipe")).unwrap();
    assert!(md.file_type().is_fifo());
}

#[test]
fn restore_is_idempotent() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let root = build_sample_tree(src.path());

    let archive = work.path().join("twice.fsa");
    save_dir(&archive, &[root.clone()], &opts()).unwrap();

    let first = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(first.errors(), 0);
    let second = restore_dir(&archive, dst.path(), &opts()).unwrap();
    assert_eq!(second.errors(), 0);

    let out = dst.path().join("d");
    assert_eq!(std::fs::read(out.join("a")).unwrap(), b"hello\n\0\0");
    assert_eq!(md5_of(&out.join("c")), md5_of(&root.join("c")));
}

#[test]
fn restore_into_wrong_command_is_refused() {
    let work = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();

    let root = src.path().join("tree");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"x").unwrap();

    let archive = work.path().join("dirs.fsa");
    save_dir(&archive, &[root], &opts()).unwrap();

    // a directories archive cannot be restored with restore-fs
    let spec = fsark::RestoreSpec::parse("id=0,dest=/dev/null").unwrap();
    let err = fsark::restore_fs(&archive, &[spec], &opts()).unwrap_err();
    assert!(matches!(err, FsaError::WrongType(_)), "got {err}");
}
