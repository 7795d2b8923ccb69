//! End-to-end: build a tree from a pseudo-file listing and a tar stream,
//! write an image through `MemFile`, and read every entry back.

use squashfs::compressors::{CompressorConfig, CompressorId};
use squashfs::image::Image;
use squashfs::inode::Inode;
use squashfs::io_file::MemFile;
use squashfs::tar::{into_tree, TarReader};
use squashfs::tree::listing;
use squashfs::writer::{write_image, WriterConfig};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn build(listing_text: &str) -> Image<MemFile> {
    let tree = listing::parse(listing_text).unwrap();
    let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
    let out = write_image(&tree, MemFile::new(), cfg, Arc::new(AtomicBool::new(false))).unwrap();
    Image::open(out).unwrap()
}

#[test]
fn listing_round_trips_a_small_tree() {
    let listing = "\
bin d 755 0 0
bin/sh s 777 0 0 /bin/busybox
dev d 755 0 0
dev/null c 666 0 0 1 3
etc d 755 0 0
etc/hostname f 644 0 0
";
    let image = build(listing);

    let bin = image.lookup_path("bin").unwrap();
    let entries = image.list_directory(&bin).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, b"sh");

    let sh = image.lookup_path("bin/sh").unwrap();
    assert_eq!(image.symlink_target(&sh).unwrap(), b"/bin/busybox");

    let null = image.lookup_path("dev/null").unwrap();
    assert!(matches!(null, Inode::Dev(_) | Inode::LDev(_)));

    let hostname = image.lookup_path("etc/hostname").unwrap();
    assert_eq!(image.read_file_data(&hostname).unwrap(), b"");
}

#[test]
fn export_table_resolves_every_inode() {
    let listing = "\
a d 755 0 0
a/b d 755 0 0
a/b/c f 644 0 0
";
    let image = build(listing);
    let inodes = image.superblock().inodes();
    for i in 1..=inodes {
        let inode_ref = image.export_lookup(i).unwrap();
        let inode = image.read_inode(inode_ref).unwrap();
        assert_eq!(inode.inode_number(), i);
    }
}

/// Builds a single-entry ustar archive by hand (no `tar` crate dependency).
fn ustar_archive(name: &str, content: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 512;
    let mut block = [0u8; BLOCK];
    block[0..name.len()].copy_from_slice(name.as_bytes());
    write_octal(&mut block[100..108], 0o644, 7);
    write_octal(&mut block[108..116], 0, 7);
    write_octal(&mut block[116..124], 0, 7);
    write_octal(&mut block[124..136], content.len() as u64, 11);
    write_octal(&mut block[136..148], 0, 11);
    block[156] = b'0';
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    for b in block[148..156].iter_mut() {
        *b = b' ';
    }
    let sum: u64 = block.iter().map(|&b| b as u64).sum();
    write_octal(&mut block[148..154], sum, 6);
    block[154] = 0;
    block[155] = b' ';

    let mut archive = Vec::new();
    archive.extend_from_slice(&block);
    archive.extend_from_slice(content);
    let pad = (BLOCK - content.len() % BLOCK) % BLOCK;
    archive.extend(std::iter::repeat(0u8).take(pad));
    archive.extend(std::iter::repeat(0u8).take(BLOCK * 2));
    archive
}

fn write_octal(field: &mut [u8], value: u64, digits: usize) {
    let s = format!("{:0width$o}", value, width = digits);
    field[..digits].copy_from_slice(s.as_bytes());
}

#[test]
fn tar_stream_becomes_a_readable_image() {
    let archive = ustar_archive("greeting.txt", b"hello, world!");

    let mut reader = TarReader::new(std::io::Cursor::new(archive));
    let tree = into_tree(&mut reader).unwrap();

    let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
    let out = write_image(&tree, MemFile::new(), cfg, Arc::new(AtomicBool::new(false))).unwrap();
    let image = Image::open(out).unwrap();

    let inode = image.lookup_path("greeting.txt").unwrap();
    assert_eq!(image.read_file_data(&inode).unwrap(), b"hello, world!");
}
