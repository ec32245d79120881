// Licensed under the Apache-2.0 license

mod common;

use common::SimTree;
use console_harness::checks::ERROR_NOTIFICATION;
use console_harness::fs_helper::{self, DiskSpec, FsImage, FsOptions};
use console_harness::Session;
use std::fs;

#[test]
fn test_fs_image_bound_to_host() {
    if !fs_helper::have_tool("mkfs.ext4") || !fs_helper::have_tool("tune2fs") {
        return;
    }
    let tree = SimTree::new();
    let mut session = Session::new(tree.config()).unwrap();
    let config = session.config().clone();
    let log = session.log().clone();

    let mut image = FsImage::new(&config, "ext4", 4 << 20, "hostfs").unwrap();
    fs::write(image.dir().join("greeting.txt"), "hello from the host").unwrap();
    let path = image.build(&config, &log).unwrap();
    assert_eq!(
        path,
        config.persistent_data_dir.join("hostfs.ext4.img")
    );

    let console = session.console();
    console.ensure_spawned().unwrap();
    assert_eq!(fs_helper::bind_host(console, 0, &path).unwrap(), "");

    let mut console = console.disable_check(ERROR_NOTIFICATION).unwrap();
    let output = fs_helper::bind_host(&mut console, 1, &tree.path().join("missing.img")).unwrap();
    assert!(output.contains("cannot open"));
    drop(console);
    drop(image);
    session.finish().unwrap();
}

#[test]
fn test_mk_fs_fat() {
    if !fs_helper::have_tool("mkfs.vfat") || !fs_helper::have_tool("mcopy") {
        return;
    }
    let tree = SimTree::new();
    let session = Session::new(tree.config()).unwrap();
    let src = tree.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("boot.scr"), "echo booted").unwrap();

    let opts = FsOptions {
        src_dir: Some(src.as_path()),
        fs_img: Some(tree.path().join("fat.img")),
        quiet: true,
    };
    let path = fs_helper::mk_fs(session.config(), session.log(), "vfat", 4 << 20, "boot", &opts)
        .unwrap();
    assert_eq!(path, tree.path().join("fat.img"));
    assert_eq!(fs::metadata(&path).unwrap().len(), 4 << 20);
    session.finish().unwrap();
}

#[test]
fn test_setup_image() {
    if !fs_helper::have_tool("sfdisk") {
        return;
    }
    let tree = SimTree::new();
    let session = Session::new(tree.config()).unwrap();
    let spec = DiskSpec {
        devnum: 2,
        second_part: true,
        ..Default::default()
    };
    let (image, scratch) = fs_helper::setup_image(session.config(), session.log(), &spec).unwrap();
    assert_eq!(image, tree.path().join("mmc2.img"));
    assert_eq!(fs::metadata(&image).unwrap().len(), 20 << 20);
    assert!(scratch.is_dir());
    session.finish().unwrap();
}
