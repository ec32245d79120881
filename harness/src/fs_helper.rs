// Licensed under the Apache-2.0 license

//! Creation of filesystem and disk images for tests that read files from the
//! DUT. The images are made by the host's mkfs, mtools and sfdisk.

use crate::config::SessionConfig;
use crate::console::Console;
use crate::multiplexed_log::{Logfile, RunAndLog};
use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Size granularity of filesystem images.
pub const SIZE_GRAN: u64 = 1 << 20;

/// Linux name of the filesystem used for `fs_type`.
fn linux_fs_type(fs_type: &str) -> &str {
    if fs_type == "exfat" {
        "exfat"
    } else if fs_type.starts_with("fat") || fs_type == "fs_generic" {
        "vfat"
    } else {
        fs_type
    }
}

/// PATH with `/sbin` added, since some distributions leave it out.
fn sbin_path() -> OsString {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
    for sbin in ["/sbin", "/usr/sbin"] {
        if !dirs.iter().any(|d| d == Path::new(sbin)) {
            dirs.push(sbin.into());
        }
    }
    std::env::join_paths(dirs).unwrap_or(path)
}

fn tool(name: &str) -> Command {
    let mut cmd = Command::new(name);
    cmd.env("PATH", sbin_path());
    cmd
}

/// Returns true if `name` can be run, looking in the sbin directories too.
pub fn have_tool(name: &str) -> bool {
    std::env::split_paths(&sbin_path()).any(|dir| dir.join(name).is_file())
}

fn mkfs_command(fs_type: &str, src_dir: Option<&Path>, fs_img: &Path) -> Result<Command> {
    let lnxtype = linux_fs_type(fs_type);
    let mut cmd = tool(&format!("mkfs.{lnxtype}"));
    match fs_type {
        "fat12" => cmd.args(["-F", "12"]),
        "fat16" => cmd.args(["-F", "16"]),
        "fat32" => cmd.args(["-F", "32"]),
        _ => &mut cmd,
    };
    if let Some(src_dir) = src_dir {
        match lnxtype {
            "ext4" => {
                cmd.arg("-d").arg(src_dir);
            }
            "vfat" | "exfat" => {}
            _ => bail!("src_dir not implemented for fs {lnxtype}"),
        }
    }
    cmd.arg(fs_img);
    Ok(cmd)
}

/// Entries of `dir`, sorted, as the shell would expand `dir/*`.
fn dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Options for [`mk_fs`].
#[derive(Clone, Debug, Default)]
pub struct FsOptions<'a> {
    /// Directory whose contents are copied into the new filesystem.
    pub src_dir: Option<&'a Path>,
    /// Where to write the image; defaults to
    /// `<persistent_data_dir>/<prefix>.<fs_type>.img`.
    pub fs_img: Option<PathBuf>,
    /// Hide the output of the tools on success.
    pub quiet: bool,
}

/// Create a filesystem image of at least `size` bytes. Returns its path.
///
/// On failure the partial image is removed.
pub fn mk_fs(
    config: &SessionConfig,
    log: &Logfile,
    fs_type: &str,
    size: u64,
    prefix: &str,
    opts: &FsOptions,
) -> Result<PathBuf> {
    let fs_img = opts.fs_img.clone().unwrap_or_else(|| {
        config
            .persistent_data_dir
            .join(format!("{prefix}.{fs_type}.img"))
    });
    let mkfs = mkfs_command(fs_type, opts.src_dir, &fs_img)?;
    let runner = log.get_runner("mkfs", None);
    let res = build_fs(&runner, mkfs, fs_type, size, opts, &fs_img);
    if res.is_err() {
        let _ = fs::remove_file(&fs_img);
    }
    res.map(|_| fs_img)
}

fn build_fs(
    runner: &RunAndLog,
    mut mkfs: Command,
    fs_type: &str,
    size: u64,
    opts: &FsOptions,
    fs_img: &Path,
) -> Result<()> {
    match fs::remove_file(fs_img) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    if let Some(dir) = fs_img.parent() {
        fs::create_dir_all(dir)?;
    }
    let count = size.div_ceil(SIZE_GRAN);
    File::create(fs_img)?.set_len(SIZE_GRAN * count)?;
    let out = runner.run(&mut mkfs)?;
    if !opts.quiet {
        log::info!("{}", out.trim_end());
    }

    let lnxtype = linux_fs_type(fs_type);
    if fs_type == "ext4" {
        let sb_content = runner.run(tool("tune2fs").arg("-l").arg(fs_img))?;
        if sb_content.contains("metadata_csum") {
            runner.run(tool("tune2fs").args(["-O", "^metadata_csum"]).arg(fs_img))?;
        }
    } else if let Some(src_dir) = opts.src_dir {
        let entries = dir_entries(src_dir)?;
        if lnxtype == "vfat" {
            let flags = if opts.quiet { "-smpQ" } else { "-smpQv" };
            runner.run(
                tool("mcopy")
                    .arg("-i")
                    .arg(fs_img)
                    .arg(flags)
                    .args(&entries)
                    .arg("::/"),
            )?;
        } else if lnxtype == "exfat" {
            runner.run(tool("fattools").arg("cp").args(&entries).arg(fs_img))?;
        }
    }
    Ok(())
}

/// A scratch directory that becomes a filesystem image.
///
/// Tests fill [`FsImage::dir`] and call [`FsImage::build`]. The scratch
/// directory is removed when the guard is dropped, also when the test fails
/// before building.
pub struct FsImage {
    scratch: TempDir,
    fs_type: String,
    size: u64,
    prefix: String,
    image: Option<PathBuf>,
}

impl FsImage {
    pub fn new(config: &SessionConfig, fs_type: &str, size: u64, prefix: &str) -> Result<Self> {
        fs::create_dir_all(&config.persistent_data_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{prefix}-{fs_type}-"))
            .tempdir_in(&config.persistent_data_dir)?;
        Ok(Self {
            scratch,
            fs_type: fs_type.to_string(),
            size,
            prefix: prefix.to_string(),
            image: None,
        })
    }

    /// Directory whose contents go into the image.
    pub fn dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Create the image from the scratch directory.
    pub fn build(&mut self, config: &SessionConfig, log: &Logfile) -> Result<PathBuf> {
        let opts = FsOptions {
            src_dir: Some(self.scratch.path()),
            quiet: true,
            ..Default::default()
        };
        let image = mk_fs(config, log, &self.fs_type, self.size, &self.prefix, &opts)?;
        self.image = Some(image.clone());
        Ok(image)
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }
}

/// Layout of a partitioned disk image for [`setup_image`].
#[derive(Clone, Debug)]
pub struct DiskSpec {
    /// Device number, used in the file name.
    pub devnum: u32,
    /// Type of the first partition, e.g. 0xc for FAT32.
    pub part_type: u8,
    /// Image size in MiB.
    pub img_size_mib: u64,
    /// Add a small second partition.
    pub second_part: bool,
    pub basename: String,
}

impl Default for DiskSpec {
    fn default() -> Self {
        Self {
            devnum: 0,
            part_type: 0xc,
            img_size_mib: 20,
            second_part: false,
            basename: "mmc".into(),
        }
    }
}

impl DiskSpec {
    /// Partition table in sfdisk's input format.
    pub fn sfdisk_script(&self) -> String {
        let mut script = format!(
            "type={:x}, size={}M, start=1M, bootable",
            self.part_type,
            self.img_size_mib.saturating_sub(2)
        );
        if self.second_part {
            script.push_str("\ntype=c");
        }
        script
    }
}

/// Create a partitioned disk image. Returns the image path and a scratch
/// directory for the test's files.
pub fn setup_image(
    config: &SessionConfig,
    log: &Logfile,
    spec: &DiskSpec,
) -> Result<(PathBuf, PathBuf)> {
    let fname = config
        .source_dir
        .join(format!("{}{}.img", spec.basename, spec.devnum));
    let mnt = config.persistent_data_dir.join("scratch");
    fs::create_dir_all(&mnt)?;

    let runner = log.get_runner("setup_image", None);
    let res = (|| -> Result<()> {
        File::create(&fname)?.set_len(spec.img_size_mib * SIZE_GRAN)?;
        runner.run_with_stdin(
            tool("sfdisk").arg(&fname),
            Some(spec.sfdisk_script().as_bytes()),
        )?;
        Ok(())
    })();
    if let Err(err) = res {
        let _ = fs::remove_file(&fname);
        return Err(err);
    }
    Ok((fname, mnt))
}

/// Attach an image to the sandbox as host device `devnum`.
pub fn bind_host(console: &mut Console, devnum: u32, path: &Path) -> crate::Result<String> {
    console.run_command(&format!("host bind {devnum} {}", path.display()))
}
