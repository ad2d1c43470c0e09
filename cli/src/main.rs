// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    rc::Rc,
};

use clap::{Parser, Subcommand};
use imgtool_ds::DataStorage;
use imgtool_ds_raw::DataStorageRaw;
use imgtool_fs::{mbr::scan_partitions, resolve_partition, DriverTable, Error, FileNode, FsError, Partition, Result, Volume};
use imgtool_fs_fat32::Fat32Driver;
use log::{error, info};

/// The 512-byte read/copy chunk the original tool streams host files
/// through; unrelated to the image's on-disk sector size, which it happens
/// to share.
const COPY_CHUNK: usize = 512;

#[derive(Parser)]
#[command(name = "imgtool", about = "Offline FAT32 disk-image editor")]
struct Cli {
    /// Path to the raw `.img` disk image to edit.
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy one host file into the image.
    Copy {
        host_path: PathBuf,
        /// `/pN[/dir/...]`
        image_path: String,
    },
    /// Recursively copy a host directory tree into the image.
    Copydir {
        host_dir: PathBuf,
        /// `/pN[/dir/...]`
        image_path: String,
    },
    /// Create a directory inside the image.
    Mkdir {
        name: String,
        /// `/pN[/dir/...]`
        image_dir: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        error!("{error}");
        eprintln!("imgtool: {error}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let data_storage: Rc<dyn DataStorage> = Rc::new(DataStorageRaw::open(&cli.image)?);

    let mut drivers = DriverTable::new();
    drivers.register(Box::new(Fat32Driver));
    let partitions = scan_partitions(&data_storage, 0, &drivers)?;

    match cli.command {
        Command::Copy { host_path, image_path } => copy_file(&partitions, &host_path, &image_path),
        Command::Copydir { host_dir, image_path } => copy_dir(&partitions, &host_dir, &image_path),
        Command::Mkdir { name, image_dir } => mkdir_cmd(&partitions, &name, &image_dir),
    }
}

/// Resolves `/pN[/dir/...]` down to its mounted volume and the directory
/// fnode named by the path's tail, mirroring the C original's
/// `get_part` + `opendir` pairing.
fn resolve_dir<'a>(
    partitions: &'a [Option<Partition>; 4],
    image_path: &str,
) -> Result<(&'a dyn Volume, FileNode, &'a str)> {
    let (partition, consumed) =
        resolve_partition(image_path.as_bytes(), partitions).ok_or(FsError::UnknownPath)?;
    let volume = partition.volume().ok_or(FsError::UnknownPath)?;
    let volume_path = &image_path[consumed..];
    let dir = volume.opendir(volume_path.as_bytes())?;
    Ok((volume, dir, volume_path))
}

fn host_name_bytes(path: &Path) -> Result<&[u8]> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::as_bytes)
        .ok_or_else(|| Error::Usage(format!("cannot determine a file name for {}", path.display())))
}

fn copy_file(partitions: &[Option<Partition>; 4], host_path: &Path, image_path: &str) -> Result<()> {
    let (volume, parent, _) = resolve_dir(partitions, image_path)?;
    copy_into(volume, &parent, host_path, host_name_bytes(host_path)?)
}

/// Streams `host_path` into a file named `name` under `parent`, creating it
/// if it doesn't already exist, in `COPY_CHUNK`-sized writes.
fn copy_into(volume: &dyn Volume, parent: &FileNode, host_path: &Path, name: &[u8]) -> Result<()> {
    let mut fnode = match volume.open(parent, name) {
        Ok(fnode) => fnode,
        Err(_) => volume.create_file(parent, name)?,
    };

    let mut src = fs::File::open(host_path)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut pos: u64 = 0;
    loop {
        let read = src.read(&mut buf)?;
        if read == 0 {
            break;
        }
        volume.write(&mut fnode, pos, &buf[..read])?;
        pos += read as u64;
    }
    info!("copied {} ({pos} bytes)", host_path.display());
    Ok(())
}

fn copy_dir(partitions: &[Option<Partition>; 4], host_dir: &Path, image_path: &str) -> Result<()> {
    let (volume, root, volume_path) = resolve_dir(partitions, image_path)?;
    copy_tree(volume, &root, volume_path, host_dir)
}

fn copy_tree(
    volume: &dyn Volume,
    parent: &FileNode,
    parent_image_path: &str,
    host_dir: &Path,
) -> Result<()> {
    for entry in fs::read_dir(host_dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let name_str = name
            .to_str()
            .ok_or_else(|| Error::Usage(format!("non-UTF-8 host name under {}", host_dir.display())))?;
        let name_bytes = name_str.as_bytes();

        if file_type.is_dir() {
            let child_image_path = format!("{}/{}", parent_image_path.trim_end_matches('/'), name_str);
            let child = match volume.opendir(child_image_path.as_bytes()) {
                Ok(fnode) => fnode,
                Err(_) => {
                    let fnode = volume.mkdir(parent, name_bytes)?;
                    info!("created directory {child_image_path}");
                    fnode
                }
            };
            copy_tree(volume, &child, &child_image_path, &entry.path())?;
        } else if file_type.is_file() {
            copy_into(volume, parent, &entry.path(), name_bytes)?;
        }
    }
    Ok(())
}

fn mkdir_cmd(partitions: &[Option<Partition>; 4], name: &str, image_dir: &str) -> Result<()> {
    let (volume, parent, _) = resolve_dir(partitions, image_dir)?;
    volume.mkdir(&parent, name.as_bytes())?;
    info!("created directory {name} under {image_dir}");
    Ok(())
}
