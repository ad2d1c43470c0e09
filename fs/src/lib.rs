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

pub mod mbr;

use std::rc::Rc;

use imgtool_ds::DataStorage;
pub use imgtool_err::*;

pub const SECTOR_SIZE: u64 = 512;

/// A file or directory handle (the "fnode" of the on-disk FAT world).
///
/// `parent` is a non-owning back-reference realized as a reference-counted
/// snapshot: once built, a node's own fields never change, only a later
/// write to a *child* mutates that child's own `size`/`offset`.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub name: Vec<u8>,
    pub pos: u32,
    pub dir_offset: u64,
    pub size: u32,
    pub offset: u64,
    pub parent: Option<Rc<FileNode>>,
}

impl FileNode {
    pub fn root(pos: u32) -> Self {
        Self {
            name: b"/".to_vec(),
            pos,
            dir_offset: 0,
            size: 0,
            offset: 0,
            parent: None,
        }
    }
}

/// Operations a mounted volume supports, keyed on [`FileNode`] handles. This
/// is the Rust rendering of the C `struct fsi` function-pointer table: one
/// `Box<dyn Volume>` per mounted partition instead of a struct of function
/// pointers.
pub trait Volume {
    fn root(&self) -> FileNode;

    fn label(&self) -> Option<&str>;

    fn open(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode>;

    fn opendir(&self, path: &[u8]) -> Result<FileNode>;

    fn create_file(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode>;

    fn mkdir(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode>;

    fn delete(&self, fnode: &FileNode) -> Result<()>;

    fn read(&self, fnode: &FileNode, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, fnode: &mut FileNode, offset: u64, buffer: &[u8]) -> Result<()>;

    fn get_attr(&self, fnode: &FileNode) -> Result<u8>;

    fn set_attr(&self, fnode: &FileNode, attr: u8) -> Result<()>;
}

/// A filesystem driver: knows whether it accepts a given MBR partition type
/// byte, and how to mount a [`Volume`] over a block backend.
pub trait FileSystemDriver {
    fn check(&self, partition_type: u8) -> bool;

    fn mount(&self, data_storage: Rc<dyn DataStorage>, start_lba: u64) -> Result<Box<dyn Volume>>;
}

/// A process-wide, read-only-after-init registry of filesystem drivers.
/// There is exactly one entry in this project: FAT32.
#[derive(Default)]
pub struct DriverTable {
    drivers: Vec<Box<dyn FileSystemDriver>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self { drivers: Vec::new() }
    }

    pub fn register(&mut self, driver: Box<dyn FileSystemDriver>) {
        self.drivers.push(driver);
    }

    fn dispatch(&self, partition_type: u8) -> Option<&dyn FileSystemDriver> {
        self.drivers
            .iter()
            .map(|driver| driver.as_ref())
            .find(|driver| driver.check(partition_type))
    }
}

/// A partition found in the MBR table: either a mounted filesystem, or an
/// extended partition acting purely as a container for further partitions.
pub enum Partition {
    Mounted {
        start: u64,
        name: Option<String>,
        root: FileNode,
        volume: Box<dyn Volume>,
    },
    Extended {
        children: [Option<Box<Partition>>; 4],
    },
}

impl Partition {
    pub fn root(&self) -> Option<&FileNode> {
        match self {
            Partition::Mounted { root, .. } => Some(root),
            Partition::Extended { .. } => None,
        }
    }

    pub fn volume(&self) -> Option<&dyn Volume> {
        match self {
            Partition::Mounted { volume, .. } => Some(volume.as_ref()),
            Partition::Extended { .. } => None,
        }
    }

    fn children(&self) -> Option<&[Option<Box<Partition>>; 4]> {
        match self {
            Partition::Extended { children } => Some(children),
            Partition::Mounted { .. } => None,
        }
    }
}

/// Resolves an image path of the form `/pN[/pM...]` down to the partition it
/// names, returning the partition and the byte offset into `path` where the
/// partition-relative directory path begins. Mirrors the C original's
/// `get_part`, including its silent recursion into extended-partition
/// children when a partition slot has no mounted filesystem.
pub fn resolve_partition<'a>(
    path: &[u8],
    partitions: &'a [Option<Partition>; 4],
) -> Option<(&'a Partition, usize)> {
    let mut path = path;
    let mut consumed = 0;
    if path.first() == Some(&b'/') {
        path = &path[1..];
        consumed += 1;
    }
    if path.first() != Some(&b'p') {
        return None;
    }
    let digit = *path.get(1)?;
    if !digit.is_ascii_digit() {
        return None;
    }
    let index = (digit - b'0') as usize;
    if index >= 4 {
        return None;
    }
    consumed += 2;
    let partition = partitions[index].as_ref()?;
    match partition {
        Partition::Extended { .. } => {
            let children = partition.children().unwrap();
            let (child, child_consumed) = resolve_partition(&path[2..], children)?;
            Some((child, consumed + child_consumed))
        }
        Partition::Mounted { .. } => Some((partition, consumed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_mounted(start: u64) -> Partition {
        struct NoopVolume;
        impl Volume for NoopVolume {
            fn root(&self) -> FileNode {
                FileNode::root(2)
            }
            fn label(&self) -> Option<&str> {
                None
            }
            fn open(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
                Err(FsError::NotFound.into())
            }
            fn opendir(&self, _path: &[u8]) -> Result<FileNode> {
                Err(FsError::NotFound.into())
            }
            fn create_file(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
                Err(FsError::CreateFailed.into())
            }
            fn mkdir(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
                Err(FsError::CreateFailed.into())
            }
            fn delete(&self, _fnode: &FileNode) -> Result<()> {
                Ok(())
            }
            fn read(&self, _fnode: &FileNode, _offset: u64, _buffer: &mut [u8]) -> Result<()> {
                Ok(())
            }
            fn write(&self, _fnode: &mut FileNode, _offset: u64, _buffer: &[u8]) -> Result<()> {
                Ok(())
            }
            fn get_attr(&self, _fnode: &FileNode) -> Result<u8> {
                Ok(0)
            }
            fn set_attr(&self, _fnode: &FileNode, _attr: u8) -> Result<()> {
                Ok(())
            }
        }

        Partition::Mounted {
            start,
            name: None,
            root: FileNode::root(2),
            volume: Box::new(NoopVolume),
        }
    }

    #[test]
    fn resolves_simple_partition_path() {
        let partitions: [Option<Partition>; 4] = [
            Some(dummy_mounted(2048)),
            None,
            None,
            None,
        ];
        let (partition, consumed) = resolve_partition(b"/p0/docs", &partitions).unwrap();
        assert_eq!(consumed, 2);
        match partition {
            Partition::Mounted { start, .. } => assert_eq!(*start, 2048),
            _ => panic!("expected mounted partition"),
        }
    }

    #[test]
    fn rejects_out_of_range_index() {
        let partitions: [Option<Partition>; 4] = [None, None, None, None];
        assert!(resolve_partition(b"/p9/foo", &partitions).is_none());
    }
}
