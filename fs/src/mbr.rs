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

use std::{mem::size_of, rc::Rc};

use imgtool_ds::DataStorage;
use log::{debug, warn};
use zerocopy::{little_endian::U32, FromBytes, IntoBytes, KnownLayout};

use crate::{DriverTable, Partition, Result, SECTOR_SIZE};

const PARTITION_TABLE_OFFSET: u64 = 0x1be;
const PARTITION_ENTRY_COUNT: usize = 4;

const PARTITION_TYPE_EXTENDED_CHS: u8 = 0x05;
const PARTITION_TYPE_EXTENDED_LBA: u8 = 0x0f;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct MbrPartitionEntry {
    boot_indicator: u8,
    start_chs: [u8; 3],
    partition_type: u8,
    end_chs: [u8; 3],
    start_lba: U32,
    size_in_sectors: U32,
}

/// Reads the four 16-byte MBR entries at sector `origin_lba`'s 0x1BE offset,
/// dispatching each non-empty entry to a registered driver, or recursing
/// into an extended partition's own table. Best-effort only: extended
/// partitions nest by re-reading a partition-table-shaped region at the
/// entry's `start_lba`, which is not guaranteed to hold one on every disk
/// layout (same caveat the original imagetool carried).
pub fn scan_partitions(
    data_storage: &Rc<dyn DataStorage>,
    origin_lba: u64,
    drivers: &DriverTable,
) -> Result<[Option<Partition>; PARTITION_ENTRY_COUNT]> {
    let mut entries_buf = [0u8; PARTITION_ENTRY_COUNT * size_of::<MbrPartitionEntry>()];
    data_storage.read(
        origin_lba * SECTOR_SIZE + PARTITION_TABLE_OFFSET,
        &mut entries_buf,
    )?;

    let mut partitions: [Option<Partition>; PARTITION_ENTRY_COUNT] = Default::default();
    for (index, chunk) in entries_buf
        .chunks_exact(size_of::<MbrPartitionEntry>())
        .enumerate()
    {
        let entry = MbrPartitionEntry::read_from_bytes(chunk).unwrap();
        if entry.boot_indicator != 0x80 && entry.boot_indicator != 0x00 {
            continue;
        }
        if entry.partition_type == 0x00 {
            continue;
        }

        let start_lba = entry.start_lba.get() as u64;
        if entry.partition_type == PARTITION_TYPE_EXTENDED_CHS
            || entry.partition_type == PARTITION_TYPE_EXTENDED_LBA
        {
            debug!("partition {index}: extended, recursing at lba {start_lba}");
            let children = scan_partitions(data_storage, start_lba, drivers)?;
            partitions[index] = Some(Partition::Extended {
                children: children.map(|child| child.map(Box::new)),
            });
            continue;
        }

        let Some(driver) = drivers.dispatch(entry.partition_type) else {
            warn!(
                "partition {index}: unsupported type 0x{:02x}",
                entry.partition_type
            );
            continue;
        };
        match driver.mount(data_storage.clone(), start_lba) {
            Ok(volume) => {
                let root = volume.root();
                let name = volume.label().map(str::to_owned);
                partitions[index] = Some(Partition::Mounted {
                    start: start_lba,
                    name,
                    root,
                    volume,
                });
            }
            Err(error) => warn!("partition {index}: failed to mount: {error}"),
        }
    }

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileNode, FileSystemDriver, Volume};

    struct StubVolume;
    impl Volume for StubVolume {
        fn root(&self) -> FileNode {
            FileNode::root(2)
        }
        fn label(&self) -> Option<&str> {
            Some("STUB")
        }
        fn open(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
            Err(imgtool_err::FsError::NotFound.into())
        }
        fn opendir(&self, _path: &[u8]) -> Result<FileNode> {
            Err(imgtool_err::FsError::NotFound.into())
        }
        fn create_file(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
            Err(imgtool_err::FsError::CreateFailed.into())
        }
        fn mkdir(&self, _parent: &FileNode, _name: &[u8]) -> Result<FileNode> {
            Err(imgtool_err::FsError::CreateFailed.into())
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

    struct StubDriver(u8);
    impl FileSystemDriver for StubDriver {
        fn check(&self, partition_type: u8) -> bool {
            partition_type == self.0
        }
        fn mount(&self, _data_storage: Rc<dyn DataStorage>, _start_lba: u64) -> Result<Box<dyn Volume>> {
            Ok(Box::new(StubVolume))
        }
    }

    fn write_entry(image: &mut [u8], slot: usize, partition_type: u8, start_lba: u32) {
        let base = PARTITION_TABLE_OFFSET as usize + slot * size_of::<MbrPartitionEntry>();
        image[base] = 0x00;
        image[base + 4] = partition_type;
        image[base + 8..base + 12].copy_from_slice(U32::new(start_lba).as_bytes());
        image[base + 12..base + 16].copy_from_slice(U32::new(1).as_bytes());
    }

    /// Builds a real `.img` file with one recognized, one unsupported and two
    /// empty MBR entries, then mounts it through `imgtool_ds_raw::DataStorageRaw`
    /// so the partition-table offset arithmetic above runs against real
    /// positioned file I/O rather than an in-memory double.
    #[test]
    fn scans_a_real_image_file_and_dispatches_known_types() {
        let mut image = vec![0u8; 4096];
        write_entry(&mut image, 0, 0x0c, 2048);
        write_entry(&mut image, 1, 0x9f, 4096);

        let file = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        std::fs::write(file.path(), &image).unwrap();

        let data_storage: Rc<dyn DataStorage> =
            Rc::new(imgtool_ds_raw::DataStorageRaw::open(file.path()).unwrap());
        let mut drivers = DriverTable::new();
        drivers.register(Box::new(StubDriver(0x0c)));

        let partitions = scan_partitions(&data_storage, 0, &drivers).unwrap();

        assert!(matches!(partitions[0], Some(Partition::Mounted { start: 2048, .. })));
        assert!(partitions[1].is_none());
        assert!(partitions[2].is_none());
        assert!(partitions[3].is_none());
    }
}
