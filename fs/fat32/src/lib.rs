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

mod dirent;
mod fat;
mod name;
mod time;

use std::rc::Rc;

use imgtool_ds::DataStorage;
use imgtool_fs::{FileNode, FileSystemDriver, FsError, Result, Volume};
use log::{debug, warn};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, IntoBytes, KnownLayout,
};

use crate::dirent::{DirEntry, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_VOLUME_ID, DIR_ENTRY_SIZE};
use crate::fat::ClusterChain;

pub(crate) const SECTOR_SIZE: u64 = 512;
/// Cluster 2 is the root directory's preassigned cluster; the allocator
/// never hands it out (see [`fat::FAT_ALLOC_SCAN_START`]), so a `pos` of 2
/// unambiguously marks "this fnode is the volume root" throughout this crate.
pub(crate) const ROOT_CLUSTER: u32 = 2;

const FSI_LEAD_SIG: u32 = 0x4161_5252;
const PARTITION_TYPE_FAT32_CHS: u8 = 0x0b;
const PARTITION_TYPE_FAT32_LBA: u8 = 0x0c;

/// Mounted FAT32 volume state: the subset of BPB/FSInfo fields the engine
/// needs at runtime, plus the derived sector offsets `spec.md` §3 names.
pub struct FatVolume {
    data_storage: Rc<dyn DataStorage>,

    sectors_per_cluster: u32,
    cluster_bytes: u64,
    num_fats: u32,
    fat_size_sectors: u32,
    fat_start: u64,
    data_start: u64,

    label: Option<String>,
}

impl FatVolume {
    /// Superblock reader (§4.1): loads BPB and FSInfo, validates the FSInfo
    /// signature, computes `fat_start`/`data_start`, and pulls the volume
    /// label from the root directory's volume-ID entry if one is present.
    pub fn mount(data_storage: Rc<dyn DataStorage>, start_lba: u64) -> Result<Self> {
        let mut bpb_bytes = [0u8; SECTOR_SIZE as usize];
        data_storage.read(start_lba * SECTOR_SIZE, &mut bpb_bytes)?;
        let bpb = Bpb::read_from_bytes(&bpb_bytes).unwrap();

        let mut fsinfo_bytes = [0u8; SECTOR_SIZE as usize];
        data_storage.read((start_lba + 1) * SECTOR_SIZE, &mut fsinfo_bytes)?;
        let fsinfo = FsInfo::read_from_bytes(&fsinfo_bytes).unwrap();
        if fsinfo.fsi_leadsig.get() != FSI_LEAD_SIG {
            warn!("FSInfo lead signature mismatch at partition lba {start_lba}");
            return Err(FsError::NotFat32.into());
        }

        let reserved_sectors = bpb.bpb_rsvdseccnt.get() as u64;
        let num_fats = bpb.bpb_numfats as u32;
        let fat_size_sectors = bpb.bpb_fatsz32.get();
        let sectors_per_cluster = bpb.bpb_secperclus as u32;

        let fat_start = start_lba + reserved_sectors;
        let data_start = fat_start + num_fats as u64 * fat_size_sectors as u64;
        let cluster_bytes = sectors_per_cluster as u64 * SECTOR_SIZE;

        let mut volume = Self {
            data_storage,
            sectors_per_cluster,
            cluster_bytes,
            num_fats,
            fat_size_sectors,
            fat_start,
            data_start,
            label: None,
        };

        let mut first_entry = [0u8; DIR_ENTRY_SIZE];
        volume
            .data_storage
            .read(volume.cluster_offset(ROOT_CLUSTER), &mut first_entry)?;
        if first_entry[11] == ATTR_VOLUME_ID {
            let end = first_entry[0..8]
                .iter()
                .position(|&b| b == b' ')
                .unwrap_or(8);
            volume.label = Some(String::from_utf8_lossy(&first_entry[..end]).into_owned());
        }

        debug!(
            "mounted FAT32 volume at lba {start_lba}: fat_start={fat_start} data_start={data_start} \
             sectors_per_cluster={sectors_per_cluster} num_fats={num_fats}"
        );

        Ok(volume)
    }

    fn create_entry(&self, parent: &FileNode, name: &[u8], attr: u8) -> Result<FileNode> {
        let (chain_offset, name_collision) = self.locate_free_slot(parent.pos, name)?;
        let (dir_offset, first_cluster) =
            self.write_name_entries(parent.pos, chain_offset, name, name_collision, attr)?;
        Ok(FileNode {
            name: name.to_vec(),
            pos: first_cluster,
            dir_offset,
            size: 0,
            offset: 0,
            parent: Some(Rc::new(parent.clone())),
        })
    }

    /// Writes `.`/`..` into a freshly allocated, still-dirty directory
    /// cluster. The cluster is zeroed first so the free-end sentinel (0x00)
    /// terminates iteration right after these two entries.
    fn write_dot_entries(&self, dir_cluster: u32, parent_cluster: u32) -> Result<()> {
        let zero = vec![0u8; self.cluster_bytes as usize];
        self.data_storage.write(self.cluster_offset(dir_cluster), &zero)?;

        let parent_first_cluster = if parent_cluster == ROOT_CLUSTER {
            0
        } else {
            parent_cluster
        };
        let stamp = time::now();
        self.write_dot_entry(dir_cluster, 0, b".", dir_cluster, &stamp)?;
        self.write_dot_entry(
            dir_cluster,
            DIR_ENTRY_SIZE as u64,
            b"..",
            parent_first_cluster,
            &stamp,
        )
    }

    fn write_dot_entry(
        &self,
        dir_cluster: u32,
        offset_in_cluster: u64,
        dot_name: &[u8],
        target_cluster: u32,
        stamp: &time::FatTimestamp,
    ) -> Result<()> {
        let mut dir_name = [b' '; 8];
        dir_name[..dot_name.len()].copy_from_slice(dot_name);
        let entry = DirEntry {
            dir_name,
            dir_ext: [b' '; 3],
            dir_attr: ATTR_DIRECTORY,
            dir_ntres: 0,
            dir_crttimetenth: stamp.tenth,
            dir_crttime: U16::new(stamp.time),
            dir_crtdate: U16::new(stamp.date),
            dir_lstaccdate: U16::new(stamp.date),
            dir_fstclushi: U16::new((target_cluster >> 16) as u16),
            dir_wrttime: U16::new(stamp.time),
            dir_wrtdate: U16::new(stamp.date),
            dir_fstcluslo: U16::new((target_cluster & 0xFFFF) as u16),
            dir_filesize: U32::new(0),
        };
        self.data_storage
            .write(self.cluster_offset(dir_cluster) + offset_in_cluster, entry.as_bytes())
    }

    /// Rewrites the parent SFN's `DIR_FileSize`/write-time fields after a
    /// write (§4.6 step 4).
    fn touch_and_resize(&self, fnode: &FileNode, new_size: u32) -> Result<()> {
        let parent = fnode.parent.as_ref().ok_or(FsError::UnknownPath)?;
        let offset = self.resolve_dir_offset(parent.pos, fnode.dir_offset, false)?;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        self.data_storage.read(offset, &mut raw)?;
        let mut entry = DirEntry::read_from_bytes(&raw).unwrap();

        let stamp = time::now();
        entry.dir_filesize = U32::new(new_size);
        entry.dir_wrttime = U16::new(stamp.time);
        entry.dir_wrtdate = U16::new(stamp.date);
        entry.dir_lstaccdate = U16::new(stamp.date);
        self.data_storage.write(offset, entry.as_bytes())
    }
}

impl Volume for FatVolume {
    fn root(&self) -> FileNode {
        FileNode::root(ROOT_CLUSTER)
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn open(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode> {
        let matched = self
            .find_entry(parent.pos, name, true)?
            .ok_or(FsError::NotFound)?;
        Ok(FileNode {
            name: name.to_vec(),
            pos: matched.first_cluster,
            dir_offset: matched.dir_offset,
            size: matched.size,
            offset: 0,
            parent: Some(Rc::new(parent.clone())),
        })
    }

    fn opendir(&self, path: &[u8]) -> Result<FileNode> {
        let mut current = self.root();
        for component in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
            let matched = self
                .find_entry(current.pos, component, false)?
                .ok_or(FsError::UnknownPath)?;
            if !matched.is_dir {
                return Err(FsError::UnknownPath.into());
            }
            current = FileNode {
                name: component.to_vec(),
                pos: matched.first_cluster,
                dir_offset: matched.dir_offset,
                size: matched.size,
                offset: 0,
                parent: Some(Rc::new(current)),
            };
        }
        Ok(current)
    }

    fn create_file(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode> {
        self.create_entry(parent, name, ATTR_ARCHIVE)
    }

    fn mkdir(&self, parent: &FileNode, name: &[u8]) -> Result<FileNode> {
        let fnode = self.create_entry(parent, name, ATTR_DIRECTORY)?;
        self.write_dot_entries(fnode.pos, parent.pos)?;
        Ok(fnode)
    }

    fn delete(&self, fnode: &FileNode) -> Result<()> {
        let parent = fnode.parent.as_ref().ok_or(FsError::UnknownPath)?;

        let mut offset = fnode.dir_offset;
        loop {
            let abs = self.resolve_dir_offset(parent.pos, offset, false)?;
            self.data_storage.write(abs, &[0xE5])?;
            if offset < DIR_ENTRY_SIZE as u64 {
                break;
            }
            let prev_offset = offset - DIR_ENTRY_SIZE as u64;
            let prev_abs = self.resolve_dir_offset(parent.pos, prev_offset, false)?;
            let mut attr_byte = [0u8; 1];
            self.data_storage.read(prev_abs + 11, &mut attr_byte)?;
            if attr_byte[0] != dirent::ATTR_LONG_NAME {
                break;
            }
            offset = prev_offset;
        }

        for cluster in ClusterChain::new(self, fnode.pos) {
            self.fat_free(0, cluster?)?;
        }
        Ok(())
    }

    fn read(&self, fnode: &FileNode, offset: u64, buffer: &mut [u8]) -> Result<()> {
        // Known limitation preserved from the source this engine is modeled
        // on (spec.md §9): a single positioned read, not stitched across a
        // cluster boundary. A `buffer` longer than the remaining tail of the
        // current cluster silently continues reading whatever follows it on
        // the image rather than hopping to the chain's next cluster.
        let cluster_index = offset / self.cluster_bytes;
        let within_cluster = offset % self.cluster_bytes;
        let cluster = self.fat_next(fnode.pos, cluster_index, false)?;
        let abs = self.cluster_offset(cluster) + within_cluster;
        self.data_storage.read(abs, buffer)
    }

    fn write(&self, fnode: &mut FileNode, offset: u64, buffer: &[u8]) -> Result<()> {
        let mut remaining = buffer;
        let mut pos_in_file = offset;
        while !remaining.is_empty() {
            let cluster_index = pos_in_file / self.cluster_bytes;
            let within_cluster = pos_in_file % self.cluster_bytes;
            let cluster = self.fat_next(fnode.pos, cluster_index, true)?;

            let within_sector = within_cluster % SECTOR_SIZE;
            let sector_index_in_cluster = within_cluster / SECTOR_SIZE;
            let chunk_len = remaining
                .len()
                .min((SECTOR_SIZE - within_sector) as usize);

            let abs = self.cluster_offset(cluster)
                + sector_index_in_cluster * SECTOR_SIZE
                + within_sector;
            self.data_storage.write(abs, &remaining[..chunk_len])?;

            remaining = &remaining[chunk_len..];
            pos_in_file += chunk_len as u64;
        }

        let new_size = (offset + buffer.len() as u64).max(fnode.size as u64) as u32;
        self.touch_and_resize(fnode, new_size)?;
        fnode.size = new_size;
        Ok(())
    }

    fn get_attr(&self, fnode: &FileNode) -> Result<u8> {
        let Some(parent) = &fnode.parent else {
            return Ok(ATTR_DIRECTORY);
        };
        let offset = self.resolve_dir_offset(parent.pos, fnode.dir_offset, false)?;
        let mut byte = [0u8; 1];
        self.data_storage.read(offset + 11, &mut byte)?;
        Ok(byte[0])
    }

    fn set_attr(&self, fnode: &FileNode, attr: u8) -> Result<()> {
        let parent = fnode.parent.as_ref().ok_or(FsError::UnknownPath)?;
        let offset = self.resolve_dir_offset(parent.pos, fnode.dir_offset, false)?;
        self.data_storage.write(offset + 11, &[attr])
    }
}

/// The single registered filesystem driver (`spec.md` §2 item 4): accepts
/// MBR partition types 0x0B/0x0C and mounts a [`FatVolume`].
pub struct Fat32Driver;

impl FileSystemDriver for Fat32Driver {
    fn check(&self, partition_type: u8) -> bool {
        partition_type == PARTITION_TYPE_FAT32_CHS || partition_type == PARTITION_TYPE_FAT32_LBA
    }

    fn mount(&self, data_storage: Rc<dyn DataStorage>, start_lba: u64) -> Result<Box<dyn Volume>> {
        Ok(Box::new(FatVolume::mount(data_storage, start_lba)?))
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct Bpb {
    bs_jmpboot: [u8; 3],
    bs_oemname: [u8; 8],

    bpb_bytspersec: U16,
    bpb_secperclus: u8,
    bpb_rsvdseccnt: U16,
    bpb_numfats: u8,
    bpb_rootentcnt: U16,
    bpb_totsec16: U16,
    bpb_media: u8,
    bpb_fatsz16: U16,

    bpb_secpertrk: U16,
    bpb_numheads: U16,
    bpb_hiddsec: U32,
    bpb_totsec32: U32,

    bpb_fatsz32: U32,
    bpb_extflags: U16,
    bpb_fsver: U16,
    bpb_rootclus: U32,
    bpb_fsinfo: U16,
    bpb_bkbootsec: U16,
    bpb_reserved: [u8; 12],

    bs_drvnum: u8,
    bs_reserved1: u8,
    bs_bootsig: u8,
    bs_volid: U32,
    bs_vollab: [u8; 11],
    bs_filsystype: [u8; 8],

    bs_boot: [u8; 420],
    signature_word: [u8; 2],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct FsInfo {
    fsi_leadsig: U32,
    fsi_reserved1: [u8; 480],
    fsi_strucsig: U32,
    fsi_free_count: U32,
    fsi_nxt_free: U32,
    fsi_reserved2: [u8; 12],
    fsi_trailsig: U32,
}
