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

use imgtool_fs::Result;
use zerocopy::{little_endian::U32, FromBytes, IntoBytes, KnownLayout};

use crate::fat::ClusterChain;
use crate::FatVolume;

pub(crate) const ATTR_READ_ONLY: u8 = 0x01;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;
pub(crate) const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_LONG_NAME: u8 = 0x0F;

pub(crate) const NTRES_BASE_LOWER: u8 = 0x08;
pub(crate) const NTRES_EXT_LOWER: u8 = 0x10;

pub(crate) const DIR_ENTRY_SIZE: usize = 32;
const DELETED_MARKER: u8 = 0xE5;
const KANJI_LEAD_BYTE: u8 = 0x05;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout)]
pub(crate) struct DirEntry {
    pub(crate) dir_name: [u8; 8],
    pub(crate) dir_ext: [u8; 3],
    pub(crate) dir_attr: u8,
    pub(crate) dir_ntres: u8,
    pub(crate) dir_crttimetenth: u8,
    pub(crate) dir_crttime: zerocopy::little_endian::U16,
    pub(crate) dir_crtdate: zerocopy::little_endian::U16,
    pub(crate) dir_lstaccdate: zerocopy::little_endian::U16,
    pub(crate) dir_fstclushi: zerocopy::little_endian::U16,
    pub(crate) dir_wrttime: zerocopy::little_endian::U16,
    pub(crate) dir_wrtdate: zerocopy::little_endian::U16,
    pub(crate) dir_fstcluslo: zerocopy::little_endian::U16,
    pub(crate) dir_filesize: U32,
}

impl DirEntry {
    pub(crate) fn first_cluster(&self) -> u32 {
        ((self.dir_fstclushi.get() as u32) << 16 | self.dir_fstcluslo.get() as u32) & 0x0FFF_FFFF
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout)]
pub(crate) struct LongNameDirEntry {
    pub(crate) ldir_ord: u8,
    pub(crate) ldir_name1: [zerocopy::little_endian::U16; 5],
    pub(crate) ldir_attr: u8,
    pub(crate) ldir_type: u8,
    pub(crate) ldir_chksum: u8,
    pub(crate) ldir_name2: [zerocopy::little_endian::U16; 6],
    pub(crate) ldir_fstcluslo: zerocopy::little_endian::U16,
    pub(crate) ldir_name3: [zerocopy::little_endian::U16; 2],
}

impl LongNameDirEntry {
    /// Decodes this slot's share of a long name. Stops at the first `0x0000`
    /// (logical terminator) or `0xFFFF` (padding) code unit, which only ever
    /// occurs in the slot holding the tail of the name.
    fn chars(&self) -> Vec<u8> {
        self.ldir_name1
            .iter()
            .chain(self.ldir_name2.iter())
            .chain(self.ldir_name3.iter())
            .map(|c| c.get())
            .take_while(|&c| c != 0x0000 && c != 0xFFFF)
            .map(|c| c as u8)
            .collect()
    }
}

pub(crate) struct MatchedEntry {
    pub(crate) dir_offset: u64,
    pub(crate) first_cluster: u32,
    pub(crate) size: u32,
    pub(crate) is_dir: bool,
}

impl FatVolume {
    /// Scans `parent`'s cluster chain for an entry named `name`. LFN groups
    /// are reassembled from the slots immediately preceding their short
    /// entry, in the disk order they're encountered (highest ordinal
    /// first), which is also the order the name's characters were split
    /// across slots at creation time. `skip_directories` mirrors the C
    /// original's distinction between a plain file lookup (which skips
    /// subdirectories) and a path-component lookup (which doesn't).
    pub(crate) fn find_entry(
        &self,
        start_cluster: u32,
        name: &[u8],
        skip_directories: bool,
    ) -> Result<Option<MatchedEntry>> {
        let mut chain_offset: u64 = 0;
        let mut pending_lfn: Vec<Vec<u8>> = Vec::new();

        for cluster in ClusterChain::new(self, start_cluster) {
            let cluster = cluster?;
            let mut buf = vec![0u8; self.cluster_bytes as usize];
            self.data_storage.read(self.cluster_offset(cluster), &mut buf)?;

            for slot in buf.chunks_exact(DIR_ENTRY_SIZE) {
                let first_byte = slot[0];
                let attr = slot[11];

                if attr == ATTR_LONG_NAME {
                    if first_byte != DELETED_MARKER {
                        let ldir = LongNameDirEntry::read_from_bytes(slot).unwrap();
                        pending_lfn.push(ldir.chars());
                    }
                    chain_offset += DIR_ENTRY_SIZE as u64;
                    continue;
                }

                if first_byte == 0x00 {
                    return Ok(None);
                }
                if first_byte == DELETED_MARKER || first_byte == KANJI_LEAD_BYTE {
                    pending_lfn.clear();
                    chain_offset += DIR_ENTRY_SIZE as u64;
                    continue;
                }

                let is_directory = attr & ATTR_DIRECTORY != 0;
                let matched = if !pending_lfn.is_empty() {
                    pending_lfn.concat() == name
                } else {
                    sfn_matches(slot, name)
                };
                pending_lfn.clear();

                if matched && !(skip_directories && is_directory) {
                    let dir_entry = DirEntry::read_from_bytes(slot).unwrap();
                    return Ok(Some(MatchedEntry {
                        dir_offset: chain_offset,
                        first_cluster: dir_entry.first_cluster(),
                        size: dir_entry.dir_filesize.get(),
                        is_dir: is_directory,
                    }));
                }
                chain_offset += DIR_ENTRY_SIZE as u64;
            }
        }

        Ok(None)
    }
}

/// The canonical short-name match rule (Design Note resolution): space is
/// padding, `.` separates base from extension, letters fold case per
/// `DIR_NTRes`, everything else compares exactly.
fn sfn_matches(slot: &[u8], name: &[u8]) -> bool {
    let ntres = slot[12];
    let base_lower = ntres & NTRES_BASE_LOWER != 0;
    let ext_lower = ntres & NTRES_EXT_LOWER != 0;

    let mut reconstructed = Vec::with_capacity(12);
    for &b in &slot[0..8] {
        if b == b' ' {
            continue;
        }
        reconstructed.push(fold(b, base_lower));
    }
    let ext: Vec<u8> = slot[8..11]
        .iter()
        .copied()
        .filter(|&b| b != b' ')
        .map(|b| fold(b, ext_lower))
        .collect();
    if !ext.is_empty() {
        reconstructed.push(b'.');
        reconstructed.extend(ext);
    }
    reconstructed == name
}

fn fold(byte: u8, lower: bool) -> u8 {
    if lower && byte.is_ascii_uppercase() {
        byte.to_ascii_lowercase()
    } else {
        byte
    }
}
