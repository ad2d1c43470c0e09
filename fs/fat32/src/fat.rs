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

use std::mem::size_of;

use imgtool_fs::Result;
use zerocopy::{little_endian::U32, FromBytes, IntoBytes};

use crate::FatVolume;

/// Any FAT entry at or above this value terminates a cluster chain.
pub(crate) const FAT_EOC_MIN: u32 = 0x0FFFFFF8;
/// First cluster a fresh allocation scan considers. Cluster 2 is the root
/// directory's preassigned cluster and is deliberately never handed out by
/// the allocator, matching the quirk of the engine this crate is modeled on.
const FAT_ALLOC_SCAN_START: u32 = 3;

impl FatVolume {
    pub(crate) fn fat_entry_offset(&self, fat_index: u32, cluster: u32) -> u64 {
        (self.fat_start + fat_index as u64 * self.fat_size_sectors as u64) * crate::SECTOR_SIZE
            + cluster as u64 * size_of::<u32>() as u64
    }

    /// Pure read of a single FAT entry from the primary (first) FAT copy.
    pub(crate) fn fat_lookup(&self, cluster: u32) -> Result<u32> {
        let mut raw = U32::new(0);
        self.data_storage
            .read(self.fat_entry_offset(0, cluster), raw.as_mut_bytes())?;
        Ok(raw.get())
    }

    fn fat_write_entry(&self, cluster: u32, value: u32) -> Result<()> {
        let raw = U32::new(value);
        for fat_index in 0..self.num_fats {
            self.data_storage
                .write(self.fat_entry_offset(fat_index, cluster), raw.as_bytes())?;
        }
        Ok(())
    }

    /// Walks `steps` hops starting at `start`. If the chain ends before all
    /// hops are taken and `allow_alloc` is set, extends it; otherwise
    /// returns the terminal cluster observed.
    pub(crate) fn fat_next(&self, start: u32, steps: u64, allow_alloc: bool) -> Result<u32> {
        let mut cluster = start;
        for _ in 0..steps {
            let next = self.fat_lookup(cluster)?;
            if next < FAT_EOC_MIN {
                cluster = next;
            } else if allow_alloc {
                cluster = self.fat_alloc(cluster, false)?;
            } else {
                return Ok(cluster);
            }
        }
        Ok(cluster)
    }

    /// Scans the first FAT from cluster 3 upward for the first free (zero)
    /// entry, marks it end-of-chain in every FAT copy, and, unless this is
    /// the first cluster of a new chain, links `last_cluster` to it.
    pub(crate) fn fat_alloc(&self, last_cluster: u32, is_first: bool) -> Result<u32> {
        let mut candidate = FAT_ALLOC_SCAN_START;
        loop {
            let mut raw = U32::new(0);
            self.data_storage
                .read(self.fat_entry_offset(0, candidate), raw.as_mut_bytes())?;
            if raw.get() == 0 {
                break;
            }
            candidate += 1;
        }

        self.fat_write_entry(candidate, FAT_EOC_MIN)?;
        if !is_first {
            self.fat_write_entry(last_cluster, candidate)?;
        }
        Ok(candidate)
    }

    /// Frees `cluster`'s FAT entry in every copy. If `last_cluster` is a
    /// real data cluster, re-links it to whatever `cluster` pointed to,
    /// unlinking `cluster` from the chain rather than truncating it.
    pub(crate) fn fat_free(&self, last_cluster: u32, cluster: u32) -> Result<()> {
        if last_cluster < FAT_ALLOC_SCAN_START && cluster < FAT_ALLOC_SCAN_START {
            return Ok(());
        }
        let relink = if last_cluster >= FAT_ALLOC_SCAN_START && cluster >= FAT_ALLOC_SCAN_START {
            Some(self.fat_lookup(cluster)?)
        } else {
            None
        };
        if let Some(next) = relink {
            self.fat_write_entry(last_cluster, next)?;
        }
        self.fat_write_entry(cluster, 0)?;
        Ok(())
    }

    pub(crate) fn cluster_offset(&self, cluster: u32) -> u64 {
        (self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster as u64)
            * crate::SECTOR_SIZE
    }
}

/// Iterates the on-disk cluster numbers of a chain starting at `first`,
/// stopping at (and not yielding) the end-of-chain marker.
pub(crate) struct ClusterChain<'a> {
    volume: &'a FatVolume,
    current: Option<u32>,
}

impl<'a> ClusterChain<'a> {
    pub(crate) fn new(volume: &'a FatVolume, first: u32) -> Self {
        Self {
            volume,
            current: Some(first),
        }
    }
}

impl<'a> Iterator for ClusterChain<'a> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.current?;
        if cluster < 2 || cluster >= FAT_EOC_MIN {
            self.current = None;
            return None;
        }
        match self.volume.fat_lookup(cluster) {
            Ok(next) => {
                self.current = Some(next);
                Some(Ok(cluster))
            }
            Err(error) => {
                self.current = None;
                Some(Err(error))
            }
        }
    }
}
