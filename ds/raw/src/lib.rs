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
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use imgtool_ds::DataStorage;
use imgtool_err::{DsError, Error, Result};
use log::debug;

/// The "raw" (flat) block backend: selected when the image file extension
/// is literally `img`. There is only ever one backend kind.
pub struct DataStorageRaw {
    file: File,
}

impl DataStorageRaw {
    /// `check` + `init` collapsed into one fallible constructor: rejects any
    /// filename whose extension isn't exactly `img`, then opens the file for
    /// reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let accepted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "img");
        if !accepted {
            return Err(Error::Ds(DsError::UnknownImageFormat));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("opened raw image {}", path.display());
        Ok(Self { file })
    }
}

impl DataStorage for DataStorageRaw {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_img_extension() {
        let file = tempfile::Builder::new().suffix(".dat").tempfile().unwrap();
        let err = DataStorageRaw::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::Ds(DsError::UnknownImageFormat)));
    }

    #[test]
    fn round_trips_positioned_io() {
        let file = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        std::fs::write(file.path(), vec![0u8; 4096]).unwrap();
        let ds = DataStorageRaw::open(file.path()).unwrap();

        ds.write(512, b"hello").unwrap();
        let mut buf = [0u8; 5];
        ds.read(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
