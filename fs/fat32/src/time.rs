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

use chrono::{Datelike, Timelike, Utc};

/// A FAT-packed date/time pair, plus the tenths-of-a-second creation
/// component that only `DIR_CrtTimeTenth` carries.
pub(crate) struct FatTimestamp {
    pub(crate) date: u16,
    pub(crate) time: u16,
    pub(crate) tenth: u8,
}

/// Packs the current wall-clock time into FAT's date/time encoding.
///
/// `DIR_CrtTime`'s seconds field only has 5 bits (2-second granularity), so
/// the whole second is halved; `DIR_CrtTimeTenth` preserves the dropped
/// half-second as tenths, following this engine's source convention of
/// `second * 10` rather than `(second % 2) * 10`.
pub(crate) fn now() -> FatTimestamp {
    let now = Utc::now();
    let date = ((now.year() - 1980).max(0) as u16) << 9 | (now.month() as u16) << 5 | now.day() as u16;
    let time = (now.hour() as u16) << 11 | (now.minute() as u16) << 5 | (now.second() >> 1) as u16;
    let tenth = (now.second() * 10) as u8;
    FatTimestamp { date, time, tenth }
}
