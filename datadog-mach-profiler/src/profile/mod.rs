// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The profile aggregator: deduplicates strings, mappings, and locations
//! across captured traces and accumulates samples in arrival order.
//!
//! The aggregator is single-writer by design; all mutation happens on the
//! resolver worker. Trace timestamps arrive as monotonic uptime and are
//! converted to wall-clock epoch nanoseconds with an offset computed once
//! at construction.

pub mod pprof;

use crate::clock;
use crate::types::{BinaryImage, StackFrame, StackTrace};
use indexmap::{IndexMap, IndexSet};
use std::hash::BuildHasherDefault;

pub(crate) type FxIndexSet<K> = IndexSet<K, BuildHasherDefault<rustc_hash::FxHasher>>;
pub(crate) type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Offset of a string in the profile's string table. Id 0 is always the
/// empty string.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct StringId(u32);

impl StringId {
    pub const ZERO: StringId = StringId(0);

    fn from_offset(offset: usize) -> Self {
        #[allow(clippy::expect_used)]
        Self(offset.try_into().expect("StringId to fit into a u32"))
    }

    #[inline]
    pub fn to_raw_id(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub fn to_offset(self) -> usize {
        self.0 as usize
    }
}

/// Holds unique strings; ids correspond to insertion order.
#[derive(Clone)]
pub struct StringTable {
    strings: FxIndexSet<Box<str>>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    /// A new table holding the empty string at id 0 and nothing else.
    pub fn new() -> Self {
        let mut strings = FxIndexSet::default();
        strings.insert("".into());
        Self { strings }
    }

    pub fn intern(&mut self, value: &str) -> StringId {
        if let Some(offset) = self.strings.get_index_of(value) {
            return StringId::from_offset(offset);
        }
        let (offset, _) = self.strings.insert_full(value.into());
        StringId::from_offset(offset)
    }

    pub fn get(&self, id: StringId) -> Option<&str> {
        self.strings.get_index(id.to_offset()).map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(AsRef::as_ref)
    }
}

/// One binary mapping, deduplicated by its start address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub memory_start: u64,
    pub filename: StringId,
    pub build_id: StringId,
}

/// One code location, deduplicated by instruction address. `mapping_id` is
/// 1-based, matching the pprof convention.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Location {
    pub mapping_id: u32,
    pub address: u64,
}

/// A mixed string/numeric sample label.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Label {
    pub key: StringId,
    pub str: StringId,
    pub num: i64,
    pub num_unit: StringId,
}

impl Label {
    pub fn num(key: StringId, num: i64, num_unit: StringId) -> Self {
        Self {
            key,
            str: StringId::ZERO,
            num,
            num_unit,
        }
    }

    pub fn str(key: StringId, value: StringId) -> Self {
        Self {
            key,
            str: value,
            num: 0,
            num_unit: StringId::ZERO,
        }
    }
}

/// One aggregated sample: a stack (leaf to root, as 1-based location ids),
/// its labels, and the sampled value.
#[derive(Clone, Debug)]
pub struct Sample {
    pub location_ids: Vec<u32>,
    pub labels: Vec<Label>,
    pub values: Vec<i64>,
    pub timestamp_ns: u64,
}

/// The deduplicating profile aggregator.
#[derive(Clone)]
pub struct Profile {
    sampling_interval_ns: u64,
    strings: StringTable,
    /// Keyed by `memory_start`; insertion order is the 1-based mapping id.
    mappings: FxIndexMap<u64, Mapping>,
    /// Keyed by instruction address; insertion order is the 1-based id.
    locations: FxIndexMap<u64, Location>,
    samples: Vec<Sample>,
    start_timestamp_ns: u64,
    end_timestamp_ns: u64,
    epoch_offset_ns: i64,

    wall_time: StringId,
    nanoseconds: StringId,
    end_timestamp_key: StringId,
    thread_id_key: StringId,
    thread_name_key: StringId,
}

impl Profile {
    pub fn new(sampling_interval_ns: u64) -> Self {
        let mut strings = StringTable::new();
        let wall_time = strings.intern("wall-time");
        let nanoseconds = strings.intern("nanoseconds");
        let end_timestamp_key = strings.intern("end_timestamp_ns");
        let thread_id_key = strings.intern("thread id");
        let thread_name_key = strings.intern("thread name");

        Self {
            sampling_interval_ns,
            strings,
            mappings: FxIndexMap::default(),
            locations: FxIndexMap::default(),
            samples: Vec::new(),
            start_timestamp_ns: 0,
            end_timestamp_ns: 0,
            epoch_offset_ns: clock::uptime_epoch_offset_ns(),
            wall_time,
            nanoseconds,
            end_timestamp_key,
            thread_id_key,
            thread_name_key,
        }
    }

    /// Consumes a batch of resolved traces, interning frames and appending
    /// one sample per trace in batch order.
    pub fn add_samples(&mut self, traces: Vec<StackTrace>) {
        for trace in traces {
            // Empty traces are dropped at capture; tolerate them anyway.
            if trace.frames.is_empty() {
                continue;
            }

            let location_ids = trace
                .frames
                .iter()
                .map(|frame| self.intern_frame(frame))
                .collect();

            let mut labels = Vec::with_capacity(3);
            labels.push(Label::num(
                self.end_timestamp_key,
                self.uptime_ns_to_epoch_ns(trace.timestamp_ns),
                self.nanoseconds,
            ));
            labels.push(Label::num(
                self.thread_id_key,
                trace.tid as i64,
                StringId::ZERO,
            ));
            if let Some(name) = trace.thread_name.as_deref() {
                let value = self.strings.intern(name);
                labels.push(Label::str(self.thread_name_key, value));
            }

            self.samples.push(Sample {
                location_ids,
                labels,
                values: vec![trace.sampling_interval_ns as i64],
                timestamp_ns: trace.timestamp_ns,
            });

            if self.start_timestamp_ns == 0 || trace.timestamp_ns < self.start_timestamp_ns {
                self.start_timestamp_ns = trace.timestamp_ns;
            }
            if self.end_timestamp_ns < trace.timestamp_ns {
                self.end_timestamp_ns = trace.timestamp_ns;
            }
        }
    }

    /// Converts a monotonic uptime reading to wall-clock epoch nanoseconds.
    pub fn uptime_ns_to_epoch_ns(&self, uptime_ns: u64) -> i64 {
        uptime_ns as i64 + self.epoch_offset_ns
    }

    fn intern_frame(&mut self, frame: &StackFrame) -> u32 {
        // A frame the resolver could not attribute still gets interned,
        // under the null image, so the sample keeps its shape.
        let mapping_id = match frame.image.as_ref() {
            Some(image) => self.intern_mapping(image),
            None => self.intern_mapping(&BinaryImage::default()),
        };
        if let Some(offset) = self.locations.get_index_of(&frame.instruction_ptr) {
            return offset as u32 + 1;
        }
        self.locations.insert(
            frame.instruction_ptr,
            Location {
                mapping_id,
                address: frame.instruction_ptr,
            },
        );
        self.locations.len() as u32
    }

    fn intern_mapping(&mut self, image: &BinaryImage) -> u32 {
        if let Some(offset) = self.mappings.get_index_of(&image.load_address) {
            return offset as u32 + 1;
        }
        let filename = match image.filename.as_deref() {
            Some(name) => self.strings.intern(name),
            None => StringId::ZERO,
        };
        let build_id = self.strings.intern(&uuid_string(&image.uuid));
        self.mappings.insert(
            image.load_address,
            Mapping {
                memory_start: image.load_address,
                filename,
                build_id,
            },
        );
        self.mappings.len() as u32
    }

    pub fn sampling_interval_ns(&self) -> u64 {
        self.sampling_interval_ns
    }

    /// Earliest sample timestamp (monotonic uptime ns), or 0 if empty.
    pub fn start_timestamp_ns(&self) -> u64 {
        self.start_timestamp_ns
    }

    /// Latest sample timestamp (monotonic uptime ns), or 0 if empty.
    pub fn end_timestamp_ns(&self) -> u64 {
        self.end_timestamp_ns
    }

    /// Observed span between the first and last sample.
    pub fn duration_ns(&self) -> u64 {
        self.end_timestamp_ns.saturating_sub(self.start_timestamp_ns)
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Mappings in insertion order; position + 1 is the pprof mapping id.
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    /// Locations in insertion order; position + 1 is the pprof location id.
    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub(crate) fn wall_time_id(&self) -> StringId {
        self.wall_time
    }

    pub(crate) fn nanoseconds_id(&self) -> StringId {
        self.nanoseconds
    }
}

/// Formats a 16-byte image UUID in the conventional uppercase hyphenated
/// form used as a pprof build id.
pub fn uuid_string(uuid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        uuid[0], uuid[1], uuid[2], uuid[3],
        uuid[4], uuid[5], uuid[6], uuid[7],
        uuid[8], uuid[9], uuid[10], uuid[11],
        uuid[12], uuid[13], uuid[14], uuid[15],
    )
}
