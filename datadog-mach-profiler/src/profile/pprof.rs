// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! pprof protobuf messages and the encoder from the aggregator's state.
//!
//! The message set mirrors the pprof `profile.proto` schema. Only the
//! pieces this profiler produces get populated: raw addresses with image
//! identity, no functions and no line information (symbolication happens
//! offline).

use prost::Message;

#[derive(Eq, Hash, PartialEq, ::prost::Message)]
pub struct Profile {
    #[prost(message, repeated, tag = "1")]
    pub sample_types: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
    #[prost(message, repeated, tag = "3")]
    pub mappings: Vec<Mapping>,
    #[prost(message, repeated, tag = "4")]
    pub locations: Vec<Location>,
    #[prost(message, repeated, tag = "5")]
    pub functions: Vec<Function>,
    #[prost(string, repeated, tag = "6")]
    pub string_table: Vec<String>,
    #[prost(int64, tag = "7")]
    pub drop_frames: i64,
    #[prost(int64, tag = "8")]
    pub keep_frames: i64,
    #[prost(int64, tag = "9")]
    pub time_nanos: i64,
    #[prost(int64, tag = "10")]
    pub duration_nanos: i64,
    #[prost(message, optional, tag = "11")]
    pub period_type: Option<ValueType>,
    #[prost(int64, tag = "12")]
    pub period: i64,
    #[prost(int64, repeated, tag = "13")]
    pub comment: Vec<i64>,
    #[prost(int64, tag = "14")]
    pub default_sample_type: i64,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, ::prost::Message)]
pub struct ValueType {
    /// Index into the string table.
    #[prost(int64, tag = "1")]
    pub r#type: i64,
    /// Index into the string table.
    #[prost(int64, tag = "2")]
    pub unit: i64,
}

#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord, ::prost::Message)]
pub struct Sample {
    #[prost(uint64, repeated, tag = "1")]
    pub location_ids: Vec<u64>,
    #[prost(int64, repeated, tag = "2")]
    pub values: Vec<i64>,
    #[prost(message, repeated, tag = "3")]
    pub labels: Vec<Label>,
}

#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct Label {
    #[prost(int64, tag = "1")]
    pub key: i64,
    #[prost(int64, tag = "2")]
    pub str: i64,
    #[prost(int64, tag = "3")]
    pub num: i64,
    #[prost(int64, tag = "4")]
    pub num_unit: i64,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, ::prost::Message)]
pub struct Mapping {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub memory_start: u64,
    #[prost(uint64, tag = "3")]
    pub memory_limit: u64,
    #[prost(uint64, tag = "4")]
    pub file_offset: u64,
    /// Index into the string table.
    #[prost(int64, tag = "5")]
    pub filename: i64,
    /// Index into the string table.
    #[prost(int64, tag = "6")]
    pub build_id: i64,
    #[prost(bool, tag = "7")]
    pub has_functions: bool,
    #[prost(bool, tag = "8")]
    pub has_filenames: bool,
    #[prost(bool, tag = "9")]
    pub has_line_numbers: bool,
    #[prost(bool, tag = "10")]
    pub has_inline_frames: bool,
}

#[derive(Clone, Eq, PartialEq, Hash, ::prost::Message)]
pub struct Location {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub mapping_id: u64,
    #[prost(uint64, tag = "3")]
    pub address: u64,
    #[prost(message, repeated, tag = "4")]
    pub lines: Vec<Line>,
    #[prost(bool, tag = "5")]
    pub is_folded: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, ::prost::Message)]
pub struct Line {
    #[prost(uint64, tag = "1")]
    pub function_id: u64,
    #[prost(int64, tag = "2")]
    pub line: i64,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, ::prost::Message)]
pub struct Function {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Index into the string table.
    #[prost(int64, tag = "2")]
    pub name: i64,
    /// Index into the string table.
    #[prost(int64, tag = "3")]
    pub system_name: i64,
    /// Index into the string table.
    #[prost(int64, tag = "4")]
    pub filename: i64,
}

/// Builds the pprof message from the aggregator without mutating it.
pub fn to_pprof(profile: &super::Profile) -> Profile {
    let wall_time = ValueType {
        r#type: profile.wall_time_id().to_raw_id(),
        unit: profile.nanoseconds_id().to_raw_id(),
    };

    Profile {
        sample_types: vec![wall_time],
        samples: profile
            .samples()
            .iter()
            .map(|sample| Sample {
                location_ids: sample.location_ids.iter().map(|&id| id as u64).collect(),
                values: sample.values.clone(),
                labels: sample
                    .labels
                    .iter()
                    .map(|label| Label {
                        key: label.key.to_raw_id(),
                        str: label.str.to_raw_id(),
                        num: label.num,
                        num_unit: label.num_unit.to_raw_id(),
                    })
                    .collect(),
            })
            .collect(),
        mappings: profile
            .mappings()
            .enumerate()
            .map(|(index, mapping)| Mapping {
                id: index as u64 + 1,
                memory_start: mapping.memory_start,
                filename: mapping.filename.to_raw_id(),
                build_id: mapping.build_id.to_raw_id(),
                ..Default::default()
            })
            .collect(),
        locations: profile
            .locations()
            .enumerate()
            .map(|(index, location)| Location {
                id: index as u64 + 1,
                mapping_id: location.mapping_id as u64,
                address: location.address,
                // No inlined line information; symbolication is offline.
                lines: Vec::new(),
                is_folded: false,
            })
            .collect(),
        functions: Vec::new(),
        string_table: profile.strings().iter().map(str::to_string).collect(),
        period_type: Some(wall_time),
        period: profile.sampling_interval_ns() as i64,
        ..Default::default()
    }
}

/// Serializes the aggregator to a pprof protobuf buffer.
pub fn serialize(profile: &super::Profile) -> anyhow::Result<Vec<u8>> {
    let message = to_pprof(profile);
    let mut buffer = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buffer)?;
    Ok(buffer)
}
