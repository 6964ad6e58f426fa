// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw bindings to the dyld enumeration API and the Mach-O load-command
//! layout. Neither `mach2` nor `libc` exports `<mach-o/dyld.h>` or
//! `<mach-o/loader.h>`, so the handful of pieces the image cache needs are
//! declared here.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;

pub const SEG_PAGEZERO: &[u8; 16] = b"__PAGEZERO\0\0\0\0\0\0";

#[repr(C)]
pub struct mach_header {
    pub magic: u32,
    pub cputype: c_int,
    pub cpusubtype: c_int,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

#[repr(C)]
pub struct mach_header_64 {
    pub magic: u32,
    pub cputype: c_int,
    pub cpusubtype: c_int,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct load_command {
    pub cmd: u32,
    pub cmdsize: u32,
}

#[repr(C)]
pub struct segment_command_64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: c_int,
    pub initprot: c_int,
    pub nsects: u32,
    pub flags: u32,
}

#[repr(C)]
pub struct uuid_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub uuid: [u8; 16],
}

pub type AddImageCallback = extern "C" fn(mh: *const mach_header, vmaddr_slide: isize);

extern "C" {
    pub fn _dyld_image_count() -> u32;
    pub fn _dyld_get_image_header(image_index: u32) -> *const mach_header;
    pub fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
    pub fn _dyld_get_image_name(image_index: u32) -> *const c_char;

    /// Registers `callback` to run whenever dyld maps a new image. dyld
    /// also invokes it synchronously for every image already loaded, on the
    /// registering thread. There is no unregistration API.
    pub fn _dyld_register_func_for_add_image(callback: AddImageCallback);
}
