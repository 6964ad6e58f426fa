// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary-image resolution: mapping instruction pointers to the Mach-O
//! image that contains them.
//!
//! The cache is populated two ways: a dyld add-image callback (which dyld
//! also fires synchronously for every image already loaded at registration
//! time) and a low-priority prewarmer thread that walks the dyld image list
//! explicitly. Lookups that miss the cache fall back to `dladdr` plus a
//! bounded parse of the image's load commands, and the result is inserted
//! for next time.
//!
//! dyld callbacks cannot be unregistered, so the live cache is published
//! through a mutex-protected nullable global; once the cache is dropped,
//! late callbacks find `None` and return without touching freed state.

pub(crate) mod dyld;

use crate::types::BinaryImage;
use dyld::{
    load_command, mach_header, mach_header_64, segment_command_64, uuid_command, LC_SEGMENT_64,
    LC_UUID, MH_MAGIC_64, SEG_PAGEZERO,
};
use crate::memory::is_valid_userspace_addr;
use std::ffi::CStr;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Upper bound for `ncmds`; typical executables carry 20-50 load commands.
const MAX_LOAD_COMMANDS: u32 = 1000;

/// Upper bound for a single load command; most are under 1 KiB.
const MAX_LOAD_COMMAND_SIZE: u32 = 0x10000;

fn is_valid_load_command_count(ncmds: u32) -> bool {
    ncmds > 0 && ncmds <= MAX_LOAD_COMMANDS
}

fn is_valid_load_command_size(cmdsize: u32) -> bool {
    cmdsize >= mem::size_of::<load_command>() as u32 && cmdsize <= MAX_LOAD_COMMAND_SIZE
}

/// Unslid address span and UUID extracted from an image's load commands.
struct ParsedImage {
    vm_low: u64,
    vm_high: u64,
    uuid: [u8; 16],
    found_uuid: bool,
}

/// Scans the load commands of a 64-bit Mach-O header in memory.
///
/// Only `MH_MAGIC_64` headers are accepted. A header whose `ncmds` is out
/// of bounds is rejected outright; a load command with an out-of-bounds
/// `cmdsize` truncates the scan at that command. These bounds catch corrupt
/// or adversarial images without parsing further.
///
/// # Safety
///
/// `header` must point to a mapped Mach-O header whose load commands are
/// readable, as reported by dyld or dladdr.
unsafe fn parse_load_commands(header: *const mach_header) -> Option<ParsedImage> {
    if header.is_null() {
        return None;
    }
    let header64: mach_header_64 = ptr::read_unaligned(header.cast());
    if header64.magic != MH_MAGIC_64 {
        return None;
    }
    if !is_valid_load_command_count(header64.ncmds) {
        return None;
    }

    let mut parsed = ParsedImage {
        vm_low: u64::MAX,
        vm_high: 0,
        uuid: [0; 16],
        found_uuid: false,
    };

    let mut cmd_ptr = header.cast::<u8>().add(mem::size_of::<mach_header_64>());
    for _ in 0..header64.ncmds {
        let lc: load_command = ptr::read_unaligned(cmd_ptr.cast());
        if !is_valid_load_command_size(lc.cmdsize) {
            break;
        }
        match lc.cmd {
            LC_SEGMENT_64 if lc.cmdsize as usize >= mem::size_of::<segment_command_64>() => {
                let seg: segment_command_64 = ptr::read_unaligned(cmd_ptr.cast());
                if &seg.segname != SEG_PAGEZERO {
                    parsed.vm_low = parsed.vm_low.min(seg.vmaddr);
                    parsed.vm_high = parsed.vm_high.max(seg.vmaddr.saturating_add(seg.vmsize));
                }
            }
            LC_UUID if lc.cmdsize as usize >= mem::size_of::<uuid_command>() => {
                let uuid_cmd: uuid_command = ptr::read_unaligned(cmd_ptr.cast());
                parsed.uuid = uuid_cmd.uuid;
                parsed.found_uuid = true;
            }
            _ => {}
        }
        cmd_ptr = cmd_ptr.add(lc.cmdsize as usize);
    }

    if parsed.vm_low == u64::MAX || parsed.vm_high <= parsed.vm_low {
        return None;
    }
    Some(parsed)
}

/// One cached image with the `[start, end)` range it occupies in memory.
/// `start` equals the image's load address (the header is the first mapped
/// byte of `__TEXT`).
struct ImageSpan {
    start: u64,
    end: u64,
    uuid: [u8; 16],
    filename: Option<String>,
}

impl ImageSpan {
    fn to_image(&self) -> BinaryImage {
        BinaryImage {
            load_address: self.start,
            uuid: self.uuid,
            // Each frame gets its own copy so traces are self-contained.
            filename: self.filename.clone(),
        }
    }
}

struct ImageCacheInner {
    /// Sorted by `start` for binary-search lookup by instruction pointer.
    spans: Mutex<Vec<ImageSpan>>,
}

impl ImageCacheInner {
    fn add_span(&self, span: ImageSpan) {
        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = spans.partition_point(|s| s.start < span.start);
        // Lost the race with another populator; drop the duplicate copy.
        if spans.get(idx).is_some_and(|s| s.start == span.start) {
            return;
        }
        spans.insert(idx, span);
    }

    /// # Safety
    ///
    /// `header` must be an image header reported by dyld.
    unsafe fn add_image(&self, header: *const mach_header, slide: isize, filename: Option<String>) {
        let Some(parsed) = parse_load_commands(header) else {
            return;
        };
        let start = parsed.vm_low.wrapping_add_signed(slide as i64);
        let end = parsed.vm_high.wrapping_add_signed(slide as i64);
        self.add_span(ImageSpan {
            start,
            end,
            uuid: parsed.uuid,
            filename,
        });
    }

    fn lookup(&self, ip: u64) -> Option<BinaryImage> {
        let spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = spans.partition_point(|s| s.start <= ip);
        let span = &spans[idx.checked_sub(1)?];
        (ip < span.end).then(|| span.to_image())
    }

    fn len(&self) -> usize {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Protects the published cache pointer itself, so the dyld callback and
/// cache teardown cannot race on it. The instance mutex inside
/// [`ImageCacheInner`] protects the span vector.
static REGISTERED_CACHE: Mutex<Option<Arc<ImageCacheInner>>> = Mutex::new(None);

extern "C" fn dyld_add_image_callback(header: *const mach_header, vmaddr_slide: isize) {
    let registered = REGISTERED_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let Some(inner) = registered.as_ref() else {
        return;
    };
    if header.is_null() {
        return;
    }
    let filename = image_name_via_dladdr(header.cast());
    // SAFETY: dyld hands us a mapped image header.
    unsafe { inner.add_image(header, vmaddr_slide, filename) };
}

fn image_name_via_dladdr(addr: *const libc::c_void) -> Option<String> {
    // SAFETY: Dl_info is a plain output struct; dladdr tolerates any addr.
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    // SAFETY: info is a valid out pointer for the duration of the call.
    if unsafe { libc::dladdr(addr, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    // SAFETY: dladdr returned a NUL-terminated image path.
    let name = unsafe { CStr::from_ptr(info.dli_fname) };
    Some(name.to_string_lossy().into_owned())
}

/// Cache of loaded binary images with `O(log n)` lookup by instruction
/// pointer.
///
/// The cache mutex is only ever taken by the resolver worker, the dyld
/// callback, and the prewarmer; it is never held while a thread is
/// suspended.
pub struct ImageCache {
    inner: Arc<ImageCacheInner>,
    started: AtomicBool,
    prewarmer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ImageCacheInner {
                spans: Mutex::new(Vec::new()),
            }),
            started: AtomicBool::new(false),
            prewarmer: Mutex::new(None),
        }
    }

    /// Publishes the cache, registers the dyld add-image callback (which
    /// synchronously back-fills every image already loaded), and spawns a
    /// utility-priority thread that walks the dyld image list as a second
    /// population pass. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, SeqCst) {
            return Ok(());
        }

        {
            let mut registered = REGISTERED_CACHE
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *registered = Some(Arc::clone(&self.inner));
        }
        // Registration must happen after the lock above is released: dyld
        // invokes the callback synchronously and it takes the same lock.
        unsafe { dyld::_dyld_register_func_for_add_image(dyld_add_image_callback) };

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("com.datadoghq.profiler.images".into())
            .spawn(move || {
                crate::set_current_thread_qos(libc::qos_class_t::QOS_CLASS_UTILITY);
                enumerate_loaded_images(&inner);
            })?;
        *self
            .prewarmer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Fills in the image containing `ip`, or returns `None`.
    ///
    /// Misses fall back to `dladdr` to cover images loaded between
    /// enumeration and the first notification; a successful fallback is
    /// inserted into the cache.
    pub fn resolve(&self, ip: u64) -> Option<BinaryImage> {
        if !is_valid_userspace_addr(ip) {
            return None;
        }
        if let Some(image) = self.inner.lookup(ip) {
            return Some(image);
        }
        let (image, span_len) = resolve_via_dladdr(ip)?;
        self.inner.add_span(ImageSpan {
            start: image.load_address,
            end: image.load_address.saturating_add(span_len),
            uuid: image.uuid,
            filename: image.filename.clone(),
        });
        Some(image)
    }

    /// Number of images currently cached.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        // Null the published pointer so late dyld callbacks become no-ops.
        {
            let mut registered = REGISTERED_CACHE
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if registered
                .as_ref()
                .is_some_and(|r| Arc::ptr_eq(r, &self.inner))
            {
                *registered = None;
            }
        }
        let handle = self
            .prewarmer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn enumerate_loaded_images(inner: &ImageCacheInner) {
    // SAFETY: the dyld enumeration API has no preconditions. Indices can
    // race with image loads, so null headers and names are tolerated.
    unsafe {
        let count = dyld::_dyld_image_count();
        for i in 0..count {
            let header = dyld::_dyld_get_image_header(i);
            if header.is_null() {
                continue;
            }
            let slide = dyld::_dyld_get_image_vmaddr_slide(i);
            let name_ptr = dyld::_dyld_get_image_name(i);
            let filename = if name_ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(name_ptr).to_string_lossy().into_owned())
            };
            inner.add_image(header, slide, filename);
        }
    }
    log::debug!("image prewarm pass cached {} images", inner.len());
}

/// Cache-free lookup, for when image-cache startup failed and profiling
/// continues on the slow path.
pub(crate) fn resolve_uncached(ip: u64) -> Option<BinaryImage> {
    if !is_valid_userspace_addr(ip) {
        return None;
    }
    resolve_via_dladdr(ip).map(|(image, _)| image)
}

/// dladdr-based lookup used when the cache misses. Requires the image to
/// carry an `LC_UUID`; load address and UUID are what the mapping needs.
/// Returns the image plus the length of its mapped span.
fn resolve_via_dladdr(ip: u64) -> Option<(BinaryImage, u64)> {
    // SAFETY: Dl_info is a plain output struct; ip was range-checked.
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    if unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) } == 0 {
        return None;
    }
    let fbase = info.dli_fbase as u64;
    if !is_valid_userspace_addr(fbase) {
        return None;
    }
    // SAFETY: dladdr reported fbase as a mapped image header.
    let parsed = unsafe { parse_load_commands(info.dli_fbase.cast()) }?;
    if !parsed.found_uuid {
        return None;
    }
    let filename = if info.dli_fname.is_null() {
        None
    } else {
        // SAFETY: dladdr returned a NUL-terminated image path.
        Some(unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned())
    };
    let image = BinaryImage {
        load_address: fbase,
        uuid: parsed.uuid,
        filename,
    };
    Some((image, parsed.vm_high - parsed.vm_low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_struct<T>(buf: &mut Vec<u8>, value: &T) {
        // SAFETY: T is one of the repr(C) load-command structs.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
        };
        buf.extend_from_slice(bytes);
    }

    fn segment(name: &[u8], vmaddr: u64, vmsize: u64) -> segment_command_64 {
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name);
        segment_command_64 {
            cmd: LC_SEGMENT_64,
            cmdsize: mem::size_of::<segment_command_64>() as u32,
            segname,
            vmaddr,
            vmsize,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }

    fn synthetic_image(ncmds: u32, commands: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_struct(
            &mut buf,
            &mach_header_64 {
                magic: MH_MAGIC_64,
                cputype: 0,
                cpusubtype: 0,
                filetype: 2,
                ncmds,
                sizeofcmds: commands.len() as u32,
                flags: 0,
                reserved: 0,
            },
        );
        buf.extend_from_slice(commands);
        buf
    }

    #[test]
    fn parses_segments_and_uuid() {
        let mut commands = Vec::new();
        push_struct(&mut commands, &segment(b"__PAGEZERO", 0, 0x1_0000_0000));
        push_struct(&mut commands, &segment(b"__TEXT", 0x1_0000_0000, 0x4000));
        push_struct(
            &mut commands,
            &segment(b"__DATA", 0x1_0000_4000, 0x2000),
        );
        push_struct(
            &mut commands,
            &uuid_command {
                cmd: LC_UUID,
                cmdsize: mem::size_of::<uuid_command>() as u32,
                uuid: [0xAB; 16],
            },
        );
        let image = synthetic_image(4, &commands);

        let parsed = unsafe { parse_load_commands(image.as_ptr().cast()) }.unwrap();
        assert_eq!(parsed.vm_low, 0x1_0000_0000);
        assert_eq!(parsed.vm_high, 0x1_0000_6000);
        assert!(parsed.found_uuid);
        assert_eq!(parsed.uuid, [0xAB; 16]);
    }

    #[test]
    fn rejects_bad_magic_and_command_counts() {
        let mut commands = Vec::new();
        push_struct(&mut commands, &segment(b"__TEXT", 0x1000, 0x1000));
        let mut image = synthetic_image(1, &commands);
        image[0] = 0; // corrupt the magic
        assert!(unsafe { parse_load_commands(image.as_ptr().cast()) }.is_none());

        let no_cmds = synthetic_image(0, &[]);
        assert!(unsafe { parse_load_commands(no_cmds.as_ptr().cast()) }.is_none());

        let too_many = synthetic_image(MAX_LOAD_COMMANDS + 1, &commands);
        assert!(unsafe { parse_load_commands(too_many.as_ptr().cast()) }.is_none());
    }

    #[test]
    fn truncates_scan_on_bad_cmdsize() {
        let mut commands = Vec::new();
        push_struct(&mut commands, &segment(b"__TEXT", 0x1000, 0x1000));
        // A command whose size is below sizeof(load_command) stops the walk
        // before the UUID that follows it.
        push_struct(
            &mut commands,
            &load_command {
                cmd: LC_UUID,
                cmdsize: 4,
            },
        );
        push_struct(
            &mut commands,
            &uuid_command {
                cmd: LC_UUID,
                cmdsize: mem::size_of::<uuid_command>() as u32,
                uuid: [1; 16],
            },
        );
        let image = synthetic_image(3, &commands);

        let parsed = unsafe { parse_load_commands(image.as_ptr().cast()) }.unwrap();
        assert_eq!(parsed.vm_low, 0x1000);
        assert!(!parsed.found_uuid);
    }

    #[test]
    fn span_insertion_deduplicates_by_start() {
        let inner = ImageCacheInner {
            spans: Mutex::new(Vec::new()),
        };
        for _ in 0..2 {
            inner.add_span(ImageSpan {
                start: 0x1000,
                end: 0x2000,
                uuid: [0; 16],
                filename: Some("a".into()),
            });
        }
        inner.add_span(ImageSpan {
            start: 0x3000,
            end: 0x4000,
            uuid: [0; 16],
            filename: None,
        });
        assert_eq!(inner.len(), 2);
        assert!(inner.lookup(0x1fff).is_some());
        assert!(inner.lookup(0x2000).is_none());
        assert!(inner.lookup(0x3000).is_some());
        assert!(inner.lookup(0x999).is_none());
    }

    #[test]
    fn resolves_own_code_through_real_dyld() {
        let cache = ImageCache::new();
        cache.start().unwrap();
        assert!(!cache.is_empty());

        let ip = resolves_own_code_through_real_dyld as usize as u64;
        let image = cache.resolve(ip).expect("test binary should resolve");
        assert!(is_valid_userspace_addr(image.load_address));
        assert_ne!(image.uuid, [0; 16]);
        assert!(image.filename.is_some());

        // Same image on a second lookup, by load address.
        let again = cache.resolve(ip).unwrap();
        assert_eq!(again.load_address, image.load_address);
    }

    #[test]
    fn rejects_invalid_instruction_pointers() {
        let cache = ImageCache::new();
        assert!(cache.resolve(0).is_none());
        assert!(cache.resolve(0x10).is_none());
        assert!(cache.resolve(u64::MAX).is_none());
    }
}
