// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::mem::ManuallyDrop;
use std::ptr;

/// An owned byte buffer holding a serialized pprof profile, handed across
/// the C ABI.
///
/// # Ownership
///
/// The buffer owns its allocation. The C side must hand it back to
/// [`ddog_prof_EncodedProfile_drop`] exactly once; after that the struct is
/// an empty buffer and dropping again is a no-op.
#[repr(C)]
#[derive(Debug)]
pub struct EncodedProfile {
    pub ptr: *mut u8,
    pub len: usize,
    pub capacity: usize,
}

impl EncodedProfile {
    pub fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
            capacity: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }
}

impl From<Vec<u8>> for EncodedProfile {
    fn from(bytes: Vec<u8>) -> Self {
        let mut bytes = ManuallyDrop::new(bytes);
        Self {
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
            capacity: bytes.capacity(),
        }
    }
}

/// Frees the buffer and resets it to the empty state. Null and already
/// dropped buffers are fine.
///
/// # Safety
///
/// If non-null, `profile` must point at a valid `EncodedProfile` that came
/// from this library and has not been freed through another copy.
#[no_mangle]
pub unsafe extern "C" fn ddog_prof_EncodedProfile_drop(profile: *mut EncodedProfile) {
    let Some(profile) = profile.as_mut() else {
        return;
    };
    if !profile.ptr.is_null() {
        // SAFETY: ptr/len/capacity came from a Vec<u8> in From<Vec<u8>>.
        drop(Vec::from_raw_parts(profile.ptr, profile.len, profile.capacity));
    }
    *profile = EncodedProfile::empty();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_drops() {
        let mut encoded = EncodedProfile::from(vec![1u8, 2, 3]);
        assert!(!encoded.is_empty());
        assert_eq!(encoded.len, 3);
        // SAFETY: the bytes are alive until the drop call below.
        let contents = unsafe { std::slice::from_raw_parts(encoded.ptr, encoded.len) };
        assert_eq!(contents, &[1, 2, 3]);

        unsafe { ddog_prof_EncodedProfile_drop(&mut encoded) };
        assert!(encoded.is_empty());
        // Double drop is a no-op.
        unsafe { ddog_prof_EncodedProfile_drop(&mut encoded) };
        // Null is tolerated.
        unsafe { ddog_prof_EncodedProfile_drop(ptr::null_mut()) };
    }
}
