// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persisted enablement settings.
//!
//! The profiler starts before the SDK proper, so enablement is decided by
//! two keys a previous session persisted under the profiling suite. The
//! preferences store itself (CFPreferences on Apple platforms) is an
//! external collaborator behind [`PreferencesSource`]; this module owns
//! the keys, the clamping, and the read-then-delete contract so the next
//! session starts clean.

/// Preferences suite holding the profiling keys.
pub const PREFERENCES_SUITE_NAME: &str = "com.datadoghq.ios-sdk.profiling";

/// Boolean key: was profiling enabled by the previous session.
pub const IS_ENABLED_KEY: &str = "is_profiling_enabled";

/// Double key: sample rate percentage in `[0, 100]`.
pub const SAMPLE_RATE_KEY: &str = "profiling_sample_rate";

/// A key-value preferences store scoped to one suite.
pub trait PreferencesSource {
    fn read_bool(&self, key: &str) -> Option<bool>;
    fn read_f64(&self, key: &str) -> Option<f64>;
    fn delete(&self, key: &str);
}

/// Effective profiling settings for this session.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProfilingSettings {
    pub enabled: bool,
    /// Sample rate percentage, clamped to `[0, 100]`.
    pub sample_rate: f64,
}

impl Default for ProfilingSettings {
    /// Absent keys mean disabled at rate 0.
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.0,
        }
    }
}

/// Reads both keys and then deletes them, so enablement is re-evaluated by
/// the SDK on every launch rather than sticking forever.
pub fn load_and_reset(source: &dyn PreferencesSource) -> ProfilingSettings {
    let settings = ProfilingSettings {
        enabled: source.read_bool(IS_ENABLED_KEY).unwrap_or(false),
        sample_rate: clamp_sample_rate(source.read_f64(SAMPLE_RATE_KEY).unwrap_or(0.0)),
    };
    source.delete(IS_ENABLED_KEY);
    source.delete(SAMPLE_RATE_KEY);
    settings
}

/// Clamps a configured sample rate to the valid percentage range. NaN is
/// treated as 0.
pub fn clamp_sample_rate(rate: f64) -> f64 {
    if !(rate >= 0.0) {
        return 0.0;
    }
    rate.min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemorySource {
        bools: RefCell<HashMap<String, bool>>,
        floats: RefCell<HashMap<String, f64>>,
    }

    impl PreferencesSource for MemorySource {
        fn read_bool(&self, key: &str) -> Option<bool> {
            self.bools.borrow().get(key).copied()
        }

        fn read_f64(&self, key: &str) -> Option<f64> {
            self.floats.borrow().get(key).copied()
        }

        fn delete(&self, key: &str) {
            self.bools.borrow_mut().remove(key);
            self.floats.borrow_mut().remove(key);
        }
    }

    #[test]
    fn absent_keys_mean_disabled() {
        let source = MemorySource::default();
        let settings = load_and_reset(&source);
        assert_eq!(settings, ProfilingSettings::default());
    }

    #[test]
    fn reads_then_deletes_both_keys() {
        let source = MemorySource::default();
        source.bools.borrow_mut().insert(IS_ENABLED_KEY.into(), true);
        source
            .floats
            .borrow_mut()
            .insert(SAMPLE_RATE_KEY.into(), 42.5);

        let settings = load_and_reset(&source);
        assert!(settings.enabled);
        assert_eq!(settings.sample_rate, 42.5);

        // Next session starts clean.
        let settings = load_and_reset(&source);
        assert_eq!(settings, ProfilingSettings::default());
    }

    #[test]
    fn sample_rate_is_clamped() {
        assert_eq!(clamp_sample_rate(-5.0), 0.0);
        assert_eq!(clamp_sample_rate(0.0), 0.0);
        assert_eq!(clamp_sample_rate(55.5), 55.5);
        assert_eq!(clamp_sample_rate(160.0), 100.0);
        assert_eq!(clamp_sample_rate(f64::NAN), 0.0);
    }
}
