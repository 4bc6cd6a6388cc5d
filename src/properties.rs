// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime configuration properties.
//!
//! Properties are read once, when the objects depending on them are built, never from the middle
//! of a negotiation or allocation.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::format::MemoryLayout;

/// Overrides the layout of the zoom video output: 1 = pitch, 2 = tiled, 3 = block-linear.
pub const VIDEO_LAYOUT_PROPERTY: &str = "camera.mode.videolayout.flags";
/// Non-zero enables per-plane memory profile logging.
pub const MEMORY_PROFILE_PROPERTY: &str = "camera-memory-profile";

/// A string-keyed property store.
pub trait PropertyStore {
    fn get(&self, key: &str) -> Option<String>;
}

impl PropertyStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl PropertyStore for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// Reads properties from the process environment. `camera.mode.videolayout.flags` is looked up
/// as `CAMERA_MODE_VIDEOLAYOUT_FLAGS`.
#[derive(Debug, Default)]
pub struct EnvProperties;

impl EnvProperties {
    fn env_key(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

impl PropertyStore for EnvProperties {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::env_key(key)).ok()
    }
}

/// Reads an integer property, returning 0 when absent or malformed.
pub fn get_u32(store: &dyn PropertyStore, key: &str) -> u32 {
    let Some(value) = store.get(key) else {
        return 0;
    };

    value.trim().parse().unwrap_or_else(|_| {
        log::debug!("Ignoring malformed value {:?} for property {}", value, key);
        0
    })
}

/// The user's layout choice for the zoom video output, if any.
pub fn video_layout_override(store: &dyn PropertyStore) -> Option<MemoryLayout> {
    match get_u32(store, VIDEO_LAYOUT_PROPERTY) {
        0 => None,
        flags => {
            let layout = MemoryLayout::n(flags);
            if layout.is_none() {
                log::debug!("Ignoring invalid video layout flags {}", flags);
            }
            layout
        }
    }
}

pub fn memory_profile_enabled(store: &dyn PropertyStore) -> bool {
    get_u32(store, MEMORY_PROFILE_PROPERTY) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn missing_properties_use_defaults() {
        let props = store(&[]);
        assert_eq!(video_layout_override(&props), None);
        assert!(!memory_profile_enabled(&props));
    }

    #[test]
    fn video_layout_values() {
        assert_eq!(
            video_layout_override(&store(&[(VIDEO_LAYOUT_PROPERTY, "2")])),
            Some(MemoryLayout::Tiled)
        );
        assert_eq!(
            video_layout_override(&store(&[(VIDEO_LAYOUT_PROPERTY, "3")])),
            Some(MemoryLayout::BlockLinear)
        );
        assert_eq!(video_layout_override(&store(&[(VIDEO_LAYOUT_PROPERTY, "0")])), None);
        assert_eq!(video_layout_override(&store(&[(VIDEO_LAYOUT_PROPERTY, "7")])), None);
        assert_eq!(video_layout_override(&store(&[(VIDEO_LAYOUT_PROPERTY, "tiled")])), None);
    }

    #[test]
    fn memory_profile_flag() {
        assert!(memory_profile_enabled(&store(&[(MEMORY_PROFILE_PROPERTY, "1")])));
        assert!(!memory_profile_enabled(&store(&[(MEMORY_PROFILE_PROPERTY, "0")])));
    }

    #[test]
    fn env_key_mapping() {
        assert_eq!(EnvProperties::env_key(VIDEO_LAYOUT_PROPERTY), "CAMERA_MODE_VIDEOLAYOUT_FLAGS");
        assert_eq!(EnvProperties::env_key(MEMORY_PROFILE_PROPERTY), "CAMERA_MEMORY_PROFILE");
    }
}
