//! Deterministic names for the objects created on behalf of a build
use crate::{Build, ResourceExt};

/// Longest name a namespaced object may have
pub const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

const POD_SUFFIX: &str = "build";
const CA_CONFIG_MAP_SUFFIX: &str = "ca";
const SYSTEM_CONFIG_MAP_SUFFIX: &str = "sys-config";

/// Joins `base` and `suffix` with a dash, shortening `base` when the result is too long
///
/// Shortened names keep as much of `base` as fits and embed a hash of the full base so
/// distinct long names stay distinct.
pub fn get_name(base: &str, suffix: &str, max_length: usize) -> String {
    if max_length == 0 {
        return String::new();
    }
    let name = format!("{base}-{suffix}");
    if name.len() <= max_length {
        return name;
    }

    // room for "-<8 hex>-"
    match max_length.checked_sub(10 + suffix.len()) {
        Some(base_length) => format!("{}-{}-{suffix}", truncate(base, base_length), hash(base)),
        None => {
            let prefix = truncate(base, max_length.saturating_sub(9));
            let short = format!("{prefix}-{}", hash(&name));
            truncate(&short, max_length).to_owned()
        }
    }
}

/// Name of the pod that runs `build`
pub fn build_pod_name(build: &Build) -> String {
    get_name(&build.name_any(), POD_SUFFIX, DNS1123_SUBDOMAIN_MAX_LENGTH)
}

/// Name of the ConfigMap holding certificate authorities for `build`
pub fn build_ca_config_map_name(build: &Build) -> String {
    get_name(&build.name_any(), CA_CONFIG_MAP_SUFFIX, DNS1123_SUBDOMAIN_MAX_LENGTH)
}

/// Name of the ConfigMap holding registry configuration for `build`
pub fn build_system_config_map_name(build: &Build) -> String {
    get_name(&build.name_any(), SYSTEM_CONFIG_MAP_SUFFIX, DNS1123_SUBDOMAIN_MAX_LENGTH)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// 32 bit FNV-1a as 8 lower case hex digits
fn hash(s: &str) -> String {
    let hash = s
        .bytes()
        .fold(0x811c_9dc5_u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
    format!("{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_joined() {
        assert_eq!(get_name("ruby-1", "build", 253), "ruby-1-build");
        assert_eq!(get_name("ruby-1", "build", 0), "");
    }

    #[test]
    fn fnv_hash() {
        assert_eq!(hash(""), "811c9dc5");
        assert_eq!(hash("a"), "e40c292c");
    }

    #[test]
    fn long_names_are_hashed() {
        let base = "b".repeat(260);
        let name = get_name(&base, "build", 253);
        assert_eq!(name.len(), 253);
        assert!(name.ends_with(&format!("-{}-build", hash(&base))));
        assert_ne!(name, get_name(&"c".repeat(260), "build", 253));
    }

    #[test]
    fn long_suffix_is_dropped() {
        let suffix = "s".repeat(20);
        let name = get_name("ruby", &suffix, 20);
        assert_eq!(name, format!("ruby-{}", hash(&format!("ruby-{suffix}"))));
    }

    #[test]
    fn build_object_names() {
        let mut build = Build::default();
        build.metadata.name = Some("ruby-1".into());
        assert_eq!(build_pod_name(&build), "ruby-1-build");
        assert_eq!(build_ca_config_map_name(&build), "ruby-1-ca");
        assert_eq!(build_system_config_map_name(&build), "ruby-1-sys-config");
    }
}
