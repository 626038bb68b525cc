//! Well known label and annotation keys
//!
//! Builds are linked to their pods, build configs and siblings purely through these.

/// Annotation on a pod naming the build it runs
pub const BUILD_ANNOTATION: &str = "openshift.io/build.name";
/// Label on a pod naming the build it runs
pub const BUILD_LABEL: &str = "openshift.io/build.name";
/// Annotation on a build naming its pod
pub const BUILD_POD_NAME_ANNOTATION: &str = "openshift.io/build.pod-name";
/// Annotation on a build naming the build config that created it
pub const BUILD_CONFIG_ANNOTATION: &str = "openshift.io/build-config.name";
/// Label selecting all builds of a build config
pub const BUILD_CONFIG_LABEL: &str = "openshift.io/build-config.name";
/// Older spelling of [`BUILD_CONFIG_LABEL`]
pub const BUILD_CONFIG_LABEL_DEPRECATED: &str = "buildconfig";
/// Annotation holding the sequence number of a build within its build config
pub const BUILD_NUMBER_ANNOTATION: &str = "openshift.io/build.number";
/// Label holding the run policy of a build
pub const BUILD_RUN_POLICY_LABEL: &str = "openshift.io/build.start-policy";

/// Longest value a label may carry
pub const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Truncates a name so it can be used as a label value
pub fn label_value(name: &str) -> &str {
    match name.char_indices().nth(MAX_LABEL_VALUE_LENGTH) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}
