//! The `ImageStream` resource and image reference helpers
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    NamespaceResourceScope,
};
use serde::{Deserialize, Serialize};

/// Tag used when a reference names a stream without one
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Reference kinds that point at image streams rather than registries
pub const IMAGE_STREAM_TAG_KIND: &str = "ImageStreamTag";
pub const IMAGE_STREAM_IMAGE_KIND: &str = "ImageStreamImage";
pub const IMAGE_STREAM_KIND: &str = "ImageStream";
pub const DOCKER_IMAGE_KIND: &str = "DockerImage";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageStream {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImageStreamSpec,
    #[serde(default)]
    pub status: ImageStreamStatus,
}

impl_resource!(
    ImageStream,
    group = "image.openshift.io",
    version = "v1",
    kind = "ImageStream",
    plural = "imagestreams",
    scope = NamespaceResourceScope
);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    pub name: String,
    #[serde(default)]
    pub reference_policy: TagReferencePolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagReferencePolicy {
    #[serde(rename = "type", default)]
    pub type_: TagReferencePolicyType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagReferencePolicyType {
    /// Consumers pull from the original registry
    #[default]
    Source,
    /// Consumers pull through the integrated registry
    Local,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    /// Location of the stream in the integrated registry, empty until the registry is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_docker_image_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<NamedTagEventList>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedTagEventList {
    pub tag: String,
    /// Newest first
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Time>,
    pub docker_image_reference: String,
    /// Image id, usually a `sha256:` digest
    pub image: String,
    #[serde(default)]
    pub generation: i64,
}

impl ImageStream {
    /// Registry location of the stream, if the integrated registry has published one
    pub fn repository(&self) -> Option<&str> {
        self.status
            .docker_image_repository
            .as_deref()
            .filter(|r| !r.is_empty())
    }

    /// Most recent tag event for `tag`
    pub fn latest_tag_event(&self, tag: &str) -> Option<&TagEvent> {
        self.status
            .tags
            .iter()
            .find(|t| t.tag == tag)
            .and_then(|t| t.items.first())
    }

    /// Pull spec of the image most recently tagged `tag`
    ///
    /// Honors a `Local` reference policy on the matching spec tag by pointing at the
    /// integrated registry by digest.
    pub fn latest_tagged_image(&self, tag: &str) -> Option<String> {
        let tag = if tag.is_empty() { DEFAULT_IMAGE_TAG } else { tag };
        let event = self.latest_tag_event(tag)?;
        let local = self
            .spec
            .tags
            .iter()
            .find(|t| t.name == tag)
            .is_some_and(|t| t.reference_policy.type_ == TagReferencePolicyType::Local);
        match self.repository() {
            Some(repo) if local && !event.image.is_empty() => Some(format!("{repo}@{}", event.image)),
            _ => Some(event.docker_image_reference.clone()),
        }
    }

    /// All tag events whose image id matches `image_id` exactly or by digest prefix
    pub fn events_matching_image(&self, image_id: &str) -> Vec<&TagEvent> {
        let mut events: Vec<&TagEvent> = self
            .status
            .tags
            .iter()
            .flat_map(|t| t.items.iter())
            .filter(|e| digest_or_image_matches(&e.image, image_id))
            .collect();
        events.dedup_by(|a, b| a.image == b.image);
        events
    }
}

/// Whether `image` is the image named by `image_id`
///
/// `image_id` may be a full `algorithm:hex` digest or a prefix of the hex part.
pub fn digest_or_image_matches(image: &str, image_id: &str) -> bool {
    if image_id.is_empty() {
        return false;
    }
    match image.split_once(':') {
        Some((_, hex)) => hex.starts_with(image_id) || image.starts_with(image_id),
        None => image.starts_with(image_id),
    }
}

/// Splits `name:tag`, defaulting the tag
///
/// The boolean reports whether a tag was present.
pub fn split_image_stream_tag(name_and_tag: &str) -> (&str, &str, bool) {
    match name_and_tag.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => (name, tag, true),
        Some((name, _)) => (name, DEFAULT_IMAGE_TAG, true),
        None => (name_and_tag, DEFAULT_IMAGE_TAG, false),
    }
}

/// Splits `name@id`
pub fn split_image_stream_image(name_and_id: &str) -> Option<(&str, &str)> {
    name_and_id
        .split_once('@')
        .filter(|(name, id)| !name.is_empty() && !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(policy: TagReferencePolicyType) -> ImageStream {
        ImageStream {
            spec: ImageStreamSpec {
                tags: vec![TagReference {
                    name: "latest".into(),
                    reference_policy: TagReferencePolicy { type_: policy },
                }],
            },
            status: ImageStreamStatus {
                docker_image_repository: Some("registry.svc:5000/app/ruby".into()),
                tags: vec![NamedTagEventList {
                    tag: "latest".into(),
                    items: vec![
                        TagEvent {
                            docker_image_reference: "quay.io/app/ruby@sha256:abcdef".into(),
                            image: "sha256:abcdef".into(),
                            ..TagEvent::default()
                        },
                        TagEvent {
                            docker_image_reference: "quay.io/app/ruby@sha256:012345".into(),
                            image: "sha256:012345".into(),
                            ..TagEvent::default()
                        },
                    ],
                }],
                ..ImageStreamStatus::default()
            },
            ..ImageStream::default()
        }
    }

    #[test]
    fn latest_tagged_image_follows_reference_policy() {
        let source = stream(TagReferencePolicyType::Source);
        assert_eq!(
            source.latest_tagged_image("").as_deref(),
            Some("quay.io/app/ruby@sha256:abcdef")
        );
        let local = stream(TagReferencePolicyType::Local);
        assert_eq!(
            local.latest_tagged_image("latest").as_deref(),
            Some("registry.svc:5000/app/ruby@sha256:abcdef")
        );
        assert_eq!(source.latest_tagged_image("2.7"), None);
    }

    #[test]
    fn image_matching() {
        let s = stream(TagReferencePolicyType::Source);
        assert_eq!(s.events_matching_image("0123").len(), 1);
        assert_eq!(s.events_matching_image("sha256:abcdef").len(), 1);
        assert!(s.events_matching_image("ffff").is_empty());
        assert!(!digest_or_image_matches("sha256:abc", ""));
    }

    #[test]
    fn splitting() {
        assert_eq!(split_image_stream_tag("ruby:2.7"), ("ruby", "2.7", true));
        assert_eq!(split_image_stream_tag("ruby"), ("ruby", "latest", false));
        assert_eq!(split_image_stream_image("ruby@sha256:abc"), Some(("ruby", "sha256:abc")));
        assert_eq!(split_image_stream_image("ruby"), None);
    }
}
