//! Resolution of image stream references to pull specs
use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::ObjectReference;
use kiln_core::{
    image::{
        split_image_stream_image, split_image_stream_tag, DEFAULT_IMAGE_TAG, DOCKER_IMAGE_KIND,
        IMAGE_STREAM_IMAGE_KIND, IMAGE_STREAM_KIND, IMAGE_STREAM_TAG_KIND,
    },
    update::BuildUpdate,
    Build, ImageStream, ResourceExt, StatusReason,
};
use kiln_runtime::events::NewEvent;
use tracing::debug;

use super::BuildController;
use crate::{Error, Result};

impl BuildController {
    /// Rewrites every image stream reference of `build` to a `DockerImage` reference
    ///
    /// While any stream is missing the build stays registered with the trigger index,
    /// so a change to one of those streams enqueues it again.
    pub(super) async fn resolve_image_references(
        &self,
        build: &mut Build,
        update: &mut BuildUpdate,
    ) -> Result<()> {
        let namespace = build.namespace().unwrap_or_default();
        let streams = unresolved_image_streams(build, &namespace)?;
        if streams.is_empty() {
            return Ok(());
        }
        let key = build.key();
        self.image_stream_triggers.add(&key, &streams);

        if let Err(err) = self.resolve_output_reference(build, &namespace) {
            update.set_reason(StatusReason::InvalidOutputReference);
            update.set_message("Output image could not be resolved.");
            if matches!(err, Error::NoIntegratedRegistry) {
                self.record(
                    build,
                    NewEvent::warning(
                        "InvalidOutput",
                        "Error starting build: an image stream cannot be used as build output because \
                         the integrated Docker registry is not configured",
                    ),
                )
                .await;
            }
            return Err(err);
        }

        let mut errors = Vec::new();
        for reference in input_references_mut(build) {
            let resolved = match reference.kind.as_deref() {
                Some(IMAGE_STREAM_TAG_KIND) => self.resolve_image_stream_tag(reference, &namespace),
                Some(IMAGE_STREAM_IMAGE_KIND) => self.resolve_image_stream_image(reference, &namespace),
                _ => continue,
            };
            match resolved {
                Ok(pull_spec) => {
                    debug!(from = ?reference.name, to = %pull_spec, "resolved image reference");
                    *reference = docker_image(pull_spec);
                }
                Err(err) => errors.push(err),
            }
        }
        if let Some(err) = Error::aggregate(errors) {
            update.set_reason(StatusReason::InvalidImageReference);
            update.set_message("Referenced image could not be resolved.");
            return Err(err);
        }

        self.image_stream_triggers.remove(&key, &streams);
        Ok(())
    }

    fn resolve_output_reference(&self, build: &mut Build, namespace: &str) -> Result<()> {
        let Some(to) = build.spec.output.to.as_mut() else {
            return Ok(());
        };
        let (name, tag) = match to.kind.as_deref() {
            Some(IMAGE_STREAM_KIND) => (to.name.clone().unwrap_or_default(), DEFAULT_IMAGE_TAG.to_owned()),
            Some(IMAGE_STREAM_TAG_KIND) => {
                let (name, tag) = parse_image_stream_tag(to.name.as_deref().unwrap_or_default())?;
                (name.to_owned(), tag.to_owned())
            }
            _ => return Ok(()),
        };
        let stream_namespace = reference_namespace(to, namespace);
        let stream = self.image_stream(&stream_namespace, &name)?;
        let repository = stream.repository().ok_or(Error::NoIntegratedRegistry)?;
        *to = docker_image(format!("{repository}:{tag}"));
        Ok(())
    }

    fn resolve_image_stream_tag(&self, reference: &ObjectReference, namespace: &str) -> Result<String> {
        let full = reference.name.as_deref().unwrap_or_default();
        let (name, tag) = parse_image_stream_tag(full)?;
        let namespace = reference_namespace(reference, namespace);
        self.image_stream(&namespace, name)?
            .latest_tagged_image(tag)
            .ok_or_else(|| Error::ImageStreamTagNotFound {
                namespace,
                name: full.to_owned(),
            })
    }

    fn resolve_image_stream_image(&self, reference: &ObjectReference, namespace: &str) -> Result<String> {
        let full = reference.name.as_deref().unwrap_or_default();
        let (name, id) = split_image_stream_image(full).ok_or(Error::InvalidImageReferences)?;
        let namespace = reference_namespace(reference, namespace);
        let stream = self.image_stream(&namespace, name)?;

        let events = stream.events_matching_image(id);
        let images: BTreeSet<&str> = events.iter().map(|e| e.image.as_str()).collect();
        match images.len() {
            0 => {
                return Err(Error::ImageNotFound {
                    namespace,
                    stream: name.to_owned(),
                    image: id.to_owned(),
                })
            }
            1 => {}
            _ => {
                return Err(Error::AmbiguousImage {
                    image: id.to_owned(),
                    matches: images.into_iter().collect::<Vec<_>>().join(", "),
                })
            }
        }
        events
            .last()
            .map(|e| e.docker_image_reference.clone())
            .filter(|pull_spec| !pull_spec.is_empty())
            .ok_or_else(|| Error::MissingPullSpec {
                namespace,
                name: full.to_owned(),
            })
    }

    fn image_stream(&self, namespace: &str, name: &str) -> Result<std::sync::Arc<ImageStream>> {
        self.stores
            .image_streams
            .get_namespaced(namespace, name)
            .ok_or_else(|| Error::ImageStreamNotFound {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })
    }
}

/// `namespace/name` keys of the image streams `build` refers to
pub(super) fn unresolved_image_streams(build: &Build, namespace: &str) -> Result<Vec<String>> {
    let mut streams = BTreeSet::new();
    for reference in all_references(build) {
        let full = reference.name.as_deref().unwrap_or_default();
        let name = match reference.kind.as_deref() {
            Some(IMAGE_STREAM_TAG_KIND) => parse_image_stream_tag(full)?.0,
            Some(IMAGE_STREAM_IMAGE_KIND) => {
                split_image_stream_image(full)
                    .ok_or(Error::InvalidImageReferences)?
                    .0
            }
            Some(IMAGE_STREAM_KIND) if !full.is_empty() => full,
            Some(IMAGE_STREAM_KIND) => return Err(Error::InvalidImageReferences),
            _ => continue,
        };
        streams.insert(format!("{}/{name}", reference_namespace(reference, namespace)));
    }
    Ok(streams.into_iter().collect())
}

fn parse_image_stream_tag(name_and_tag: &str) -> Result<(&str, &str)> {
    match split_image_stream_tag(name_and_tag) {
        (name, tag, true) if !name.is_empty() => Ok((name, tag)),
        _ => Err(Error::InvalidImageReferences),
    }
}

fn reference_namespace(reference: &ObjectReference, default: &str) -> String {
    reference
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn docker_image(pull_spec: String) -> ObjectReference {
    ObjectReference {
        kind: Some(DOCKER_IMAGE_KIND.to_owned()),
        name: Some(pull_spec),
        ..ObjectReference::default()
    }
}

fn all_references(build: &Build) -> impl Iterator<Item = &ObjectReference> {
    let strategy = &build.spec.strategy;
    strategy
        .source_strategy
        .as_ref()
        .map(|s| &s.from)
        .into_iter()
        .chain(strategy.docker_strategy.as_ref().and_then(|s| s.from.as_ref()))
        .chain(strategy.custom_strategy.as_ref().map(|s| &s.from))
        .chain(build.spec.source.images.iter().map(|i| &i.from))
        .chain(build.spec.output.to.as_ref())
}

/// The image inputs of a build: strategy image and source images
fn input_references_mut(build: &mut Build) -> impl Iterator<Item = &mut ObjectReference> {
    let strategy = &mut build.spec.strategy;
    strategy
        .source_strategy
        .as_mut()
        .map(|s| &mut s.from)
        .into_iter()
        .chain(strategy.docker_strategy.as_mut().and_then(|s| s.from.as_mut()))
        .chain(strategy.custom_strategy.as_mut().map(|s| &mut s.from))
        .chain(build.spec.source.images.iter_mut().map(|i| &mut i.from))
}
