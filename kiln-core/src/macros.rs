/// Implements the `k8s_openapi` resource traits for a locally defined object type
///
/// The type must have a `metadata: ObjectMeta` field.
macro_rules! impl_resource {
    (
        $ty:ty,
        group = $group:literal,
        version = $version:literal,
        kind = $kind:literal,
        plural = $plural:literal,
        scope = $scope:ty
    ) => {
        impl k8s_openapi::Resource for $ty {
            type Scope = $scope;

            const API_VERSION: &'static str = concat!($group, "/", $version);
            const GROUP: &'static str = $group;
            const KIND: &'static str = $kind;
            const URL_PATH_SEGMENT: &'static str = $plural;
            const VERSION: &'static str = $version;
        }

        impl k8s_openapi::Metadata for $ty {
            type Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

            fn metadata(&self) -> &Self::Ty {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Self::Ty {
                &mut self.metadata
            }
        }
    };
}
