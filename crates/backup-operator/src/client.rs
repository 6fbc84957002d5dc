use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    client::Client as KubeClient,
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to list objects with label selector {label_selector:?}"))]
    ListResources {
        source: kube::Error,
        label_selector: String,
    },

    #[snafu(display("failed to create object {name:?}"))]
    CreateObject { source: kube::Error, name: String },

    #[snafu(display("failed to delete object {name:?}"))]
    DeleteObject { source: kube::Error, name: String },

    #[snafu(display("failed to patch status of object {name:?}"))]
    PatchStatus { source: kube::Error, name: String },
}

/// The reason an API request was rejected with, as reported in the returned `Status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
pub enum StatusReason {
    /// The object to create already exists. Status code 409.
    AlreadyExists,

    /// The requested object does not exist. Status code 404.
    NotFound,
}

/// Returns the status reason of a failed API request, if it is one we know about.
pub fn reason_for_error(error: &kube::Error) -> Option<StatusReason> {
    match error {
        kube::Error::Api(status) => status.reason.parse().ok(),
        _ => None,
    }
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [`kube::client::Client`] and provides some common functionality.
#[derive(Clone)]
pub struct Client {
    client: KubeClient,
    post_params: PostParams,
    merge_patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl Client {
    pub fn new(client: KubeClient, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            merge_patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
            // Dependents (the pods of a job) are removed in the background
            delete_params: DeleteParams {
                propagation_policy: Some(PropagationPolicy::Background),
                ..DeleteParams::default()
            },
        }
    }

    /// Returns a [`kube::client::Client`] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> KubeClient {
        self.client.clone()
    }

    /// Lists all objects in `namespace` matching `label_selector`.
    pub async fn list_with_label_selector<T>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<T>>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let list_params = ListParams::default().labels(label_selector);

        Ok(self
            .get_api::<T>(namespace)
            .list(&list_params)
            .await
            .with_context(|_| ListResourcesSnafu { label_selector })?
            .items)
    }

    /// Creates `resource`. Returns `false` instead of failing if the object already exists.
    pub async fn create_if_missing<T>(&self, resource: &T) -> Result<bool>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Serialize
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let namespace = resource.namespace().context(ObjectHasNoNamespaceSnafu)?;

        match self
            .get_api::<T>(&namespace)
            .create(&self.post_params, resource)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if reason_for_error(&error) == Some(StatusReason::AlreadyExists) => {
                Ok(false)
            }
            Err(source) => Err(Error::CreateObject {
                source,
                name: resource.name_any(),
            }),
        }
    }

    /// Deletes `resource` with background propagation. An object that is already gone is not an
    /// error.
    pub async fn delete<T>(&self, resource: &T) -> Result<()>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let namespace = resource.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let name = resource.name_any();

        match self
            .get_api::<T>(&namespace)
            .delete(&name, &self.delete_params)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if reason_for_error(&error) == Some(StatusReason::NotFound) => Ok(()),
            Err(source) => Err(Error::DeleteObject { source, name }),
        }
    }

    /// Sets the status of `resource` using a merge patch on its status subresource.
    ///
    /// Fields which are [`None`] in `status` are serialized as `null` and therefore removed.
    pub async fn merge_patch_status<T, S>(&self, resource: &T, status: &S) -> Result<T>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
        S: Debug + Serialize,
    {
        let namespace = resource.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let name = resource.name_any();

        let patch = serde_json::json!({ "status": status });

        self.get_api::<T>(&namespace)
            .patch_status(&name, &self.merge_patch_params, &Patch::Merge(&patch))
            .await
            .context(PatchStatusSnafu { name })
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub fn get_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}
