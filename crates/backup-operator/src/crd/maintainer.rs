use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to patch CRD {crd_name:?}"))]
    PatchCrd {
        source: kube::Error,
        crd_name: String,
    },
}

/// Installs and updates the custom resource definitions the operator is responsible for.
///
/// The definitions are deployed with a server-side apply, using the operator name as the field
/// manager. Running the maintainer again is a no-op as long as the definitions did not change.
pub struct CustomResourceDefinitionMaintainer<'a> {
    client: Client,
    definitions: Vec<CustomResourceDefinition>,
    options: CustomResourceDefinitionMaintainerOptions<'a>,
}

impl<'a> CustomResourceDefinitionMaintainer<'a> {
    /// Creates a new maintainer for the given `definitions`.
    ///
    /// ```no_run
    /// # use backup_operator::crd::{BackupPolicy, maintainer::*};
    /// # use kube::CustomResourceExt;
    /// # async fn run(client: kube::Client) -> Result<(), Error> {
    /// CustomResourceDefinitionMaintainer::new(
    ///     client,
    ///     [BackupPolicy::crd()],
    ///     CustomResourceDefinitionMaintainerOptions {
    ///         operator_name: "backup-operator",
    ///         disabled: false,
    ///     },
    /// )
    /// .run()
    /// .await
    /// # }
    /// ```
    pub fn new(
        client: Client,
        definitions: impl IntoIterator<Item = CustomResourceDefinition>,
        options: CustomResourceDefinitionMaintainerOptions<'a>,
    ) -> Self {
        Self {
            client,
            definitions: definitions.into_iter().collect(),
            options,
        }
    }

    /// Applies all definitions once.
    ///
    /// Returns immediately if the maintainer is disabled or has nothing to maintain.
    pub async fn run(self) -> Result<(), Error> {
        let CustomResourceDefinitionMaintainerOptions {
            operator_name,
            disabled,
        } = self.options;

        if disabled || self.definitions.is_empty() {
            tracing::info!(
                disabled,
                "skipping maintenance of custom resource definitions"
            );
            return Ok(());
        }

        let crd_api: Api<CustomResourceDefinition> = Api::all(self.client);
        let patch_params = PatchParams::apply(operator_name).force();

        for crd in &self.definitions {
            let crd_kind = &crd.spec.names.kind;
            let crd_name = crd.name_any();

            tracing::debug!(
                k8s.crd.kind = %crd_kind,
                k8s.crd.name = %crd_name,
                "applying custom resource definition"
            );

            crd_api
                .patch(&crd_name, &patch_params, &Patch::Apply(crd))
                .await
                .with_context(|_| PatchCrdSnafu {
                    crd_name: crd_name.clone(),
                })?;

            tracing::info!(k8s.crd.name = %crd_name, "applied custom resource definition");
        }

        Ok(())
    }
}

/// Options to customize a [`CustomResourceDefinitionMaintainer`].
pub struct CustomResourceDefinitionMaintainerOptions<'a> {
    /// The operator name, used as the field manager.
    pub operator_name: &'a str,

    /// Indicates if the maintainer should be disabled.
    pub disabled: bool,
}
