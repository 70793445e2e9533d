use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use infergate::crd::{ModelRoute, ModelServer};

/// Print both CRDs as a multi-document YAML stream.
pub fn generate() -> Result<()> {
    let route = serde_yaml::to_string(&ModelRoute::crd())?;
    let server = serde_yaml::to_string(&ModelServer::crd())?;
    println!("{route}---\n{server}");
    Ok(())
}

/// Server-side apply both CRDs into the connected cluster.
pub async fn install() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("infergate").force();

    for crd in [ModelRoute::crd(), ModelServer::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("Failed to apply CRD {name}"))?;
        println!("applied {name}");
    }
    Ok(())
}
