use anyhow::{Context, Result};
use kube::api::ListParams;
use kube::{Api, Client};

use infergate::crd::{ModelRoute, ModelServer};

/// Verify cluster connectivity and that the gateway CRDs are usable.
pub async fn run() -> Result<()> {
    println!("Checking cluster connectivity...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  ModelRoute CRD .............. ");
    let routes: Api<ModelRoute> = Api::all(client.clone());
    match routes.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} visible)", list.items.len()),
        Err(e) => println!("MISSING ({e})"),
    }

    print!("  ModelServer CRD ............. ");
    let servers: Api<ModelServer> = Api::all(client);
    match servers.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} visible)", list.items.len()),
        Err(e) => println!("MISSING ({e})"),
    }

    println!("\nDone.");
    Ok(())
}
