//! Client bootstrap for both in-cluster and local-kubeconfig use.

use kube::config::{KubeConfigOptions, Kubeconfig};

/// Builds a client from an explicit kubeconfig path — used by binaries run
/// outside the cluster during local development.
pub async fn from_kubeconfig(kubeconfig_path: &str) -> Result<kube::Client, kube::Error> {
    let to_err = |err: kube::config::KubeconfigError| -> kube::Error {
        kube::Error::Service(Box::new(err))
    };

    let kubeconfig = Kubeconfig::read_from(kubeconfig_path).map_err(to_err)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(to_err)?;
    let client = kube::Client::try_from(config)?;
    client.apiserver_version().await?;
    Ok(client)
}

/// Builds a client from the in-cluster service account — the normal path
/// for the controller/worker binaries.
pub async fn in_cluster() -> Result<kube::Client, kube::Error> {
    let to_err = |err: kube::config::InClusterError| -> kube::Error {
        kube::Error::Service(Box::new(err))
    };

    let config = kube::Config::incluster().map_err(to_err)?;
    let client = kube::Client::try_from(config)?;
    client.apiserver_version().await?;
    Ok(client)
}
