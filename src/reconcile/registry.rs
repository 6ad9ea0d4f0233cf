//! Registry reconciler. On a Registry spec change, prunes
//! Images whose repository fell out of a non-empty allow-list, without
//! waiting for the next scan to notice.

use crate::errors::ReconcileError;
use crate::messages::ResourceRef;
use crate::reconcile::ReconcilerContext;
use crate::store::fetch_optional;
use kube::api::ListParams;
use kube::ResourceExt;
use tracing::{debug, info, warn};

pub async fn reconcile(ctx: &ReconcilerContext, registry_ref: &ResourceRef) -> Result<(), ReconcileError> {
    let Some(registry) = fetch_optional(ctx.registries.as_ref(), &registry_ref.namespace, &registry_ref.name).await? else {
        debug!(registry = %registry_ref.name, "registry deleted, nothing to prune");
        return Ok(());
    };

    if let Err(reason) = registry.spec.validate() {
        // Fail fast here rather than let a NoCatalog registry with an
        // empty allow-list reach the catalog handler, which would call
        // an endpoint this registry doesn't support and surface as an
        // opaque registry error instead of a clear one at the source.
        warn!(registry = %registry_ref.name, reason = %reason, "registry spec is invalid, skipping reconcile");
        return Ok(());
    }

    if registry.spec.repositories.is_empty() {
        return Ok(());
    }

    let allow_list: std::collections::HashSet<&str> = registry.spec.repositories.iter().map(String::as_str).collect();

    let images = ctx.images.list(&registry_ref.namespace, &ListParams::default()).await?;
    for image in images.iter().filter(|i| i.spec.registry == registry.spec.uri) {
        if !allow_list.contains(image.spec.repository.as_str()) {
            if let Err(err) = ctx.images.delete(&registry_ref.namespace, &image.name_any()).await {
                if !err.is_not_found() {
                    return Err(err.into());
                }
            }
            info!(registry = %registry_ref.name, image = %image.name_any(), repository = %image.spec.repository, platform = %image.spec.platform.as_str(), "pruned image no longer in repository allow-list");
        }
    }

    Ok(())
}
