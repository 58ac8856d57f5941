//! External volume cleanup

use crate::common::{Error, Result, RetryPolicy};
use crate::ops::client::ControlClient;

/// Destroy `name`, retrying while the storage backend still holds the
/// device. A volume that is already gone counts as cleaned up. A volume
/// still attached to a workload is reported, never detached here.
pub async fn cleanup_volume(client: &ControlClient, name: &str, policy: &RetryPolicy) -> Result<()> {
    let result = policy
        .run("destroy volume", || client.destroy_volume(name))
        .await;

    match result {
        Ok(()) => {
            tracing::info!(volume = name, "Volume removed");
            Ok(())
        }
        Err(Error::VolumeNotFound(_)) => {
            tracing::info!(volume = name, "Volume already removed");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(volume = name, error = %e, "Failed to remove volume");
            Err(e)
        }
    }
}
