//! # Platform Shim
//!
//! The only part of hover that touches the operating system. A resource is
//! an `IFNAME:IPV4` pair; installing one adds the address to the interface
//! and announces it with a gratuitous ARP so neighbors repoint their caches
//! at this host, releasing removes the address again.
//!
//! The shim exclusively owns the set of installed resources. The controller
//! never inspects it — it just keeps firing `assign_resource` commands
//! derived from the replicated state, and the shim turns the edge into an
//! install, a release, or a no-op. That makes recovery trivial: restart the
//! controller and the replicated `assign:*` keys re-drive the shim.
//!
//! OS work runs as spawned subprocesses whose failures are logged and
//! swallowed; the next reassignment or `assign:` echo retries.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Errors from the OS-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("malformed resource {0:?}: expected IFNAME:ADDRESS")]
    MalformedResource(String),
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Splits `IFNAME:ADDRESS` at the first colon.
pub fn split_resource(resource: &str) -> Result<(&str, &str), PlatformError> {
    match resource.split_once(':') {
        Some((ifname, address)) if !ifname.is_empty() && !address.is_empty() => {
            Ok((ifname, address))
        }
        _ => Err(PlatformError::MalformedResource(resource.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Address operations
// ---------------------------------------------------------------------------

/// What installing and releasing actually do. One implementation per OS,
/// plus a recording one for tests.
#[async_trait]
pub trait AddressOps: Send + Sync {
    async fn install(&self, resource: &str) -> Result<(), PlatformError>;
    async fn release(&self, resource: &str) -> Result<(), PlatformError>;
}

/// GNU/Linux: `ip addr add/del` plus a single gratuitous ARP via `arping`.
pub struct LinuxAddressOps {
    ip: String,
    arping: String,
}

impl LinuxAddressOps {
    pub fn new() -> Self {
        LinuxAddressOps {
            ip: "/sbin/ip".to_string(),
            arping: "/usr/sbin/arping".to_string(),
        }
    }

    /// Override the tool paths (distributions disagree about /sbin).
    pub fn with_paths(ip: impl Into<String>, arping: impl Into<String>) -> Self {
        LinuxAddressOps {
            ip: ip.into(),
            arping: arping.into(),
        }
    }
}

impl Default for LinuxAddressOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressOps for LinuxAddressOps {
    async fn install(&self, resource: &str) -> Result<(), PlatformError> {
        let (ifname, address) = split_resource(resource)?;
        run(&self.ip, &["addr", "add", &format!("{}/32", address), "dev", ifname]).await?;
        run(&self.arping, &["-I", ifname, "-U", address, "-c", "1"]).await?;
        Ok(())
    }

    async fn release(&self, resource: &str) -> Result<(), PlatformError> {
        let (ifname, address) = split_resource(resource)?;
        run(&self.ip, &["addr", "del", &format!("{}/32", address), "dev", ifname]).await
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    let rendered = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| PlatformError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(PlatformError::CommandFailed {
            command: rendered,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Records calls instead of touching the OS.
#[derive(Default)]
pub struct NullAddressOps {
    calls: Mutex<Vec<(String, String)>>,
}

impl NullAddressOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(operation, resource)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AddressOps for NullAddressOps {
    async fn install(&self, resource: &str) -> Result<(), PlatformError> {
        self.calls.lock().push(("install".into(), resource.into()));
        Ok(())
    }

    async fn release(&self, resource: &str) -> Result<(), PlatformError> {
        self.calls.lock().push(("release".into(), resource.into()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Tracks which resources this host has installed and turns assignment
/// edges into OS operations.
pub struct Platform {
    ops: Arc<dyn AddressOps>,
    installed: Mutex<HashMap<String, String>>,
}

impl Platform {
    pub fn new(ops: Arc<dyn AddressOps>) -> Arc<Self> {
        Arc::new(Platform {
            ops,
            installed: Mutex::new(HashMap::new()),
        })
    }

    /// Applies one assignment observation. Install happens only on the
    /// not-installed → assigned-to-me edge, release only on the reverse;
    /// everything else is a no-op, so replays are harmless.
    ///
    /// `resource` may be absent when the backing record was already
    /// tombstoned. Installing needs it; releasing uses the string recorded
    /// at install time, so a resource deleted before its clearing
    /// assignment arrives still gets its address removed.
    pub fn assign_resource(&self, resource_id: &str, assign_to_me: bool, resource: Option<&str>) {
        enum Op {
            Install(String),
            Release(String),
        }

        let op = {
            let mut installed = self.installed.lock();
            if assign_to_me && !installed.contains_key(resource_id) {
                match resource {
                    Some(resource) => {
                        installed.insert(resource_id.to_string(), resource.to_string());
                        Some(Op::Install(resource.to_string()))
                    }
                    None => {
                        debug!(resource_id, "assignment without a resource record; nothing to install");
                        None
                    }
                }
            } else if !assign_to_me {
                installed.remove(resource_id).map(Op::Release)
            } else {
                None
            }
        };

        let Some(op) = op else {
            return;
        };
        let ops = Arc::clone(&self.ops);
        let resource_id = resource_id.to_string();
        tokio::spawn(async move {
            let result = match &op {
                Op::Install(resource) => {
                    info!(resource_id = %resource_id, resource = %resource, "installing resource");
                    ops.install(resource).await
                }
                Op::Release(resource) => {
                    info!(resource_id = %resource_id, resource = %resource, "releasing resource");
                    ops.release(resource).await
                }
            };
            if let Err(e) = result {
                // Best effort: the next reassignment pass retries.
                error!(resource_id = %resource_id, "platform operation failed: {}", e);
            }
        });
    }

    /// Resource ids currently installed on this host.
    pub fn installed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.installed.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        // Let spawned platform tasks run on the current-thread test runtime.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn split_resource_validates_shape() {
        let (ifname, address) = split_resource("eth0:10.0.0.1").expect("well-formed");
        assert_eq!((ifname, address), ("eth0", "10.0.0.1"));
        assert!(split_resource("eth0").is_err());
        assert!(split_resource(":10.0.0.1").is_err());
        assert!(split_resource("eth0:").is_err());
    }

    #[tokio::test]
    async fn installs_once_per_assignment() {
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());

        platform.assign_resource("r1", true, Some("eth0:10.0.0.1"));
        // A replayed echo of the same assignment must not reinstall.
        platform.assign_resource("r1", true, Some("eth0:10.0.0.1"));
        settle().await;

        assert_eq!(ops.calls(), vec![("install".to_string(), "eth0:10.0.0.1".to_string())]);
        assert_eq!(platform.installed(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn releases_when_assignment_moves_away() {
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());

        platform.assign_resource("r1", true, Some("eth0:10.0.0.1"));
        platform.assign_resource("r1", false, Some("eth0:10.0.0.1"));
        settle().await;

        assert_eq!(
            ops.calls(),
            vec![
                ("install".to_string(), "eth0:10.0.0.1".to_string()),
                ("release".to_string(), "eth0:10.0.0.1".to_string()),
            ]
        );
        assert!(platform.installed().is_empty());
    }

    #[tokio::test]
    async fn releases_from_its_own_record_when_the_resource_is_gone() {
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());

        platform.assign_resource("r1", true, Some("eth0:10.0.0.1"));
        // The clearing assignment arrives after the resource record was
        // tombstoned, so the caller has no address to pass.
        platform.assign_resource("r1", false, None);
        settle().await;

        assert_eq!(
            ops.calls(),
            vec![
                ("install".to_string(), "eth0:10.0.0.1".to_string()),
                ("release".to_string(), "eth0:10.0.0.1".to_string()),
            ]
        );
        assert!(platform.installed().is_empty());
    }

    #[tokio::test]
    async fn install_without_an_address_is_a_noop() {
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());
        platform.assign_resource("r1", true, None);
        settle().await;
        assert!(ops.calls().is_empty());
        assert!(platform.installed().is_empty());
    }

    #[tokio::test]
    async fn release_of_a_never_installed_resource_is_a_noop() {
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());

        platform.assign_resource("r1", false, Some("eth0:10.0.0.1"));
        settle().await;

        assert!(ops.calls().is_empty());
        assert!(platform.installed().is_empty());
    }
}
