use std::collections::HashSet;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::RngCore;
use tracing::info;

/// The virtualization layer that actually hands out containers.
pub trait ContainerBackend: Send + Sync {
    /// Provision a container and return its identity.
    fn provision(&self) -> Result<String>;

    fn release(&self, container_id: &str) -> Result<()>;
}

/// In-process backend: containers are just random identities that live
/// until released or until the server exits.
#[derive(Default)]
pub struct EphemeralContainers {
    live: Mutex<HashSet<String>>,
}

impl EphemeralContainers {
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }
}

fn generate_container_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl ContainerBackend for EphemeralContainers {
    fn provision(&self) -> Result<String> {
        let mut live = self.live.lock();
        let mut id = generate_container_id();
        while live.contains(&id) {
            id = generate_container_id();
        }
        live.insert(id.clone());
        info!(live = live.len(), "container provisioned");
        Ok(id)
    }

    fn release(&self, container_id: &str) -> Result<()> {
        let mut live = self.live.lock();
        if !live.remove(container_id) {
            bail!("unknown container {container_id}");
        }
        info!(live = live.len(), "container released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_and_release() {
        let backend = EphemeralContainers::default();
        let a = backend.provision().unwrap();
        let b = backend.provision().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(backend.live(), 2);

        backend.release(&a).unwrap();
        assert_eq!(backend.live(), 1);
        assert!(backend.release(&a).is_err());
    }
}
