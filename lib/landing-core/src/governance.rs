//! Service control policy attachments per organizational unit

use crate::{ResolveError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// PolicyAttachmentStore maps organizational units to the set of service
/// control policy ARNs attached to them
#[derive(Clone)]
pub struct PolicyAttachmentStore {
    attachments: Arc<RwLock<BTreeMap<String, BTreeSet<String>>>>,
}

impl PolicyAttachmentStore {
    pub fn new() -> Self {
        Self {
            attachments: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Seed the store from a declared OU -> policies mapping
    pub async fn load(&self, declared: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (ou, policies) in declared {
            self.attach(ou, policies.iter().cloned()).await?;
        }
        Ok(())
    }

    /// Attach policies to an OU. Attaching a policy twice is a no-op.
    pub async fn attach<I>(&self, ou: &str, policies: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        if ou.trim().is_empty() {
            return Err(ResolveError::Configuration(
                "policy attachment needs an organizational unit id".to_string(),
            ));
        }

        let policies: Vec<String> = policies.into_iter().collect();
        if let Some(blank) = policies.iter().position(|p| p.trim().is_empty()) {
            return Err(ResolveError::Configuration(format!(
                "policy #{} attached to {} is empty",
                blank, ou
            )));
        }

        let mut attachments = self.attachments.write().await;
        let attached = attachments.entry(ou.to_string()).or_default();
        attached.extend(policies);

        debug!("Attached {} policy(ies) to {}", attached.len(), ou);
        Ok(())
    }

    /// Policies attached to an OU
    pub async fn policies_for(&self, ou: &str) -> Result<BTreeSet<String>> {
        let attachments = self.attachments.read().await;
        attachments
            .get(ou)
            .cloned()
            .ok_or_else(|| ResolveError::Configuration(format!("organizational unit not found: {}", ou)))
    }

    /// Detach a single policy. Returns whether it was attached.
    pub async fn detach(&self, ou: &str, policy: &str) -> Result<bool> {
        let mut attachments = self.attachments.write().await;
        let attached = attachments
            .get_mut(ou)
            .ok_or_else(|| ResolveError::Configuration(format!("organizational unit not found: {}", ou)))?;
        let removed = attached.remove(policy);
        if attached.is_empty() {
            attachments.remove(ou);
        }
        debug!("Detached {} from {}", policy, ou);
        Ok(removed)
    }

    /// Flattened (ou, policy) pairs in a stable order
    pub async fn snapshot(&self) -> Vec<(String, String)> {
        let attachments = self.attachments.read().await;
        attachments
            .iter()
            .flat_map(|(ou, policies)| policies.iter().map(move |p| (ou.clone(), p.clone())))
            .collect()
    }

    /// Number of OUs with at least one policy
    pub async fn count(&self) -> usize {
        self.attachments.read().await.len()
    }
}

impl Default for PolicyAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}
