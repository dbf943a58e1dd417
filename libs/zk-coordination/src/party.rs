//! Group membership ("party") tracking.

use std::{collections::BTreeSet, collections::HashSet, sync::Arc};

use tracing::debug;

use crate::client::{PartyRecipe, ZkClient};
use crate::error::CoordinationResult;

/// Separates a member's logical id from a disambiguating suffix.
pub const MEMBER_SUFFIX_SEPARATOR: char = '\0';

/// Membership of one logical group.
#[derive(Debug)]
pub struct Party {
    recipe: Box<dyn PartyRecipe>,
    path: String,
    autojoin: bool,
}

impl Party {
    /// Attach to the group at `path` and run [`Party::autojoin`].
    pub(crate) async fn new(
        client: &Arc<dyn ZkClient>,
        path: String,
        identifier: &str,
        autojoin: bool,
    ) -> CoordinationResult<Self> {
        let recipe = client.party(&path, identifier).await?;
        let party = Self {
            recipe,
            path,
            autojoin,
        };
        party.autojoin().await?;
        Ok(party)
    }

    /// Absolute path of the group node.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn join(&self) -> CoordinationResult<()> {
        Ok(self.recipe.join().await?)
    }

    /// Join if configured to, then log the current membership.
    ///
    /// Run at construction and again after every reconnection, since an
    /// expired session takes its membership entry with it.
    pub async fn autojoin(&self) -> CoordinationResult<()> {
        if self.autojoin {
            self.join().await?;
        }
        let members = self.list().await?;
        let names: BTreeSet<&str> = members.iter().map(|m| member_name(m)).collect();
        debug!(path = %self.path, ?names, "current party members");
        Ok(())
    }

    /// Raw identifiers of all current members.
    pub async fn list(&self) -> CoordinationResult<HashSet<String>> {
        Ok(self.recipe.members().await?.into_iter().collect())
    }
}

/// Logical member name with any disambiguating suffix removed.
pub fn member_name(identifier: &str) -> &str {
    identifier
        .split(MEMBER_SUFFIX_SEPARATOR)
        .next()
        .unwrap_or(identifier)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::CoordinationError;
    use crate::memory::{MemoryClient, MemoryEnsemble};

    async fn client(ensemble: &MemoryEnsemble) -> (MemoryClient, Arc<dyn ZkClient>) {
        let client = ensemble.client();
        client.start(Duration::from_secs(1)).await.unwrap();
        let dyn_client: Arc<dyn ZkClient> = Arc::new(client.clone());
        (client, dyn_client)
    }

    #[test]
    fn test_member_name() {
        assert_eq!(member_name("bs1-10-1"), "bs1-10-1");
        assert_eq!(member_name("bs1-10-1\u{0}2"), "bs1-10-1");
        assert_eq!(member_name(""), "");
    }

    #[tokio::test]
    async fn test_autojoin_registers_member() {
        let ensemble = MemoryEnsemble::new();
        let (_, zk) = client(&ensemble).await;
        let party = Party::new(&zk, "/g/party".into(), "srv-a", true)
            .await
            .unwrap();
        assert_eq!(party.path(), "/g/party");
        let members = party.list().await.unwrap();
        assert_eq!(members, HashSet::from(["srv-a".to_owned()]));
    }

    #[tokio::test]
    async fn test_observer_does_not_join() {
        let ensemble = MemoryEnsemble::new();
        let (_, a) = client(&ensemble).await;
        let (_, b) = client(&ensemble).await;
        let member = Party::new(&a, "/g/party".into(), "srv-a", true)
            .await
            .unwrap();
        let observer = Party::new(&b, "/g/party".into(), "srv-b", false)
            .await
            .unwrap();
        assert_eq!(observer.list().await.unwrap().len(), 1);
        assert_eq!(member.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_after_session_loss() {
        let ensemble = MemoryEnsemble::new();
        let (raw, zk) = client(&ensemble).await;
        let party = Party::new(&zk, "/g/party".into(), "srv-a", true)
            .await
            .unwrap();

        raw.expire_session();
        assert!(matches!(
            party.list().await,
            Err(CoordinationError::ConnectionLoss)
        ));
        assert!(raw.reconnect());
        assert!(party.list().await.unwrap().is_empty());
        party.autojoin().await.unwrap();
        assert_eq!(party.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_construction_fails_when_disconnected() {
        let ensemble = MemoryEnsemble::new();
        let (raw, zk) = client(&ensemble).await;
        raw.suspend();
        assert!(matches!(
            Party::new(&zk, "/g/party".into(), "srv-a", true).await,
            Err(CoordinationError::ConnectionLoss)
        ));
    }
}
