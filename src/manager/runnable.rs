//! # Runnables
//!
//! Long-running units of work owned by the manager: controllers, the webhook
//! server, the metrics and probe listeners.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A task started by the manager once it is running
///
/// `start` must return promptly after `shutdown` is cancelled. An `Err` from any
/// runnable stops the whole manager.
#[async_trait]
pub trait Runnable: Send + 'static {
    fn name(&self) -> &str;

    /// Runnables that need leader election only start on the replica holding the lease
    fn needs_leader_election(&self) -> bool {
        true
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Named set of runnables; names are unique
#[derive(Default)]
pub struct Runnables {
    names: HashSet<String>,
    items: Vec<Box<dyn Runnable>>,
}

impl fmt::Debug for Runnables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnables")
            .field("names", &self.names())
            .finish()
    }
}

impl Runnables {
    /// Add a runnable; returns its name back when the name is taken
    pub fn add(&mut self, runnable: Box<dyn Runnable>) -> Result<(), String> {
        let name = runnable.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(name);
        }
        self.items.push(runnable);
        Ok(())
    }

    /// Registration order is preserved
    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Split into (leader-gated, always-on)
    pub fn partition(self) -> (Vec<Box<dyn Runnable>>, Vec<Box<dyn Runnable>>) {
        self.items
            .into_iter()
            .partition(|runnable| runnable.needs_leader_election())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        name: &'static str,
        leader: bool,
    }

    #[async_trait]
    impl Runnable for Noop {
        fn name(&self) -> &str {
            self.name
        }

        fn needs_leader_election(&self) -> bool {
            self.leader
        }

        async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut runnables = Runnables::default();
        runnables
            .add(Box::new(Noop { name: "a", leader: true }))
            .unwrap();
        let err = runnables
            .add(Box::new(Noop { name: "a", leader: false }))
            .unwrap_err();
        assert_eq!(err, "a");
        assert_eq!(runnables.len(), 1);
    }

    #[test]
    fn test_partition_by_leader_election() {
        let mut runnables = Runnables::default();
        runnables
            .add(Box::new(Noop { name: "controller", leader: true }))
            .unwrap();
        runnables
            .add(Box::new(Noop { name: "probes", leader: false }))
            .unwrap();
        assert_eq!(runnables.names(), vec!["controller", "probes"]);

        let (leader, always) = runnables.partition();
        assert_eq!(leader.len(), 1);
        assert_eq!(leader[0].name(), "controller");
        assert_eq!(always.len(), 1);
        assert_eq!(always[0].name(), "probes");
    }
}
