//! Periodic background work for a [`Node`].
//!
//! Four independent loops, each on its own timer: session sweep, upload
//! sweep, download sweep, and heartbeat. Every loop exits when the shutdown
//! channel changes. Failures inside one tick are logged by the node and
//! never end the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::Node;

impl Node {
    /// Spawn the periodic workers. Flip `shutdown` to stop them.
    pub fn start_background_tasks(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let sweep = self.options().sweep_period;
        let heartbeat = self.options().heartbeat_period;

        vec![
            spawn_periodic("session-sweep", sweep, shutdown.clone(), Arc::clone(self), |node| async move {
                node.sweep_sessions().await;
            }),
            spawn_periodic("upload-sweep", sweep, shutdown.clone(), Arc::clone(self), |node| async move {
                node.sweep_uploads().await;
            }),
            spawn_periodic("download-sweep", sweep, shutdown.clone(), Arc::clone(self), |node| async move {
                node.sweep_downloads().await;
            }),
            spawn_periodic("heartbeat", heartbeat, shutdown, Arc::clone(self), |node| async move {
                node.heartbeat().await;
            }),
        ]
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    node: Arc<Node>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Node>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(worker = name, ?period, "background worker starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    tick(Arc::clone(&node)).await;
                }
                _ = shutdown.changed() => {
                    debug!(worker = name, "background worker shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use gridnode_core::{LocalEventBus, NodeEvent};
    use url::Url;

    use crate::node::{NodeBuilder, NodeOptions};

    #[tokio::test]
    async fn heartbeat_worker_publishes_until_shutdown() {
        let mut options = NodeOptions::new(Url::parse("http://localhost:5555").unwrap());
        options.heartbeat_period = Duration::from_millis(10);
        options.sweep_period = Duration::from_millis(10);

        let bus = Arc::new(LocalEventBus::default());
        let mut events = bus.subscribe();
        let node = Arc::new(NodeBuilder::new(options, bus.clone()).build());

        let (tx, rx) = watch::channel(false);
        let handles = node.start_background_tasks(rx);
        assert_eq!(handles.len(), 4);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            NodeEvent::Heartbeat(status) => {
                assert_eq!(status.node_id, node.id());
                assert!(status.slots.is_empty());
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
