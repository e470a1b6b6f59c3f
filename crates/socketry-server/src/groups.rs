//! Named fan-out sets layered over a [`ClientRegistry`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use socketry_core::{ConnectionId, SendError};
use tracing::{debug, warn};

use crate::proxy::ClientProxy;
use crate::registry::ClientRegistry;

/// Outcome of one group broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupDelivery {
    /// Members the frame was handed to.
    pub delivered: usize,
    /// Members that no longer resolved to a live connection.
    pub skipped: usize,
    /// Members whose send failed.
    pub failed: usize,
}

/// Group name → member connection ids.
///
/// Membership is by id only and only registered connections may join. Ids
/// whose connection has gone are skipped at send time, and
/// [`GroupRegistry::remove_connection`] purges them on teardown. Groups exist
/// while they have members; the last `leave` prunes the group.
pub struct GroupRegistry {
    clients: Arc<ClientRegistry>,
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl GroupRegistry {
    /// Create an empty registry resolving members through `clients`.
    pub fn new(clients: Arc<ClientRegistry>) -> Self {
        Self {
            clients,
            groups: DashMap::new(),
        }
    }

    /// Add a live connection to `group`. Returns `false` if `id` was already
    /// a member or is not registered.
    pub fn join(&self, group: &str, id: ConnectionId) -> bool {
        if !self.clients.contains(&id) {
            debug!(group, conn_id = %id, "join refused, connection not registered");
            return false;
        }
        let added = self
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(id.clone());
        // Teardown deregisters before purging groups, so a connection that
        // left between the check and the insert is visible here.
        if added && !self.clients.contains(&id) {
            let _ = self.leave(group, &id);
            return false;
        }
        if added {
            debug!(group, "joined group");
        }
        added
    }

    /// Remove `id` from `group`. Returns whether it was a member.
    pub fn leave(&self, group: &str, id: &ConnectionId) -> bool {
        let removed = self
            .groups
            .get_mut(group)
            .is_some_and(|mut members| members.remove(id));
        let _ = self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    /// Remove `id` from every group. Returns how many groups it left.
    pub fn remove_connection(&self, id: &ConnectionId) -> usize {
        let mut left = 0;
        self.groups.retain(|_, members| {
            if members.remove(id) {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// Snapshot of `group`'s member ids. Empty for an unknown group.
    pub fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` is a member of `group`.
    pub fn contains(&self, group: &str, id: &ConnectionId) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(id))
    }

    /// Names of non-empty groups, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Groups `id` belongs to, sorted.
    pub fn groups_of(&self, id: &ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .iter()
            .filter(|g| g.value().contains(id))
            .map(|g| g.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Send a request envelope to every live member of `group`.
    ///
    /// An unknown group is a no-op. Members are sent to independently; one
    /// member's failure does not stop the others.
    pub async fn send(&self, group: &str, method: &str, arguments: Vec<Value>) -> GroupDelivery {
        self.send_except(group, None, method, arguments).await
    }

    /// Like [`Self::send`], skipping `except` (typically the sender).
    pub async fn send_except(
        &self,
        group: &str,
        except: Option<&ConnectionId>,
        method: &str,
        arguments: Vec<Value>,
    ) -> GroupDelivery {
        // Snapshot first; no map guard is held across an await.
        let ids = self.members(group);
        let mut report = GroupDelivery::default();
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if except == Some(&id) {
                continue;
            }
            match self.clients.get(&id) {
                Some(proxy) => targets.push((id, proxy)),
                None => report.skipped += 1,
            }
        }
        if targets.is_empty() {
            return report;
        }

        debug!(group, method, members = targets.len(), "group send");

        let sends = targets.iter().map(|(_, proxy)| proxy.send(method, arguments.clone()));
        let results = join_all(sends).await;
        for ((id, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(SendError::Closed(_)) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(group, method, conn_id = %id, error = %e, "group member send failed");
                }
            }
        }
        report
    }

    /// Send capability addressing `group`.
    pub fn group(self: &Arc<Self>, name: &str) -> GroupProxy {
        GroupProxy {
            registry: Arc::clone(self),
            name: name.to_owned(),
        }
    }
}

/// [`ClientProxy`] that fans out to every live member of one group.
#[derive(Clone)]
pub struct GroupProxy {
    registry: Arc<GroupRegistry>,
    name: String,
}

impl GroupProxy {
    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ClientProxy for GroupProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let _ = self.registry.send(&self.name, method, arguments).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use serde_json::json;
    use socketry_core::{Frame, TransportError};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn registry() -> (Arc<ClientRegistry>, Arc<GroupRegistry>) {
        let clients = Arc::new(ClientRegistry::new("test"));
        let groups = Arc::new(GroupRegistry::new(Arc::clone(&clients)));
        (clients, groups)
    }

    fn connect(clients: &ClientRegistry, id: &str) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(
            ConnectionId::from(id),
            tx,
            CancellationToken::new(),
        ));
        assert!(clients.add(conn.id().clone(), Arc::clone(&conn) as Arc<dyn ClientProxy>));
        (conn, rx)
    }

    fn live(clients: &ClientRegistry, id: &str) -> ConnectionId {
        let id = ConnectionId::from(id);
        assert!(clients.add(id.clone(), Arc::new(BrokenProxy)));
        id
    }

    struct BrokenProxy;

    #[async_trait]
    impl ClientProxy for BrokenProxy {
        async fn send(&self, _method: &str, _arguments: Vec<Value>) -> Result<(), SendError> {
            Err(SendError::Transport(TransportError::Send("broken pipe".into())))
        }
    }

    #[test]
    fn join_is_idempotent() {
        let (clients, groups) = registry();
        let a = live(&clients, "a");
        assert!(groups.join("room", a.clone()));
        assert!(!groups.join("room", a));
        assert_eq!(groups.members("room").len(), 1);
    }

    #[test]
    fn join_refuses_unregistered_id() {
        let (clients, groups) = registry();
        assert!(!groups.join("room", ConnectionId::from("ghost")));
        assert!(groups.members("room").is_empty());
        assert!(groups.group_names().is_empty());

        // Deregistered ids are refused too.
        let gone = live(&clients, "gone");
        let _ = clients.remove(&gone);
        assert!(!groups.join("room", gone));
        assert!(groups.group_names().is_empty());
    }

    #[test]
    fn last_leave_prunes_group() {
        let (clients, groups) = registry();
        let a = live(&clients, "a");
        let _ = groups.join("room", a.clone());
        assert!(groups.leave("room", &a));
        assert!(groups.group_names().is_empty());
        assert!(!groups.leave("room", &a));
    }

    #[test]
    fn remove_connection_purges_all_groups() {
        let (clients, groups) = registry();
        let a = live(&clients, "a");
        let b = live(&clients, "b");
        let _ = groups.join("one", a.clone());
        let _ = groups.join("two", a.clone());
        let _ = groups.join("two", b.clone());
        assert_eq!(groups.groups_of(&a), vec!["one", "two"]);

        assert_eq!(groups.remove_connection(&a), 2);
        assert_eq!(groups.group_names(), vec!["two"]);
        assert!(!groups.contains("two", &a));
        assert!(groups.contains("two", &b));
    }

    #[tokio::test]
    async fn send_to_unknown_group_is_noop() {
        let (_clients, groups) = registry();
        let report = groups.send("nobody", "Hi", vec![]).await;
        assert_eq!(report, GroupDelivery::default());
    }

    #[tokio::test]
    async fn send_reaches_every_member() {
        let (clients, groups) = registry();
        let (a, mut rx_a) = connect(&clients, "a");
        let (b, mut rx_b) = connect(&clients, "b");
        let _ = groups.join("room", a.id().clone());
        let _ = groups.join("room", b.id().clone());

        let report = groups.send("room", "Message", vec![json!("hi")]).await;
        assert_eq!(report.delivered, 2);

        let expected = Frame::text(r#"{"Method":"Message","Flag":0,"Arguments":["hi"]}"#);
        assert_eq!(rx_a.recv().await, Some(expected.clone()));
        assert_eq!(rx_b.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn departed_member_is_skipped() {
        let (clients, groups) = registry();
        let (a, mut rx_a) = connect(&clients, "a");
        let (b, _rx_b) = connect(&clients, "b");
        let _ = groups.join("room", a.id().clone());
        let _ = groups.join("room", b.id().clone());

        // Gone from the directory but still listed in the group.
        let _ = clients.remove(b.id());

        let report = groups.send("room", "Message", vec![json!(1)]).await;
        assert_eq!(report, GroupDelivery { delivered: 1, skipped: 1, failed: 0 });
        assert!(rx_a.recv().await.is_some());
    }

    #[tokio::test]
    async fn closing_member_counts_as_skipped() {
        let (clients, groups) = registry();
        let (a, _rx_a) = connect(&clients, "a");
        let (b, mut rx_b) = connect(&clients, "b");
        let _ = groups.join("room", a.id().clone());
        let _ = groups.join("room", b.id().clone());
        let _ = a.shut_outbound(None);

        let report = groups.send("room", "Message", vec![]).await;
        assert_eq!(report, GroupDelivery { delivered: 1, skipped: 1, failed: 0 });
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn stalled_member_does_not_block_broadcast() {
        let (clients, groups) = registry();
        let (tx, _unread) = mpsc::channel(1);
        let stalled = Arc::new(Connection::new(
            ConnectionId::from("stalled"),
            tx,
            CancellationToken::new(),
        ));
        let _ = clients.add(stalled.id().clone(), Arc::clone(&stalled) as Arc<dyn ClientProxy>);
        let (a, mut rx_a) = connect(&clients, "a");
        let _ = groups.join("room", stalled.id().clone());
        let _ = groups.join("room", a.id().clone());

        let first = groups.send("room", "Message", vec![json!(1)]).await;
        assert_eq!(first.delivered, 2);
        let second = groups.send("room", "Message", vec![json!(2)]).await;
        assert_eq!(second, GroupDelivery { delivered: 1, skipped: 0, failed: 1 });
        assert_eq!(stalled.drop_count(), 1);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_a.recv().await.is_some());
    }

    #[tokio::test]
    async fn failing_member_does_not_abort_broadcast() {
        let (clients, groups) = registry();
        let (a, mut rx_a) = connect(&clients, "a");
        let broken = live(&clients, "broken");
        let _ = groups.join("room", a.id().clone());
        let _ = groups.join("room", broken);

        let report = groups.send("room", "Message", vec![]).await;
        assert_eq!(report, GroupDelivery { delivered: 1, skipped: 0, failed: 1 });
        assert!(rx_a.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_except_skips_sender() {
        let (clients, groups) = registry();
        let (a, mut rx_a) = connect(&clients, "a");
        let (b, mut rx_b) = connect(&clients, "b");
        let _ = groups.join("room", a.id().clone());
        let _ = groups.join("room", b.id().clone());

        let report = groups
            .send_except("room", Some(a.id()), "Message", vec![])
            .await;
        assert_eq!(report.delivered, 1);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_proxy_fans_out() {
        let (clients, groups) = registry();
        let (a, mut rx_a) = connect(&clients, "a");
        let _ = groups.join("room", a.id().clone());

        let proxy = groups.group("room");
        assert_eq!(proxy.name(), "room");
        proxy.send("Message", vec![json!(true)]).await.unwrap();
        assert_eq!(
            rx_a.recv().await,
            Some(Frame::text(r#"{"Method":"Message","Flag":0,"Arguments":[true]}"#))
        );
    }

    #[tokio::test]
    async fn concurrent_churn_during_broadcast() {
        let (clients, groups) = registry();
        let mut conns = Vec::new();
        for i in 0..20 {
            let (conn, rx) = connect(&clients, &format!("c{i}"));
            let _ = groups.join("room", conn.id().clone());
            conns.push((conn, rx));
        }

        let churn = {
            let clients = Arc::clone(&clients);
            let groups = Arc::clone(&groups);
            tokio::spawn(async move {
                for i in (0..20).step_by(2) {
                    let id = ConnectionId::from_raw(format!("c{i}"));
                    let _ = clients.remove(&id);
                    let _ = groups.remove_connection(&id);
                    tokio::task::yield_now().await;
                }
            })
        };
        let report = groups.send("room", "Message", vec![]).await;
        churn.await.unwrap();

        assert_eq!(report.failed, 0);
        assert!(report.delivered >= 10);
        assert_eq!(groups.members("room").len(), 10);
    }

    #[tokio::test]
    async fn join_racing_teardown_leaves_no_membership() {
        let (clients, groups) = registry();
        for round in 0..50 {
            let id = live(&clients, &format!("r{round}"));
            let joiner = {
                let groups = Arc::clone(&groups);
                let id = id.clone();
                tokio::spawn(async move { groups.join("room", id) })
            };
            // Same order as session teardown.
            let _ = clients.remove(&id);
            let _ = groups.remove_connection(&id);
            let _ = joiner.await.unwrap();
        }
        assert!(groups.group_names().is_empty());
    }
}
