//! Mailbox table: local endpoint id -> live operation.
//!
//! Each entry holds the sending half of the operation's event channel. The
//! runner task owns the receiving half, so events for one mailbox are handled
//! in the order they were pushed and never concurrently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use opflow_core::{Mailbox, OpMessage, OpTypeId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::op::{ActionId, NetOpKind, Role};
use crate::traits::TransportError;

/// Event queued for a live operation.
#[derive(Debug)]
pub(crate) enum MailboxEvent {
    Message(OpMessage),
    Trigger(Bytes),
    ActionDone {
        action: ActionId,
        kind: NetOpKind,
        outcome: Result<(), TransportError>,
    },
}

/// Introspection record for one live operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveOpInfo {
    pub mailbox: Mailbox,
    pub op_id: OpTypeId,
    pub op_name: &'static str,
    pub role: Role,
    pub state: &'static str,
    pub waiting: &'static str,
    pub age_ms: u64,
}

#[derive(Debug)]
struct OpStatus {
    state: &'static str,
    waiting: &'static str,
}

#[derive(Debug)]
pub(crate) struct MailboxEntry {
    pub(crate) mailbox: Mailbox,
    pub(crate) op_id: OpTypeId,
    pub(crate) op_name: &'static str,
    pub(crate) role: Role,
    pub(crate) tx: mpsc::UnboundedSender<MailboxEvent>,
    status: ArcSwap<OpStatus>,
    created_at: Instant,
}

impl MailboxEntry {
    pub(crate) fn set_status(&self, state: &'static str, waiting: &'static str) {
        self.status.store(Arc::new(OpStatus { state, waiting }));
    }

    fn info(&self) -> LiveOpInfo {
        let status = self.status.load();
        LiveOpInfo {
            mailbox: self.mailbox,
            op_id: self.op_id,
            op_name: self.op_name,
            role: self.role,
            state: status.state,
            waiting: status.waiting,
            age_ms: u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Concurrent mailbox table with id reuse.
///
/// Ids start at 1 (0 is `Mailbox::NONE`). An id goes back on the free list
/// only when its entry is removed, so it is never handed out twice while the
/// operation that owns it is alive.
#[derive(Debug)]
pub(crate) struct MailboxTable {
    entries: DashMap<Mailbox, Arc<MailboxEntry>>,
    next: AtomicU32,
    free: Mutex<Vec<Mailbox>>,
}

impl MailboxTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU32::new(1),
            free: Mutex::new(Vec::new()),
        }
    }

    fn allocate_id(&self) -> Mailbox {
        if let Some(mailbox) = self.free.lock().pop() {
            return mailbox;
        }
        Mailbox(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Assigns a mailbox and registers a new entry under it.
    pub(crate) fn register(
        &self,
        op_id: OpTypeId,
        op_name: &'static str,
        role: Role,
        tx: mpsc::UnboundedSender<MailboxEvent>,
    ) -> Arc<MailboxEntry> {
        let mailbox = self.allocate_id();
        let entry = Arc::new(MailboxEntry {
            mailbox,
            op_id,
            op_name,
            role,
            tx,
            status: ArcSwap::from_pointee(OpStatus {
                state: "created",
                waiting: "none",
            }),
            created_at: Instant::now(),
        });
        self.entries.insert(mailbox, Arc::clone(&entry));
        entry
    }

    pub(crate) fn get(&self, mailbox: Mailbox) -> Option<Arc<MailboxEntry>> {
        self.entries.get(&mailbox).map(|e| Arc::clone(e.value()))
    }

    /// Removes the entry and frees its id for reuse.
    pub(crate) fn remove(&self, mailbox: Mailbox) -> Option<Arc<MailboxEntry>> {
        let (_, entry) = self.entries.remove(&mailbox)?;
        self.free.lock().push(mailbox);
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<LiveOpInfo> {
        let mut out: Vec<LiveOpInfo> = self.entries.iter().map(|e| e.value().info()).collect();
        out.sort_by_key(|info| info.mailbox);
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn register(table: &MailboxTable) -> Arc<MailboxEntry> {
        let (tx, _rx) = mpsc::unbounded_channel();
        table.register(OpTypeId(1), "TestOp", Role::Origin, tx)
    }

    #[test]
    fn ids_start_at_one_and_are_unique() {
        let table = MailboxTable::new();
        let a = register(&table);
        let b = register(&table);
        assert_eq!(a.mailbox, Mailbox(1));
        assert_eq!(b.mailbox, Mailbox(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn id_reused_only_after_removal() {
        let table = MailboxTable::new();
        let a = register(&table);
        let _b = register(&table);

        assert!(table.remove(a.mailbox).is_some());
        assert!(table.get(a.mailbox).is_none());
        let c = register(&table);
        assert_eq!(c.mailbox, a.mailbox);
        assert!(table.remove(Mailbox(99)).is_none());
    }

    #[test]
    fn live_ids_never_collide() {
        let table = Arc::new(MailboxTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200 {
                        let entry = register(&table);
                        if i % 2 == 0 {
                            table.remove(entry.mailbox);
                        } else {
                            kept.push(entry.mailbox);
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for mailbox in h.join().unwrap() {
                assert!(seen.insert(mailbox), "{mailbox} handed out twice");
            }
        }
        assert_eq!(seen.len(), table.len());
    }

    #[test]
    fn snapshot_reports_status() {
        let table = MailboxTable::new();
        let entry = register(&table);
        entry.set_status("snd_wait_for_reply", "wait_on_message");

        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].op_name, "TestOp");
        assert_eq!(snap[0].state, "snd_wait_for_reply");
        assert_eq!(snap[0].role, Role::Origin);
    }

    proptest! {
        /// Any interleaving of registrations and removals keeps live ids
        /// distinct and never hands out `Mailbox::NONE`.
        #[test]
        fn register_remove_sequences_keep_ids_distinct(
            ops in prop::collection::vec(prop::option::of(0usize..16), 1..200)
        ) {
            let table = MailboxTable::new();
            let mut live: Vec<Mailbox> = Vec::new();
            for op in ops {
                match op {
                    Some(idx) if !live.is_empty() => {
                        let mailbox = live.swap_remove(idx % live.len());
                        prop_assert!(table.remove(mailbox).is_some());
                    }
                    _ => {
                        let mailbox = register(&table).mailbox;
                        prop_assert!(!mailbox.is_none());
                        prop_assert!(!live.contains(&mailbox));
                        live.push(mailbox);
                    }
                }
            }
            prop_assert_eq!(table.len(), live.len());
        }
    }
}
