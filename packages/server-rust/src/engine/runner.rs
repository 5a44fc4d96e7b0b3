//! Per-operation runner task.
//!
//! A runner owns one live op and the receiving half of its mailbox channel.
//! It calls the op once per event, hands requested network actions to the
//! op's outbox task, and retires the op once it reported a terminal waiting
//! type and every issued action has completed.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio::time::sleep_until;
use tracing::{info_span, Instrument};

use super::dispatch::EngineShared;
use super::lifecycle::LiveOpGuard;
use super::mailbox::{MailboxEntry, MailboxEvent};
use crate::op::operation::{NetAction, OpCell};
use crate::op::{ActionId, NetOpKind, OpContext, OpEvent, WaitingType};
use crate::traits::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Terminal waiting type reached and all actions flushed.
    Done,
    /// Engine terminated the runner before the op finished.
    Terminated,
}

pub(crate) struct OpRunner {
    cell: OpCell,
    entry: Arc<MailboxEntry>,
    rx: mpsc::UnboundedReceiver<MailboxEvent>,
    shared: Arc<EngineShared>,
    outbox: mpsc::UnboundedSender<(ActionId, NetAction)>,
    outstanding: usize,
    deadline: Option<tokio::time::Instant>,
    next_action: u64,
    started_at: Instant,
    _live: LiveOpGuard,
    _permit: OwnedSemaphorePermit,
}

impl OpRunner {
    /// Spawns the runner and its outbox task on the engine's runtime.
    pub(crate) fn spawn(
        shared: &Arc<EngineShared>,
        cell: OpCell,
        entry: Arc<MailboxEntry>,
        rx: mpsc::UnboundedReceiver<MailboxEvent>,
        permit: OwnedSemaphorePermit,
        initial: Option<OpEvent>,
    ) {
        let span = info_span!(
            "op",
            node = %shared.node,
            mailbox = %entry.mailbox,
            op = entry.op_name,
            role = %entry.role,
        );

        let (outbox, actions) = mpsc::unbounded_channel();
        shared.runtime.spawn(
            flush_actions(Arc::clone(&shared.transport), entry.tx.clone(), actions)
                .instrument(span.clone()),
        );

        let runner = Self {
            cell,
            entry,
            rx,
            shared: Arc::clone(shared),
            outbox,
            outstanding: 0,
            deadline: None,
            next_action: 0,
            started_at: Instant::now(),
            _live: shared.lifecycle.live_guard(),
            _permit: permit,
        };
        let terminate = shared.lifecycle.terminate_receiver();
        shared
            .runtime
            .spawn(runner.run(initial, terminate).instrument(span));
    }

    async fn run(mut self, initial: Option<OpEvent>, mut terminate: watch::Receiver<bool>) {
        let mut exit = if *terminate.borrow_and_update() {
            Exit::Terminated
        } else {
            self.drive(initial, &mut terminate).await
        };
        if exit == Exit::Done {
            exit = self.flush(&mut terminate).await;
        }
        self.retire(exit);
    }

    async fn drive(&mut self, initial: Option<OpEvent>, terminate: &mut watch::Receiver<bool>) -> Exit {
        if let Some(event) = initial {
            if self.step(event) {
                return Exit::Done;
            }
        }

        loop {
            let deadline = self.deadline;
            let event = tokio::select! {
                biased;
                _ = terminate.changed() => return Exit::Terminated,
                received = self.rx.recv() => match received {
                    Some(event) => match self.translate(event) {
                        Some(event) => event,
                        None => continue,
                    },
                    None => return Exit::Terminated,
                },
                () = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    OpEvent::Timeout
                }
            };
            if self.step(event) {
                return Exit::Done;
            }
        }
    }

    /// Converts a queued event into what the op sees. Successful sends are
    /// only counted.
    fn translate(&mut self, event: MailboxEvent) -> Option<OpEvent> {
        match event {
            MailboxEvent::Message(msg) => Some(OpEvent::Message(msg)),
            MailboxEvent::Trigger(payload) => Some(OpEvent::UserTrigger(payload)),
            MailboxEvent::ActionDone {
                action,
                kind,
                outcome,
            } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if outcome.is_err() {
                    self.shared.stats.record_transport_failure();
                } else if kind == NetOpKind::Send {
                    return None;
                }
                Some(OpEvent::Completion {
                    action,
                    kind,
                    outcome,
                })
            }
        }
    }

    /// Runs one transition. Returns `true` once the op is finished.
    fn step(&mut self, event: OpEvent) -> bool {
        let event_name = event.name();
        let shared = Arc::clone(&self.shared);
        let mut ctx = OpContext::new(
            self.entry.mailbox,
            &shared.allocator,
            shared.transport.as_ref(),
            &mut self.next_action,
        );

        let wait = match self.cell.update(event, &mut ctx) {
            Ok(wait) => wait,
            Err(violation) => {
                tracing::error!(%violation, "invariant violation; poisoning engine");
                shared.lifecycle.poison();
                panic!("{violation}");
            }
        };

        for (action, net) in ctx.into_actions() {
            self.outstanding += 1;
            if self.outbox.send((action, net)).is_err() {
                self.outstanding -= 1;
                tracing::error!(%action, "outbox closed; action not issued");
            }
        }

        self.deadline = match wait {
            WaitingType::WaitOnTimeout(after) => Some(tokio::time::Instant::now() + after),
            _ => None,
        };
        let state = self.cell.state_name();
        self.entry.set_status(state, wait.name());
        tracing::debug!(
            event = event_name,
            state,
            waiting = wait.name(),
            outstanding = self.outstanding,
            "transition"
        );
        wait.is_terminal()
    }

    /// Waits for outstanding actions after the op finished. Late completions
    /// are absorbed; anything else is dropped.
    async fn flush(&mut self, terminate: &mut watch::Receiver<bool>) -> Exit {
        while self.outstanding > 0 {
            tokio::select! {
                biased;
                _ = terminate.changed() => return Exit::Terminated,
                received = self.rx.recv() => match received {
                    Some(MailboxEvent::ActionDone { action, kind, outcome }) => {
                        self.outstanding -= 1;
                        if let Err(e) = outcome {
                            self.shared.stats.record_transport_failure();
                            tracing::debug!(%action, ?kind, error = %e, "action failed after op finished");
                        }
                    }
                    Some(other) => self.drop_late(&other),
                    None => return Exit::Terminated,
                },
            }
        }
        Exit::Done
    }

    fn drop_late(&self, event: &MailboxEvent) {
        drop_late(&self.shared, event);
    }

    /// Destroys the op, then frees its mailbox. The id is not reusable until
    /// the op is gone.
    fn retire(mut self, exit: Exit) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.drop_late(&event);
        }

        let state = self.cell.state_name();
        let finished = self.cell.is_done();
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = self.started_at.elapsed().as_millis() as u64;

        let Self {
            cell,
            entry,
            shared,
            _live,
            _permit,
            ..
        } = self;
        drop(cell);
        shared.mailboxes.remove(entry.mailbox);

        let op_name = entry.op_name;
        match exit {
            Exit::Done => {
                shared.stats.record_retired(op_name);
                tracing::info!(state, duration_ms, "operation complete");
            }
            Exit::Terminated => {
                shared.stats.record_abandoned(op_name);
                tracing::warn!(state, duration_ms, finished, "operation abandoned");
            }
        }
    }
}

/// Counts and logs an event that reached an op after it finished.
fn drop_late(shared: &EngineShared, event: &MailboxEvent) {
    match event {
        MailboxEvent::Message(msg) => {
            shared.stats.record_stale();
            tracing::warn!(
                src_node = %msg.src_node,
                src_mailbox = %msg.src_mailbox,
                "dropping message for finished operation"
            );
        }
        MailboxEvent::Trigger(_) => {
            tracing::warn!("dropping user trigger for finished operation");
        }
        MailboxEvent::ActionDone { .. } => {}
    }
}

/// Issues an op's network actions one at a time, in the order requested, and
/// reports each completion back to the op's mailbox.
async fn flush_actions(
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<MailboxEvent>,
    mut actions: mpsc::UnboundedReceiver<(ActionId, NetAction)>,
) {
    while let Some((action, net)) = actions.recv().await {
        let kind = net.kind();
        let outcome = match net {
            NetAction::Send { peer, msg } => transport.send(peer, msg).await,
            NetAction::Get {
                peer,
                remote,
                local,
            } => transport.get(peer, remote, local).await,
            NetAction::Put {
                peer,
                local,
                remote,
            } => transport.put(peer, local, remote).await,
        };
        if let Err(e) = &outcome {
            tracing::debug!(%action, ?kind, error = %e, "network action failed");
        }
        // The runner is gone if the engine terminated it.
        let _ = events.send(MailboxEvent::ActionDone {
            action,
            kind,
            outcome,
        });
    }
}
