//! Observation engine: records plate sightings, computes average speed
//! between same-plate/same-road pairs, and emits `Ticket`s subject to
//! the one-ticket-per-plate-per-day rule.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::registry::RegistryHandle;

const DAY_IN_SECS: u32 = 86400;
const SYSTEM_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: Vec<u8>,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    pub speed_x100: u16,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    mile: u16,
    timestamp: u32,
    limit: u16,
}

enum Command {
    Record {
        plate: Vec<u8>,
        road: u16,
        mile: u16,
        timestamp: u32,
        limit: u16,
    },
}

struct Engine {
    observations: HashMap<(Vec<u8>, u16), Vec<Observation>>,
    billed_days: HashMap<Vec<u8>, HashSet<u32>>,
    registry: RegistryHandle,
}

impl Engine {
    fn record(&mut self, plate: Vec<u8>, road: u16, mile: u16, timestamp: u32, limit: u16) -> Vec<Ticket> {
        let key = (plate.clone(), road);
        let priors = self.observations.entry(key.clone()).or_default().clone();

        let mut tickets = Vec::new();
        for prior in &priors {
            if prior.timestamp == timestamp {
                continue;
            }

            let (a, b) = if prior.timestamp < timestamp {
                (*prior, Observation { mile, timestamp, limit })
            } else {
                (Observation { mile, timestamp, limit }, *prior)
            };

            let hours = (b.timestamp - a.timestamp) as f64 / 3600.0;
            let speed_mph = (b.mile.abs_diff(a.mile)) as f64 / hours;

            if speed_mph + 0.005 < limit as f64 + 0.5 {
                continue;
            }

            let day_start = a.timestamp / DAY_IN_SECS;
            let day_end = b.timestamp / DAY_IN_SECS;

            if self.try_claim_days(&plate, day_start, day_end) {
                let ticket = Ticket {
                    plate: plate.clone(),
                    road,
                    mile1: a.mile,
                    timestamp1: a.timestamp,
                    mile2: b.mile,
                    timestamp2: b.timestamp,
                    speed_x100: (speed_mph * 100.0).round() as u16,
                };
                info!(plate = %String::from_utf8_lossy(&ticket.plate), road, speed_x100 = ticket.speed_x100, "issuing ticket");
                tickets.push(ticket);
            } else {
                debug!(plate = %String::from_utf8_lossy(&plate), day_start, day_end, "day already billed, skipping");
            }
        }

        self.observations
            .entry(key)
            .or_default()
            .push(Observation { mile, timestamp, limit });

        tickets
    }

    /// Atomically checks whether any day in `[start, end]` is already
    /// billed for `plate`; if none are, claims all of them and returns
    /// true. Atomicity here is free: the engine is a single task
    /// processing one `Command` at a time.
    fn try_claim_days(&mut self, plate: &[u8], start: u32, end: u32) -> bool {
        let billed = self.billed_days.entry(plate.to_vec()).or_default();
        if (start..=end).any(|day| billed.contains(&day)) {
            return false;
        }
        billed.extend(start..=end);
        true
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub fn start(registry: RegistryHandle) -> Self {
        let (tx, mut rx) = mpsc::channel(SYSTEM_BUFFER_SIZE);

        let mut engine = Engine {
            observations: HashMap::new(),
            billed_days: HashMap::new(),
            registry,
        };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Record {
                        plate,
                        road,
                        mile,
                        timestamp,
                        limit,
                    } => {
                        let tickets = engine.record(plate, road, mile, timestamp, limit);
                        for ticket in tickets {
                            engine.registry.deliver_ticket(ticket).await;
                        }
                    }
                }
            }
        });

        Self { sender: tx }
    }

    pub async fn record(&self, plate: Vec<u8>, road: u16, mile: u16, timestamp: u32, limit: u16) {
        let _ = self
            .sender
            .send(Command::Record {
                plate,
                road,
                mile,
                timestamp,
                limit,
            })
            .await;
    }
}
