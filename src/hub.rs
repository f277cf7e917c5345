use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::message::{DISCONNECT_TYPE, Envelope, JOIN_TYPE, MessageBody, User};

pub type ClientId = u64;

/// A freshly accepted connection joining its channel.
#[derive(Debug)]
pub struct Registration {
    pub id: ClientId,
    pub channel: String,
    pub outbound: mpsc::UnboundedSender<Envelope>,
}

/// Posted when a connection's read loop ends; the only deregistration path.
#[derive(Debug, Clone)]
pub struct Departure {
    pub id: ClientId,
    pub channel: String,
}

/// A broadcast request from one client to every member of its channel.
#[derive(Debug)]
pub struct Publish {
    pub sender: ClientId,
    pub channel: String,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    /// A join; the hub records the identity and fans out a roster snapshot.
    Join(User),
    /// Any other frame, already stamped with the sender's identity.
    Stamped(MessageBody),
}

struct Member {
    user: Option<User>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

/// Owns the channel-membership table and processes one event at a time.
///
/// Connection handlers never touch the table directly; they post events
/// through a [`HubHandle`] and the single event loop in [`Hub::run`] is the
/// only place membership is read or mutated, so no locking is needed.
pub struct Hub {
    register_rx: mpsc::UnboundedReceiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<Departure>,
    publish_rx: mpsc::UnboundedReceiver<Publish>,
    channels: HashMap<String, HashMap<ClientId, Member>>,
}

/// Cloneable handle the connection handlers use to talk to the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<Registration>,
    unregister_tx: mpsc::UnboundedSender<Departure>,
    publish_tx: mpsc::UnboundedSender<Publish>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, registration: Registration) {
        if self.register_tx.send(registration).is_err() {
            warn!("hub event loop is gone; register dropped");
        }
    }

    pub fn unregister(&self, departure: Departure) {
        if self.unregister_tx.send(departure).is_err() {
            warn!("hub event loop is gone; unregister dropped");
        }
    }

    pub fn publish(&self, publish: Publish) {
        if self.publish_tx.send(publish).is_err() {
            warn!("hub event loop is gone; broadcast dropped");
        }
    }
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let hub = Self {
            register_rx,
            unregister_rx,
            publish_rx,
            channels: HashMap::new(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            publish_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Runs the event loop until every handle has been dropped.
    ///
    /// A malformed message or a failed delivery never stops the loop; only
    /// the event queues closing does, and the server treats that as fatal.
    pub async fn run(mut self) {
        loop {
            select! {
                // Registers drain first, so a join that raced its own
                // registration still finds the member in the table.
                biased;
                registration = self.register_rx.recv() => match registration {
                    Some(registration) => self.handle_register(registration),
                    None => break,
                },
                departure = self.unregister_rx.recv() => match departure {
                    Some(departure) => self.handle_unregister(departure),
                    None => break,
                },
                publish = self.publish_rx.recv() => match publish {
                    Some(publish) => self.handle_publish(publish),
                    None => break,
                },
            }
        }
        debug!("hub event loop stopped");
    }

    fn handle_register(&mut self, registration: Registration) {
        let Registration {
            id,
            channel,
            outbound,
        } = registration;
        let members = self.channels.entry(channel.clone()).or_default();
        members.insert(id, Member { user: None, outbound });
        debug!(
            client = id,
            channel = %channel,
            members = members.len(),
            "client registered"
        );
    }

    fn handle_unregister(&mut self, departure: Departure) {
        let Departure { id, channel } = departure;
        let Some(members) = self.channels.get_mut(&channel) else {
            return;
        };
        if members.remove(&id).is_none() {
            return;
        }
        info!(client = id, channel = %channel, "client unregistered");

        if members.is_empty() {
            // Last member left; drop the entry to bound memory.
            self.channels.remove(&channel);
            return;
        }
        self.broadcast_roster(&channel, DISCONNECT_TYPE);
    }

    fn handle_publish(&mut self, publish: Publish) {
        let Publish {
            sender,
            channel,
            payload,
        } = publish;
        if !self.channels.contains_key(&channel) {
            debug!(client = sender, channel = %channel, "dropping broadcast for unknown channel");
            return;
        }

        match payload {
            Payload::Join(user) => {
                if let Some(member) = self
                    .channels
                    .get_mut(&channel)
                    .and_then(|members| members.get_mut(&sender))
                {
                    // The first identity sticks; a repeated join only
                    // refreshes the roster.
                    member.user.get_or_insert(user);
                }
                info!(client = sender, channel = %channel, "client joined");
                self.broadcast_roster(&channel, JOIN_TYPE);
            }
            Payload::Stamped(body) => match Envelope::stamped(&body) {
                Ok(envelope) => self.deliver(&channel, &envelope),
                Err(err) => {
                    warn!(client = sender, channel = %channel, error = %err, "failed to encode message body");
                }
            },
        }
    }

    /// Snapshots the roster from the membership table at this instant and
    /// fans it out; members that have not identified themselves yet are
    /// omitted.
    fn broadcast_roster(&mut self, channel: &str, kind: u32) {
        let Some(members) = self.channels.get(channel) else {
            return;
        };
        let mut users: Vec<User> = members
            .values()
            .filter_map(|member| member.user.clone())
            .collect();
        users.sort_by_key(|user| user.id);

        match Envelope::roster(kind, users) {
            Ok(envelope) => self.deliver(channel, &envelope),
            Err(err) => warn!(channel = %channel, error = %err, "failed to encode roster"),
        }
    }

    fn deliver(&self, channel: &str, envelope: &Envelope) {
        let Some(members) = self.channels.get(channel) else {
            return;
        };
        for (id, member) in members {
            // Send-and-forget: a closed queue means that client's handler
            // is already tearing down, so keep delivering to the rest.
            if member.outbound.send(envelope.clone()).is_err() {
                warn!(client = *id, channel = %channel, "dropping delivery to closed client");
            }
        }
    }
}
