//! Fan-out of group lines, roster pushes and private messages.
//!
//! Delivery never stops at a failing peer. Peers whose queue rejects a line are
//! collected and sent through the departure sequence once the current fan-out
//! has finished, so one dead connection cannot stall or abort the others.

use std::num::NonZeroUsize;

use tracing::{debug, info};

use crate::{
    protocol::ServerLine,
    registry::{Registry, RegistryError},
    session::{DEFAULT_OUTBOUND_CAPACITY, SessionHandle},
};

#[derive(Debug)]
pub struct RelayState {
    registry: Registry,
    outbound_capacity: NonZeroUsize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::with_outbound_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions whose queue reaches `outbound_capacity` unsent lines are dropped.
    pub fn with_outbound_capacity(outbound_capacity: NonZeroUsize) -> Self {
        Self {
            registry: Registry::new(),
            outbound_capacity,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn outbound_capacity(&self) -> NonZeroUsize {
        self.outbound_capacity
    }

    /// Registers `session`, tells everyone else it arrived, then pushes the roster to all.
    pub async fn join(&self, session: &SessionHandle) -> Result<(), RegistryError> {
        self.registry.register(session.clone()).await?;
        info!(username = %session.username(), id = %session.id(), "session joined");

        let notice = ServerLine::Joined(session.username().to_string()).encode();
        self.broadcast_group(&notice, session.username()).await;
        self.broadcast_roster().await;
        Ok(())
    }

    /// Delivers `line` to every member except `excluded`, in roster order.
    pub async fn broadcast_group(&self, line: &str, excluded: &str) {
        let targets = self.registry.members_except(excluded).await;
        let dead = fan_out(&targets, line);
        self.settle(dead).await;
    }

    /// Pushes the current roster to every member, including whoever just joined.
    pub async fn broadcast_roster(&self) {
        let dead = self.push_roster().await;
        self.settle(dead).await;
    }

    /// Routes a private message and echoes it back to the sender.
    pub async fn deliver_private(&self, sender: &SessionHandle, recipient: &str, body: &str) {
        let mut dead = Vec::new();

        match self.registry.lookup(recipient).await {
            Some(target) => {
                let to_target = ServerLine::Direct {
                    peer: sender.username().to_string(),
                    body: body.to_string(),
                };
                let echo = ServerLine::Direct {
                    peer: recipient.to_string(),
                    body: body.to_string(),
                };

                debug!(from = %sender.username(), to = %recipient, "relaying private message");
                if target.deliver(to_target.encode()).is_err() {
                    dead.push(target);
                }
                if sender.deliver(echo.encode()).is_err() {
                    dead.push(sender.clone());
                }
            }
            None => {
                debug!(from = %sender.username(), to = %recipient, "recipient not found");
                let reply = ServerLine::UnknownRecipient(recipient.to_string());
                if sender.deliver(reply.encode()).is_err() {
                    dead.push(sender.clone());
                }
            }
        }

        self.settle(dead).await;
    }

    /// Runs the departure sequence for `session`.
    ///
    /// Returns `false` if the session had already left (or never joined), in
    /// which case nothing is announced.
    pub async fn depart(&self, session: &SessionHandle) -> bool {
        let announced = self.retire_and_announce(session).await;
        if let Some(dead) = announced {
            self.settle(dead).await;
            return true;
        }
        false
    }

    async fn push_roster(&self) -> Vec<SessionHandle> {
        let members = self.registry.members().await;
        let names = members
            .iter()
            .map(|member| member.username().to_string())
            .collect();
        fan_out(&members, &ServerLine::Roster(names).encode())
    }

    async fn retire_and_announce(&self, session: &SessionHandle) -> Option<Vec<SessionHandle>> {
        if !self.registry.retire(session).await {
            return None;
        }
        info!(username = %session.username(), id = %session.id(), "session left");

        let notice = ServerLine::Left(session.username().to_string()).encode();
        let remaining = self.registry.members().await;
        let mut dead = fan_out(&remaining, &notice);
        dead.extend(self.push_roster().await);
        Some(dead)
    }

    async fn settle(&self, mut pending: Vec<SessionHandle>) {
        while let Some(peer) = pending.pop() {
            debug!(username = %peer.username(), "peer stopped accepting lines");
            if let Some(more) = self.retire_and_announce(&peer).await {
                pending.extend(more);
            }
        }
    }
}

fn fan_out(targets: &[SessionHandle], line: &str) -> Vec<SessionHandle> {
    targets
        .iter()
        .filter(|target| target.deliver(line).is_err())
        .cloned()
        .collect()
}
