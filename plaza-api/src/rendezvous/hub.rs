use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use plaza_core::models::ParticipantId;
use plaza_core::protocol::{PeerSignal, ServerMessage};

/// Outbound queue of one rendezvous connection
pub type MemberSender = mpsc::Sender<ServerMessage>;

#[derive(Debug, Clone)]
struct Member {
    id: ParticipantId,
    sender: MemberSender,
}

/// Topic membership for mesh peer discovery
///
/// Members of a topic learn about each other's arrivals and departures and can
/// exchange signals. Nothing crosses topic boundaries.
#[derive(Debug, Default)]
pub struct RendezvousHub {
    /// topic -> members, in join order
    topics: DashMap<String, Vec<Member>>,
    /// member -> topic, for cleanup and signal routing
    members: DashMap<ParticipantId, String>,
}

impl RendezvousHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to `topic` under a fresh identity
    ///
    /// The joiner gets its `Welcome` before anyone else hears about it.
    pub fn join(&self, topic: &str, sender: MemberSender) -> ParticipantId {
        let id = ParticipantId::new();
        let mut members = self.topics.entry(topic.to_string()).or_default();
        let peers: Vec<ParticipantId> = members.iter().map(|m| m.id.clone()).collect();

        deliver(
            &id,
            &sender,
            ServerMessage::Welcome {
                self_id: id.clone(),
                peers,
            },
        );
        for member in members.iter() {
            deliver(
                &member.id,
                &member.sender,
                ServerMessage::PeerJoined {
                    peer_id: id.clone(),
                },
            );
        }
        members.push(Member {
            id: id.clone(),
            sender,
        });
        let size = members.len();
        drop(members);

        self.members.insert(id.clone(), topic.to_string());
        info!(participant = %id, topic = %short(topic), members = size, "Rendezvous member joined");
        id
    }

    /// Remove a member and tell the rest of its topic
    pub fn leave(&self, id: &ParticipantId) {
        let Some((_, topic)) = self.members.remove(id) else {
            return;
        };

        if let Some(mut members) = self.topics.get_mut(&topic) {
            members.retain(|m| m.id != *id);
            for member in members.iter() {
                deliver(
                    &member.id,
                    &member.sender,
                    ServerMessage::PeerLeft { peer_id: id.clone() },
                );
            }
            if members.is_empty() {
                drop(members);
                self.topics.remove_if(&topic, |_, members| members.is_empty());
                debug!(topic = %short(&topic), "Rendezvous topic is empty, removed");
            }
        }
        info!(participant = %id, topic = %short(&topic), "Rendezvous member left");
    }

    /// Forward a signal between two members of the same topic
    ///
    /// Returns false when `to` is not in the sender's topic.
    pub fn relay_signal(&self, from: &ParticipantId, to: &ParticipantId, signal: PeerSignal) -> bool {
        let Some(topic) = self.members.get(from).map(|t| t.clone()) else {
            return false;
        };
        let Some(members) = self.topics.get(&topic) else {
            return false;
        };
        let Some(target) = members.iter().find(|m| m.id == *to) else {
            return false;
        };

        deliver(
            &target.id,
            &target.sender,
            ServerMessage::Signal {
                from: from.clone(),
                signal,
            },
        );
        true
    }

    /// Number of members currently in `topic`
    #[must_use]
    pub fn occupancy(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |members| members.len())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Queue a message for one member; slow consumers lose messages
fn deliver(id: &ParticipantId, sender: &MemberSender, message: ServerMessage) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(participant = %id, "Rendezvous client too slow, dropping message");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(participant = %id, "Rendezvous client already gone");
        }
    }
}

fn short(topic: &str) -> &str {
    topic.get(..8).unwrap_or(topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_core::protocol::IceCandidate;

    fn member() -> (MemberSender, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(16)
    }

    #[test]
    fn test_join_welcomes_and_announces() {
        let hub = RendezvousHub::new();
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();

        let a = hub.join("t", a_tx);
        let b = hub.join("t", b_tx);

        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerMessage::Welcome {
                self_id: a.clone(),
                peers: vec![]
            }
        );
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::PeerJoined { peer_id: b.clone() });
        assert_eq!(
            b_rx.try_recv().unwrap(),
            ServerMessage::Welcome {
                self_id: b,
                peers: vec![a]
            }
        );
        assert_eq!(hub.occupancy("t"), 2);
    }

    #[test]
    fn test_signals_stay_inside_topic() {
        let hub = RendezvousHub::new();
        let (a_tx, _a_rx) = member();
        let (b_tx, mut b_rx) = member();
        let (c_tx, _c_rx) = member();
        let a = hub.join("t", a_tx);
        let b = hub.join("t", b_tx);
        let c = hub.join("other", c_tx);

        let signal = PeerSignal::Candidate(IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
        assert!(hub.relay_signal(&a, &b, signal.clone()));
        assert!(!hub.relay_signal(&a, &c, signal.clone()));
        assert!(!hub.relay_signal(&ParticipantId::from("ghost"), &b, signal.clone()));

        let _welcome = b_rx.try_recv().unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::Signal { from: a, signal });
    }

    #[test]
    fn test_leave_notifies_and_cleans_up() {
        let hub = RendezvousHub::new();
        let (a_tx, _a_rx) = member();
        let (b_tx, mut b_rx) = member();
        let a = hub.join("t", a_tx);
        let _b = hub.join("t", b_tx);

        hub.leave(&a);
        hub.leave(&a);

        let _welcome = b_rx.try_recv().unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::PeerLeft { peer_id: a });
        assert!(b_rx.try_recv().is_err());
        assert_eq!(hub.occupancy("t"), 1);
    }

    #[test]
    fn test_empty_topic_removed() {
        let hub = RendezvousHub::new();
        let (tx, _rx) = member();
        let id = hub.join("t", tx);
        assert_eq!(hub.topic_count(), 1);

        hub.leave(&id);
        assert_eq!(hub.topic_count(), 0);
        assert_eq!(hub.occupancy("t"), 0);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let hub = RendezvousHub::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let _slow = hub.join("t", slow_tx);

        for _ in 0..4 {
            let (tx, _rx) = member();
            hub.join("t", tx);
        }
        assert_eq!(hub.occupancy("t"), 5);
    }
}
