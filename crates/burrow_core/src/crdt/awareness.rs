//! Ephemeral per-vault awareness state.
//!
//! Awareness carries presence (cursor, selection, active file) for every
//! connected editor. The server never interprets the JSON payloads; it merges
//! deltas by the awareness clock rule, rebroadcasts them, and crafts removal
//! updates when a connection departs. Nothing here is persisted.

use std::collections::HashMap;

use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

use crate::error::CrdtError;

/// JSON literal marking a departed client in the awareness protocol.
const NULL_STATE: &str = "null";

#[derive(Debug, Clone)]
struct ClientState {
    clock: u32,
    json: String,
}

/// Merged awareness state for one vault.
///
/// Follows the standard awareness merge rule: an incoming entry wins when its
/// clock is newer, or on a clock tie when it is a removal.
#[derive(Debug, Default)]
pub struct VaultAwareness {
    states: HashMap<u64, ClientState>,
}

impl VaultAwareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an encoded awareness delta.
    ///
    /// Returns every client id named by the delta, applied or not, so the
    /// caller can associate awareness clients with the connection that sent
    /// them.
    pub fn apply_update(&mut self, delta: &[u8]) -> Result<Vec<u64>, CrdtError> {
        let update = AwarenessUpdate::decode_v1(delta)
            .map_err(|e| CrdtError::Decode(format!("awareness update: {}", e)))?;

        let mut seen = Vec::with_capacity(update.clients.len());
        for (client_id, entry) in update.clients {
            let client_id = client_id as u64;
            seen.push(client_id);

            let incoming_null = &*entry.json == NULL_STATE;
            let apply = match self.states.get(&client_id) {
                Some(current) => {
                    entry.clock > current.clock
                        || (entry.clock == current.clock
                            && incoming_null
                            && current.json != NULL_STATE)
                }
                None => true,
            };
            if apply {
                self.states.insert(
                    client_id,
                    ClientState {
                        clock: entry.clock,
                        json: entry.json.to_string(),
                    },
                );
            }
        }
        Ok(seen)
    }

    /// Encode the full live awareness state, or `None` when nobody is present.
    pub fn encode_full(&self) -> Option<Vec<u8>> {
        let clients: HashMap<_, _> = self
            .states
            .iter()
            .filter(|(_, state)| state.json != NULL_STATE)
            .map(|(id, state)| {
                (
                    *id,
                    AwarenessUpdateEntry {
                        clock: state.clock,
                        json: state.json.clone().into(),
                    },
                )
            })
            .collect();

        if clients.is_empty() {
            return None;
        }
        Some(AwarenessUpdate { clients }.encode_v1())
    }

    /// Mark the given clients as departed and encode the removal delta.
    ///
    /// Returns `None` when none of the clients were known.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> Option<Vec<u8>> {
        let mut removed = HashMap::new();
        for id in client_ids {
            if let Some(state) = self.states.get_mut(id) {
                if state.json == NULL_STATE {
                    continue;
                }
                state.clock += 1;
                state.json = NULL_STATE.to_string();
                removed.insert(
                    *id,
                    AwarenessUpdateEntry {
                        clock: state.clock,
                        json: NULL_STATE.to_string().into(),
                    },
                );
            }
        }
        if removed.is_empty() {
            return None;
        }
        Some(AwarenessUpdate { clients: removed }.encode_v1())
    }

    /// Number of clients with live (non-null) state.
    pub fn live_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.json != NULL_STATE)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(client: u64, clock: u32, json: &str) -> Vec<u8> {
        let mut clients = HashMap::new();
        clients.insert(
            client,
            AwarenessUpdateEntry {
                clock,
                json: json.to_string().into(),
            },
        );
        AwarenessUpdate { clients }.encode_v1()
    }

    #[test]
    fn test_apply_and_count() {
        let mut aw = VaultAwareness::new();
        let seen = aw.apply_update(&delta(7, 1, r#"{"cursor":3}"#)).unwrap();
        assert_eq!(seen, vec![7]);
        assert_eq!(aw.live_count(), 1);
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut aw = VaultAwareness::new();
        aw.apply_update(&delta(7, 5, r#"{"file":"b.md"}"#)).unwrap();
        aw.apply_update(&delta(7, 3, r#"{"file":"a.md"}"#)).unwrap();

        let full = aw.encode_full().unwrap();
        let decoded = AwarenessUpdate::decode_v1(&full).unwrap();
        assert_eq!(&*decoded.clients[&7].json, r#"{"file":"b.md"}"#);
        assert_eq!(decoded.clients[&7].clock, 5);
    }

    #[test]
    fn test_removal_wins_clock_tie() {
        let mut aw = VaultAwareness::new();
        aw.apply_update(&delta(9, 2, r#"{}"#)).unwrap();
        aw.apply_update(&delta(9, 2, "null")).unwrap();
        assert_eq!(aw.live_count(), 0);
        assert!(aw.encode_full().is_none());
    }

    #[test]
    fn test_remove_clients_encodes_removal() {
        let mut aw = VaultAwareness::new();
        aw.apply_update(&delta(1, 1, r#"{"user":"a"}"#)).unwrap();
        aw.apply_update(&delta(2, 1, r#"{"user":"b"}"#)).unwrap();

        let removal = aw.remove_clients(&[1]).unwrap();
        let decoded = AwarenessUpdate::decode_v1(&removal).unwrap();
        assert_eq!(decoded.clients.len(), 1);
        assert_eq!(&*decoded.clients[&1].json, "null");
        assert_eq!(decoded.clients[&1].clock, 2);

        assert_eq!(aw.live_count(), 1);
    }

    #[test]
    fn test_remove_unknown_client_is_none() {
        let mut aw = VaultAwareness::new();
        assert!(aw.remove_clients(&[42]).is_none());
    }

    #[test]
    fn test_removal_propagates_between_sets() {
        let mut server = VaultAwareness::new();
        let mut peer = VaultAwareness::new();

        let hello = delta(5, 1, r#"{"user":"x"}"#);
        server.apply_update(&hello).unwrap();
        peer.apply_update(&hello).unwrap();

        let removal = server.remove_clients(&[5]).unwrap();
        peer.apply_update(&removal).unwrap();
        assert_eq!(peer.live_count(), 0);
    }

    #[test]
    fn test_garbage_delta_rejected() {
        let mut aw = VaultAwareness::new();
        assert!(aw.apply_update(&[0xff, 0xff, 0xff]).is_err());
    }
}
