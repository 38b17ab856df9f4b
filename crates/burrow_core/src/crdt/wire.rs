//! Binary wire codec for the sync protocol.
//!
//! Every message starts with a tag byte (`0` = sync, `1` = awareness; `2` is
//! reserved for auth and never sent). Sync messages carry a second sub-type
//! byte (`0` = SyncStep1, `1` = SyncStep2, `2` = Update). The payload that
//! follows is length-prefixed with an unsigned LEB128 varint so that several
//! messages can travel in one frame.
//!
//! # Protocol Overview
//!
//! Synchronization uses a two-phase handshake:
//!
//! 1. **SyncStep1**: a peer sends its state vector
//! 2. **SyncStep2**: the other side responds with the missing updates
//!
//! After the handshake, incremental **Update** messages flow in both
//! directions. **Awareness** messages are relayed opaquely.

use crate::error::CrdtError;

/// Message type bytes.
mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u8 = 0;
    /// Awareness message
    pub const AWARENESS: u8 = 1;
    /// Auth message (reserved, unused on the wire)
    #[allow(dead_code)]
    pub const AUTH: u8 = 2;
}

/// Sync sub-message types.
mod sync_type {
    /// SyncStep1: state vector exchange
    pub const STEP1: u8 = 0;
    /// SyncStep2: missing updates response
    pub const STEP2: u8 = 1;
    /// Update: incremental update
    pub const UPDATE: u8 = 2;
}

/// A single message on the sync wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// SyncStep1 carries a state vector.
    SyncStep1(Vec<u8>),
    /// SyncStep2 carries the updates the peer is missing.
    SyncStep2(Vec<u8>),
    /// Update carries an incremental update.
    Update(Vec<u8>),
    /// Awareness carries an opaque awareness delta.
    Awareness(Vec<u8>),
}

impl WireMessage {
    /// Encode the message to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (header, payload): (&[u8], &[u8]) = match self {
            WireMessage::SyncStep1(sv) => (&[msg_type::SYNC, sync_type::STEP1], sv),
            WireMessage::SyncStep2(update) => (&[msg_type::SYNC, sync_type::STEP2], update),
            WireMessage::Update(update) => (&[msg_type::SYNC, sync_type::UPDATE], update),
            WireMessage::Awareness(delta) => (&[msg_type::AWARENESS], delta),
        };

        let mut buf = Vec::with_capacity(header.len() + 5 + payload.len());
        buf.extend_from_slice(header);
        write_var_u32(&mut buf, payload.len() as u32);
        buf.extend_from_slice(payload);
        buf
    }

    /// True for messages that mutate document state when applied.
    pub fn is_mutation(&self) -> bool {
        matches!(self, WireMessage::SyncStep2(_) | WireMessage::Update(_))
    }

    /// Decode a single message from the front of `data`.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CrdtError> {
        if data.is_empty() {
            return Err(CrdtError::Frame("empty frame".into()));
        }

        match data[0] {
            msg_type::SYNC => {
                if data.len() < 2 {
                    return Err(CrdtError::Frame("truncated sync header".into()));
                }
                let (payload, consumed) = read_payload(&data[2..])?;
                let msg = match data[1] {
                    sync_type::STEP1 => WireMessage::SyncStep1(payload),
                    sync_type::STEP2 => WireMessage::SyncStep2(payload),
                    sync_type::UPDATE => WireMessage::Update(payload),
                    other => {
                        return Err(CrdtError::Frame(format!("unknown sync type: {}", other)));
                    }
                };
                Ok((msg, 2 + consumed))
            }
            msg_type::AWARENESS => {
                let (payload, consumed) = read_payload(&data[1..])?;
                Ok((WireMessage::Awareness(payload), 1 + consumed))
            }
            other => Err(CrdtError::Frame(format!("unknown message type: {}", other))),
        }
    }

    /// Decode every message in a frame.
    ///
    /// A frame may carry several concatenated messages (e.g. a SyncStep2
    /// followed by the sender's own SyncStep1).
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>, CrdtError> {
        let mut messages = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let (msg, consumed) = Self::decode(rest)?;
            messages.push(msg);
            rest = &rest[consumed..];
        }
        Ok(messages)
    }
}

/// Read a varint-length-prefixed payload; returns (payload, bytes consumed).
fn read_payload(data: &[u8]) -> Result<(Vec<u8>, usize), CrdtError> {
    let (len, len_bytes) = read_var_u32(data)?;
    let len = len as usize;
    let end = len_bytes + len;
    if data.len() < end {
        return Err(CrdtError::Frame(format!(
            "payload truncated: expected {} bytes, have {}",
            len,
            data.len() - len_bytes
        )));
    }
    Ok((data[len_bytes..end].to_vec(), end))
}

/// Append an unsigned LEB128 varint.
fn write_var_u32(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint; returns (value, bytes consumed).
fn read_var_u32(data: &[u8]) -> Result<(u32, usize), CrdtError> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 32 {
            return Err(CrdtError::Frame("varint overflow".into()));
        }
    }
    Err(CrdtError::Frame("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_round_trip() {
        let sv = vec![1, 2, 3, 4];
        let encoded = WireMessage::SyncStep1(sv.clone()).encode();
        assert_eq!(encoded[0], msg_type::SYNC);
        assert_eq!(encoded[1], sync_type::STEP1);

        let (decoded, consumed) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::SyncStep1(sv));
    }

    #[test]
    fn test_sync_step2_round_trip() {
        let update = vec![5, 6, 7, 8];
        let encoded = WireMessage::SyncStep2(update.clone()).encode();
        let (decoded, _) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, WireMessage::SyncStep2(update));
    }

    #[test]
    fn test_update_round_trip() {
        let update = vec![9, 10, 11];
        let encoded = WireMessage::Update(update.clone()).encode();
        let (decoded, _) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, WireMessage::Update(update));
    }

    #[test]
    fn test_awareness_round_trip() {
        let delta = vec![42; 300];
        let encoded = WireMessage::Awareness(delta.clone()).encode();
        assert_eq!(encoded[0], msg_type::AWARENESS);
        let (decoded, consumed) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::Awareness(delta));
    }

    #[test]
    fn test_decode_all_concatenated() {
        let mut frame = WireMessage::SyncStep2(vec![1, 2]).encode();
        frame.extend(WireMessage::SyncStep1(vec![3]).encode());
        frame.extend(WireMessage::Awareness(vec![4, 5, 6]).encode());

        let messages = WireMessage::decode_all(&frame).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], WireMessage::SyncStep2(vec![1, 2]));
        assert_eq!(messages[1], WireMessage::SyncStep1(vec![3]));
        assert_eq!(messages[2], WireMessage::Awareness(vec![4, 5, 6]));
    }

    #[test]
    fn test_empty_payload() {
        let encoded = WireMessage::SyncStep1(Vec::new()).encode();
        let (decoded, _) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, WireMessage::SyncStep1(Vec::new()));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(WireMessage::decode(&[]).is_err());
        assert!(WireMessage::decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(WireMessage::decode(&[7, 0, 0]).is_err());
        // Tag 2 (auth) is reserved and never valid on the wire.
        assert!(WireMessage::decode(&[2, 0]).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut encoded = WireMessage::Update(vec![1, 2, 3, 4]).encode();
        encoded.truncate(encoded.len() - 2);
        assert!(WireMessage::decode(&encoded).is_err());
    }

    #[test]
    fn test_large_payload_varint() {
        let payload = vec![0xab; 70_000];
        let encoded = WireMessage::Update(payload.clone()).encode();
        let (decoded, consumed) = WireMessage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::Update(payload));
    }

    #[test]
    fn test_is_mutation() {
        assert!(WireMessage::SyncStep2(vec![]).is_mutation());
        assert!(WireMessage::Update(vec![]).is_mutation());
        assert!(!WireMessage::SyncStep1(vec![]).is_mutation());
        assert!(!WireMessage::Awareness(vec![]).is_mutation());
    }
}
