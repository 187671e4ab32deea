//! Binary frame protocol and message classifier.
//!
//! Every frame starts with a single type byte compatible with the Yjs
//! provider dialect: 0 Sync, 1 Awareness, 2 Auth, 3 QueryAwareness,
//! 4 SyncReply, 8 SyncStatus. Payload integers are unsigned varints
//! (7 bits per byte, low group first, high bit = continuation); byte
//! strings are varint-length-prefixed.
//!
//! Frames with any other leading byte are suspected content updates and
//! are classified by dry-applying them to a throwaway replica.

use crate::crdt;
use crate::error::ProtocolError;

pub const MSG_SYNC: u8 = 0;
pub const MSG_AWARENESS: u8 = 1;
pub const MSG_AUTH: u8 = 2;
pub const MSG_QUERY_AWARENESS: u8 = 3;
pub const MSG_SYNC_REPLY: u8 = 4;
pub const MSG_BROADCAST_STATELESS: u8 = 6;
pub const MSG_SYNC_STATUS: u8 = 8;

const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// Classification of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Sync,
    Awareness,
    Auth,
    QueryAwareness,
    SyncReply,
    SyncStatus,
    ContentUpdate,
    Unknown,
}

/// Classify a raw frame.
///
/// The first-byte table is the primary path; the dry-apply fallback only
/// runs for non-standard leading bytes, and only up to `max_probe` bytes
/// (larger frames are dropped as unknown). Allocates at most one scratch
/// replica per call.
pub fn classify(frame: &[u8], max_probe: usize) -> FrameKind {
    let Some(&first) = frame.first() else {
        return FrameKind::Unknown;
    };
    match first {
        MSG_SYNC => FrameKind::Sync,
        MSG_AWARENESS => FrameKind::Awareness,
        MSG_AUTH => FrameKind::Auth,
        MSG_QUERY_AWARENESS => FrameKind::QueryAwareness,
        MSG_SYNC_REPLY => FrameKind::SyncReply,
        MSG_SYNC_STATUS => FrameKind::SyncStatus,
        _ => {
            if frame.len() > max_probe {
                return FrameKind::Unknown;
            }
            match crdt::probe_update(frame) {
                Ok(probe) if probe.text_changed || probe.other_changed => {
                    FrameKind::ContentUpdate
                }
                // Applied cleanly but touched nothing we persist; treat as
                // presence noise rather than rejecting outright.
                Ok(_) => FrameKind::Awareness,
                Err(_) => FrameKind::Unknown,
            }
        }
    }
}

// ── varint primitives ──────────────────────────────────────────────

pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn read_var_u64(data: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(ProtocolError::Truncated)?;
        *pos += 1;
        if shift >= 64 {
            return Err(ProtocolError::BadVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn write_var_buf(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_u64(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn read_var_buf<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_u64(data, pos)? as usize;
    let end = pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
    let slice = data.get(*pos..end).ok_or(ProtocolError::Truncated)?;
    *pos = end;
    Ok(slice)
}

pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_buf(buf, s.as_bytes());
}

pub fn read_var_string(data: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let raw = read_var_buf(data, pos)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadString)
}

// ── Sync sub-protocol ──────────────────────────────────────────────

/// Payload of a Sync or SyncReply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    /// Peer's state vector; answer with the missing diff.
    Step1(Vec<u8>),
    /// Diff to apply.
    Step2(Vec<u8>),
    /// Incremental update to apply.
    Update(Vec<u8>),
}

pub fn decode_sync_payload(payload: &[u8]) -> Result<SyncPayload, ProtocolError> {
    let mut pos = 0;
    let kind = read_var_u64(payload, &mut pos)?;
    let body = read_var_buf(payload, &mut pos)?.to_vec();
    match kind {
        SYNC_STEP1 => Ok(SyncPayload::Step1(body)),
        SYNC_STEP2 => Ok(SyncPayload::Step2(body)),
        SYNC_UPDATE => Ok(SyncPayload::Update(body)),
        other => Err(ProtocolError::BadSyncType(other)),
    }
}

pub fn sync_step1_frame(state_vector: &[u8]) -> Vec<u8> {
    let mut buf = vec![MSG_SYNC];
    write_var_u64(&mut buf, SYNC_STEP1);
    write_var_buf(&mut buf, state_vector);
    buf
}

pub fn sync_step2_frame(update: &[u8]) -> Vec<u8> {
    let mut buf = vec![MSG_SYNC];
    write_var_u64(&mut buf, SYNC_STEP2);
    write_var_buf(&mut buf, update);
    buf
}

pub fn sync_update_frame(update: &[u8]) -> Vec<u8> {
    let mut buf = vec![MSG_SYNC];
    write_var_u64(&mut buf, SYNC_UPDATE);
    write_var_buf(&mut buf, update);
    buf
}

// ── Awareness codec ────────────────────────────────────────────────

/// One client's entry in an awareness update. `state` is a JSON document,
/// or the string "null" when the client is leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: String,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state == "null"
    }
}

/// Decode the payload of an Awareness frame (after the type byte).
pub fn decode_awareness_payload(payload: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
    let mut pos = 0;
    let body = read_var_buf(payload, &mut pos)?;
    let mut pos = 0;
    let count = read_var_u64(body, &mut pos)?;
    let mut entries = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let client_id = read_var_u64(body, &mut pos)?;
        let clock = read_var_u64(body, &mut pos)?;
        let state = read_var_string(body, &mut pos)?;
        entries.push(AwarenessEntry { client_id, clock, state });
    }
    Ok(entries)
}

/// Build a full Awareness frame from entries.
pub fn awareness_frame(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    write_var_u64(&mut body, entries.len() as u64);
    for entry in entries {
        write_var_u64(&mut body, entry.client_id);
        write_var_u64(&mut body, entry.clock);
        write_var_string(&mut body, &entry.state);
    }
    let mut buf = vec![MSG_AWARENESS];
    write_var_buf(&mut buf, &body);
    buf
}

// ── Outbound stateless frames ──────────────────────────────────────

/// Structured error frame: type 6 with a JSON payload. Sent for per-frame
/// rejections; the connection stays open.
pub fn error_frame(code: &str, message: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string();
    let mut buf = vec![MSG_BROADCAST_STATELESS];
    write_var_string(&mut buf, &payload);
    buf
}

/// Warning frame for operator-grade conditions (e.g. repeated store
/// failures), same wire shape as [`error_frame`].
pub fn warning_frame(code: &str, message: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "type": "warning",
        "code": code,
        "message": message,
    })
    .to_string();
    let mut buf = vec![MSG_BROADCAST_STATELESS];
    write_var_string(&mut buf, &payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Replica;

    const PROBE_CAP: usize = 1 << 20;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_var_u64(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 300);
        let mut pos = 0;
        assert_eq!(
            read_var_u64(&buf[..1], &mut pos),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn first_byte_table() {
        assert_eq!(classify(&[0, 0, 0], PROBE_CAP), FrameKind::Sync);
        assert_eq!(classify(&[1, 1, 0], PROBE_CAP), FrameKind::Awareness);
        assert_eq!(classify(&[2], PROBE_CAP), FrameKind::Auth);
        assert_eq!(classify(&[3], PROBE_CAP), FrameKind::QueryAwareness);
        assert_eq!(classify(&[4, 1, 0], PROBE_CAP), FrameKind::SyncReply);
        assert_eq!(classify(&[8, 1], PROBE_CAP), FrameKind::SyncStatus);
        assert_eq!(classify(&[], PROBE_CAP), FrameKind::Unknown);
    }

    #[test]
    fn garbage_with_odd_leading_byte_is_unknown() {
        assert_eq!(classify(&[9, 0xde, 0xad, 0xbe, 0xef], PROBE_CAP), FrameKind::Unknown);
        assert_eq!(classify(&[7, 1, 2, 3], PROBE_CAP), FrameKind::Unknown);
    }

    #[test]
    fn oversized_frame_is_not_probed() {
        let update = crate::crdt::test_support::unframed_content_update("x");
        assert_eq!(classify(&update, 4), FrameKind::Unknown);
    }

    #[test]
    fn bare_content_update_is_detected_by_dry_apply() {
        let update = crate::crdt::test_support::unframed_content_update("hello");
        assert!(update[0] > MSG_SYNC_STATUS, "update must dodge the tag table");
        assert_eq!(classify(&update, PROBE_CAP), FrameKind::ContentUpdate);
    }

    #[test]
    fn sync_payload_roundtrip() {
        let frame = sync_step2_frame(b"abc");
        assert_eq!(frame[0], MSG_SYNC);
        let payload = decode_sync_payload(&frame[1..]).unwrap();
        assert_eq!(payload, SyncPayload::Step2(b"abc".to_vec()));

        let frame = sync_step1_frame(b"\x00");
        let payload = decode_sync_payload(&frame[1..]).unwrap();
        assert_eq!(payload, SyncPayload::Step1(vec![0]));

        let frame = sync_update_frame(b"zzz");
        let payload = decode_sync_payload(&frame[1..]).unwrap();
        assert_eq!(payload, SyncPayload::Update(b"zzz".to_vec()));
    }

    #[test]
    fn initial_sync_frame_applies_to_a_fresh_replica() {
        let mut replica = Replica::new();
        replica.insert_text(0, "shared state");
        let frame = sync_step2_frame(&replica.encode_full());

        let SyncPayload::Step2(update) = decode_sync_payload(&frame[1..]).unwrap() else {
            panic!("expected step2");
        };
        let mut fresh = Replica::new();
        fresh.apply_update(&update).unwrap();
        assert_eq!(fresh.text_string(), "shared state");
    }

    #[test]
    fn awareness_roundtrip_including_removal() {
        let entries = vec![
            AwarenessEntry {
                client_id: 42,
                clock: 3,
                state: r#"{"cursor":42,"user":{"name":"bob"}}"#.to_string(),
            },
            AwarenessEntry { client_id: 7, clock: 9, state: "null".to_string() },
        ];
        let frame = awareness_frame(&entries);
        assert_eq!(frame[0], MSG_AWARENESS);
        let decoded = decode_awareness_payload(&frame[1..]).unwrap();
        assert_eq!(decoded, entries);
        assert!(!decoded[0].is_removal());
        assert!(decoded[1].is_removal());
    }

    #[test]
    fn error_frame_shape() {
        let frame = error_frame("permission_denied", "User bob has readonly access");
        assert_eq!(frame[0], MSG_BROADCAST_STATELESS);
        let mut pos = 1;
        let payload = read_var_string(&frame, &mut pos).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["code"], "permission_denied");
        assert_eq!(parsed["message"], "User bob has readonly access");
    }
}
