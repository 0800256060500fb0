//! Decoding of raw batch storage values.
//!
//! The kernel program writes `struct http_batch_t` values with C layout in
//! little-endian byte order. The total length is checked once per batch, then
//! fixed-offset reads decode each transaction. Nothing in the payload is
//! trusted: `pos` is clamped to the batch capacity.

use thiserror::Error;

use super::types::{ConnTuple, HttpBatch, HttpTransaction, HTTP_BATCH_SIZE, HTTP_BUFFER_SIZE};

/// Size of `conn_tuple_t`.
pub const CONN_TUPLE_SIZE: usize = 48;

/// Size of `http_transaction_t`, including trailing alignment.
pub const HTTP_TX_SIZE: usize = 248;

/// Offset of the first transaction inside a batch (idx u64, pos u8, pad).
pub const BATCH_HEADER_SIZE: usize = 16;

/// Size of `http_batch_t`.
pub const HTTP_BATCH_WIRE_SIZE: usize = BATCH_HEADER_SIZE + HTTP_BATCH_SIZE * HTTP_TX_SIZE;

/// Size of the perf notification payload (cpu u32, pad u32, idx u64).
pub const NOTIFICATION_SIZE: usize = 16;

/// Errors that can occur while decoding storage values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("batch too short: {size} bytes, need {need}")]
    BatchTruncated { size: usize, need: usize },

    #[error("notification too short: {size} bytes")]
    NotificationTruncated { size: usize },
}

/// Decode a raw `http_batch_t` value.
pub fn parse_batch(data: &[u8]) -> Result<HttpBatch, ParseError> {
    if data.len() < HTTP_BATCH_WIRE_SIZE {
        return Err(ParseError::BatchTruncated {
            size: data.len(),
            need: HTTP_BATCH_WIRE_SIZE,
        });
    }

    let idx = read_u64_le(data, 0);
    let raw_pos = read_u8(data, 8);
    let pos = raw_pos.min(HTTP_BATCH_SIZE as u8);
    if raw_pos != pos {
        tracing::debug!(idx, raw_pos, "batch pos exceeds capacity, clamping");
    }

    let mut txs = Vec::with_capacity(HTTP_BATCH_SIZE);
    for i in 0..HTTP_BATCH_SIZE {
        let start = BATCH_HEADER_SIZE + i * HTTP_TX_SIZE;
        txs.push(parse_transaction(&data[start..start + HTTP_TX_SIZE]));
    }

    Ok(HttpBatch { idx, pos, txs })
}

/// Decode a perf notification payload into `(cpu, idx)`.
pub fn parse_notification(data: &[u8]) -> Result<(u32, u64), ParseError> {
    if data.len() < NOTIFICATION_SIZE {
        return Err(ParseError::NotificationTruncated { size: data.len() });
    }
    // pad[4] at 4-7
    Ok((read_u32_le(data, 0), read_u64_le(data, 8)))
}

/// Decode one transaction. `data` must be exactly `HTTP_TX_SIZE` bytes.
fn parse_transaction(data: &[u8]) -> HttpTransaction {
    let mut request_fragment = [0u8; HTTP_BUFFER_SIZE];
    request_fragment.copy_from_slice(&data[72..72 + HTTP_BUFFER_SIZE]);

    HttpTransaction {
        tup: parse_conn_tuple(&data[..CONN_TUPLE_SIZE]),
        request_started: read_u64_le(data, 48),
        request_method: read_u8(data, 56),
        // pad[1] at 57
        response_status_code: read_u16_le(data, 58),
        // pad[4] at 60-63
        response_last_seen: read_u64_le(data, 64),
        request_fragment,
        owned_by_src_port: read_u16_le(data, 232),
        // pad[2] at 234-235
        tcp_seq: read_u32_le(data, 236),
        tags: read_u64_le(data, 240),
    }
}

fn parse_conn_tuple(data: &[u8]) -> ConnTuple {
    ConnTuple {
        saddr_h: read_u64_le(data, 0),
        saddr_l: read_u64_le(data, 8),
        daddr_h: read_u64_le(data, 16),
        daddr_l: read_u64_le(data, 24),
        sport: read_u16_le(data, 32),
        dport: read_u16_le(data, 34),
        netns: read_u32_le(data, 36),
        pid: read_u32_le(data, 40),
        metadata: read_u32_le(data, 44),
    }
}

// ---------------------------------------------------------------------------
// Encoding, used by in-memory storage and tests
// ---------------------------------------------------------------------------

/// Encode a batch into its wire layout. Missing transactions are zeroed.
pub fn encode_batch(batch: &HttpBatch) -> Vec<u8> {
    let mut out = vec![0u8; HTTP_BATCH_WIRE_SIZE];
    out[0..8].copy_from_slice(&batch.idx.to_le_bytes());
    out[8] = batch.pos;
    for (i, tx) in batch.txs.iter().take(HTTP_BATCH_SIZE).enumerate() {
        let start = BATCH_HEADER_SIZE + i * HTTP_TX_SIZE;
        encode_transaction(tx, &mut out[start..start + HTTP_TX_SIZE]);
    }
    out
}

/// Encode a notification payload.
pub fn encode_notification(cpu: u32, idx: u64) -> [u8; NOTIFICATION_SIZE] {
    let mut out = [0u8; NOTIFICATION_SIZE];
    out[0..4].copy_from_slice(&cpu.to_le_bytes());
    out[8..16].copy_from_slice(&idx.to_le_bytes());
    out
}

fn encode_transaction(tx: &HttpTransaction, out: &mut [u8]) {
    let t = &tx.tup;
    out[0..8].copy_from_slice(&t.saddr_h.to_le_bytes());
    out[8..16].copy_from_slice(&t.saddr_l.to_le_bytes());
    out[16..24].copy_from_slice(&t.daddr_h.to_le_bytes());
    out[24..32].copy_from_slice(&t.daddr_l.to_le_bytes());
    out[32..34].copy_from_slice(&t.sport.to_le_bytes());
    out[34..36].copy_from_slice(&t.dport.to_le_bytes());
    out[36..40].copy_from_slice(&t.netns.to_le_bytes());
    out[40..44].copy_from_slice(&t.pid.to_le_bytes());
    out[44..48].copy_from_slice(&t.metadata.to_le_bytes());
    out[48..56].copy_from_slice(&tx.request_started.to_le_bytes());
    out[56] = tx.request_method;
    out[58..60].copy_from_slice(&tx.response_status_code.to_le_bytes());
    out[64..72].copy_from_slice(&tx.response_last_seen.to_le_bytes());
    out[72..72 + HTTP_BUFFER_SIZE].copy_from_slice(&tx.request_fragment);
    out[232..234].copy_from_slice(&tx.owned_by_src_port.to_le_bytes());
    out[236..240].copy_from_slice(&tx.tcp_seq.to_le_bytes());
    out[240..248].copy_from_slice(&tx.tags.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Byte-reading helpers (callers check lengths up front)
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    data[offset]
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}
