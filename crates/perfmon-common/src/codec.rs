//! Binary encoding for batches and acknowledgements.
//!
//! All numbers are fixed-width big-endian. Every message starts with the
//! `PMON` magic, a version byte and a tag byte, so truncated or foreign input
//! is rejected before any field is interpreted and an empty batch is still a
//! well-formed message.

use crate::error::CodecError;
use crate::types::{Batch, CaptureInstant, ClientIdentity, MetricKind, Sample};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;

pub const MAGIC: &[u8; 4] = b"PMON";
pub const VERSION: u8 = 1;
pub const TAG_BATCH: u8 = 0x01;
pub const TAG_ACK: u8 = 0x02;

const HEADER_LEN: usize = MAGIC.len() + 2;
/// Smallest possible encoded sample: empty subject.
const MIN_SAMPLE_LEN: usize = 4 + 1 + 8 + 8 + 4 + 8;

/// Encodes a batch.
///
/// # Examples
///
/// ```
/// use perfmon_common::codec::{decode, encode};
/// use perfmon_common::types::{Batch, ClientIdentity};
///
/// let batch = Batch { sequence: 1, client: ClientIdentity::new("svc"), samples: vec![] };
/// let bytes = encode(&batch);
/// assert_eq!(decode(&bytes).unwrap(), batch);
/// ```
pub fn encode(batch: &Batch) -> Bytes {
    let body: usize = batch
        .samples
        .iter()
        .map(|s| MIN_SAMPLE_LEN + s.subject.len())
        .sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 8 + 4 + batch.client.as_str().len() + 4 + body);

    put_header(&mut buf, TAG_BATCH);
    buf.put_u64(batch.sequence);
    put_str(&mut buf, batch.client.as_str());
    buf.put_u32(batch.samples.len() as u32);
    for sample in &batch.samples {
        put_str(&mut buf, &sample.subject);
        buf.put_u8(sample.metric.code());
        buf.put_u64(sample.value.to_bits());
        buf.put_i64(sample.timestamp.wall.timestamp());
        buf.put_u32(sample.timestamp.wall.timestamp_subsec_nanos());
        buf.put_u64(sample.timestamp.monotonic_ns);
    }
    buf.freeze()
}

pub fn decode(mut input: &[u8]) -> Result<Batch, CodecError> {
    take_header(&mut input, TAG_BATCH)?;
    let sequence = take_u64(&mut input)?;
    let client = ClientIdentity::new(take_str(&mut input, "client")?);
    let count = take_u32(&mut input)? as usize;

    // Reject absurd counts before allocating for them.
    let needed = count.saturating_mul(MIN_SAMPLE_LEN);
    if needed > input.remaining() {
        return Err(CodecError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let subject = take_str(&mut input, "subject")?;
        let code = take_u8(&mut input)?;
        let metric = MetricKind::from_code(code).ok_or(CodecError::UnknownMetric(code))?;
        let value = f64::from_bits(take_u64(&mut input)?);
        if !value.is_finite() {
            return Err(CodecError::NonFiniteValue);
        }
        let secs = take_i64(&mut input)?;
        let nanos = take_u32(&mut input)?;
        let wall = DateTime::from_timestamp(secs, nanos)
            .ok_or(CodecError::InvalidTimestamp { secs, nanos })?;
        let monotonic_ns = take_u64(&mut input)?;
        samples.push(Sample {
            subject,
            metric,
            value,
            timestamp: CaptureInstant { wall, monotonic_ns },
        });
    }

    if input.has_remaining() {
        return Err(CodecError::TrailingBytes(input.remaining()));
    }

    Ok(Batch {
        sequence,
        client,
        samples,
    })
}

pub fn encode_ack(sequence: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 8);
    put_header(&mut buf, TAG_ACK);
    buf.put_u64(sequence);
    buf.freeze()
}

pub fn decode_ack(mut input: &[u8]) -> Result<u64, CodecError> {
    take_header(&mut input, TAG_ACK)?;
    let sequence = take_u64(&mut input)?;
    if input.has_remaining() {
        return Err(CodecError::TrailingBytes(input.remaining()));
    }
    Ok(sequence)
}

fn put_header(buf: &mut BytesMut, tag: u8) {
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(tag);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn ensure(input: &[u8], needed: usize) -> Result<(), CodecError> {
    if input.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

fn take_header(input: &mut &[u8], expected_tag: u8) -> Result<(), CodecError> {
    ensure(input, HEADER_LEN)?;
    if &input[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    input.advance(MAGIC.len());
    let version = input.get_u8();
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let tag = input.get_u8();
    if tag != expected_tag {
        return Err(CodecError::UnexpectedTag {
            expected: expected_tag,
            found: tag,
        });
    }
    Ok(())
}

fn take_u8(input: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(input, 1)?;
    Ok(input.get_u8())
}

fn take_u32(input: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(input, 4)?;
    Ok(input.get_u32())
}

fn take_u64(input: &mut &[u8]) -> Result<u64, CodecError> {
    ensure(input, 8)?;
    Ok(input.get_u64())
}

fn take_i64(input: &mut &[u8]) -> Result<i64, CodecError> {
    ensure(input, 8)?;
    Ok(input.get_i64())
}

fn take_str(input: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let len = take_u32(input)? as usize;
    ensure(input, len)?;
    let s = std::str::from_utf8(&input[..len])
        .map_err(|_| CodecError::InvalidUtf8 { field })?
        .to_string();
    input.advance(len);
    Ok(s)
}
