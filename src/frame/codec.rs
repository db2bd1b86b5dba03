//! Single and batched frame encode/decode, with a pooled zstd
//! encoder/decoder so steady-state traffic doesn't pay allocation cost per
//! frame.

use std::sync::OnceLock;

use concurrent_queue::ConcurrentQueue;
use zstd::bulk::{Compressor, Decompressor};

use crate::error::{Error, Result};

use super::header::{append_api, decode_len_flags, encode_len_flags, read_api};

/// zstd `SpeedFastest` equivalent: level 1.
const ZSTD_LEVEL: i32 = 1;

fn encoder_pool() -> &'static ConcurrentQueue<Compressor<'static>> {
    static POOL: OnceLock<ConcurrentQueue<Compressor<'static>>> = OnceLock::new();
    POOL.get_or_init(ConcurrentQueue::unbounded)
}

fn decoder_pool() -> &'static ConcurrentQueue<Decompressor<'static>> {
    static POOL: OnceLock<ConcurrentQueue<Decompressor<'static>>> = OnceLock::new();
    POOL.get_or_init(ConcurrentQueue::unbounded)
}

fn checkout_encoder() -> Result<Compressor<'static>> {
    if let Ok(enc) = encoder_pool().pop() {
        return Ok(enc);
    }
    Compressor::new(ZSTD_LEVEL).map_err(|e| Error::CodecError(e.to_string()))
}

fn checkin_encoder(enc: Compressor<'static>) {
    let _ = encoder_pool().push(enc);
}

fn checkout_decoder() -> Result<Decompressor<'static>> {
    if let Ok(dec) = decoder_pool().pop() {
        return Ok(dec);
    }
    Decompressor::new().map_err(|e| Error::CodecError(e.to_string()))
}

fn checkin_decoder(dec: Decompressor<'static>) {
    let _ = decoder_pool().push(dec);
}

fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut enc = checkout_encoder()?;
    let out = enc
        .compress(payload)
        .map_err(|e| Error::CodecError(e.to_string()));
    checkin_encoder(enc);
    out
}

fn decompress(payload: &[u8], capacity: usize) -> Result<Vec<u8>> {
    let mut dec = checkout_decoder()?;
    let out = dec
        .decompress(payload, capacity)
        .map_err(|e| Error::CodecError(e.to_string()));
    checkin_decoder(dec);
    out
}

/// One `(api, payload)` item destined for a batched frame's pre-image.
pub struct BatchItem<'a> {
    pub api: u16,
    pub payload: &'a [u8],
}

fn put_uvarint(dst: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a uvarint from the front of `buf`. Returns `None` if `buf` runs out
/// before a terminating byte is found.
fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Encodes a single frame: `LenFlags ‖ Api ‖ Payload`, optionally
/// zstd-compressing the payload before framing.
pub fn encode_single(api: u16, payload: &[u8], compressed: bool) -> Result<Vec<u8>> {
    let body = if compressed {
        compress(payload)?
    } else {
        payload.to_vec()
    };
    let hdr = encode_len_flags(body.len(), compressed, false)?;

    let mut out = Vec::with_capacity(hdr.len() + 2 + body.len());
    out.extend_from_slice(&hdr);
    append_api(&mut out, api);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encodes a batched frame. The pre-image `uvarint(n) ‖ n × (api ‖
/// uvarint(len) ‖ payload)` is always compressed, since `Batched` implies
/// `Compressed`.
pub fn encode_batch(items: &[BatchItem<'_>]) -> Result<Vec<u8>> {
    let mut pre = Vec::new();
    put_uvarint(&mut pre, items.len() as u64);
    for item in items {
        pre.extend_from_slice(&item.api.to_be_bytes());
        put_uvarint(&mut pre, item.payload.len() as u64);
        pre.extend_from_slice(item.payload);
    }

    let body = compress(&pre)?;
    let hdr = encode_len_flags(body.len(), true, true)?;

    let mut out = Vec::with_capacity(hdr.len() + body.len());
    out.extend_from_slice(&hdr);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses as many complete frames as possible out of the front of `buf`,
/// invoking `on_message(api, payload)` once per logical message — once for a
/// `Single` frame, `n` times for a `Batched` frame of `n` items.
///
/// Returns the number of bytes consumed; the caller keeps the remainder for
/// the next call. `max_payload` bounds both a single frame's declared
/// length and the decompression capacity used for a batched pre-image.
pub fn parse<F>(buf: &[u8], max_payload: usize, mut on_message: F) -> Result<usize>
where
    F: FnMut(u16, &[u8]) -> Result<()>,
{
    let mut i = 0usize;

    loop {
        let remaining = &buf[i..];
        if remaining.len() < 2 {
            return Ok(i);
        }

        let (consumed, len, compressed, batched) = match decode_len_flags(remaining) {
            Ok(v) => v,
            Err(Error::HeaderTooShort) => return Ok(i),
            Err(e) => return Err(e),
        };

        if len > max_payload {
            return Err(Error::PayloadTooLarge {
                len,
                max: max_payload,
            });
        }

        if !batched {
            let after_hdr = &remaining[consumed..];
            if after_hdr.len() < 2 + len {
                return Ok(i);
            }
            let (api, _) = read_api(after_hdr)?;
            let raw = &after_hdr[2..2 + len];
            let msg = if compressed {
                decompress(raw, max_payload)?
            } else {
                raw.to_vec()
            };
            on_message(api, &msg)?;
            i += consumed + 2 + len;
            continue;
        }

        let after_hdr = &remaining[consumed..];
        if after_hdr.len() < len {
            return Ok(i);
        }
        let compressed_body = &after_hdr[..len];
        i += consumed + len;

        // Decompression capacity for a batched pre-image must accommodate
        // every item's header and payload, not just one payload.
        let pre = decompress(compressed_body, max_payload.saturating_mul(8).max(1 << 16))?;

        let (count, mut off) =
            read_uvarint(&pre).ok_or_else(|| Error::CodecError("truncated batch count".into()))?;

        for _ in 0..count {
            if pre.len() < off + 2 {
                return Err(Error::CodecError("truncated batch item api".into()));
            }
            let api = u16::from_be_bytes([pre[off], pre[off + 1]]);
            off += 2;
            let (item_len, n) = read_uvarint(&pre[off..])
                .ok_or_else(|| Error::CodecError("truncated batch item length".into()))?;
            off += n;
            let item_len = item_len as usize;
            if pre.len() < off + item_len {
                return Err(Error::CodecError("truncated batch item payload".into()));
            }
            on_message(api, &pre[off..off + item_len])?;
            off += item_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_round_trip_uncompressed() {
        let frame = encode_single(7, b"hello", false).unwrap();
        let mut got = Vec::new();
        let consumed = parse(&frame, 4096, |api, payload| {
            got.push((api, payload.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(got, vec![(7, b"hello".to_vec())]);
    }

    #[test]
    fn single_frame_round_trip_compressed() {
        let payload = vec![42u8; 5000];
        let frame = encode_single(3, &payload, true).unwrap();
        let mut got = Vec::new();
        parse(&frame, 8192, |api, p| {
            got.push((api, p.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(got[0].0, 3);
        assert_eq!(got[0].1, payload);
    }

    #[test]
    fn batched_frame_round_trip() {
        let items = vec![
            BatchItem { api: 1, payload: b"one" },
            BatchItem { api: 2, payload: b"" },
            BatchItem { api: 3, payload: b"three" },
        ];
        let frame = encode_batch(&items).unwrap();
        let mut got = Vec::new();
        let consumed = parse(&frame, 4096, |api, payload| {
            got.push((api, payload.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(
            got,
            vec![(1, b"one".to_vec()), (2, b"".to_vec()), (3, b"three".to_vec())]
        );
    }

    #[test]
    fn batched_n_zero_yields_no_messages() {
        let frame = encode_batch(&[]).unwrap();
        let mut calls = 0;
        parse(&frame, 4096, |_, _| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let frame = encode_single(1, b"hello world", false).unwrap();
        let consumed = parse(&frame[..frame.len() - 1], 4096, |_, _| Ok(())).unwrap();
        assert_eq!(consumed, 0);
    }

    #[test]
    fn two_frames_back_to_back_both_parsed() {
        let mut buf = encode_single(1, b"first", false).unwrap();
        buf.extend(encode_single(2, b"second", false).unwrap());
        let mut got = Vec::new();
        let consumed = parse(&buf, 4096, |api, payload| {
            got.push((api, payload.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let frame = encode_single(1, &vec![0u8; 100], false).unwrap();
        let err = parse(&frame, 10, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn uvarint_round_trips() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let (got, n) = read_uvarint(&buf).unwrap();
            assert_eq!(got, v);
            assert_eq!(n, buf.len());
        }
    }
}
