use super::*;

const TIMESTAMP_SIGN_FLIP: u64 = 1 << 63;

/// Which window coder a PCollection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WindowCoder {
    Global,
    Interval,
}

/// Append `value` as an unsigned LEB128 varint.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read an unsigned LEB128 varint, advancing `buf`.
pub fn decode_varint(buf: &mut &[u8]) -> CodecResult<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let cur = *buf;
        let (&byte, rest) = cur
            .split_first()
            .ok_or_else(|| EngineError::decode("truncated varint"))?;
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(EngineError::decode("varint longer than 10 bytes"))
}

/// Take exactly `n` bytes from the front of `buf`.
pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> CodecResult<&'a [u8]> {
    if buf.len() < n {
        return Err(EngineError::decode(format!(
            "need {n} bytes, only {} left",
            buf.len()
        )));
    }
    let cur: &'a [u8] = *buf;
    let (head, rest) = cur.split_at(n);
    *buf = rest;
    Ok(head)
}

/// Append a length prefix and the bytes themselves.
pub fn encode_length_prefixed(bytes: &[u8], buf: &mut Vec<u8>) {
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

/// Timestamps are 8 big-endian bytes with the sign bit flipped, so that the
/// byte order matches the numeric order.
pub fn encode_timestamp(ts: EventTime, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&((ts as u64) ^ TIMESTAMP_SIGN_FLIP).to_be_bytes());
}

pub fn decode_timestamp(buf: &mut &[u8]) -> CodecResult<EventTime> {
    let raw = take(buf, 8)?;
    let mut be = [0u8; 8];
    be.copy_from_slice(raw);
    Ok((u64::from_be_bytes(be) ^ TIMESTAMP_SIGN_FLIP) as EventTime)
}

// ── Pane info ─────────────────────────────────────────────────────────────────

const PANE_FIRST: u8 = 0;
const PANE_ONE_INDEX: u8 = 1;
const PANE_TWO_INDICES: u8 = 2;

/// Encode pane info with the one-byte header format. The upper nibble of the
/// header selects how many indices follow.
pub fn encode_pane(pane: &PaneInfo, buf: &mut Vec<u8>) {
    let header =
        (pane.is_first as u8) | ((pane.is_last as u8) << 1) | ((pane.timing as u8) << 2);
    let encoding = if (pane.index == 0 && pane.non_speculative_index == 0)
        || pane.timing == PaneTiming::Unknown
    {
        PANE_FIRST
    } else if pane.index == pane.non_speculative_index || pane.timing == PaneTiming::Early {
        PANE_ONE_INDEX
    } else {
        PANE_TWO_INDICES
    };
    buf.push(header | (encoding << 4));
    if encoding >= PANE_ONE_INDEX {
        encode_varint(pane.index as u64, buf);
    }
    if encoding == PANE_TWO_INDICES {
        encode_varint(pane.non_speculative_index as u64, buf);
    }
}

pub fn decode_pane(buf: &mut &[u8]) -> CodecResult<PaneInfo> {
    let byte = take(buf, 1)?[0];
    let timing = PaneTiming::from_bits(byte >> 2);
    let mut pane = PaneInfo {
        is_first: byte & 0x1 != 0,
        is_last: byte & 0x2 != 0,
        timing,
        index: 0,
        non_speculative_index: if timing == PaneTiming::Early { -1 } else { 0 },
    };
    match byte >> 4 {
        PANE_FIRST => {}
        PANE_ONE_INDEX => {
            pane.index = decode_varint(buf)? as i64;
            if timing != PaneTiming::Early {
                pane.non_speculative_index = pane.index;
            }
        }
        PANE_TWO_INDICES => {
            pane.index = decode_varint(buf)? as i64;
            pane.non_speculative_index = decode_varint(buf)? as i64;
        }
        other => {
            return Err(EngineError::decode(format!(
                "unknown pane encoding {other}"
            )));
        }
    }
    Ok(pane)
}

// ── Windows ───────────────────────────────────────────────────────────────────

/// Interval windows are encoded as their end timestamp followed by the span
/// as a varint; the global window encodes to nothing.
pub fn encode_window(window: &Window, coder: WindowCoder, buf: &mut Vec<u8>) -> CodecResult<()> {
    match (coder, window) {
        (WindowCoder::Global, Window::Global) => Ok(()),
        (WindowCoder::Interval, Window::Interval { start, end }) => {
            encode_timestamp(*end, buf);
            encode_varint(end.wrapping_sub(*start) as u64, buf);
            Ok(())
        }
        (coder, window) => Err(EngineError::decode(format!(
            "window {window} cannot be encoded with the {coder:?} window coder"
        ))),
    }
}

pub fn decode_window(coder: WindowCoder, buf: &mut &[u8]) -> CodecResult<Window> {
    match coder {
        WindowCoder::Global => Ok(Window::Global),
        WindowCoder::Interval => {
            let end = decode_timestamp(buf)?;
            let span = decode_varint(buf)? as i64;
            Ok(Window::interval(end.wrapping_sub(span), end))
        }
    }
}

const MIN_INTERVAL_WINDOW_BYTES: usize = 9;

// ── Windowed values ───────────────────────────────────────────────────────────

/// A decoded windowed value whose payload stays encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedValue<'a> {
    pub timestamp: EventTime,
    pub windows: Vec<Window>,
    pub pane: PaneInfo,
    pub value: &'a [u8],
}

/// Encode `timestamp, windows, pane, value` in the full windowed-value format.
pub fn encode_windowed_value(
    coder: WindowCoder,
    windows: &[Window],
    timestamp: EventTime,
    pane: &PaneInfo,
    value: &[u8],
    buf: &mut Vec<u8>,
) -> CodecResult<()> {
    encode_timestamp(timestamp, buf);
    buf.extend_from_slice(&(windows.len() as i32).to_be_bytes());
    for w in windows {
        encode_window(w, coder, buf)?;
    }
    encode_pane(pane, buf);
    buf.extend_from_slice(value);
    Ok(())
}

/// Decode one windowed value. `element` measures the payload.
pub fn decode_windowed_value<'a>(
    coder: WindowCoder,
    element: &ElementDecoder,
    buf: &mut &'a [u8],
) -> CodecResult<WindowedValue<'a>> {
    let timestamp = decode_timestamp(buf)?;
    let count = i32::from_be_bytes(
        take(buf, 4)?
            .try_into()
            .map_err(|_| EngineError::decode("window count"))?,
    );
    if count < 0 {
        return Err(EngineError::decode(format!("negative window count {count}")));
    }
    // The global window encodes to nothing, so only one is meaningful; an
    // interval window takes at least a timestamp and a one-byte span.
    let fits = match coder {
        WindowCoder::Global => count <= 1,
        WindowCoder::Interval => {
            (count as usize).saturating_mul(MIN_INTERVAL_WINDOW_BYTES) <= buf.len()
        }
    };
    if !fits {
        return Err(EngineError::decode(format!(
            "window count {count} exceeds the {} remaining bytes",
            buf.len()
        )));
    }
    let mut windows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        windows.push(decode_window(coder, buf)?);
    }
    let pane = decode_pane(buf)?;
    let value = element.pull(buf)?;
    Ok(WindowedValue {
        timestamp,
        windows,
        pane,
        value,
    })
}

/// Encode a `KV<K, Iterable<V>>` value from already encoded parts.
pub fn encode_grouped_value(key: &[u8], values: &[Vec<u8>], buf: &mut Vec<u8>) {
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(values.len() as i32).to_be_bytes());
    for v in values {
        buf.extend_from_slice(v);
    }
}
