use super::*;

/// Measures one nested-encoded element of a known coder.
///
/// Built by [`CoderRegistry::pull_decoder`]; coders the engine does not know
/// are always reached through a [`ElementDecoder::LengthPrefixed`] wrapper,
/// so every decoder is total.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ElementDecoder {
    /// Varint length followed by that many bytes (bytes, strings, length prefix).
    LengthPrefixed,
    Varint,
    Bool,
    Double,
    Kv(Box<ElementDecoder>, Box<ElementDecoder>),
    Iterable(Box<ElementDecoder>),
    GlobalWindow,
    IntervalWindow,
    WindowedValue {
        window: WindowCoder,
        value: Box<ElementDecoder>,
    },
}

impl ElementDecoder {
    /// Consume one element from `buf` and return the bytes it occupied.
    pub fn pull<'a>(&self, buf: &mut &'a [u8]) -> CodecResult<&'a [u8]> {
        let start: &'a [u8] = *buf;
        self.skip(buf)?;
        Ok(&start[..start.len() - buf.len()])
    }

    /// Pull every element from `bytes` until it is exhausted.
    pub fn split<'a>(&self, mut bytes: &'a [u8]) -> CodecResult<Vec<&'a [u8]>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            out.push(self.pull(&mut bytes)?);
        }
        Ok(out)
    }

    fn skip(&self, buf: &mut &[u8]) -> CodecResult<()> {
        match self {
            ElementDecoder::LengthPrefixed => {
                let len = decode_varint(buf)?;
                let len = usize::try_from(len)
                    .map_err(|_| EngineError::decode(format!("length {len} overflows")))?;
                take(buf, len)?;
            }
            ElementDecoder::Varint => {
                decode_varint(buf)?;
            }
            ElementDecoder::Bool => {
                take(buf, 1)?;
            }
            ElementDecoder::Double => {
                take(buf, 8)?;
            }
            ElementDecoder::Kv(key, value) => {
                key.skip(buf)?;
                value.skip(buf)?;
            }
            ElementDecoder::Iterable(elem) => {
                let raw = take(buf, 4)?;
                let count = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if count >= 0 {
                    for _ in 0..count {
                        elem.skip(buf)?;
                    }
                } else if count == -1 {
                    // Unknown length: blocks of `varint count, elements`, ended by 0.
                    loop {
                        let block = decode_varint(buf)?;
                        if block == 0 {
                            break;
                        }
                        for _ in 0..block {
                            elem.skip(buf)?;
                        }
                    }
                } else {
                    return Err(EngineError::decode(format!(
                        "invalid iterable length {count}"
                    )));
                }
            }
            ElementDecoder::GlobalWindow => {}
            ElementDecoder::IntervalWindow => {
                decode_window(WindowCoder::Interval, buf)?;
            }
            ElementDecoder::WindowedValue { window, value } => {
                decode_windowed_value(*window, value, buf)?;
            }
        }
        Ok(())
    }
}
