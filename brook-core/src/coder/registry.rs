use std::sync::Arc;

use super::*;

/// The pipeline's coders plus any length-prefix rewrites made while building
/// decoders.
#[derive(Debug, Clone, Default)]
pub struct CoderRegistry {
    coders: HashMap<String, pipeline::Coder>,
}

impl CoderRegistry {
    pub fn new(coders: &HashMap<String, pipeline::Coder>) -> Self {
        Self {
            coders: coders.clone(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&pipeline::Coder, EngineError> {
        self.coders
            .get(id)
            .ok_or_else(|| EngineError::UnknownCoder(id.to_string()))
    }

    /// Return a coder id equivalent to `id` in which every coder the engine
    /// cannot measure is wrapped in a length prefix. Returns `id` itself
    /// when nothing needed rewriting.
    pub fn lp_unknown(&mut self, id: &str) -> Result<String, EngineError> {
        let coder = self.get(id)?.clone();
        let urn = coder.urn();
        match urn {
            urns::CODER_KV | urns::CODER_ITERABLE | urns::CODER_WINDOWED_VALUE => {
                let mut changed = false;
                let mut components = Vec::with_capacity(coder.component_coder_ids.len());
                for cid in &coder.component_coder_ids {
                    let rewritten = self.lp_unknown(cid)?;
                    changed |= rewritten != *cid;
                    components.push(rewritten);
                }
                if !changed {
                    return Ok(id.to_string());
                }
                let new_id = format!("{id}_lp");
                self.coders.insert(
                    new_id.clone(),
                    pipeline::Coder {
                        spec: coder.spec.clone(),
                        component_coder_ids: components,
                    },
                );
                Ok(new_id)
            }
            u if urns::is_known_coder(u) => Ok(id.to_string()),
            _ => {
                let new_id = format!("{id}_lp");
                self.coders.insert(
                    new_id.clone(),
                    pipeline::Coder {
                        spec: Some(pipeline::FunctionSpec::new(
                            urns::CODER_LENGTH_PREFIX,
                            Vec::new(),
                        )),
                        component_coder_ids: vec![id.to_string()],
                    },
                );
                Ok(new_id)
            }
        }
    }

    /// Build the decoder for an already rewritten coder id.
    pub fn pull_decoder(&self, id: &str) -> Result<ElementDecoder, EngineError> {
        let coder = self.get(id)?;
        let component = |i: usize| -> Result<Box<ElementDecoder>, EngineError> {
            let cid = coder.component_coder_ids.get(i).ok_or_else(|| {
                EngineError::malformed(format!("coder {id} is missing component {i}"))
            })?;
            Ok(Box::new(self.pull_decoder(cid)?))
        };
        Ok(match coder.urn() {
            urns::CODER_BYTES | urns::CODER_STRING_UTF8 | urns::CODER_LENGTH_PREFIX => {
                ElementDecoder::LengthPrefixed
            }
            urns::CODER_VARINT => ElementDecoder::Varint,
            urns::CODER_BOOL => ElementDecoder::Bool,
            urns::CODER_DOUBLE => ElementDecoder::Double,
            urns::CODER_KV => ElementDecoder::Kv(component(0)?, component(1)?),
            urns::CODER_ITERABLE => ElementDecoder::Iterable(component(0)?),
            urns::CODER_GLOBAL_WINDOW => ElementDecoder::GlobalWindow,
            urns::CODER_INTERVAL_WINDOW => ElementDecoder::IntervalWindow,
            urns::CODER_WINDOWED_VALUE => {
                let window_id = coder.component_coder_ids.get(1).ok_or_else(|| {
                    EngineError::malformed(format!("windowed value coder {id} has no window coder"))
                })?;
                ElementDecoder::WindowedValue {
                    window: self.window_coder(window_id)?,
                    value: component(0)?,
                }
            }
            other => {
                return Err(EngineError::UnknownCoder(format!(
                    "{id} ({other}) was not length prefixed"
                )));
            }
        })
    }

    /// Resolve a window coder id to the window encodings the engine supports.
    pub fn window_coder(&self, id: &str) -> Result<WindowCoder, EngineError> {
        match self.get(id)?.urn() {
            urns::CODER_GLOBAL_WINDOW => Ok(WindowCoder::Global),
            urns::CODER_INTERVAL_WINDOW => Ok(WindowCoder::Interval),
            other => Err(EngineError::UnsupportedWindowFn(format!(
                "window coder {id} ({other})"
            ))),
        }
    }

    /// The key coder of a KV coder, or `None` for other coders.
    pub fn key_coder_id(&self, id: &str) -> Option<&str> {
        let coder = self.coders.get(id)?;
        if coder.urn() == urns::CODER_KV {
            coder.component_coder_ids.first().map(String::as_str)
        } else {
            None
        }
    }

    /// Build the decoding metadata for one PCollection.
    pub fn pcollection_info(
        &mut self,
        pcoll_id: &str,
        components: &pipeline::Components,
    ) -> Result<Arc<PColInfo>, EngineError> {
        let pcoll = components
            .pcollections
            .get(pcoll_id)
            .ok_or_else(|| EngineError::UnknownPCollection(pcoll_id.to_string()))?;
        let ws = components
            .windowing_strategies
            .get(&pcoll.windowing_strategy_id)
            .ok_or_else(|| {
                EngineError::malformed(format!(
                    "pcollection {pcoll_id} references unknown windowing strategy {:?}",
                    pcoll.windowing_strategy_id
                ))
            })?;
        let coder_id = self.lp_unknown(&pcoll.coder_id)?;
        let element = self.pull_decoder(&coder_id)?;
        let key = match self.key_coder_id(&coder_id).map(str::to_string) {
            Some(kid) => Some(self.pull_decoder(&kid)?),
            None => None,
        };
        Ok(Arc::new(PColInfo {
            global_id: pcoll_id.to_string(),
            coder_id,
            window_coder: self.window_coder(&ws.window_coder_id)?,
            element,
            key,
        }))
    }
}

/// Everything needed to move one PCollection's elements through the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PColInfo {
    pub global_id: String,
    /// Coder id after length-prefix rewriting.
    pub coder_id: String,
    pub window_coder: WindowCoder,
    pub element: ElementDecoder,
    /// Present when the element coder is a KV.
    pub key: Option<ElementDecoder>,
}

impl PColInfo {
    /// Decode concatenated windowed values into engine elements, one per window.
    pub fn decode_elements(&self, mut bytes: &[u8]) -> Result<Vec<Element>, EngineError> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let wv = decode_windowed_value(self.window_coder, &self.element, &mut bytes)
                .map_err(|e| EngineError::decode(format!("{}: {e}", self.global_id)))?;
            let key = self.extract_key(wv.value)?;
            for window in wv.windows {
                let mut e =
                    Element::new(window, wv.timestamp, wv.value.to_vec()).with_pane(wv.pane);
                e.key_bytes = key.clone();
                out.push(e);
            }
        }
        Ok(out)
    }

    /// Build an element from an encoded value that carries no windowed-value header.
    pub fn element_from_value(
        &self,
        window: Window,
        timestamp: EventTime,
        value: Vec<u8>,
    ) -> Result<Element, EngineError> {
        let mut check = value.as_slice();
        self.element
            .pull(&mut check)
            .map_err(|e| EngineError::decode(format!("{}: {e}", self.global_id)))?;
        if !check.is_empty() {
            return Err(EngineError::decode(format!(
                "{}: {} trailing bytes after element",
                self.global_id,
                check.len()
            )));
        }
        let key = self.extract_key(&value)?;
        let mut e = Element::new(window, timestamp, value);
        e.key_bytes = key;
        Ok(e)
    }

    /// Encode one engine element as a single-window windowed value.
    pub fn encode_element(&self, e: &Element, buf: &mut Vec<u8>) -> Result<(), EngineError> {
        encode_windowed_value(
            self.window_coder,
            std::slice::from_ref(&e.window),
            e.timestamp,
            &e.pane,
            &e.elm_bytes,
            buf,
        )
    }

    fn extract_key(&self, value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let Some(kd) = &self.key else {
            return Ok(None);
        };
        let mut cursor = value;
        let key = kd
            .pull(&mut cursor)
            .map_err(|e| EngineError::decode(format!("{} key: {e}", self.global_id)))?;
        Ok(Some(key.to_vec()))
    }
}
