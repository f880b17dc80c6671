//! HashMap-based keyed state backend.

use ahash::AHashMap;

use super::*;

type Cell = (LinkId, Window);

/// In-memory keyed state, indexed by user key first so that a bundle's
/// snapshot only touches the keys it owns.
#[derive(Debug, Default)]
pub struct HashMapStateBackend {
    /// user key -> (declaration, window) -> values
    bags: AHashMap<Vec<u8>, BTreeMap<Cell, Vec<Vec<u8>>>>,
    /// user key -> (declaration, window) -> map key -> values
    multimaps: AHashMap<Vec<u8>, BTreeMap<Cell, BTreeMap<Vec<u8>, Vec<Vec<u8>>>>>,
}

/// A write whose appended data has already been split into values.
#[derive(Debug)]
pub struct PreparedWrite {
    write: StateWrite,
    values: Vec<Vec<u8>>,
}

impl HashMapStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every cell belonging to `keys`.
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> StateSnapshot {
        let mut snap = StateSnapshot::default();
        for key in keys {
            if let Some(cells) = self.bags.get(key) {
                for ((link, window), values) in cells {
                    snap.bags.insert(state_id(link, key, window), values.clone());
                }
            }
            if let Some(cells) = self.multimaps.get(key) {
                for ((link, window), map) in cells {
                    snap.multimaps.insert(state_id(link, key, window), map.clone());
                }
            }
        }
        snap
    }

    /// Split appended data into values without touching any state, so a bad
    /// write fails the whole bundle before anything is applied.
    ///
    /// Declarations without a decoder store the appended data as one value.
    pub fn prepare(
        writes: Vec<StateWrite>,
        decoders: &HashMap<LinkId, ElementDecoder>,
    ) -> Result<Vec<PreparedWrite>, EngineError> {
        writes
            .into_iter()
            .map(|write| {
                let values = match &write {
                    StateWrite::BagAppend { id, data }
                    | StateWrite::MultimapAppend { id, data, .. } => {
                        match decoders.get(&id.link) {
                            Some(dec) => dec
                                .split(data)
                                .map_err(|e| {
                                    EngineError::decode(format!(
                                        "state {}/{}: {e}",
                                        id.link.transform_id, id.link.state_id
                                    ))
                                })?
                                .into_iter()
                                .map(<[u8]>::to_vec)
                                .collect(),
                            None => vec![data.clone()],
                        }
                    }
                    _ => Vec::new(),
                };
                Ok(PreparedWrite { write, values })
            })
            .collect()
    }

    /// Apply prepared writes in order.
    pub fn apply(&mut self, writes: Vec<PreparedWrite>) {
        for PreparedWrite { write, values } in writes {
            match write {
                StateWrite::BagAppend { id, .. } => {
                    let StateId { link, key, window } = id;
                    self.bags
                        .entry(key)
                        .or_default()
                        .entry((link, window))
                        .or_default()
                        .extend(values);
                }
                StateWrite::BagClear { id } => {
                    if let Some(cells) = self.bags.get_mut(&id.key) {
                        cells.remove(&(id.link, id.window));
                        if cells.is_empty() {
                            self.bags.remove(&id.key);
                        }
                    }
                }
                StateWrite::MultimapAppend { id, user_key, .. } => {
                    let StateId { link, key, window } = id;
                    self.multimaps
                        .entry(key)
                        .or_default()
                        .entry((link, window))
                        .or_default()
                        .entry(user_key)
                        .or_default()
                        .extend(values);
                }
                StateWrite::MultimapRemove { id, user_key } => {
                    if let Some(map) = self
                        .multimaps
                        .get_mut(&id.key)
                        .and_then(|cells| cells.get_mut(&(id.link.clone(), id.window)))
                    {
                        map.remove(&user_key);
                    }
                }
                StateWrite::MultimapClear { id } => {
                    if let Some(cells) = self.multimaps.get_mut(&id.key) {
                        cells.remove(&(id.link, id.window));
                        if cells.is_empty() {
                            self.multimaps.remove(&id.key);
                        }
                    }
                }
            }
        }
    }

    /// Drop every cell of `key` in `window`. Called when the window expires.
    pub fn clear_window(&mut self, key: &[u8], window: &Window) {
        if let Some(cells) = self.bags.get_mut(key) {
            cells.retain(|(_, w), _| w != window);
            if cells.is_empty() {
                self.bags.remove(key);
            }
        }
        if let Some(cells) = self.multimaps.get_mut(key) {
            cells.retain(|(_, w), _| w != window);
            if cells.is_empty() {
                self.multimaps.remove(key);
            }
        }
    }

    /// Windows that hold state for `key`.
    pub fn windows_of(&self, key: &[u8]) -> Vec<Window> {
        let mut windows: Vec<Window> = self
            .bags
            .get(key)
            .into_iter()
            .flat_map(|cells| cells.keys().map(|(_, w)| *w))
            .chain(
                self.multimaps
                    .get(key)
                    .into_iter()
                    .flat_map(|cells| cells.keys().map(|(_, w)| *w)),
            )
            .collect();
        windows.sort();
        windows.dedup();
        windows
    }

    /// All user keys holding any state, sorted.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .bags
            .keys()
            .chain(self.multimaps.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty() && self.multimaps.is_empty()
    }
}

fn state_id(link: &LinkId, key: &[u8], window: &Window) -> StateId {
    StateId {
        link: link.clone(),
        key: key.to_vec(),
        window: *window,
    }
}
