use super::*;

/// Assigns windows to elements by event-time timestamp.
///
/// Only non-merging window functions are supported; session windows are
/// rejected when the pipeline is preprocessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFn {
    /// A single window that spans all time.
    Global,
    /// Fixed-size, non-overlapping windows aligned to `offset` modulo `size`.
    Fixed { size: EventTime, offset: EventTime },
    /// Fixed-size windows starting every `period`, possibly overlapping.
    Sliding {
        size: EventTime,
        period: EventTime,
        offset: EventTime,
    },
}

impl WindowFn {
    /// Fixed windows of the given `size`.
    pub fn fixed(size: Duration) -> Self {
        WindowFn::Fixed {
            size: size.as_millis() as EventTime,
            offset: 0,
        }
    }

    /// Sliding windows of the given `size` advancing every `period`.
    pub fn sliding(size: Duration, period: Duration) -> Self {
        WindowFn::Sliding {
            size: size.as_millis() as EventTime,
            period: period.as_millis() as EventTime,
            offset: 0,
        }
    }

    /// Check the parameters once at graph-build time.
    pub fn validate(&self) -> Result<()> {
        match self {
            WindowFn::Global => Ok(()),
            WindowFn::Fixed { size, .. } if *size <= 0 => {
                Err(anyhow!("fixed window size must be positive, got {size}"))
            }
            WindowFn::Sliding { size, period, .. } if *size <= 0 || *period <= 0 => Err(anyhow!(
                "sliding window size and period must be positive, got size={size} period={period}"
            )),
            _ => Ok(()),
        }
    }

    /// Return the windows that contain `timestamp`.
    pub fn assign_windows(&self, timestamp: EventTime) -> Vec<Window> {
        match *self {
            WindowFn::Global => vec![Window::Global],
            WindowFn::Fixed { size, offset } => {
                let rem = timestamp.saturating_sub(offset).rem_euclid(size);
                let start = timestamp.saturating_sub(rem);
                vec![Window::interval(start, start.saturating_add(size))]
            }
            WindowFn::Sliding {
                size,
                period,
                offset,
            } => {
                // Walk back from the last start by period until no window covers ts.
                let rem = timestamp.saturating_sub(offset).rem_euclid(period);
                let last_start = timestamp.saturating_sub(rem);
                let mut windows = Vec::new();
                let mut start = last_start;
                while start > timestamp.saturating_sub(size) {
                    windows.push(Window::interval(start, start.saturating_add(size)));
                    match start.checked_sub(period) {
                        Some(prev) => start = prev,
                        None => break,
                    }
                }
                windows
            }
        }
    }
}

impl WindowFn {
    /// Encode as a pipeline window-fn spec.
    pub fn to_spec(&self) -> pipeline::FunctionSpec {
        use prost::Message;

        match *self {
            WindowFn::Global => pipeline::FunctionSpec::new(urns::WINDOW_FN_GLOBAL, Vec::new()),
            WindowFn::Fixed { size, offset } => pipeline::FunctionSpec::new(
                urns::WINDOW_FN_FIXED,
                pipeline::FixedWindowsPayload {
                    size_millis: size,
                    offset_millis: offset,
                }
                .encode_to_vec(),
            ),
            WindowFn::Sliding {
                size,
                period,
                offset,
            } => pipeline::FunctionSpec::new(
                urns::WINDOW_FN_SLIDING,
                pipeline::SlidingWindowsPayload {
                    size_millis: size,
                    period_millis: period,
                    offset_millis: offset,
                }
                .encode_to_vec(),
            ),
        }
    }

    /// The window coder URN windows of this function are encoded with.
    pub fn window_coder_urn(&self) -> &'static str {
        match self {
            WindowFn::Global => urns::CODER_GLOBAL_WINDOW,
            _ => urns::CODER_INTERVAL_WINDOW,
        }
    }
}

impl TryFrom<&pipeline::FunctionSpec> for WindowFn {
    type Error = EngineError;

    fn try_from(spec: &pipeline::FunctionSpec) -> Result<Self, Self::Error> {
        use prost::Message;

        let bad = |e: prost::DecodeError| {
            EngineError::malformed(format!("{} payload: {e}", spec.urn))
        };
        let window_fn = match spec.urn.as_str() {
            urns::WINDOW_FN_GLOBAL => WindowFn::Global,
            urns::WINDOW_FN_FIXED => {
                let p = pipeline::FixedWindowsPayload::decode(spec.payload.as_slice())
                    .map_err(bad)?;
                WindowFn::Fixed {
                    size: p.size_millis,
                    offset: p.offset_millis,
                }
            }
            urns::WINDOW_FN_SLIDING => {
                let p = pipeline::SlidingWindowsPayload::decode(spec.payload.as_slice())
                    .map_err(bad)?;
                WindowFn::Sliding {
                    size: p.size_millis,
                    period: p.period_millis,
                    offset: p.offset_millis,
                }
            }
            other => return Err(EngineError::UnsupportedWindowFn(other.to_string())),
        };
        window_fn
            .validate()
            .map_err(|e| EngineError::malformed(e.to_string()))?;
        Ok(window_fn)
    }
}
