use super::*;

/// One scripted event, already validated.
#[derive(Debug, Clone)]
pub(crate) enum TestStreamEvent {
    Elements { pcollection: String, elements: Vec<Element> },
    Watermark { tag: String, watermark: EventTime },
    /// Relative advance of the processing clock.
    ProcessingTime { advance: EventTime },
}

/// Replay state of the pipeline's test stream.
#[derive(Debug)]
pub(crate) struct TestStreamHandler {
    pub(crate) stage: StageId,
    tag_to_pcollection: BTreeMap<String, String>,
    events: Vec<TestStreamEvent>,
    next: usize,
    tag_watermarks: BTreeMap<String, EventTime>,
}

impl TestStreamHandler {
    pub(crate) fn new(stage: StageId, tag_to_pcollection: BTreeMap<String, String>) -> Self {
        let tag_watermarks = tag_to_pcollection
            .keys()
            .map(|tag| (tag.clone(), MIN_TIMESTAMP))
            .collect();
        Self {
            stage,
            tag_to_pcollection,
            events: Vec::new(),
            next: 0,
            tag_watermarks,
        }
    }

    pub(crate) fn pcollection(&self, tag: &str) -> Result<&str, EngineError> {
        self.tag_to_pcollection
            .get(tag)
            .map(String::as_str)
            .ok_or_else(|| EngineError::UnknownPCollection(format!("test stream tag {tag:?}")))
    }

    pub(crate) fn push(&mut self, event: TestStreamEvent) {
        self.events.push(event);
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next < self.events.len()
    }

    /// Take the next event and apply its watermark part.
    pub(crate) fn advance(&mut self) -> Option<TestStreamEvent> {
        let event = self.events.get(self.next)?.clone();
        self.next += 1;
        if let TestStreamEvent::Watermark { tag, watermark } = &event {
            let slot = self.tag_watermarks.entry(tag.clone()).or_insert(MIN_TIMESTAMP);
            *slot = (*slot).max(*watermark);
        }
        Some(event)
    }

    /// The stream's output watermark: the slowest tag, or the end of time
    /// once every event was applied.
    pub(crate) fn watermark(&self) -> EventTime {
        if !self.has_next() {
            return MAX_TIMESTAMP;
        }
        self.tag_watermarks
            .values()
            .copied()
            .min()
            .unwrap_or(MIN_TIMESTAMP)
    }
}

/// Appends events to the script of a test stream stage.
///
/// Events are applied one at a time, in the order they were added, whenever
/// the engine has no other work.
pub struct TestStreamBuilder<'a> {
    pub(crate) em: &'a ElementManager,
}

impl TestStreamBuilder<'_> {
    /// Inject `elements` (encoded value, timestamp) into the global window of
    /// the PCollection bound to `tag`.
    ///
    /// Each value must be a complete nested encoding of the PCollection's
    /// element coder.
    pub fn add_element_event(
        &self,
        tag: &str,
        elements: Vec<(Vec<u8>, EventTime)>,
    ) -> Result<(), EngineError> {
        self.em.with_test_stream(|core, ts| {
            let pcollection = ts.pcollection(tag)?.to_string();
            let info = core
                .pcollection_info(&pcollection)
                .ok_or_else(|| EngineError::UnknownPCollection(pcollection.clone()))?;
            let elements = elements
                .into_iter()
                .map(|(bytes, timestamp)| {
                    info.element_from_value(
                        Window::Global,
                        crate::types::clamp_timestamp(timestamp),
                        bytes,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            ts.push(TestStreamEvent::Elements {
                pcollection,
                elements,
            });
            Ok(())
        })
    }

    /// Advance the watermark of `tag`.
    pub fn add_watermark_event(&self, tag: &str, watermark: EventTime) -> Result<(), EngineError> {
        self.em.with_test_stream(|_, ts| {
            ts.pcollection(tag)?;
            ts.push(TestStreamEvent::Watermark {
                tag: tag.to_string(),
                watermark: crate::types::clamp_timestamp(watermark),
            });
            Ok(())
        })
    }

    /// Advance the synthetic processing clock by `advance` milliseconds.
    /// [`MAX_TIMESTAMP`] moves it to the end of time.
    pub fn add_processing_time_event(&self, advance: EventTime) -> Result<(), EngineError> {
        self.em.with_test_stream(|_, ts| {
            ts.push(TestStreamEvent::ProcessingTime { advance });
            Ok(())
        })
    }
}
