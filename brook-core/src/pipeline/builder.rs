use prost::Message;

use super::*;
use crate::error::EngineError;
use crate::window::{Trigger as WindowTrigger, WindowFn};

/// Assembles a [`Pipeline`] proto transform by transform.
///
/// Used by tests and by the CLI's demo pipelines; real pipelines arrive
/// already serialized from an SDK.
///
/// Every helper returns the id of what it created. Transforms are added at
/// the top level, in call order, and each output PCollection is named
/// `<transform>.out`.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    components: Components,
    roots: Vec<String>,
}

impl PipelineBuilder {
    /// Create a builder with the global windowing strategy already declared
    /// under [`PipelineBuilder::GLOBAL_WINDOWING`].
    pub fn new() -> Self {
        let mut builder = Self::default();
        builder.windowing(
            Self::GLOBAL_WINDOWING,
            &WindowFn::Global,
            &WindowTrigger::Default,
            AccumulationMode::Discarding,
            OutputTime::EndOfWindow,
            0,
        );
        builder
    }

    pub const GLOBAL_WINDOWING: &'static str = "global";

    // ── Coders ───────────────────────────────────────────────────────────────

    /// Declare a coder, reusing an identical existing declaration.
    pub fn coder(&mut self, urn: &str, components: &[&str]) -> String {
        let coder = Coder {
            spec: Some(FunctionSpec::new(urn, Vec::new())),
            component_coder_ids: components.iter().map(|c| c.to_string()).collect(),
        };
        let mut existing: Vec<&String> = self
            .components
            .coders
            .iter()
            .filter(|(_, c)| **c == coder)
            .map(|(id, _)| id)
            .collect();
        existing.sort();
        if let Some(id) = existing.first() {
            return (*id).clone();
        }
        let id = format!("c{}", self.components.coders.len());
        self.components.coders.insert(id.clone(), coder);
        id
    }

    pub fn bytes_coder(&mut self) -> String {
        self.coder(urns::CODER_BYTES, &[])
    }

    pub fn string_coder(&mut self) -> String {
        self.coder(urns::CODER_STRING_UTF8, &[])
    }

    pub fn varint_coder(&mut self) -> String {
        self.coder(urns::CODER_VARINT, &[])
    }

    pub fn kv_coder(&mut self, key: &str, value: &str) -> String {
        self.coder(urns::CODER_KV, &[key, value])
    }

    pub fn iterable_coder(&mut self, element: &str) -> String {
        self.coder(urns::CODER_ITERABLE, &[element])
    }

    // ── Windowing and environments ───────────────────────────────────────────

    /// Declare a windowing strategy under `id`, creating its window coder.
    pub fn windowing(
        &mut self,
        id: &str,
        window_fn: &WindowFn,
        trigger: &WindowTrigger,
        accumulation: AccumulationMode,
        output_time: OutputTime,
        allowed_lateness: i64,
    ) -> String {
        let window_coder_id = self.coder(window_fn.window_coder_urn(), &[]);
        self.components.windowing_strategies.insert(
            id.to_string(),
            WindowingStrategy {
                window_fn: Some(window_fn.to_spec()),
                merge_status: MergeStatus::NonMerging as i32,
                window_coder_id,
                trigger: Some(trigger.into()),
                accumulation_mode: accumulation as i32,
                output_time: output_time as i32,
                allowed_lateness,
                assigns_to_one_window: matches!(
                    window_fn,
                    WindowFn::Global | WindowFn::Fixed { .. }
                ),
                environment_id: String::new(),
            },
        );
        id.to_string()
    }

    /// Declare an SDK environment that user transforms run in.
    pub fn environment(&mut self, id: &str) -> String {
        self.components.environments.insert(
            id.to_string(),
            Environment {
                urn: urns::ENV_EXTERNAL.to_string(),
                payload: Vec::new(),
            },
        );
        id.to_string()
    }

    /// Declare a PCollection directly.
    pub fn pcollection(&mut self, id: &str, coder_id: &str, windowing_id: &str) -> String {
        self.components.pcollections.insert(
            id.to_string(),
            PCollection {
                unique_name: id.to_string(),
                coder_id: coder_id.to_string(),
                is_bounded: IsBounded::Bounded as i32,
                windowing_strategy_id: windowing_id.to_string(),
            },
        );
        id.to_string()
    }

    // ── Transforms ───────────────────────────────────────────────────────────

    /// Add a transform. `inputs` and `outputs` map local names to PCollection ids.
    pub fn transform(
        &mut self,
        name: &str,
        spec: FunctionSpec,
        environment_id: &str,
        inputs: &[(&str, &str)],
        outputs: &[(&str, &str)],
    ) -> String {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        self.components.transforms.insert(
            name.to_string(),
            PTransform {
                spec: Some(spec),
                subtransforms: Vec::new(),
                inputs: to_map(inputs),
                outputs: to_map(outputs),
                unique_name: name.to_string(),
                environment_id: environment_id.to_string(),
            },
        );
        self.roots.push(name.to_string());
        name.to_string()
    }

    /// Impulse producing a single empty byte array in the global window.
    pub fn impulse(&mut self, name: &str) -> String {
        let coder = self.bytes_coder();
        let out = self.pcollection(&output_id(name), &coder, Self::GLOBAL_WINDOWING);
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_IMPULSE, Vec::new()),
            "",
            &[],
            &[("out", &out)],
        );
        out
    }

    /// Flatten several PCollections into one with the first input's coder
    /// and windowing.
    pub fn flatten(&mut self, name: &str, inputs: &[&str]) -> Result<String, EngineError> {
        let first = inputs
            .first()
            .ok_or_else(|| EngineError::malformed(format!("flatten {name} has no inputs")))?;
        let (coder, windowing) = self.coder_and_windowing(first)?;
        let out = self.pcollection(&output_id(name), &coder, &windowing);
        let local: Vec<(String, &str)> = inputs
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("i{i}"), *p))
            .collect();
        let local: Vec<(&str, &str)> = local.iter().map(|(k, p)| (k.as_str(), *p)).collect();
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_FLATTEN, Vec::new()),
            "",
            &local,
            &[("out", &out)],
        );
        Ok(out)
    }

    /// Group a `KV<K, V>` PCollection into `KV<K, Iterable<V>>`.
    pub fn group_by_key(&mut self, name: &str, input: &str) -> Result<String, EngineError> {
        let (coder_id, windowing) = self.coder_and_windowing(input)?;
        let coder = self
            .components
            .coders
            .get(&coder_id)
            .ok_or_else(|| EngineError::UnknownCoder(coder_id.clone()))?;
        let [key, value] = coder.component_coder_ids.as_slice() else {
            return Err(EngineError::malformed(format!(
                "group by key {name} needs a KV input, got {}",
                coder.urn()
            )));
        };
        let (key, value) = (key.clone(), value.clone());
        let values = self.iterable_coder(&value);
        let out_coder = self.kv_coder(&key, &values);
        let out = self.pcollection(&output_id(name), &out_coder, &windowing);
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_GBK, Vec::new()),
            "",
            &[("in", input)],
            &[("out", &out)],
        );
        Ok(out)
    }

    /// Reassign the windows of `input` per the windowing strategy `windowing_id`.
    pub fn window_into(
        &mut self,
        name: &str,
        input: &str,
        windowing_id: &str,
    ) -> Result<String, EngineError> {
        let (coder, _) = self.coder_and_windowing(input)?;
        let window_fn = self
            .components
            .windowing_strategies
            .get(windowing_id)
            .and_then(|ws| ws.window_fn.clone())
            .ok_or_else(|| {
                EngineError::malformed(format!("unknown windowing strategy {windowing_id}"))
            })?;
        let payload = WindowIntoPayload {
            window_fn: Some(window_fn),
        };
        let out = self.pcollection(&output_id(name), &coder, windowing_id);
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_WINDOW_INTO, payload.encode_to_vec()),
            "",
            &[("in", input)],
            &[("out", &out)],
        );
        Ok(out)
    }

    /// Scripted source. Elements are encoded with `coder_id`.
    pub fn test_stream(
        &mut self,
        name: &str,
        coder_id: &str,
        windowing_id: &str,
        events: Vec<test_stream_payload::Event>,
    ) -> String {
        let out = self.pcollection(&output_id(name), coder_id, windowing_id);
        let payload = TestStreamPayload {
            coder_id: coder_id.to_string(),
            events,
        };
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_TEST_STREAM, payload.encode_to_vec()),
            "",
            &[],
            &[("out", &out)],
        );
        out
    }

    /// User transform executed by the worker of `environment_id`. The single
    /// output inherits the main input's windowing.
    ///
    /// `side_inputs` maps local names to PCollections; any not already
    /// declared in `payload` are declared with the iterable access pattern.
    pub fn pardo(
        &mut self,
        name: &str,
        environment_id: &str,
        input: &str,
        side_inputs: &[(&str, &str)],
        mut payload: ParDoPayload,
        output_coder: &str,
    ) -> Result<String, EngineError> {
        let (_, windowing) = self.coder_and_windowing(input)?;
        let out = self.pcollection(&output_id(name), output_coder, &windowing);
        for (local, _) in side_inputs {
            payload
                .side_inputs
                .entry(local.to_string())
                .or_insert_with(|| SideInput {
                    access_pattern: Some(FunctionSpec::new(
                        urns::SIDE_INPUT_ITERABLE,
                        Vec::new(),
                    )),
                    view_fn: None,
                    window_mapping_fn: None,
                });
        }
        if payload.do_fn.is_none() {
            payload.do_fn = Some(FunctionSpec::new("brook:dofn:opaque", name.as_bytes().to_vec()));
        }
        let mut inputs = vec![("in", input)];
        inputs.extend_from_slice(side_inputs);
        self.transform(
            name,
            FunctionSpec::new(urns::TRANSFORM_PARDO, payload.encode_to_vec()),
            environment_id,
            &inputs,
            &[("out", &out)],
        );
        Ok(out)
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            components: Some(self.components),
            root_transform_ids: self.roots,
            requirements: Vec::new(),
        }
    }

    fn coder_and_windowing(&self, pcoll: &str) -> Result<(String, String), EngineError> {
        let p = self
            .components
            .pcollections
            .get(pcoll)
            .ok_or_else(|| EngineError::UnknownPCollection(pcoll.to_string()))?;
        Ok((p.coder_id.clone(), p.windowing_strategy_id.clone()))
    }
}

fn output_id(transform: &str) -> String {
    format!("{transform}.out")
}
