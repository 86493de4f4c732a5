// src/rl/policy.rs
//
// Policy adapter: observation + recurrent state in, actions + recurrent
// state out.
//
// Design:
// - PolicyBinding: how a layout maps onto engine inputs/outputs
// - RecurrentState: the fixed-length history buffer some models carry
// - PolicyAdapter: checks the binding against the engine's declared tensors
//   at construction, then runs one deterministic evaluation per tick
//
// Nothing here truncates, pads, or substitutes values. A wrong length or a
// non-finite value is an InferenceError and ends the session.

use serde::{Deserialize, Serialize};

use super::engine::{InferenceEngine, NamedTensors};
use super::observation::{ObservationLayout, ObservationVector, SegmentKind};
use crate::error::{ConfigError, InferenceError};

/// How the observation and actions are bound to engine tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyBinding {
    /// Whole observation to one input, one output holds the actions.
    Flat { input: String, output: String },
    /// Each layout segment feeds the input of the same name.
    NamedSegments {
        /// Raw actions, fed back as previous actions.
        actions: String,
        /// Actions used for commands; falls back to `actions` when unset.
        #[serde(default)]
        actions_scaled: Option<String>,
        /// Updated recurrent history buffer.
        #[serde(default)]
        history: Option<String>,
    },
}

impl PolicyBinding {
    pub fn flat() -> Self {
        PolicyBinding::Flat {
            input: "obs".to_string(),
            output: "actions".to_string(),
        }
    }

    /// Binding of the projected-gravity checkpoint.
    pub fn gravity_named() -> Self {
        PolicyBinding::NamedSegments {
            actions: "actions".to_string(),
            actions_scaled: Some("actions_scaled".to_string()),
            history: Some("x.3".to_string()),
        }
    }
}

/// Rolling history buffer carried between ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecurrentState {
    history: Vec<f32>,
}

impl RecurrentState {
    pub fn zeros(len: usize) -> Self {
        Self {
            history: vec![0.0; len],
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyStep {
    /// Raw actions, policy order; stored as previous actions.
    pub actions: Vec<f64>,
    /// Actions converted to commands, policy order.
    pub command_actions: Vec<f64>,
}

pub struct PolicyAdapter {
    engine: Box<dyn InferenceEngine>,
    binding: PolicyBinding,
    layout: ObservationLayout,
}

impl std::fmt::Debug for PolicyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyAdapter")
            .field("model_id", &self.engine.model_id())
            .field("binding", &self.binding)
            .field("layout", &self.layout.id)
            .finish()
    }
}

impl PolicyAdapter {
    /// Bind an engine to a layout. Any disagreement between the engine's
    /// declared tensors and the layout is a configuration error.
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        binding: PolicyBinding,
        layout: ObservationLayout,
    ) -> Result<Self, ConfigError> {
        layout.validate()?;
        let n = layout.num_joints;
        let mismatch = |reason: String| ConfigError::Layout {
            layout: layout.id.clone(),
            reason,
        };
        let expect_output = |name: &str, len: usize| -> Result<(), ConfigError> {
            match engine.output(name) {
                None => Err(mismatch(format!(
                    "model {} has no output {name:?}",
                    engine.model_id()
                ))),
                Some(t) if t.len != len => Err(mismatch(format!(
                    "model output {name:?} has length {}, expected {len}",
                    t.len
                ))),
                Some(_) => Ok(()),
            }
        };

        match &binding {
            PolicyBinding::Flat { input, output } => {
                if layout.history_len() > 0 {
                    return Err(mismatch(
                        "flat binding cannot carry a history segment".to_string(),
                    ));
                }
                match engine.input(input) {
                    None => {
                        return Err(mismatch(format!(
                            "model {} has no input {input:?}",
                            engine.model_id()
                        )))
                    }
                    Some(t) if t.len != layout.len() => {
                        return Err(mismatch(format!(
                            "model input {input:?} has length {}, layout has {}",
                            t.len,
                            layout.len()
                        )))
                    }
                    Some(_) => {}
                }
                expect_output(output, n)?;
            }
            PolicyBinding::NamedSegments {
                actions,
                actions_scaled,
                history,
            } => {
                for seg in &layout.segments {
                    if seg.kind == SegmentKind::Reserved {
                        continue;
                    }
                    match engine.input(&seg.name) {
                        None => {
                            return Err(mismatch(format!(
                                "model {} has no input {:?}",
                                engine.model_id(),
                                seg.name
                            )))
                        }
                        Some(t) if t.len != seg.len => {
                            return Err(mismatch(format!(
                                "model input {:?} has length {}, segment has {}",
                                seg.name, t.len, seg.len
                            )))
                        }
                        Some(_) => {}
                    }
                }
                expect_output(actions, n)?;
                if let Some(scaled) = actions_scaled {
                    expect_output(scaled, n)?;
                }
                match (history, layout.history_len()) {
                    (Some(name), h) if h > 0 => expect_output(name, h)?,
                    (None, 0) => {}
                    (Some(_), _) => {
                        return Err(mismatch(
                            "history output bound but layout has no history segment".to_string(),
                        ))
                    }
                    (None, _) => {
                        return Err(mismatch(
                            "layout has a history segment but no history output is bound"
                                .to_string(),
                        ))
                    }
                }
            }
        }

        Ok(Self {
            engine,
            binding,
            layout,
        })
    }

    pub fn model_id(&self) -> &str {
        self.engine.model_id()
    }

    pub fn layout(&self) -> &ObservationLayout {
        &self.layout
    }

    pub fn num_actions(&self) -> usize {
        self.layout.num_joints
    }

    /// Zeroed recurrent state sized for the layout.
    pub fn initial_state(&self) -> RecurrentState {
        RecurrentState::zeros(self.layout.history_len())
    }

    pub fn infer(
        &self,
        obs: &ObservationVector,
        state: &RecurrentState,
    ) -> Result<(PolicyStep, RecurrentState), InferenceError> {
        if obs.layout_id() != self.layout.id {
            return Err(InferenceError::Engine(format!(
                "observation built for layout {} but policy expects {}",
                obs.layout_id(),
                self.layout.id
            )));
        }
        if obs.len() != self.layout.len() {
            return Err(InferenceError::ShapeMismatch {
                name: "observation".to_string(),
                expected: self.layout.len(),
                actual: obs.len(),
            });
        }
        let n = self.num_actions();

        match &self.binding {
            PolicyBinding::Flat { input, output } => {
                let mut inputs = NamedTensors::new();
                inputs.insert(input.clone(), obs.as_slice().to_vec());
                let outputs = self.engine.run(&inputs)?;
                let actions = take_output(&outputs, output, n)?;
                Ok((
                    PolicyStep {
                        command_actions: actions.clone(),
                        actions,
                    },
                    state.clone(),
                ))
            }
            PolicyBinding::NamedSegments {
                actions,
                actions_scaled,
                history,
            } => {
                let mut inputs = NamedTensors::new();
                let values = obs.as_slice();
                let mut start = 0;
                for seg in &self.layout.segments {
                    if seg.kind != SegmentKind::Reserved {
                        inputs.insert(seg.name.clone(), values[start..start + seg.len].to_vec());
                    }
                    start += seg.len;
                }
                let outputs = self.engine.run(&inputs)?;
                let raw = take_output(&outputs, actions, n)?;
                let command_actions = match actions_scaled {
                    Some(name) => take_output(&outputs, name, n)?,
                    None => raw.clone(),
                };
                let next_state = match history {
                    Some(name) => {
                        let h = take_output(&outputs, name, self.layout.history_len())?;
                        RecurrentState {
                            history: h.into_iter().map(|v| v as f32).collect(),
                        }
                    }
                    None => state.clone(),
                };
                Ok((
                    PolicyStep {
                        actions: raw,
                        command_actions,
                    },
                    next_state,
                ))
            }
        }
    }
}

fn take_output(
    outputs: &NamedTensors,
    name: &str,
    expected: usize,
) -> Result<Vec<f64>, InferenceError> {
    let v = outputs
        .get(name)
        .ok_or_else(|| InferenceError::MissingOutput(name.to_string()))?;
    if v.len() != expected {
        return Err(InferenceError::ShapeMismatch {
            name: name.to_string(),
            expected,
            actual: v.len(),
        });
    }
    if let Some(index) = v.iter().position(|x| !x.is_finite()) {
        return Err(InferenceError::NonFinite {
            name: name.to_string(),
            index,
        });
    }
    Ok(v.iter().map(|&x| x as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gait::GaitPhase;
    use crate::rl::engine::TensorSpec;
    use crate::rl::observation::{ObsScales, ObservationBuilder, ObservationInputs};
    use crate::types::{Orientation, VelocityCommand};

    /// Test engine returning fixed outputs and echoing one input.
    struct Canned {
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
        values: NamedTensors,
        echo: Option<(String, String)>,
    }

    impl InferenceEngine for Canned {
        fn model_id(&self) -> &str {
            "canned"
        }
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }
        fn outputs(&self) -> &[TensorSpec] {
            &self.outputs
        }
        fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors, InferenceError> {
            for spec in &self.inputs {
                let v = inputs
                    .get(&spec.name)
                    .ok_or_else(|| InferenceError::MissingInput(spec.name.clone()))?;
                assert_eq!(v.len(), spec.len);
            }
            let mut out = self.values.clone();
            if let Some((from, to)) = &self.echo {
                out.insert(to.clone(), inputs[from].clone());
            }
            Ok(out)
        }
    }

    fn flat_engine(actions: Vec<f32>) -> Canned {
        let mut values = NamedTensors::new();
        let n = actions.len();
        values.insert("actions".to_string(), actions);
        Canned {
            inputs: vec![TensorSpec::new("obs", 11 + 3 * n + 4)],
            outputs: vec![TensorSpec::new("actions", n)],
            values,
            echo: None,
        }
    }

    fn obs_for(layout: &ObservationLayout, history: &[f32]) -> ObservationVector {
        let n = layout.num_joints;
        let zeros = vec![0.0; n];
        ObservationBuilder::new(layout.clone(), ObsScales::unit(), zeros.clone(), [1.0; 3])
            .unwrap()
            .build(&ObservationInputs {
                phase: GaitPhase::default(),
                elapsed_s: 0.0,
                command: VelocityCommand::default(),
                joint_pos: &zeros,
                joint_vel: &zeros,
                previous_actions: &zeros,
                angular_velocity: [0.0; 3],
                orientation: Orientation::identity(),
                history,
            })
            .unwrap()
    }

    #[test]
    fn flat_binding_returns_actions_and_keeps_state() {
        let layout = ObservationLayout::euler_phase_v1(2);
        let adapter = PolicyAdapter::new(
            Box::new(flat_engine(vec![0.25, -0.5])),
            PolicyBinding::flat(),
            layout.clone(),
        )
        .unwrap();
        let state = adapter.initial_state();
        assert!(state.is_empty());
        let (step, next) = adapter.infer(&obs_for(&layout, &[]), &state).unwrap();
        assert_eq!(step.actions, vec![0.25, -0.5]);
        assert_eq!(step.command_actions, step.actions);
        assert_eq!(next, state);
    }

    #[test]
    fn wrong_output_length_is_rejected_at_construction() {
        let mut engine = flat_engine(vec![0.0; 3]);
        engine.inputs = vec![TensorSpec::new("obs", ObservationLayout::euler_phase_v1(2).len())];
        let err = PolicyAdapter::new(
            Box::new(engine),
            PolicyBinding::flat(),
            ObservationLayout::euler_phase_v1(2),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Layout { .. }));
    }

    #[test]
    fn non_finite_and_short_outputs_are_inference_errors() {
        let layout = ObservationLayout::euler_phase_v1(2);
        let adapter = PolicyAdapter::new(
            Box::new(flat_engine(vec![0.1, f32::NAN])),
            PolicyBinding::flat(),
            layout.clone(),
        )
        .unwrap();
        let err = adapter
            .infer(&obs_for(&layout, &[]), &adapter.initial_state())
            .unwrap_err();
        assert!(matches!(err, InferenceError::NonFinite { index: 1, .. }));

        // Declares 2 but returns 1.
        let mut engine = flat_engine(vec![0.1, 0.2]);
        engine.values.insert("actions".to_string(), vec![0.1]);
        let adapter = PolicyAdapter::new(Box::new(engine), PolicyBinding::flat(), layout.clone())
            .unwrap();
        let err = adapter
            .infer(&obs_for(&layout, &[]), &adapter.initial_state())
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ShapeMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    fn gravity_engine(n: usize, h: usize) -> Canned {
        let layout = ObservationLayout::projected_gravity_v1(n, h);
        let inputs = layout
            .segments
            .iter()
            .map(|s| TensorSpec::new(&s.name, s.len))
            .collect();
        let mut values = NamedTensors::new();
        values.insert("actions".to_string(), vec![1.0; n]);
        values.insert("actions_scaled".to_string(), vec![0.5; n]);
        Canned {
            inputs,
            outputs: vec![
                TensorSpec::new("actions", n),
                TensorSpec::new("actions_scaled", n),
                TensorSpec::new("x.3", h),
            ],
            values,
            // The history output echoes the history input, shifted by the
            // test below.
            echo: Some(("buffer.1".to_string(), "x.3".to_string())),
        }
    }

    #[test]
    fn named_binding_splits_inputs_and_replaces_history() {
        let layout = ObservationLayout::projected_gravity_v1(2, 3);
        let adapter = PolicyAdapter::new(
            Box::new(gravity_engine(2, 3)),
            PolicyBinding::gravity_named(),
            layout.clone(),
        )
        .unwrap();
        let state = RecurrentState {
            history: vec![7.0, 8.0, 9.0],
        };
        let (step, next) = adapter
            .infer(&obs_for(&layout, state.as_slice()), &state)
            .unwrap();
        assert_eq!(step.actions, vec![1.0, 1.0]);
        assert_eq!(step.command_actions, vec![0.5, 0.5]);
        assert_eq!(next.as_slice(), &[7.0, 8.0, 9.0]);
    }

    #[test]
    fn named_binding_requires_every_segment_input() {
        let mut engine = gravity_engine(2, 3);
        engine.inputs.retain(|t| t.name != "t.1");
        let err = PolicyAdapter::new(
            Box::new(engine),
            PolicyBinding::gravity_named(),
            ObservationLayout::projected_gravity_v1(2, 3),
        )
        .unwrap_err();
        assert!(err.to_string().contains("t.1"));
    }

    #[test]
    fn history_output_must_match_layout() {
        let err = PolicyAdapter::new(
            Box::new(gravity_engine(2, 3)),
            PolicyBinding::NamedSegments {
                actions: "actions".to_string(),
                actions_scaled: None,
                history: None,
            },
            ObservationLayout::projected_gravity_v1(2, 3),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Layout { .. }));
    }
}
