//! # Thinking Engine
//!
//! Turns a token id into vocabulary scores through a fixed number of thinking
//! iterations. Each iteration rotates and gates the persistent manifold state and,
//! when adaptation is enabled, applies a local surprise correction to it. Nothing is
//! back-propagated: the parameters stay fixed and only the working state learns.
//!
//! ## One iteration
//!
//! ```text
//!            stream
//!               │
//!        RMSNorm × gain ──────────────┐
//!               │                     │
//!     ┌─────────┼─────────┐           │
//!   Wr·norm   Wv·norm   σ(Wg·norm)    │
//!     r         v         g           │
//!     └────┬────┴────┬────┘           │
//!          ▼         ▼                │
//!   ┌──────────────────────┐          │
//!   │  mixer (state, r,v,g)│◄── working manifold state (in place)
//!   └──────────┬───────────┘          │
//!           holo_out                  │
//!              │                      │
//!   Down·(swish(Up1·h) ⊙ Up2·h)       │
//!              │                      │
//!        holo_out + ffn_out + stream ◄┘
//!              │
//!        RMSNorm × gain  → next stream
//!              │
//!   [adapt] WPredict·stream → surprise → state += lr·surprise·(cos r, sin r)
//! ```
//!
//! After the last iteration `scores = Embedding · stream` (tied weights).
//!
//! All dispatches of one call are recorded into a single [`CommandBatch`] against bind
//! groups built once in [`ThinkingEngine::new`].

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{BindGroup, CommandBatch, ComputeContext, DeviceTensor, Kernel, Uniforms};
use crate::config::{EngineConfig, MixerKind};
use crate::error::NovaError;
use crate::manifold::{ManifoldState, ManifoldStats};
use crate::params::{ParameterName, ParameterSet, ParameterSnapshot};
use crate::workspace::{Buffers, Slot, Workspace};
use crate::NovaResult;

/// Options of a single forward call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Next token whose embedding the correction pulls toward; the input token is
    /// used when absent
    pub target_token_id: Option<usize>,
    /// Run the local surprise correction each iteration
    pub apply_adaptation: bool,
    /// Override the configured number of thinking iterations
    pub thinking_steps: Option<usize>,
}

impl ForwardOptions {
    /// Plain inference, no state correction
    pub fn inference() -> Self {
        Self::default()
    }

    /// Adapt toward the input token itself
    pub fn adapt() -> Self {
        Self {
            apply_adaptation: true,
            ..Self::default()
        }
    }

    /// Adapt toward `target`
    pub fn adapt_toward(target: usize) -> Self {
        Self {
            target_token_id: Some(target),
            apply_adaptation: true,
            thinking_steps: None,
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.thinking_steps = Some(steps);
        self
    }
}

/// Options of [`ThinkingEngine::observe_sequence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceOptions {
    /// Step between observed positions
    pub stride: usize,
    /// First target position whose pair adapts the state; earlier pairs only advance it
    pub adapt_from: usize,
    pub thinking_steps: Option<usize>,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            stride: 1,
            adapt_from: 0,
            thinking_steps: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveSummary {
    pub forwards: usize,
    pub adapted: usize,
}

/// Scalars of the mixer gain and the surprise correction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptationRates {
    pub decay: f32,
    pub learning_rate: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Ready,
    /// A dispatch failed mid-batch; the working state may be partially updated
    Invalidated { reason: String },
}

/// Bind groups of every dispatch the engine issues
struct DispatchPlan {
    gather_input: BindGroup<Slot>,
    gather_target: BindGroup<Slot>,
    stream_init: BindGroup<Slot>,
    pre_norm: BindGroup<Slot>,
    r_proj: BindGroup<Slot>,
    v_proj: BindGroup<Slot>,
    g_proj: BindGroup<Slot>,
    gate_sigmoid: BindGroup<Slot>,
    mixer: BindGroup<Slot>,
    ffn_gate: BindGroup<Slot>,
    ffn_value: BindGroup<Slot>,
    ffn_swish: BindGroup<Slot>,
    ffn_mul: BindGroup<Slot>,
    ffn_down: BindGroup<Slot>,
    cell_add: BindGroup<Slot>,
    resid_add: BindGroup<Slot>,
    post_norm: BindGroup<Slot>,
    predict: BindGroup<Slot>,
    correct_toward_input: BindGroup<Slot>,
    correct_toward_target: BindGroup<Slot>,
    scores: BindGroup<Slot>,
}

/// Dispatches per iteration without / with the correction
const STEP_DISPATCHES: usize = 14;
const CORRECTION_DISPATCHES: usize = 2;

impl DispatchPlan {
    fn build(
        ctx: &ComputeContext,
        config: &EngineConfig,
        buffers: &Buffers<'_>,
    ) -> NovaResult<Self> {
        let gather = ctx.create_pipeline("embedding-gather", Kernel::Gather);
        let copy = ctx.create_pipeline("vec-copy", Kernel::Copy);
        let rmsnorm = ctx.create_pipeline("rmsnorm", Kernel::RmsNorm { eps: config.rms_eps });
        let matvec = ctx.create_pipeline("matvec", Kernel::MatVec);
        let sigmoid = ctx.create_pipeline("sigmoid", Kernel::Sigmoid);
        let swish = ctx.create_pipeline("swish", Kernel::Swish);
        let add = ctx.create_pipeline("vec-add", Kernel::Add);
        let mul = ctx.create_pipeline("vec-mul", Kernel::Mul);
        let mixer = match config.mixer {
            MixerKind::Symplectic => ctx.create_pipeline("symplectic-flow", Kernel::SymplecticFlow),
            MixerKind::Holographic => ctx.create_pipeline("holo-mixer", Kernel::HolographicMix),
        };
        let active = ctx.create_pipeline("active-inference", Kernel::ActiveInference);

        let bind = |pipeline, slots: &[Slot]| BindGroup::new(pipeline, slots, buffers);
        use Slot::*;
        Ok(Self {
            gather_input: bind(gather, &[Embedding, Input])?,
            gather_target: bind(gather, &[Embedding, Target])?,
            stream_init: bind(copy, &[Input, Stream])?,
            pre_norm: bind(rmsnorm, &[Stream, NormGain, Norm])?,
            r_proj: bind(matvec, &[Wr, Norm, R])?,
            v_proj: bind(matvec, &[Wv, Norm, V])?,
            g_proj: bind(matvec, &[Wg, Norm, G])?,
            gate_sigmoid: bind(sigmoid, &[G])?,
            mixer: bind(mixer, &[State, R, V, G, HoloOut])?,
            ffn_gate: bind(matvec, &[Up1, HoloOut, FfnGate])?,
            ffn_value: bind(matvec, &[Up2, HoloOut, FfnValue])?,
            ffn_swish: bind(swish, &[FfnGate])?,
            ffn_mul: bind(mul, &[FfnGate, FfnValue, FfnProd])?,
            ffn_down: bind(matvec, &[Down, FfnProd, FfnOut])?,
            cell_add: bind(add, &[HoloOut, FfnOut, CellOut])?,
            resid_add: bind(add, &[Stream, CellOut, Resid])?,
            post_norm: bind(rmsnorm, &[Resid, NormGain, Stream])?,
            predict: bind(matvec, &[WPredict, Stream, Prediction])?,
            correct_toward_input: bind(active, &[State, R, Prediction, Input])?,
            correct_toward_target: bind(active, &[State, R, Prediction, Target])?,
            scores: bind(matvec, &[Embedding, Stream, Scores])?,
        })
    }
}

/// The recurrent thinking engine.
///
/// Mutating methods take `&mut self`: one engine serves one caller at a time, and the
/// score tensor returned by a forward call is overwritten by the next one.
pub struct ThinkingEngine {
    ctx: Arc<ComputeContext>,
    config: EngineConfig,
    params: ParameterSet,
    manifold: ManifoldState,
    workspace: Workspace,
    plan: DispatchPlan,
    rates: AdaptationRates,
    status: EngineStatus,
    calls: u64,
}

impl ThinkingEngine {
    /// Allocate every tensor, build the pipelines and bind groups, and reset the
    /// working state from the freshly initialized base.
    pub fn new(ctx: Arc<ComputeContext>, config: EngineConfig) -> NovaResult<Self> {
        config.validate()?;
        check_capacity(&ctx, &config)?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let params = ParameterSet::new(&ctx, &config, &mut rng)?;
        let manifold = ManifoldState::new(&ctx, config.d_model, &mut rng)?;
        let workspace = Workspace::new(&ctx, &config)?;
        let plan = DispatchPlan::build(
            &ctx,
            &config,
            &Buffers {
                params: &params,
                manifold: &manifold,
                workspace: &workspace,
            },
        )?;

        log::info!(
            "Thinking engine ready: vocab={} d_model={} ffn_hidden={} steps={} mixer={:?}",
            config.vocab_size,
            config.d_model,
            config.ffn_hidden,
            config.thinking_steps,
            config.mixer
        );
        log::debug!("{} bytes resident on {:?}", ctx.allocated_bytes(), ctx.device());

        let rates = AdaptationRates {
            decay: config.decay,
            learning_rate: config.learning_rate,
        };
        Ok(Self {
            ctx,
            config,
            params,
            manifold,
            workspace,
            plan,
            rates,
            status: EngineStatus::Ready,
            calls: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    pub fn rates(&self) -> AdaptationRates {
        self.rates
    }

    /// Forward calls completed since construction
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    pub fn parameter(&self, name: ParameterName) -> &DeviceTensor {
        self.params.get(name)
    }

    pub fn manifold(&self) -> &ManifoldState {
        &self.manifold
    }

    /// Scores of the last forward call
    pub fn scores(&self) -> &DeviceTensor {
        &self.workspace.scores
    }

    #[cfg(test)]
    pub(crate) fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run the thinking loop for `token_id` and return the `[vocab]` score tensor.
    ///
    /// The returned tensor is owned by the engine and overwritten by the next call.
    pub fn forward_token(
        &mut self,
        token_id: usize,
        options: &ForwardOptions,
    ) -> NovaResult<&DeviceTensor> {
        self.ensure_ready()?;
        self.check_token(token_id)?;
        if let Some(target) = options.target_token_id {
            self.check_token(target)?;
        }
        let steps = self.check_steps(options.thinking_steps)?;

        let outcome = {
            let batch = self.record(token_id, options, steps);
            self.ctx.submit(&batch, &self.buffers())
        };
        if let Err(err) = outcome {
            log::warn!("Forward call for token {} aborted: {}", token_id, err);
            self.status = EngineStatus::Invalidated {
                reason: err.to_string(),
            };
            return Err(err);
        }

        self.calls += 1;
        log::debug!(
            "Forward token {} ({} steps, adapt={}, target={:?})",
            token_id,
            steps,
            options.apply_adaptation,
            options.target_token_id
        );
        Ok(&self.workspace.scores)
    }

    /// [`forward_token`](Self::forward_token) followed by a read-back of the scores.
    ///
    /// A failed read-back aborts the request with [`NovaError::Readback`]; the engine
    /// stays usable.
    pub fn forward_scores(
        &mut self,
        token_id: usize,
        options: &ForwardOptions,
    ) -> NovaResult<Vec<f32>> {
        self.forward_token(token_id, options)?.read()
    }

    /// Teacher-forced adaptation over a token sequence.
    ///
    /// Visits pairs `(tokens[i], tokens[i + 1])` every `stride` positions and adapts the
    /// working state toward `tokens[i + 1]` once `i + 1 >= adapt_from`.
    pub fn observe_sequence(
        &mut self,
        tokens: &[usize],
        options: &SequenceOptions,
    ) -> NovaResult<ObserveSummary> {
        if options.stride == 0 {
            return Err(NovaError::InvalidConfig("stride must be positive".into()));
        }
        self.check_steps(options.thinking_steps)?;
        for &token in tokens {
            self.check_token(token)?;
        }

        let mut summary = ObserveSummary::default();
        for i in (0..tokens.len().saturating_sub(1)).step_by(options.stride) {
            let adapt = i + 1 >= options.adapt_from;
            let forward = ForwardOptions {
                target_token_id: Some(tokens[i + 1]),
                apply_adaptation: adapt,
                thinking_steps: options.thinking_steps,
            };
            self.forward_token(tokens[i], &forward)?;
            summary.forwards += 1;
            if adapt {
                summary.adapted += 1;
            }
        }
        Ok(summary)
    }

    /// Copy base → working, discarding all adaptation since the last commit.
    ///
    /// Also clears an [`EngineStatus::Invalidated`] state, since the base is never
    /// touched by a forward call.
    pub fn reset_working(&mut self) -> NovaResult<()> {
        self.manifold.reset_working()?;
        if let EngineStatus::Invalidated { reason } = &self.status {
            log::info!("Working state restored from base after: {}", reason);
            self.status = EngineStatus::Ready;
        }
        log::debug!("Working state reset from base");
        Ok(())
    }

    /// Copy working → base, making accumulated adaptation permanent
    pub fn commit_to_base(&mut self) -> NovaResult<()> {
        self.ensure_ready()?;
        self.manifold.commit_to_base()?;
        log::info!("Committed working state to base after {} calls", self.calls);
        Ok(())
    }

    /// Update the mixer gain and correction rate used by subsequent calls
    pub fn set_adaptation_rates(&mut self, decay: f32, learning_rate: f32) -> NovaResult<()> {
        if !decay.is_finite() || !learning_rate.is_finite() {
            return Err(NovaError::InvalidConfig(format!(
                "adaptation rates must be finite, got decay={} learning_rate={}",
                decay, learning_rate
            )));
        }
        self.rates = AdaptationRates { decay, learning_rate };
        log::debug!("Adaptation rates set to {:?}", self.rates);
        Ok(())
    }

    /// Overwrite one parameter tensor
    pub fn load_parameter(&mut self, name: ParameterName, data: &[f32]) -> NovaResult<()> {
        self.params.get_mut(name).write(data)
    }

    /// Overwrite the base state and reset working from it
    pub fn load_base_state(&mut self, data: &[f32]) -> NovaResult<()> {
        self.manifold.load_base(data)?;
        self.reset_working()
    }

    /// Host copy of every parameter and the base state
    pub fn export_parameters(&self) -> NovaResult<ParameterSnapshot> {
        let mut snapshot = self.params.export()?;
        snapshot.base_manifold = Some(self.manifold.base().read()?);
        Ok(snapshot)
    }

    /// Restore parameters (and the base state, when present), then reset working
    pub fn import_parameters(&mut self, snapshot: &ParameterSnapshot) -> NovaResult<()> {
        if let Some(base) = &snapshot.base_manifold {
            let expected = self.manifold.base().size();
            if base.len() != expected {
                return Err(NovaError::SizeMismatch {
                    expected: expected * 4,
                    got: base.len() * 4,
                });
            }
        }
        self.params.import(snapshot)?;
        match &snapshot.base_manifold {
            Some(base) => self.load_base_state(base),
            None => self.reset_working(),
        }
    }

    pub fn working_stats(&self) -> NovaResult<ManifoldStats> {
        self.manifold.working_stats()
    }

    fn buffers(&self) -> Buffers<'_> {
        Buffers {
            params: &self.params,
            manifold: &self.manifold,
            workspace: &self.workspace,
        }
    }

    fn record(
        &self,
        token_id: usize,
        options: &ForwardOptions,
        steps: usize,
    ) -> CommandBatch<'_, Slot> {
        let p = &self.plan;
        let flow = Uniforms::Flow {
            gain: self.rates.decay,
            imag_scale: self.config.imag_scale,
            read_mix: self.config.read_mix,
        };
        let rate = Uniforms::Rate(self.rates.learning_rate);
        let capacity = planned_dispatches(steps, options.apply_adaptation).unwrap_or(0);
        let mut batch = CommandBatch::with_capacity("forward-token", capacity);

        batch.record(&p.gather_input, Uniforms::Token(token_id));
        let correction = match (options.apply_adaptation, options.target_token_id) {
            (false, _) => None,
            (true, Some(target)) => {
                batch.record(&p.gather_target, Uniforms::Token(target));
                Some(&p.correct_toward_target)
            }
            (true, None) => Some(&p.correct_toward_input),
        };
        batch.record(&p.stream_init, Uniforms::None);

        for _ in 0..steps {
            for group in [
                &p.pre_norm,
                &p.r_proj,
                &p.v_proj,
                &p.g_proj,
                &p.gate_sigmoid,
            ] {
                batch.record(group, Uniforms::None);
            }
            batch.record(&p.mixer, flow);
            for group in [
                &p.ffn_gate,
                &p.ffn_value,
                &p.ffn_swish,
                &p.ffn_mul,
                &p.ffn_down,
                &p.cell_add,
                &p.resid_add,
                &p.post_norm,
            ] {
                batch.record(group, Uniforms::None);
            }
            if let Some(correction) = correction {
                batch.record(&p.predict, Uniforms::None);
                batch.record(correction, rate);
            }
        }

        batch.record(&p.scores, Uniforms::None);
        batch
    }

    fn ensure_ready(&self) -> NovaResult<()> {
        match &self.status {
            EngineStatus::Ready => Ok(()),
            EngineStatus::Invalidated { reason } => Err(NovaError::Invalidated(reason.clone())),
        }
    }

    /// Resolve the iteration count of a call, bounded by `max_thinking_steps`
    fn check_steps(&self, requested: Option<usize>) -> NovaResult<usize> {
        let steps = requested.unwrap_or(self.config.thinking_steps);
        if steps > self.config.max_thinking_steps {
            return Err(NovaError::InvalidConfig(format!(
                "{} thinking steps requested, at most {} allowed",
                steps, self.config.max_thinking_steps
            )));
        }
        Ok(steps)
    }

    fn check_token(&self, token: usize) -> NovaResult<()> {
        if token >= self.config.vocab_size {
            return Err(NovaError::TokenOutOfRange {
                token,
                vocab: self.config.vocab_size,
            });
        }
        Ok(())
    }
}

/// Upper bound on the dispatches one call records
fn planned_dispatches(steps: usize, adapt: bool) -> Option<usize> {
    let per_step = STEP_DISPATCHES + if adapt { CORRECTION_DISPATCHES } else { 0 };
    steps.checked_mul(per_step)?.checked_add(4)
}

/// Reject configs whose buffers the device cannot hold, before allocating anything
fn check_capacity(ctx: &ComputeContext, config: &EngineConfig) -> NovaResult<()> {
    let bytes = |label: &str, shape: &[usize]| -> NovaResult<usize> {
        shape
            .iter()
            .try_fold(4usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| NovaError::Capacity(format!("'{}' shape {:?} overflows", label, shape)))
    };
    for name in ParameterName::ALL {
        let shape = name.shape(config);
        ctx.check_capacity(name.as_str(), bytes(name.as_str(), &shape)?)?;
    }
    ctx.check_capacity("scores", bytes("scores", &[config.vocab_size])?)?;
    ctx.check_capacity("ffn_hidden", bytes("ffn_hidden", &[config.ffn_hidden])?)?;
    Ok(())
}
