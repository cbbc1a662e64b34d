//! Scratch buffers of the thinking loop and the slot table that wires them.
//!
//! Every buffer is allocated once when the engine is built and overwritten on every
//! iteration of every call.

use std::sync::Arc;

use crate::backend::{BufferTable, ComputeContext, DeviceTensor};
use crate::config::EngineConfig;
use crate::manifold::ManifoldState;
use crate::params::ParameterSet;
use crate::NovaResult;

#[derive(Debug)]
pub struct Workspace {
    pub input: DeviceTensor,
    pub target: DeviceTensor,
    pub stream: DeviceTensor,
    pub norm: DeviceTensor,
    pub r: DeviceTensor,
    pub v: DeviceTensor,
    pub g: DeviceTensor,
    pub holo_out: DeviceTensor,
    pub ffn_gate: DeviceTensor,
    pub ffn_value: DeviceTensor,
    pub ffn_prod: DeviceTensor,
    pub ffn_out: DeviceTensor,
    pub cell_out: DeviceTensor,
    pub resid: DeviceTensor,
    pub prediction: DeviceTensor,
    pub scores: DeviceTensor,
}

impl Workspace {
    pub fn new(ctx: &Arc<ComputeContext>, config: &EngineConfig) -> NovaResult<Self> {
        let d = [config.d_model];
        let h = [config.ffn_hidden];
        Ok(Self {
            input: DeviceTensor::create(ctx, "input", &d)?,
            target: DeviceTensor::create(ctx, "target", &d)?,
            stream: DeviceTensor::create(ctx, "stream", &d)?,
            norm: DeviceTensor::create(ctx, "norm", &d)?,
            r: DeviceTensor::create(ctx, "r", &d)?,
            v: DeviceTensor::create(ctx, "v", &d)?,
            g: DeviceTensor::create(ctx, "g", &d)?,
            holo_out: DeviceTensor::create(ctx, "holo_out", &d)?,
            ffn_gate: DeviceTensor::create(ctx, "ffn_gate", &h)?,
            ffn_value: DeviceTensor::create(ctx, "ffn_value", &h)?,
            ffn_prod: DeviceTensor::create(ctx, "ffn_prod", &h)?,
            ffn_out: DeviceTensor::create(ctx, "ffn_out", &d)?,
            cell_out: DeviceTensor::create(ctx, "cell_out", &d)?,
            resid: DeviceTensor::create(ctx, "resid", &d)?,
            prediction: DeviceTensor::create(ctx, "prediction", &d)?,
            scores: DeviceTensor::create(ctx, "scores", &[config.vocab_size])?,
        })
    }
}

/// Every buffer a dispatch can bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Embedding,
    NormGain,
    Wr,
    Wv,
    Wg,
    Up1,
    Up2,
    Down,
    WPredict,
    State,
    Input,
    Target,
    Stream,
    Norm,
    R,
    V,
    G,
    HoloOut,
    FfnGate,
    FfnValue,
    FfnProd,
    FfnOut,
    CellOut,
    Resid,
    Prediction,
    Scores,
}

/// Borrowed view over the engine's buffers used to resolve slots
pub struct Buffers<'a> {
    pub params: &'a ParameterSet,
    pub manifold: &'a ManifoldState,
    pub workspace: &'a Workspace,
}

impl BufferTable for Buffers<'_> {
    type Slot = Slot;

    fn buffer(&self, slot: Slot) -> &DeviceTensor {
        let (p, w) = (self.params, self.workspace);
        match slot {
            Slot::Embedding => &p.embedding,
            Slot::NormGain => &p.norm_gain,
            Slot::Wr => &p.wr,
            Slot::Wv => &p.wv,
            Slot::Wg => &p.wg,
            Slot::Up1 => &p.up1,
            Slot::Up2 => &p.up2,
            Slot::Down => &p.down,
            Slot::WPredict => &p.w_predict,
            Slot::State => self.manifold.working(),
            Slot::Input => &w.input,
            Slot::Target => &w.target,
            Slot::Stream => &w.stream,
            Slot::Norm => &w.norm,
            Slot::R => &w.r,
            Slot::V => &w.v,
            Slot::G => &w.g,
            Slot::HoloOut => &w.holo_out,
            Slot::FfnGate => &w.ffn_gate,
            Slot::FfnValue => &w.ffn_value,
            Slot::FfnProd => &w.ffn_prod,
            Slot::FfnOut => &w.ffn_out,
            Slot::CellOut => &w.cell_out,
            Slot::Resid => &w.resid,
            Slot::Prediction => &w.prediction,
            Slot::Scores => &w.scores,
        }
    }
}
