//! Compute kernels of the thinking loop.
//!
//! Each [`Kernel`] reads its bound input buffers, computes on the device and writes
//! the result into its output buffer in place. The math itself is exposed as plain
//! functions over candle tensors so it can be checked against hand-computed values.
//!
//! Manifold state tensors are `[channels, 2]`: column 0 holds the real part, column 1
//! the imaginary part of each channel's spinor.

use candle_core::{Result as CandleResult, Tensor};

use crate::backend::tensor::DeviceTensor;
use crate::error::NovaError;
use crate::rmsnorm::rms_norm;
use crate::NovaResult;

/// Per-dispatch scalars, filled when the dispatch is recorded
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Uniforms {
    #[default]
    None,
    /// Row to gather from an embedding matrix
    Token(usize),
    /// Mixer constants; `gain` is the decay applied to the retained state
    Flow {
        gain: f32,
        imag_scale: f32,
        read_mix: f32,
    },
    /// Learning rate of the surprise correction
    Rate(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `[embedding, out]`: copy row `Token` of the embedding into `out`
    Gather,
    /// `[src, dst]`
    Copy,
    /// `[x, gain, out]`
    RmsNorm { eps: f64 },
    /// `[matrix, x, out]`: `out = matrix · x`
    MatVec,
    /// `[x]`, in place
    Sigmoid,
    /// `[x]`, in place
    Swish,
    /// `[a, b, out]`
    Add,
    /// `[a, b, out]`
    Mul,
    /// `[state, r, v, g, out]`
    SymplecticFlow,
    /// `[state, r, v, g, out]`
    HolographicMix,
    /// `[state, r, prediction, target]`
    ActiveInference,
}

impl Kernel {
    pub fn binding_count(&self) -> usize {
        match self {
            Kernel::Sigmoid | Kernel::Swish => 1,
            Kernel::Gather | Kernel::Copy => 2,
            Kernel::RmsNorm { .. } | Kernel::MatVec | Kernel::Add | Kernel::Mul => 3,
            Kernel::ActiveInference => 4,
            Kernel::SymplecticFlow | Kernel::HolographicMix => 5,
        }
    }

    /// Kernels that store a view of one binding into another; those two must differ.
    pub(crate) fn forbids_aliasing(&self) -> bool {
        matches!(self, Kernel::Gather | Kernel::Copy)
    }

    /// Check the shapes bound to this kernel
    pub(crate) fn check_shapes(&self, shapes: &[&[usize]]) -> Result<(), String> {
        if shapes.len() != self.binding_count() {
            return Err(format!(
                "expected {} bindings, got {}",
                self.binding_count(),
                shapes.len()
            ));
        }
        let len = |s: &[usize]| s.iter().product::<usize>();
        let same_len = |shapes: &[&[usize]]| -> Result<(), String> {
            let first = len(shapes[0]);
            for &shape in shapes {
                if len(shape) != first {
                    return Err(format!("length {} does not match {}", len(shape), first));
                }
            }
            Ok(())
        };
        let pair_state = |state: &[usize], lanes: usize| -> Result<(), String> {
            if state.len() == 2 && state[1] == 2 && state[0] == lanes {
                Ok(())
            } else {
                Err(format!("state {:?} is not [{}, 2]", state, lanes))
            }
        };

        match self {
            Kernel::Gather => match shapes[0] {
                [_, cols] if *cols == len(shapes[1]) => Ok(()),
                other => Err(format!("embedding {:?} does not gather into {:?}", other, shapes[1])),
            },
            Kernel::MatVec => match shapes[0] {
                [rows, cols] if *cols == len(shapes[1]) && *rows == len(shapes[2]) => Ok(()),
                other => Err(format!(
                    "matrix {:?} cannot map {:?} to {:?}",
                    other, shapes[1], shapes[2]
                )),
            },
            Kernel::Copy
            | Kernel::RmsNorm { .. }
            | Kernel::Add
            | Kernel::Mul
            | Kernel::Sigmoid
            | Kernel::Swish => same_len(shapes),
            Kernel::SymplecticFlow | Kernel::HolographicMix | Kernel::ActiveInference => {
                same_len(&shapes[1..])?;
                pair_state(shapes[0], len(shapes[1]))
            }
        }
    }

    /// Run the kernel against bound buffers
    pub(crate) fn execute(&self, b: &[&DeviceTensor], uniforms: Uniforms) -> NovaResult<()> {
        if b.len() != self.binding_count() {
            return Err(NovaError::Binding {
                pipeline: "execute",
                reason: format!("expected {} bindings, got {}", self.binding_count(), b.len()),
            });
        }
        match (self, uniforms) {
            (Kernel::Gather, Uniforms::Token(token)) => {
                let embedding = b[0].tensor()?;
                let rows = embedding.dims()[0];
                if token >= rows {
                    return Err(NovaError::TokenOutOfRange { token, vocab: rows });
                }
                b[1].store(&embedding.narrow(0, token, 1)?)
            }
            (Kernel::Copy, _) => b[1].store(b[0].tensor()?),
            (Kernel::RmsNorm { eps }, _) => {
                b[2].store(&rms_norm(b[0].tensor()?, b[1].tensor()?, *eps)?)
            }
            (Kernel::MatVec, _) => b[2].store(&mat_vec(b[0].tensor()?, b[1].tensor()?)?),
            (Kernel::Sigmoid, _) => b[0].store(&candle_nn::ops::sigmoid(b[0].tensor()?)?),
            (Kernel::Swish, _) => b[0].store(&b[0].tensor()?.silu()?),
            (Kernel::Add, _) => b[2].store(&(b[0].tensor()? + b[1].tensor()?)?),
            (Kernel::Mul, _) => b[2].store(&(b[0].tensor()? * b[1].tensor()?)?),
            (
                Kernel::SymplecticFlow,
                Uniforms::Flow {
                    gain,
                    imag_scale,
                    read_mix,
                },
            ) => {
                let (state, out) = symplectic_flow(
                    b[0].tensor()?,
                    b[1].tensor()?,
                    b[2].tensor()?,
                    b[3].tensor()?,
                    gain,
                    imag_scale,
                    read_mix,
                )?;
                b[0].store(&state)?;
                b[4].store(&out)
            }
            (Kernel::HolographicMix, Uniforms::Flow { gain, .. }) => {
                let (state, out) = holographic_mix(
                    b[0].tensor()?,
                    b[1].tensor()?,
                    b[2].tensor()?,
                    b[3].tensor()?,
                    gain,
                )?;
                b[0].store(&state)?;
                b[4].store(&out)
            }
            (Kernel::ActiveInference, Uniforms::Rate(lr)) => {
                let surprise = (b[3].tensor()? - b[2].tensor()?)?;
                let state = active_inference(b[0].tensor()?, b[1].tensor()?, &surprise, lr)?;
                b[0].store(&state)
            }
            (kernel, uniforms) => Err(NovaError::Binding {
                pipeline: "execute",
                reason: format!("{:?} cannot run with {:?}", kernel, uniforms),
            }),
        }
    }
}

/// A kernel ready to be bound and dispatched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pipeline {
    label: &'static str,
    kernel: Kernel,
}

impl Pipeline {
    pub(crate) fn new(label: &'static str, kernel: Kernel) -> Self {
        Self { label, kernel }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }
}

/// `matrix [rows, cols] · x [cols] -> [rows]`
pub fn mat_vec(matrix: &Tensor, x: &Tensor) -> CandleResult<Tensor> {
    let (rows, cols) = matrix.dims2()?;
    matrix.matmul(&x.reshape((cols, 1))?)?.reshape(rows)
}

fn split_pairs(state: &Tensor) -> CandleResult<(Tensor, Tensor)> {
    let re = state.narrow(1, 0, 1)?.squeeze(1)?;
    let im = state.narrow(1, 1, 1)?.squeeze(1)?;
    Ok((re, im))
}

fn join_pairs(re: &Tensor, im: &Tensor) -> CandleResult<Tensor> {
    Tensor::stack(&[re, im], 1)
}

/// Rotate each spinor by `r`, scale by `max(0, g) × gain`, inject `(v, v × imag_scale)`.
///
/// Returns the updated state and the read-out `re × mix + im × (1 − mix)` with `mix`
/// clamped to `[0, 1]`.
pub fn symplectic_flow(
    state: &Tensor,
    r: &Tensor,
    v: &Tensor,
    g: &Tensor,
    gain: f32,
    imag_scale: f32,
    read_mix: f32,
) -> CandleResult<(Tensor, Tensor)> {
    let (re, im) = split_pairs(state)?;
    let (cos, sin) = (r.cos()?, r.sin()?);
    let rot_re = ((&re * &cos)? - (&im * &sin)?)?;
    let rot_im = ((&re * &sin)? + (&im * &cos)?)?;

    let lambda = g.relu()?.affine(gain as f64, 0.0)?;
    let next_re = ((&rot_re * &lambda)? + v)?;
    let next_im = ((&rot_im * &lambda)? + v.affine(imag_scale as f64, 0.0)?)?;

    let mix = read_mix.clamp(0.0, 1.0) as f64;
    let out = (next_re.affine(mix, 0.0)? + next_im.affine(1.0 - mix, 0.0)?)?;
    Ok((join_pairs(&next_re, &next_im)?, out))
}

/// Decay the state and write `v` along angle `r`, then read it back along the same
/// angle, gated by `g`.
pub fn holographic_mix(
    state: &Tensor,
    r: &Tensor,
    v: &Tensor,
    g: &Tensor,
    decay: f32,
) -> CandleResult<(Tensor, Tensor)> {
    let (re, im) = split_pairs(state)?;
    let (cos, sin) = (r.cos()?, r.sin()?);
    let next_re = (re.affine(decay as f64, 0.0)? + (v * &cos)?)?;
    let next_im = (im.affine(decay as f64, 0.0)? + (v * &sin)?)?;
    let read = ((&next_re * &cos)? + (&next_im * &sin)?)?;
    let out = (read * g)?;
    Ok((join_pairs(&next_re, &next_im)?, out))
}

/// Local surprise correction: `re += lr × surprise × cos r`, `im += lr × surprise × sin r`.
///
/// Lanes whose surprise is exactly zero keep their bits.
pub fn active_inference(
    state: &Tensor,
    r: &Tensor,
    surprise: &Tensor,
    lr: f32,
) -> CandleResult<Tensor> {
    let (re, im) = split_pairs(state)?;
    let step = surprise.affine(lr as f64, 0.0)?;
    let next_re = (&re + (&step * r.cos()?)?)?;
    let next_im = (&im + (&step * r.sin()?)?)?;

    let settled = surprise.eq(&surprise.zeros_like()?)?;
    let next_re = settled.where_cond(&re, &next_re)?;
    let next_im = settled.where_cond(&im, &next_im)?;
    join_pairs(&next_re, &next_im)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, data.len(), &Device::Cpu).unwrap()
    }

    fn state(pairs: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = pairs.iter().flatten().copied().collect();
        Tensor::from_slice(&flat, (pairs.len(), 2), &Device::Cpu).unwrap()
    }

    fn pairs(state: &Tensor) -> Vec<Vec<f32>> {
        state.to_vec2::<f32>().unwrap()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_mat_vec() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m = Tensor::from_slice(&data, (2, 3), &Device::Cpu).unwrap();
        let out = mat_vec(&m, &t(&[1.0, 0.0, -1.0])).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![-2.0, -2.0]);
    }

    #[test]
    fn test_symplectic_quarter_turn() {
        // (1, 0) rotated by pi/2 is (0, 1); gate 1 and gain 1 keep it whole.
        let s = state(&[[1.0, 0.0]]);
        let r = t(&[std::f32::consts::FRAC_PI_2]);
        let (next, out) = symplectic_flow(&s, &r, &t(&[0.0]), &t(&[1.0]), 1.0, 0.25, 0.0).unwrap();

        let next = pairs(&next);
        assert!(close(next[0][0], 0.0));
        assert!(close(next[0][1], 1.0));
        // read_mix 0 reads the imaginary part
        assert!(close(out.to_vec1::<f32>().unwrap()[0], 1.0));
    }

    #[test]
    fn test_symplectic_gate_and_injection() {
        let s = state(&[[2.0, -1.0], [0.5, 0.5]]);
        let r = t(&[0.0, 0.0]);
        let v = t(&[1.0, -2.0]);
        let g = t(&[0.5, -3.0]);
        let (next, out) = symplectic_flow(&s, &r, &v, &g, 0.9, 0.25, 1.0).unwrap();

        let next = pairs(&next);
        // channel 0: (2, -1) * 0.45 + (1, 0.25)
        assert!(close(next[0][0], 1.9));
        assert!(close(next[0][1], -0.2));
        // channel 1: negative gate clamps to zero, only the stimulus survives
        assert!(close(next[1][0], -2.0));
        assert!(close(next[1][1], -0.5));

        let out = out.to_vec1::<f32>().unwrap();
        assert!(close(out[0], 1.9));
        assert!(close(out[1], -2.0));
    }

    #[test]
    fn test_symplectic_read_mix_is_clamped() {
        let s = state(&[[1.0, 3.0]]);
        let zero = t(&[0.0]);
        let (_, out) = symplectic_flow(&s, &zero, &zero, &t(&[1.0]), 1.0, 0.0, 4.0).unwrap();
        assert!(close(out.to_vec1::<f32>().unwrap()[0], 1.0));
    }

    #[test]
    fn test_holographic_mix() {
        let s = state(&[[1.0, 2.0]]);
        let r = t(&[0.0]);
        let (next, out) = holographic_mix(&s, &r, &t(&[3.0]), &t(&[0.5]), 0.5).unwrap();
        let next = pairs(&next);
        assert!(close(next[0][0], 3.5));
        assert!(close(next[0][1], 1.0));
        assert!(close(out.to_vec1::<f32>().unwrap()[0], 1.75));
    }

    #[test]
    fn test_active_inference_hand_vector() {
        let s = state(&[[1.0, 1.0], [0.0, 0.0]]);
        let r = t(&[0.0, std::f32::consts::FRAC_PI_2]);
        let surprise = t(&[2.0, -4.0]);
        let next = pairs(&active_inference(&s, &r, &surprise, 0.5).unwrap());

        assert!(close(next[0][0], 2.0));
        assert!(close(next[0][1], 1.0));
        assert!(close(next[1][0], 0.0));
        assert!(close(next[1][1], -2.0));
    }

    #[test]
    fn test_zero_surprise_keeps_state_bits() {
        let s = state(&[[-0.0, 1.25], [3.5, -0.0]]);
        let r = t(&[2.0, -1.0]);
        let surprise = t(&[0.0, 0.0]);
        let next = active_inference(&s, &r, &surprise, 0.7).unwrap();

        let bits = |t: &Tensor| -> Vec<u32> {
            let flat = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            flat.iter().map(|v| v.to_bits()).collect()
        };
        assert_eq!(bits(&s), bits(&next));
    }

    #[test]
    fn test_check_shapes() {
        assert!(Kernel::MatVec.check_shapes(&[&[3, 4], &[4], &[3]]).is_ok());
        assert!(Kernel::MatVec.check_shapes(&[&[3, 4], &[3], &[3]]).is_err());
        assert!(Kernel::Gather.check_shapes(&[&[10, 4], &[4]]).is_ok());
        assert!(Kernel::SymplecticFlow
            .check_shapes(&[&[4, 2], &[4], &[4], &[4], &[4]])
            .is_ok());
        assert!(Kernel::ActiveInference
            .check_shapes(&[&[4, 2], &[4], &[4], &[5]])
            .is_err());
        assert!(Kernel::Add.check_shapes(&[&[4], &[4]]).is_err());
    }

    #[test]
    fn test_execute_rejects_wrong_uniforms() {
        let ctx = crate::backend::ComputeContext::cpu();
        let emb = DeviceTensor::create(&ctx, "emb", &[2, 2]).unwrap();
        let out = DeviceTensor::create(&ctx, "out", &[2]).unwrap();
        assert!(Kernel::Gather.execute(&[&emb, &out], Uniforms::None).is_err());
        assert!(matches!(
            Kernel::Gather.execute(&[&emb, &out], Uniforms::Token(2)),
            Err(NovaError::TokenOutOfRange { token: 2, vocab: 2 })
        ));
    }
}
