//! Bind groups and command batches.
//!
//! A [`BindGroup`] fixes which buffers a pipeline reads and writes. Bind groups are
//! validated once when built and then reused for every call; a [`CommandBatch`] only
//! pairs them with the per-call [`Uniforms`].

use std::fmt::Debug;

use crate::backend::kernels::{Pipeline, Uniforms};
use crate::backend::tensor::DeviceTensor;
use crate::error::NovaError;
use crate::NovaResult;

/// Resolves buffer slots to the tensors that back them
pub trait BufferTable {
    type Slot: Copy + Eq + Debug;

    fn buffer(&self, slot: Self::Slot) -> &DeviceTensor;
}

#[derive(Debug, Clone)]
pub struct BindGroup<S> {
    pipeline: Pipeline,
    slots: Vec<S>,
}

impl<S: Copy + Eq + Debug> BindGroup<S> {
    /// Bind `slots` to `pipeline`, checking arity and shapes against `table`
    pub fn new<T>(pipeline: Pipeline, slots: &[S], table: &T) -> NovaResult<Self>
    where
        T: BufferTable<Slot = S>,
    {
        let binding_error = |reason: String| NovaError::Binding {
            pipeline: pipeline.label(),
            reason,
        };
        let kernel = pipeline.kernel();

        let shapes: Vec<&[usize]> = slots.iter().map(|&s| table.buffer(s).shape()).collect();
        kernel.check_shapes(&shapes).map_err(binding_error)?;

        if kernel.forbids_aliasing() && slots[0] == slots[1] {
            return Err(binding_error(format!(
                "{:?} is bound as both source and destination",
                slots[0]
            )));
        }
        if let Some(disposed) = slots.iter().find(|&&s| table.buffer(s).is_disposed()) {
            return Err(binding_error(format!("{:?} is disposed", disposed)));
        }

        Ok(Self {
            pipeline,
            slots: slots.to_vec(),
        })
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn slots(&self) -> &[S] {
        &self.slots
    }
}

/// One recorded kernel launch
#[derive(Debug, Clone, Copy)]
pub struct Dispatch<'a, S> {
    pub group: &'a BindGroup<S>,
    pub uniforms: Uniforms,
}

/// Dispatches recorded for a single submission
#[derive(Debug)]
pub struct CommandBatch<'a, S> {
    label: &'static str,
    dispatches: Vec<Dispatch<'a, S>>,
}

impl<'a, S> CommandBatch<'a, S> {
    pub fn new(label: &'static str) -> Self {
        Self::with_capacity(label, 0)
    }

    pub fn with_capacity(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            dispatches: Vec::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, group: &'a BindGroup<S>, uniforms: Uniforms) {
        self.dispatches.push(Dispatch { group, uniforms });
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dispatch<'a, S>> {
        self.dispatches.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ComputeContext, Kernel};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Slot {
        A,
        B,
        Out,
    }

    struct Table {
        a: DeviceTensor,
        b: DeviceTensor,
        out: DeviceTensor,
    }

    impl BufferTable for Table {
        type Slot = Slot;

        fn buffer(&self, slot: Slot) -> &DeviceTensor {
            match slot {
                Slot::A => &self.a,
                Slot::B => &self.b,
                Slot::Out => &self.out,
            }
        }
    }

    fn table(ctx: &Arc<ComputeContext>) -> Table {
        Table {
            a: DeviceTensor::from_slice(ctx, "a", &[3], &[1.0, 2.0, 3.0]).unwrap(),
            b: DeviceTensor::from_slice(ctx, "b", &[3], &[10.0, 20.0, 30.0]).unwrap(),
            out: DeviceTensor::create(ctx, "out", &[3]).unwrap(),
        }
    }

    #[test]
    fn test_batch_runs_in_submission_order() {
        let ctx = ComputeContext::cpu();
        let table = table(&ctx);
        let add = ctx.create_pipeline("add", Kernel::Add);
        let mul = ctx.create_pipeline("mul", Kernel::Mul);

        let sum = BindGroup::new(add, &[Slot::A, Slot::B, Slot::Out], &table).unwrap();
        // reads the output of the previous dispatch
        let square = BindGroup::new(mul, &[Slot::Out, Slot::Out, Slot::Out], &table).unwrap();

        let mut batch = CommandBatch::new("test");
        assert!(batch.is_empty());
        batch.record(&sum, Uniforms::None);
        batch.record(&square, Uniforms::None);
        assert_eq!(batch.len(), 2);
        ctx.submit(&batch, &table).unwrap();

        assert_eq!(table.out.read().unwrap(), vec![121.0, 484.0, 1089.0]);
    }

    #[test]
    fn test_bind_group_rejects_bad_wiring() {
        let ctx = ComputeContext::cpu();
        let table = table(&ctx);
        let add = ctx.create_pipeline("add", Kernel::Add);
        let copy = ctx.create_pipeline("copy", Kernel::Copy);

        assert!(matches!(
            BindGroup::new(add, &[Slot::A, Slot::B], &table),
            Err(NovaError::Binding { pipeline: "add", .. })
        ));
        assert!(BindGroup::new(copy, &[Slot::A, Slot::A], &table).is_err());
    }

    #[test]
    fn test_failed_dispatch_stops_batch() {
        let ctx = ComputeContext::cpu();
        let table = table(&ctx);
        let copy = ctx.create_pipeline("copy", Kernel::Copy);
        let add = ctx.create_pipeline("add", Kernel::Add);
        let first = BindGroup::new(copy, &[Slot::A, Slot::Out], &table).unwrap();
        let second = BindGroup::new(add, &[Slot::A, Slot::B, Slot::Out], &table).unwrap();

        let mut batch = CommandBatch::new("test");
        batch.record(&first, Uniforms::None);
        batch.record(&second, Uniforms::None);

        ctx.faults.fail_dispatch(1);
        let err = ctx.submit(&batch, &table).unwrap_err();
        assert!(matches!(err, NovaError::Dispatch { index: 1, pipeline: "add", .. }));
        assert_eq!(table.out.read().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
