//! The operation execution contract.

use crate::device::{Device, DeviceError, DeviceMemory, DevicePtr, LaunchDesc, StreamId};
use crate::index::IndexCollection;
use crate::workbuffer::{WorkbufferRequest, Workbuffers};
use crate::{Error, Result};

/// Execution context passed to `Operation::execute()`.
///
/// Carries the device, the stream the operation must enqueue on, and the
/// operation's position in the compiled graph (attached to every launch so
/// deferred faults can be traced back to it).
#[derive(Clone, Copy)]
pub struct ExecutionCtx<'a> {
    device: &'a dyn Device,
    stream: StreamId,
    op_index: usize,
}

impl<'a> ExecutionCtx<'a> {
    /// Create a new execution context.
    pub fn new(device: &'a dyn Device, stream: StreamId, op_index: usize) -> Self {
        Self {
            device,
            stream,
            op_index,
        }
    }

    /// The device.
    pub fn device(&self) -> &'a dyn Device {
        self.device
    }

    /// The stream to enqueue on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Index of the executing operation in the compiled graph.
    pub fn op_index(&self) -> usize {
        self.op_index
    }

    /// Enqueue `kernel` on the context stream, tagged with the op index.
    pub fn launch<F>(&self, name: &str, kernel: F) -> Result<()>
    where
        F: FnOnce(&mut dyn DeviceMemory) -> std::result::Result<(), DeviceError> + Send + 'static,
    {
        let desc = LaunchDesc {
            name: name.to_string(),
            tag: Some(self.op_index),
        };
        self.device
            .launch(self.stream, desc, Box::new(kernel))
            .map_err(|e| Error::ExecutionFailure(format!("{name}: launch rejected: {e}")))
    }
}

/// A device-resident executable operation.
///
/// Operations are built once per compiled graph from a creation context,
/// a node view, and two index collections, and are then executed any number
/// of times. They never own input/output memory; the execution driver
/// binds concrete device addresses per request.
pub trait Operation: Send + Sync {
    /// Operation name (for diagnostics and logging).
    fn name(&self) -> &str;

    /// Buffer-table indices of the inputs, in argument order.
    fn input_ids(&self) -> &IndexCollection;

    /// Buffer-table indices of the outputs, in argument order.
    fn output_ids(&self) -> &IndexCollection;

    /// Scratch memory this operation needs.
    ///
    /// Computed at construction; repeated calls return the same request.
    fn workbuffer_request(&self) -> WorkbufferRequest {
        WorkbufferRequest::none()
    }

    /// Populate immutable workbuffers.
    ///
    /// Called exactly once per compiled graph, after allocation and before
    /// the first `execute`. Fails with `Error::InitializationFailure`.
    fn initialize_workbuffers(&self, _device: &dyn Device, _immutable: &[DevicePtr]) -> Result<()> {
        Ok(())
    }

    /// Enqueue this operation's device work on `ctx.stream()`.
    ///
    /// Returns once the work is enqueued. Only synchronous pre-launch
    /// validation fails here (`Error::ExecutionFailure`); kernel faults are
    /// reported when the stream is synchronized.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Device, stream and op index for this launch.
    /// * `inputs` - Device addresses for `input_ids()`, same order.
    /// * `outputs` - Device addresses for `output_ids()`, same order.
    /// * `workbuffers` - Addresses of the workbuffers from `workbuffer_request()`.
    fn execute(
        &self,
        ctx: &ExecutionCtx<'_>,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
        workbuffers: &Workbuffers,
    ) -> Result<()>;
}

/// Pre-launch validation shared by every operation.
///
/// Checks that the bound pointer lists match the operation's index
/// collections and workbuffer request and that no pointer is null.
pub fn validate_binding(
    op: &dyn Operation,
    inputs: &[DevicePtr],
    outputs: &[DevicePtr],
    workbuffers: &Workbuffers,
) -> Result<()> {
    if inputs.len() != op.input_ids().len() || outputs.len() != op.output_ids().len() {
        return Err(Error::ExecutionFailure(format!(
            "{}: bound {} inputs / {} outputs, expected {} / {}",
            op.name(),
            inputs.len(),
            outputs.len(),
            op.input_ids().len(),
            op.output_ids().len()
        )));
    }
    if let Some(pos) = inputs.iter().chain(outputs).position(DevicePtr::is_null) {
        return Err(Error::ExecutionFailure(format!(
            "{}: null device pointer bound at argument {pos}",
            op.name()
        )));
    }
    if !workbuffers.matches(&op.workbuffer_request()) {
        return Err(Error::ExecutionFailure(format!(
            "{}: workbuffers not bound as requested",
            op.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_device::HostDevice;

    struct Fill {
        inputs: IndexCollection,
        outputs: IndexCollection,
    }

    impl Operation for Fill {
        fn name(&self) -> &str {
            "Fill"
        }

        fn input_ids(&self) -> &IndexCollection {
            &self.inputs
        }

        fn output_ids(&self) -> &IndexCollection {
            &self.outputs
        }

        fn execute(
            &self,
            ctx: &ExecutionCtx<'_>,
            inputs: &[DevicePtr],
            outputs: &[DevicePtr],
            workbuffers: &Workbuffers,
        ) -> Result<()> {
            validate_binding(self, inputs, outputs, workbuffers)?;
            let out = outputs[0];
            ctx.launch("fill", move |mem| mem.write(out, &[5.0f32; 2]))
        }
    }

    #[test]
    fn test_operation_trait_object() {
        let device = HostDevice::new();
        let op: Box<dyn Operation> = Box::new(Fill {
            inputs: IndexCollection::new(&[]),
            outputs: IndexCollection::new(&[0]),
        });
        assert_eq!(op.name(), "Fill");
        assert!(op.workbuffer_request().is_empty());

        let out = device.allocate(8).unwrap();
        let ctx = ExecutionCtx::new(&device, device.default_stream(), 0);
        op.execute(&ctx, &[], &[out], &Workbuffers::default())
            .unwrap();
        device.synchronize(device.default_stream()).unwrap();

        let mut bytes = [0u8; 8];
        device.copy_to_host(out, &mut bytes).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes), vec![5.0, 5.0]);
    }

    #[test]
    fn test_pre_launch_validation() {
        let device = HostDevice::new();
        let op = Fill {
            inputs: IndexCollection::new(&[]),
            outputs: IndexCollection::new(&[0]),
        };
        let ctx = ExecutionCtx::new(&device, device.default_stream(), 0);
        assert!(matches!(
            op.execute(&ctx, &[], &[], &Workbuffers::default()),
            Err(Error::ExecutionFailure(_))
        ));
        assert!(matches!(
            op.execute(&ctx, &[], &[DevicePtr::NULL], &Workbuffers::default()),
            Err(Error::ExecutionFailure(_))
        ));
    }
}
