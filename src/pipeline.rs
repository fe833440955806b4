//! Metal compute pipelines and the command queue shared by kernels and timers.
//!
//! Every GEMM issued for a model placed on [`Device::Metal`](crate::device::Device)
//! and every timing fence goes through the one queue held here, so a fence
//! completes only after all kernels committed before it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::slice;
use std::sync::Mutex;

use metal::{
    Buffer, CommandQueue, CompileOptions, ComputePipelineState, Device, FunctionConstantValues,
    Library, MTLDataType, MTLResourceOptions, MTLSize, NSUInteger,
};

use crate::gemm::{Activation, GemmParameters};
use crate::tensor::Tensor;
use crate::{Error, Result};

const GEMM_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

constant uint M [[function_constant(0)]];
constant uint N [[function_constant(1)]];
constant uint K [[function_constant(2)]];
constant bool B_TRANS [[function_constant(11)]];
constant ushort ACTIVATION [[function_constant(101)]];
constant bool FUSED_BIAS [[function_constant(50001)]];

kernel void sgemm(device const float *A [[buffer(0)]],
                  device const float *B [[buffer(1)]],
                  device float *C [[buffer(2)]],
                  device const float *D [[buffer(3), function_constant(FUSED_BIAS)]],
                  uint2 gid [[thread_position_in_grid]])
{
    if (gid.x >= N || gid.y >= M) {
        return;
    }
    float sum = 0.0f;
    for (uint p = 0; p < K; ++p) {
        float w = B_TRANS ? B[gid.x * K + p] : B[p * N + gid.x];
        sum += A[gid.y * K + p] * w;
    }
    if (FUSED_BIAS) {
        sum += D[gid.x];
    }
    if (ACTIVATION == 1) {
        float inner = 0.7978846f * (sum + 0.044715f * sum * sum * sum);
        sum = 0.5f * sum * (1.0f + precise::tanh(inner));
    } else if (ACTIVATION == 2) {
        sum = precise::tanh(sum);
    }
    C[gid.y * N + gid.x] = sum;
}
"#;

const GROUP_WIDTH: NSUInteger = 16;
const GROUP_HEIGHT: NSUInteger = 16;

static METAL_CONTEXT: Mutex<Option<MetalContext>> = Mutex::new(None);

pub struct MetalContext {
    device: Device,
    queue: CommandQueue,
    library: Library,
    pipelines: HashMap<GemmParameters, ComputePipelineState>,
}

/// Runs `f` with the process-wide Metal context, creating it on first use.
pub fn with_context<T>(f: impl FnOnce(&mut MetalContext) -> Result<T>) -> Result<T> {
    let mut guard = METAL_CONTEXT
        .lock()
        .map_err(|_| Error::Metal("metal context lock poisoned".to_string()))?;
    if guard.is_none() {
        *guard = Some(MetalContext::new()?);
    }
    match guard.as_mut() {
        Some(context) => f(context),
        None => Err(Error::Metal("metal context missing after init".to_string())),
    }
}

fn void_ptr<T>(v: &T) -> *const c_void {
    (v as *const T).cast()
}

fn activation_code(act: Option<Activation>) -> u16 {
    match act {
        None => 0,
        Some(Activation::Gelu) => 1,
        Some(Activation::Tanh) => 2,
    }
}

fn function_constant_values(p: &GemmParameters) -> Result<FunctionConstantValues> {
    let dim = |v: usize| {
        u32::try_from(v).map_err(|_| Error::Metal(format!("dimension {v} exceeds u32")))
    };
    let (m, n, k) = (dim(p.m)?, dim(p.n)?, dim(p.k)?);
    let activation = activation_code(p.fused_activation);

    let constants = FunctionConstantValues::new();
    constants.set_constant_value_at_index(void_ptr(&m), MTLDataType::UInt, 0);
    constants.set_constant_value_at_index(void_ptr(&n), MTLDataType::UInt, 1);
    constants.set_constant_value_at_index(void_ptr(&k), MTLDataType::UInt, 2);
    constants.set_constant_value_at_index(void_ptr(&p.transpose_b), MTLDataType::Bool, 11);
    constants.set_constant_value_at_index(void_ptr(&activation), MTLDataType::UShort, 101);
    constants.set_constant_value_at_index(void_ptr(&p.fused_bias), MTLDataType::Bool, 50001);
    Ok(constants)
}

impl MetalContext {
    fn new() -> Result<Self> {
        let device = Device::system_default().ok_or_else(|| Error::DeviceUnavailable {
            device: crate::device::Device::Metal,
            reason: "no system default Metal device".to_string(),
        })?;
        let library = device
            .new_library_with_source(GEMM_SOURCE, &CompileOptions::new())
            .map_err(Error::Metal)?;
        let queue = device.new_command_queue();
        tracing::debug!(device = device.name(), "created Metal context");
        Ok(MetalContext {
            device,
            queue,
            library,
            pipelines: HashMap::new(),
        })
    }

    fn pipeline(&mut self, p: GemmParameters) -> Result<ComputePipelineState> {
        if let Some(pipeline) = self.pipelines.get(&p) {
            return Ok(pipeline.clone());
        }
        let constants = function_constant_values(&p)?;
        let function = self
            .library
            .get_function("sgemm", Some(constants))
            .map_err(Error::Metal)?;
        let pipeline = self
            .device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(Error::Metal)?;
        tracing::debug!(?p, "compiled gemm pipeline");
        self.pipelines.insert(p, pipeline.clone());
        Ok(pipeline)
    }

    fn buffer(&self, data: &[f32]) -> Buffer {
        self.device.new_buffer_with_data(
            data.as_ptr().cast(),
            mem::size_of_val(data) as NSUInteger,
            MTLResourceOptions::StorageModeShared,
        )
    }

    /// Encodes one GEMM on the shared queue and waits for its result.
    pub fn gemm(
        &mut self,
        a: &[f32],
        b: &[f32],
        bias: Option<&[f32]>,
        p: GemmParameters,
    ) -> Result<Tensor<f32>> {
        let pipeline = self.pipeline(p)?;
        let a_buffer = self.buffer(a);
        let b_buffer = self.buffer(b);
        let d_buffer = bias.map(|d| self.buffer(d));
        let c_count = p.m * p.n;
        let c_buffer = self.device.new_buffer(
            (c_count * mem::size_of::<f32>()) as NSUInteger,
            MTLResourceOptions::StorageModeShared,
        );

        let command_buffer = self.queue.new_command_buffer();
        let encoder = command_buffer.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(0, Some(&*a_buffer), 0);
        encoder.set_buffer(1, Some(&*b_buffer), 0);
        encoder.set_buffer(2, Some(&*c_buffer), 0);
        if let Some(d) = &d_buffer {
            encoder.set_buffer(3, Some(&**d), 0);
        }
        let grid_size = MTLSize::new(p.n as NSUInteger, p.m as NSUInteger, 1);
        let group_size = MTLSize::new(GROUP_WIDTH, GROUP_HEIGHT, 1);
        encoder.dispatch_threads(grid_size, group_size);
        encoder.end_encoding();
        command_buffer.commit();
        command_buffer.wait_until_completed();

        // The buffer is shared storage and the command buffer has completed.
        let contents =
            unsafe { slice::from_raw_parts(c_buffer.contents() as *const f32, c_count) };
        Tensor::from_vec(contents.to_vec(), [p.m, p.n])
    }

    /// Commits an empty command buffer and waits for it, which on a serial
    /// queue means every buffer committed earlier has completed.
    pub fn fence(&self) {
        let command_buffer = self.queue.new_command_buffer();
        command_buffer.commit();
        command_buffer.wait_until_completed();
    }
}
