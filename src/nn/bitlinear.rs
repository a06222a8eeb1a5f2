use std::sync::Arc;

use wgpu::BufferUsages;

use crate::gpu::buffer_pool::{BufferPool, GpuBuf};
use crate::gpu::pipeline::PipelineManager;

const RMSNORM_WGSL: &str = include_str!("../shaders/rmsnorm.wgsl");
const QUANTIZE_WGSL: &str = include_str!("../shaders/quantize.wgsl");
const TERNARY_GEMV_WGSL: &str = include_str!("../shaders/ternary_gemv.wgsl");
const TERNARY_GEMM_WGSL: &str = include_str!("../shaders/ternary_gemm.wgsl");

/// BitLinear layer: RMSNorm → Quantize → Ternary MatMul → Dequantize
///
/// Core building block of BitNet. Weights are ternary {-1,0,+1} packed as
/// 2-bit values (16 per u32). Input activations are quantized to int8
/// with per-token absmax before the matmul.
pub struct BitLinear {
    device: Arc<wgpu::Device>,
    packed_weights: GpuBuf,
    weight_scales: GpuBuf,
    norm_weight: Option<GpuBuf>,
    norm_eps: f32,
    pub(crate) in_dim: usize,
    pub(crate) out_dim: usize,
    k_packed: usize,
}

impl BitLinear {
    pub fn new(
        device: Arc<wgpu::Device>,
        packed_weights: GpuBuf,
        weight_scales: GpuBuf,
        norm_weight: Option<GpuBuf>,
        norm_eps: f32,
        in_dim: usize,
        out_dim: usize,
    ) -> Self {
        Self {
            device,
            packed_weights,
            weight_scales,
            norm_weight,
            norm_eps,
            in_dim,
            out_dim,
            k_packed: (in_dim + 15) / 16,
        }
    }

    /// Forward pass: input [N, in_dim] f32 → output [N, out_dim] f32
    pub fn forward(
        &mut self,
        input: &GpuBuf,
        n: usize,
        encoder: &mut wgpu::CommandEncoder,
        pipelines: &mut PipelineManager,
        pool: &mut BufferPool,
    ) -> GpuBuf {
        // Step 1: RMSNorm (optional)
        let normed = if let Some(ref _norm_w) = self.norm_weight {
            let out = pool.acquire(
                (n * self.in_dim * 4) as u64,
                BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            );
            self.dispatch_rmsnorm(encoder, input, &out, n, pipelines);
            Some(out)
        } else {
            None
        };
        let normed_ref = normed.as_ref().unwrap_or(input);

        // Step 2: Quantize (absmax int8)
        let quantized = pool.acquire(
            (n * self.in_dim * 4) as u64,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        let input_scales = pool.acquire(
            (n * 4) as u64,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::UNIFORM,
        );
        self.dispatch_quantize(encoder, normed_ref, &quantized, &input_scales, n, pipelines);
        if let Some(normed) = normed {
            pool.release(normed);
        }

        // Step 3: Ternary MatMul
        let output = pool.acquire(
            (n * self.out_dim * 4) as u64,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );

        if n == 1 {
            self.dispatch_gemv(encoder, &quantized, &input_scales, &output, pipelines);
        } else {
            self.dispatch_gemm(encoder, &quantized, &input_scales, &output, n, pipelines);
        }
        pool.release(quantized);
        pool.release(input_scales);

        output
    }

    fn dispatch_rmsnorm(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        output: &wgpu::Buffer,
        n: usize,
        pipelines: &mut PipelineManager,
    ) {
        let entry = pipelines.get_or_create_default("rmsnorm", RMSNORM_WGSL);
        let params = create_uniform_u32_u32_f32(
            &self.device,
            n as u32,
            self.in_dim as u32,
            self.norm_eps,
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bitlinear_rmsnorm"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, self.norm_weight.as_ref().unwrap()),
                buf_entry(2, output),
                buf_entry(3, &params),
            ],
        });

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(n as u32, 1, 1);
    }

    fn dispatch_quantize(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        output: &wgpu::Buffer,
        scales: &wgpu::Buffer,
        n: usize,
        pipelines: &mut PipelineManager,
    ) {
        let entry = pipelines.get_or_create_default("quantize", QUANTIZE_WGSL);
        let params = create_uniform_u32_u32(&self.device, n as u32, self.in_dim as u32);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bitlinear_quantize"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, output),
                buf_entry(2, scales),
                buf_entry(3, &params),
            ],
        });

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(n as u32, 1, 1);
    }

    fn dispatch_gemv(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        input_scales: &wgpu::Buffer,
        output: &wgpu::Buffer,
        pipelines: &mut PipelineManager,
    ) {
        let entry = pipelines.get_or_create_default("ternary_gemv", TERNARY_GEMV_WGSL);

        let params_data = [
            (self.out_dim as u32).to_le_bytes(),
            (self.in_dim as u32).to_le_bytes(),
            (self.k_packed as u32).to_le_bytes(),
        ]
        .concat();
        let params_buf = create_uniform_raw(&self.device, &params_data);

        // Copy input_scales[0] to a uniform buffer
        let scale_uniform = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gemv_scale"),
            size: 4,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(input_scales, 0, &scale_uniform, 0, 4);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bitlinear_gemv"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &self.packed_weights),
                buf_entry(1, input),
                buf_entry(2, &self.weight_scales),
                buf_entry(3, &params_buf),
                buf_entry(4, &scale_uniform),
                buf_entry(5, output),
            ],
        });

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(self.out_dim as u32, 1, 1);
    }

    fn dispatch_gemm(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        input_scales: &wgpu::Buffer,
        output: &wgpu::Buffer,
        n: usize,
        pipelines: &mut PipelineManager,
    ) {
        let entry = pipelines.get_or_create_default("ternary_gemm", TERNARY_GEMM_WGSL);

        let params_data = [
            (self.out_dim as u32).to_le_bytes(),
            (n as u32).to_le_bytes(),
            (self.in_dim as u32).to_le_bytes(),
            (self.k_packed as u32).to_le_bytes(),
        ]
        .concat();
        let params_buf = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bitlinear_gemm"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &self.packed_weights),
                buf_entry(1, input),
                buf_entry(2, &self.weight_scales),
                buf_entry(3, &params_buf),
                buf_entry(4, input_scales),
                buf_entry(5, output),
            ],
        });

        let wg_m = ((self.out_dim + 63) / 64) as u32;
        let wg_n = ((n + 63) / 64) as u32;

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(wg_m, wg_n, 1);
    }

}

// --- Uniform buffer helpers ---

pub(crate) fn buf_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

pub(crate) fn create_uniform_raw(device: &wgpu::Device, data: &[u8]) -> wgpu::Buffer {
    let size = ((data.len().max(4) + 3) / 4 * 4) as u64;
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: None,
        size,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..data.len()].copy_from_slice(data);
    }
    buffer.unmap();
    buffer
}

pub(crate) fn create_uniform_u32_u32(device: &wgpu::Device, a: u32, b: u32) -> wgpu::Buffer {
    let data = [a.to_le_bytes(), b.to_le_bytes()].concat();
    create_uniform_raw(device, &data)
}

pub(crate) fn create_uniform_u32_u32_f32(
    device: &wgpu::Device,
    a: u32,
    b: u32,
    c: f32,
) -> wgpu::Buffer {
    let data = [a.to_le_bytes(), b.to_le_bytes(), c.to_le_bytes()].concat();
    create_uniform_raw(device, &data)
}

#[cfg(test)]
mod tests {
    use crate::model::gguf::i2s;

    // CPU mirror of rmsnorm.wgsl.
    fn rmsnorm(row: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
        let inv_rms = 1.0 / (mean_sq + eps).sqrt();
        row.iter().zip(weight).map(|(v, w)| v * inv_rms * w).collect()
    }

    #[test]
    fn rmsnorm_unit_weight_unit_variance_has_unit_rms() {
        // A row whose mean square is exactly 1.
        let row = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let weight = vec![1.0; row.len()];
        let out = rmsnorm(&row, &weight, 1e-5);
        let rms = (out.iter().map(|v| v * v).sum::<f32>() / out.len() as f32).sqrt();
        assert!((rms - 1.0).abs() < 1e-3);
    }

    #[test]
    fn rmsnorm_scales_by_weight() {
        let row = vec![2.0, 2.0, 2.0, 2.0];
        let weight = vec![1.0, 2.0, 3.0, 4.0];
        let out = rmsnorm(&row, &weight, 1e-5);
        // mean_sq = 4, inv_rms = 0.5, so out = row * 0.5 * weight = weight.
        for (got, w) in out.iter().zip(&weight) {
            assert!((got - w).abs() < 1e-4);
        }
    }

    // CPU mirrors of ternary_gemv.wgsl and ternary_gemm.wgsl's dot-product
    // math, using two different traversal orders over the same packed row,
    // to confirm GEMV (N=1) and GEMM agree bitwise on integer accumulation.

    fn gemv_style_dot(packed_row: &[u8], xq: &[i32], in_dim: usize) -> i32 {
        let mut acc = 0i32;
        for k in 0..in_dim {
            let w = i2s::decode_one(packed_row, k) as i32;
            acc += w * xq[k];
        }
        acc
    }

    fn gemm_style_dot(packed_row: &[u8], xq: &[i32], in_dim: usize) -> i32 {
        // Walk k-tiles of 32 (one (block, group) pair at a time), mirroring
        // the GEMM kernel's k-tile loop order instead of GEMV's linear scan.
        let mut acc = 0i32;
        let num_tiles = in_dim.div_ceil(32);
        for kt in 0..num_tiles {
            for gp in 0..32 {
                let k = kt * 32 + gp;
                if k >= in_dim {
                    continue;
                }
                let w = i2s::decode_one(packed_row, k) as i32;
                acc += w * xq[k];
            }
        }
        acc
    }

    #[test]
    fn gemv_and_gemm_traversal_agree_for_n_equals_1() {
        let in_dim = 256usize;
        let weights: Vec<i8> = (0..in_dim)
            .map(|i| match i % 3 {
                0 => -1,
                1 => 0,
                _ => 1,
            })
            .collect();
        let packed = i2s::pack_row(&weights);
        let xq: Vec<i32> = (0..in_dim).map(|i| (i as i32 % 13) - 6).collect();

        let gemv_result = gemv_style_dot(&packed, &xq, in_dim);
        let gemm_result = gemm_style_dot(&packed, &xq, in_dim);
        assert_eq!(gemv_result, gemm_result);
    }
}
