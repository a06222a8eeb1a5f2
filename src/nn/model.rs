use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{BitNetError, Result};
use crate::gpu::buffer_pool::{BufferPool, GpuBuf};
use crate::gpu::pipeline::PipelineManager;
use crate::model::config::ModelConfig;
use crate::model::weights::WeightStore;
use crate::nn::attention::{create_kv_cache, Attention, KvCache};
use crate::nn::bitlinear::{buf_entry, create_uniform_raw, create_uniform_u32_u32_f32, BitLinear};
use crate::nn::ffn::FFN;
use crate::nn::transformer::TransformerBlock;

const EMBEDDING_WGSL: &str = include_str!("../shaders/embedding.wgsl");
const RMSNORM_WGSL: &str = include_str!("../shaders/rmsnorm.wgsl");
const F32_MATMUL_WGSL: &str = include_str!("../shaders/f32_matmul.wgsl");

/// Full BitNet model: embedding → N × transformer → final RMSNorm → LM head
pub struct BitNetModel {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pub(crate) pipelines: PipelineManager,
    pub(crate) pool: BufferPool,
    pub config: ModelConfig,

    embed_tokens: GpuBuf,
    layers: Vec<TransformerBlock>,
    final_norm: GpuBuf,
    lm_head: LmHead,
    kv_caches: Vec<KvCache>,
}

enum LmHead {
    Tied,                    // Use embed_tokens
    Separate(BitLinear),
}

impl BitNetModel {
    /// Build a full model from loaded weights.
    pub fn build(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: ModelConfig,
        weights: &WeightStore,
        max_seq_len: usize,
    ) -> Result<Self> {
        let pipelines = PipelineManager::new(Arc::clone(&device));
        let pool = BufferPool::new(Arc::clone(&device));

        let require = |name: &str| -> Result<GpuBuf> {
            weights
                .get(name)
                .cloned()
                .ok_or_else(|| BitNetError::MissingWeight(name.to_string()))
        };

        let embed_tokens = require("model.embed_tokens.weight")?;
        let final_norm = require("model.norm.weight")?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        let mut kv_caches = Vec::with_capacity(config.num_hidden_layers);

        for i in 0..config.num_hidden_layers {
            let p = format!("model.layers.{i}");
            let head_dim = config.head_dim();

            let input_ln = require(&format!("{p}.input_layernorm.weight"))?;
            let post_attn_ln = require(&format!("{p}.post_attention_layernorm.weight"))?;

            let attn_sub_norm = weights.get(&format!("{p}.self_attn.sub_norm.weight")).cloned();
            let ffn_sub_norm = weights.get(&format!("{p}.mlp.sub_norm.weight")).cloned();

            let q_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.self_attn.q_proj.weight"))?,
                require(&format!("{p}.self_attn.q_proj.weight_scale"))?,
                None,
                config.rms_norm_eps,
                config.hidden_size,
                config.num_attention_heads * head_dim,
            );
            let k_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.self_attn.k_proj.weight"))?,
                require(&format!("{p}.self_attn.k_proj.weight_scale"))?,
                None,
                config.rms_norm_eps,
                config.hidden_size,
                config.num_key_value_heads * head_dim,
            );
            let v_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.self_attn.v_proj.weight"))?,
                require(&format!("{p}.self_attn.v_proj.weight_scale"))?,
                None,
                config.rms_norm_eps,
                config.hidden_size,
                config.num_key_value_heads * head_dim,
            );
            let o_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.self_attn.o_proj.weight"))?,
                require(&format!("{p}.self_attn.o_proj.weight_scale"))?,
                attn_sub_norm,
                config.rms_norm_eps,
                config.num_attention_heads * head_dim,
                config.hidden_size,
            );

            let attention = Attention::new(
                Arc::clone(&device),
                config.clone(),
                q_proj, k_proj, v_proj, o_proj,
            );

            let up_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.mlp.up_proj.weight"))?,
                require(&format!("{p}.mlp.up_proj.weight_scale"))?,
                None,
                config.rms_norm_eps,
                config.hidden_size,
                config.intermediate_size,
            );
            let down_proj = BitLinear::new(
                Arc::clone(&device),
                require(&format!("{p}.mlp.down_proj.weight"))?,
                require(&format!("{p}.mlp.down_proj.weight_scale"))?,
                ffn_sub_norm,
                config.rms_norm_eps,
                config.intermediate_size,
                config.hidden_size,
            );

            let gate_proj = if weights.has(&format!("{p}.mlp.gate_proj.weight")) {
                Some(BitLinear::new(
                    Arc::clone(&device),
                    require(&format!("{p}.mlp.gate_proj.weight"))?,
                    require(&format!("{p}.mlp.gate_proj.weight_scale"))?,
                    None,
                    config.rms_norm_eps,
                    config.hidden_size,
                    config.intermediate_size,
                ))
            } else {
                None
            };

            let ffn = FFN::new(
                Arc::clone(&device),
                config.clone(),
                up_proj, down_proj, gate_proj,
            );

            layers.push(TransformerBlock::new(
                Arc::clone(&device),
                config.clone(),
                input_ln,
                post_attn_ln,
                attention,
                ffn,
            ));

            kv_caches.push(create_kv_cache(&device, &config, max_seq_len));
        }

        let lm_head = if config.tie_word_embeddings || !weights.has("lm_head.weight") {
            LmHead::Tied
        } else {
            LmHead::Separate(BitLinear::new(
                Arc::clone(&device),
                require("lm_head.weight")?,
                require("lm_head.weight_scale")?,
                weights.get("lm_head.input_norm.weight").cloned().or_else(|| Some(final_norm.clone())),
                config.rms_norm_eps,
                config.hidden_size,
                config.vocab_size,
            ))
        };

        Ok(Self {
            device,
            queue,
            pipelines,
            pool,
            config,
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            kv_caches,
        })
    }

    /// Forward pass: token IDs → logits buffer [1, vocab_size] f32
    pub fn forward(&mut self, token_ids: &[u32]) -> GpuBuf {
        let n = token_ids.len();
        let mut encoder = self.device.create_command_encoder(&Default::default());

        // Upload token IDs
        let token_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("token_ids"),
            size: (token_ids.len() * 4) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });
        {
            let mut view = token_buffer.slice(..).get_mapped_range_mut();
            let bytes: &[u8] = bytemuck::cast_slice(token_ids);
            view[..bytes.len()].copy_from_slice(bytes);
        }
        token_buffer.unmap();
        let token_buffer = Arc::new(token_buffer);

        // Embedding lookup
        let mut hidden = self.dispatch_embedding(&mut encoder, &token_buffer, n);

        // Transformer layers
        for i in 0..self.layers.len() {
            let old_hidden = hidden;
            let new_hidden = {
                let kv = &mut self.kv_caches[i];
                self.layers[i].forward(&old_hidden, n, kv, &mut encoder, &mut self.pipelines, &mut self.pool)
            };
            self.pool.release(old_hidden);
            hidden = new_hidden;
            self.kv_caches[i].seq_len += n;
        }

        // Final RMSNorm
        let normed = self.dispatch_final_norm(&mut encoder, &hidden, n);
        self.pool.release(hidden);

        // Extract last token for LM head
        let lm_input = if n > 1 {
            let lm_buf = self.pool.acquire(
                (self.config.hidden_size * 4) as u64,
                BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            );
            encoder.copy_buffer_to_buffer(
                &normed,
                ((n - 1) * self.config.hidden_size * 4) as u64,
                &lm_buf,
                0,
                (self.config.hidden_size * 4) as u64,
            );
            self.pool.release(normed);
            lm_buf
        } else {
            normed
        };

        // LM head (always N=1)
        let logits = match &mut self.lm_head {
            LmHead::Separate(ref mut bl) => {
                bl.forward(&lm_input, 1, &mut encoder, &mut self.pipelines, &mut self.pool)
            }
            LmHead::Tied => {
                self.dispatch_lm_head(&mut encoder, &lm_input, 1)
            }
        };
        self.pool.release(lm_input);

        self.queue.submit(std::iter::once(encoder.finish()));
        logits
    }

    /// Read logits from GPU buffer to CPU.
    pub async fn read_logits(&self, logits: &GpuBuf) -> Result<Vec<f32>> {
        self.read_buffer(logits, self.config.vocab_size).await
    }

    /// Read an arbitrary-length f32 buffer back to host memory. Used by the
    /// sampler readback and by the diagnostic probe.
    pub async fn read_buffer(&self, buf: &GpuBuf, len: usize) -> Result<Vec<f32>> {
        let size = len * 4;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("probe_staging"),
            size: size as u64,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(buf, 0, &staging, 0, size as u64);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::Wait);
        rx.await
            .map_err(|_| BitNetError::BufferMap)?
            .map_err(|_| BitNetError::BufferMap)?;

        let data = staging.slice(..).get_mapped_range();
        let floats: &[f32] = bytemuck::cast_slice(&data);
        let result = floats.to_vec();
        drop(data);
        staging.unmap();

        Ok(result)
    }

    /// Forward pass with a submit/readback after each stage, for numerical
    /// triage. Much slower than `forward` (one GPU round-trip per stage
    /// instead of one for the whole pass) and not used outside test tooling.
    pub async fn forward_probed(&mut self, token_ids: &[u32]) -> Result<Vec<(&'static str, Vec<f32>)>> {
        let n = token_ids.len();
        let hidden_size = self.config.hidden_size;
        let mut stages = Vec::new();

        let token_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("token_ids"),
            size: (token_ids.len() * 4) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });
        {
            let mut view = token_buffer.slice(..).get_mapped_range_mut();
            let bytes: &[u8] = bytemuck::cast_slice(token_ids);
            view[..bytes.len()].copy_from_slice(bytes);
        }
        token_buffer.unmap();

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let mut hidden = self.dispatch_embedding(&mut encoder, &token_buffer, n);
        self.queue.submit(std::iter::once(encoder.finish()));
        stages.push(("embedding", self.read_buffer(&hidden, n * hidden_size).await?));

        let num_layers = self.layers.len();
        for i in 0..num_layers {
            let mut encoder = self.device.create_command_encoder(&Default::default());
            let old_hidden = hidden;
            let new_hidden = {
                let kv = &mut self.kv_caches[i];
                self.layers[i].forward(&old_hidden, n, kv, &mut encoder, &mut self.pipelines, &mut self.pool)
            };
            self.queue.submit(std::iter::once(encoder.finish()));
            self.kv_caches[i].seq_len += n;
            hidden = new_hidden;

            if i == 0 {
                stages.push(("layer_0", self.read_buffer(&hidden, n * hidden_size).await?));
            } else if i == 1 {
                stages.push(("layer_1", self.read_buffer(&hidden, n * hidden_size).await?));
            } else if i == num_layers - 1 && i > 1 {
                stages.push(("layer_last", self.read_buffer(&hidden, n * hidden_size).await?));
            }
            self.pool.release(old_hidden);
        }

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let normed = self.dispatch_final_norm(&mut encoder, &hidden, n);
        self.queue.submit(std::iter::once(encoder.finish()));
        stages.push(("final_norm", self.read_buffer(&normed, n * hidden_size).await?));
        self.pool.release(hidden);

        let lm_input = if n > 1 {
            let mut encoder = self.device.create_command_encoder(&Default::default());
            let lm_buf = self.pool.acquire(
                (hidden_size * 4) as u64,
                BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            );
            encoder.copy_buffer_to_buffer(
                &normed,
                ((n - 1) * hidden_size * 4) as u64,
                &lm_buf,
                0,
                (hidden_size * 4) as u64,
            );
            self.queue.submit(std::iter::once(encoder.finish()));
            self.pool.release(normed);
            lm_buf
        } else {
            normed
        };
        stages.push(("pre_head", self.read_buffer(&lm_input, hidden_size).await?));

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let logits = match &mut self.lm_head {
            LmHead::Separate(ref mut bl) => {
                bl.forward(&lm_input, 1, &mut encoder, &mut self.pipelines, &mut self.pool)
            }
            LmHead::Tied => self.dispatch_lm_head(&mut encoder, &lm_input, 1),
        };
        self.queue.submit(std::iter::once(encoder.finish()));
        let logits_full = self.read_buffer(&logits, self.config.vocab_size).await?;
        stages.push(("logits_first_100", logits_full.into_iter().take(100).collect()));
        self.pool.release(lm_input);
        self.pool.release(logits);

        Ok(stages)
    }

    pub fn reset_kv_cache(&mut self) {
        for cache in &mut self.kv_caches {
            cache.seq_len = 0;
        }
    }

    /// Tear down pooled buffers and compiled pipelines. The model is left in
    /// a valid but unusable state; only `dispose` may be called again.
    pub fn dispose(&mut self) {
        self.pool.destroy();
        self.pipelines.clear();
    }

    fn dispatch_embedding(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        token_buffer: &wgpu::Buffer,
        n: usize,
    ) -> GpuBuf {
        let entry = self.pipelines.get_or_create_default("embedding", EMBEDDING_WGSL);

        let output_size = (n * self.config.hidden_size * 4) as u64;
        let output = self.pool.acquire(
            output_size,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );

        let params_data = [
            (n as u32).to_le_bytes(),
            (self.config.hidden_size as u32).to_le_bytes(),
            (self.config.vocab_size as u32).to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("embedding"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, token_buffer),
                buf_entry(1, &self.embed_tokens),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let total = (n * self.config.hidden_size) as u32;
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);

        output
    }

    fn dispatch_final_norm(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        n: usize,
    ) -> GpuBuf {
        let entry = self.pipelines.get_or_create_default("rmsnorm", RMSNORM_WGSL);

        let output = self.pool.acquire(
            (n * self.config.hidden_size * 4) as u64,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );

        let params = create_uniform_u32_u32_f32(
            &self.device,
            n as u32,
            self.config.hidden_size as u32,
            self.config.rms_norm_eps,
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("final_norm"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, &self.final_norm),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(n as u32, 1, 1);

        output
    }

    fn dispatch_lm_head(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::Buffer,
        n: usize,
    ) -> GpuBuf {
        let v = self.config.vocab_size;
        let d = self.config.hidden_size;
        let entry = self.pipelines.get_or_create_default("f32_matmul", F32_MATMUL_WGSL);

        let output = self.pool.acquire(
            (n * v * 4) as u64,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );

        let params_data = [
            (n as u32).to_le_bytes(),
            (v as u32).to_le_bytes(),
            (d as u32).to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lm_head"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, &self.embed_tokens),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let total = (n * v) as u32;
        let wg_x = total.min(65535);
        let wg_y = total.div_ceil(65535);

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(wg_x, wg_y, 1);

        output
    }
}
