use crate::error::{BitNetError, Result};

/// Model architecture configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub tie_word_embeddings: bool,
    pub activation: Activation,
}

/// Gate nonlinearity used by the FFN. Whether the FFN is gated at all is a
/// separate, per-weight decision (presence of `ffn_gate`) — this only picks
/// which nonlinearity is applied to the up/gate projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(0, x)^2`, used by the official 2B-4T configuration.
    Relu2,
    /// `x * sigmoid(x)`, used by community-converted models.
    Silu,
}

impl ModelConfig {
    /// Head dimension = hidden_size / num_attention_heads
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// GQA group size = num_attention_heads / num_key_value_heads
    pub fn gqa_group_size(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Validate the structural invariants the rest of the stack assumes:
    /// heads divide hidden size evenly, kv-heads divide heads evenly (GQA),
    /// and the head dimension is even (RoPE operates on adjacent pairs).
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(BitNetError::ConfigurationInvalid(
                "head counts must be non-zero".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(BitNetError::ConfigurationInvalid(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(BitNetError::ConfigurationInvalid(format!(
                "num_attention_heads {} is not divisible by num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(BitNetError::ConfigurationInvalid(format!(
                "head_dim {} must be even for RoPE pair structure",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

/// Default config for microsoft/bitnet-b1.58-2B-4T
pub fn bitnet_2b_4t_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 128256,
        hidden_size: 2560,
        intermediate_size: 6912,
        num_hidden_layers: 30,
        num_attention_heads: 20,
        num_key_value_heads: 5,
        max_position_embeddings: 4096,
        rms_norm_eps: 1e-5,
        rope_theta: 500000.0,
        tie_word_embeddings: true,
        activation: Activation::Relu2,
    }
}

/// Default config for 1bitLLM/bitnet_b1_58-large (0.7B)
pub fn bitnet_0_7b_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 32002,
        hidden_size: 1536,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        num_key_value_heads: 16,
        max_position_embeddings: 2048,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        tie_word_embeddings: false,
        activation: Activation::Silu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_dims_match_known_configs() {
        let cfg = bitnet_2b_4t_config();
        assert_eq!(cfg.head_dim(), 128);
        assert_eq!(cfg.gqa_group_size(), 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_indivisible_heads() {
        let mut cfg = bitnet_0_7b_config();
        cfg.num_attention_heads = 17;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_gqa_heads() {
        let mut cfg = bitnet_2b_4t_config();
        cfg.num_key_value_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_odd_head_dim() {
        let mut cfg = bitnet_2b_4t_config();
        cfg.hidden_size = 2550; // 2550 / 20 = 127.5, not integral either
        cfg.num_attention_heads = 20;
        cfg.hidden_size = 2540; // 2540 / 20 = 127, odd head_dim
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn well_known_configs_validate() {
        bitnet_2b_4t_config().validate().unwrap();
        bitnet_0_7b_config().validate().unwrap();
    }
}
