//! Grouped-query self-attention with rotary position embeddings and a KV cache.

use super::layers::QMatMul;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Module, Result, Tensor};
use std::io::{Read, Seek};
use std::sync::Arc;

/// Per-layer key/value cache, concatenated along the sequence dimension.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    kv: Option<(Tensor, Tensor)>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `k`/`v` of shape `(batch, kv_heads, seq, head_dim)` and return
    /// the full cached keys and values.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match &self.kv {
            None => (k.clone(), v.clone()),
            Some((k_cache, v_cache)) => (
                Tensor::cat(&[k_cache, k], 2)?,
                Tensor::cat(&[v_cache, v], 2)?,
            ),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn current_seq_len(&self) -> usize {
        self.kv
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.kv = None;
    }
}

/// Interleaved rotary embedding tables, as laid out by llama.cpp GGUF exports.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// `scaling_factor` > 1 applies linear position interpolation.
    pub fn new(
        head_dim: usize,
        freq_base: f32,
        scaling_factor: f32,
        max_seq_len: usize,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / freq_base.powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions = (Tensor::arange(0, max_seq_len as u32, device)?.to_dtype(DType::F32)?
            / scaling_factor.max(1.0) as f64)?;
        let freqs = positions
            .reshape((max_seq_len, 1))?
            .matmul(&inv_freq.reshape((1, inv_freq.elem_count()))?)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `x` of shape `(batch, heads, seq, head_dim)` starting at `offset`.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        candle_nn::rotary_emb::rope_i(&x.contiguous()?, &cos, &sin)
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.dims()[0]
    }
}

/// Causal mask of shape `(seq_len, seq_len + offset)`; 1 marks a future position.
pub fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total_len = seq_len + offset;
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..total_len).map(move |j| u8::from(j > i + offset)))
        .collect();
    Tensor::from_slice(&mask, (seq_len, total_len), device)
}

/// Shape parameters of one attention block.
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: QMatMul,
    k_proj: QMatMul,
    v_proj: QMatMul,
    o_proj: QMatMul,
    config: AttentionConfig,
    rotary: Arc<RotaryEmbedding>,
    neg_inf: Tensor,
    span: tracing::Span,
}

impl Attention {
    pub fn load<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        layer_prefix: &str,
        config: AttentionConfig,
        rotary: Arc<RotaryEmbedding>,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            q_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.attn_q.weight"), device)?,
            k_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.attn_k.weight"), device)?,
            v_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.attn_v.weight"), device)?,
            o_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.attn_output.weight"), device)?,
            config,
            rotary,
            neg_inf: Tensor::new(f32::NEG_INFINITY, device)?,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        kv_cache: &mut KvCache,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let AttentionConfig {
            num_heads,
            num_kv_heads,
            head_dim,
        } = self.config;
        let (b_sz, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, num_heads, head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, num_kv_heads, head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, num_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rotary.apply(&q, offset)?;
        let k = self.rotary.apply(&k, offset)?;

        let (k, v) = kv_cache.append(&k, &v)?;

        let n_rep = num_heads / num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?;

        let att = (q.matmul(&k.t()?)? / (head_dim as f64).sqrt())?;
        let att = match mask {
            None => att,
            Some(mask) => {
                let mask = mask.broadcast_as(att.shape())?;
                mask.where_cond(&self.neg_inf.broadcast_as(att.shape().dims())?, &att)?
            }
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v.contiguous()?)?;

        let y = y
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, num_heads * head_dim))?;
        self.o_proj.forward(&y)
    }
}
