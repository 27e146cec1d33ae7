//! Quantized network layers shared by the model implementations.

use candle_core::quantized::{gguf_file, QTensor};
use candle_core::{Device, Module, Result, Tensor};
use std::io::{Read, Seek};

/// Matrix multiplication against quantized weights.
#[derive(Clone)]
pub struct QMatMul {
    inner: candle_core::quantized::QMatMul,
    span: tracing::Span,
}

impl QMatMul {
    pub fn from_qtensor(ws: QTensor) -> Result<Self> {
        let inner = candle_core::quantized::QMatMul::from_qtensor(ws)?;
        let span = tracing::span!(tracing::Level::TRACE, "qmatmul");
        Ok(Self { inner, span })
    }

    /// Read the tensor `name` from a GGUF file.
    pub fn load<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        name: &str,
        device: &Device,
    ) -> Result<Self> {
        Self::from_qtensor(content.tensor(reader, name, device)?)
    }
}

impl Module for QMatMul {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

impl std::fmt::Debug for QMatMul {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QMatMul")
    }
}

#[derive(Debug, Clone)]
pub struct Embedding {
    inner: candle_nn::Embedding,
    span: tracing::Span,
}

impl Embedding {
    /// Dequantize a `(vocab, hidden)` table.
    pub fn from_qtensor(weights: &QTensor, device: &Device) -> Result<Self> {
        let embeddings = weights.dequantize(device)?;
        let hidden_size = embeddings.dim(1)?;
        let inner = candle_nn::Embedding::new(embeddings, hidden_size);
        let span = tracing::span!(tracing::Level::TRACE, "embedding");
        Ok(Self { inner, span })
    }
}

impl Module for Embedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn from_qtensor(weight: QTensor, eps: f64) -> Result<Self> {
        let weight = weight.dequantize(&weight.device())?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(x, &self.weight, self.eps as f32)
    }
}

/// SwiGLU feed-forward block: `down(silu(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    gate_proj: QMatMul,
    up_proj: QMatMul,
    down_proj: QMatMul,
    span: tracing::Span,
}

impl FeedForward {
    pub fn load<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        layer_prefix: &str,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            gate_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.ffn_gate.weight"), device)?,
            up_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.ffn_up.weight"), device)?,
            down_proj: QMatMul::load(content, reader, &format!("{layer_prefix}.ffn_down.weight"), device)?,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}
