pub mod attention;
pub mod layers;

pub use attention::{causal_mask, Attention, AttentionConfig, KvCache, RotaryEmbedding};
pub use layers::{Embedding, FeedForward, QMatMul, RmsNorm};
