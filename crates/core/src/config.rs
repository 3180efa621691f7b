use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// Score-only models: no generation phase.
    EarlyStop,
    /// Whole-batch argmax.
    #[default]
    Batched,
    /// Per-request sampling policy, row by row.
    Mixed,
    /// Batched argmax committed through each request's output token row.
    StarAttention,
    /// Token selection delegated to a native decoding engine.
    Native,
}

impl std::fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EarlyStop => "early_stop",
            Self::Batched => "batched",
            Self::Mixed => "mixed",
            Self::StarAttention => "star_attention",
            Self::Native => "native",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for DecoderKind {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "early_stop" | "early-stop" => Ok(Self::EarlyStop),
            "batched" => Ok(Self::Batched),
            "mixed" => Ok(Self::Mixed),
            "star_attention" | "star-attention" => Ok(Self::StarAttention),
            "native" => Ok(Self::Native),
            other => Err(DecoderError::Unsupported(format!("decoder kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub kind: DecoderKind,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    /// Seed for stochastic policies. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Host buffer sets the native decoder may have in flight at once.
    pub scratch_depth: usize,
    /// Run step n+1's `decode_async` before step n's commit.
    pub overlap: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            kind: DecoderKind::default(),
            max_seq_len: 4096,
            max_batch_size: 64,
            max_beam_width: 1,
            seed: None,
            scratch_depth: 2,
            overlap: false,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_seq_len == 0 {
            return Err(DecoderError::Invariant("max_seq_len must be > 0".into()));
        }
        if self.max_batch_size == 0 {
            return Err(DecoderError::Invariant("max_batch_size must be > 0".into()));
        }
        if self.max_beam_width == 0 {
            return Err(DecoderError::Invariant("max_beam_width must be > 0".into()));
        }
        if self.scratch_depth == 0 {
            return Err(DecoderError::Invariant("scratch_depth must be > 0".into()));
        }
        if self.overlap && self.kind == DecoderKind::Native && self.scratch_depth < 2 {
            return Err(DecoderError::Invariant(
                "overlap with the native decoder needs scratch_depth >= 2".into(),
            ));
        }
        Ok(())
    }
}
