//! Per-layer block geometry and page-size arithmetic

use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_types::{DataType, Result, TesseraError, BLOCK_SIZE_ALIGNMENT};

/// Width of the positional rope slice carried by every MLA token
pub const MLA_ROPE_DIM: usize = 64;

/// Elements covered by one f32 scale in the FA3 fp8 latent layout
pub const FA3_SCALE_TILE: usize = 128;

/// Quantisation applied to cached keys/values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KvQuantMode {
    /// Keys and values stored at the layer dtype
    #[default]
    None,
    /// Int8 keys, values at the layer dtype
    Int8Key,
    /// FA3 fp8 latent with per-tile scales; rope slice kept at the layer dtype
    Fa3Fp8,
}

/// Attention variant of an allocation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationGroupKind {
    Full,
    SlidingWindow { window: usize },
    MlaQuant { fa3_quant: bool },
}

impl AllocationGroupKind {
    /// Whether every past token stays addressable
    pub fn is_full_like(&self) -> bool {
        !matches!(self, AllocationGroupKind::SlidingWindow { .. })
    }

    fn family(&self) -> AttentionFamily {
        match self {
            AllocationGroupKind::Full => AttentionFamily::Full,
            AllocationGroupKind::SlidingWindow { window } => AttentionFamily::Sliding(*window),
            AllocationGroupKind::MlaQuant { .. } => AttentionFamily::Mla,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttentionFamily {
    Full,
    Sliding(usize),
    Mla,
}

/// Identity of a geometry for grouping purposes: kind, block size, page size
/// and layout
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeometryTypeId(pub String);

impl GeometryTypeId {
    pub fn compose(
        kind: AllocationGroupKind,
        block_size: usize,
        page_size_bytes: u64,
        use_mla: bool,
    ) -> Self {
        let tag = match kind {
            AllocationGroupKind::Full => "full_attention".to_string(),
            AllocationGroupKind::SlidingWindow { window } => format!("sliding_window_{}", window),
            AllocationGroupKind::MlaQuant { .. } => "mla_attention".to_string(),
        };
        Self(format!(
            "{}_{}_{}{}",
            tag,
            block_size,
            page_size_bytes,
            if use_mla { "_mla" } else { "" }
        ))
    }
}

impl fmt::Display for GeometryTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache layout of one attention layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockGeometry {
    /// Tokens per block
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub dtype: DataType,
    /// Single compressed vector per token instead of separate keys and values
    pub use_mla: bool,
    pub quant_mode: KvQuantMode,
    pub sliding_window: Option<usize>,
    /// Set by [`BlockGeometry::merge`] when the inputs disagree on page size
    heterogeneous: bool,
}

impl BlockGeometry {
    /// Full attention layer with separate keys and values
    pub fn full(
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
        dtype: DataType,
    ) -> Result<Self> {
        Self::build(block_size, num_kv_heads, head_size, dtype, false, None)
    }

    /// Sliding-window attention layer keeping the last `window` tokens
    pub fn sliding_window(
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
        dtype: DataType,
        window: usize,
    ) -> Result<Self> {
        Self::build(block_size, num_kv_heads, head_size, dtype, false, Some(window))
    }

    /// Multi-latent attention layer; `head_size` includes the rope slice
    pub fn mla(block_size: usize, head_size: usize, dtype: DataType) -> Result<Self> {
        Self::build(block_size, 1, head_size, dtype, true, None)
    }

    fn build(
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
        dtype: DataType,
        use_mla: bool,
        sliding_window: Option<usize>,
    ) -> Result<Self> {
        let geometry = Self {
            block_size,
            num_kv_heads,
            head_size,
            dtype,
            use_mla,
            quant_mode: KvQuantMode::None,
            sliding_window,
            heterogeneous: false,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Same geometry with a different quantisation mode
    pub fn with_quant(mut self, quant_mode: KvQuantMode) -> Result<Self> {
        self.quant_mode = quant_mode;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % BLOCK_SIZE_ALIGNMENT != 0 {
            return Err(TesseraError::invalid_parameter(format!(
                "block_size must be a positive multiple of {}, got {}",
                BLOCK_SIZE_ALIGNMENT, self.block_size
            )));
        }
        if self.num_kv_heads == 0 || self.head_size == 0 {
            return Err(TesseraError::invalid_parameter(
                "num_kv_heads and head_size must be positive",
            ));
        }
        if self.use_mla && self.num_kv_heads != 1 {
            return Err(TesseraError::invalid_parameter(format!(
                "MLA layers cache a single latent head, got {} kv heads",
                self.num_kv_heads
            )));
        }
        if self.use_mla && self.sliding_window.is_some() {
            return Err(TesseraError::invalid_parameter(
                "sliding window is not supported for MLA layers",
            ));
        }
        if self.sliding_window == Some(0) {
            return Err(TesseraError::invalid_parameter(
                "sliding window must be positive",
            ));
        }
        check_quant(self.use_mla, self.head_size, self.quant_mode)
    }

    pub fn kind(&self) -> AllocationGroupKind {
        if self.use_mla {
            AllocationGroupKind::MlaQuant {
                fa3_quant: self.quant_mode == KvQuantMode::Fa3Fp8,
            }
        } else if let Some(window) = self.sliding_window {
            AllocationGroupKind::SlidingWindow { window }
        } else {
            AllocationGroupKind::Full
        }
    }

    pub fn is_heterogeneous(&self) -> bool {
        self.heterogeneous
    }

    /// Bytes one token occupies for a single kv head under `quant_mode`
    pub fn per_token_bytes(&self, quant_mode: KvQuantMode) -> Result<u64> {
        check_quant(self.use_mla, self.head_size, quant_mode)?;
        let dtype = self.dtype.size_bytes();
        let head = self.head_size;
        let bytes = match (self.use_mla, quant_mode) {
            (false, KvQuantMode::None) => 2 * head * dtype,
            (false, KvQuantMode::Int8Key) => head * (1 + dtype),
            (true, KvQuantMode::None) => head * dtype,
            (true, KvQuantMode::Fa3Fp8) => {
                let latent = head - MLA_ROPE_DIM;
                latent + 4 * latent.div_ceil(FA3_SCALE_TILE) + MLA_ROPE_DIM * dtype
            }
            (false, KvQuantMode::Fa3Fp8) | (true, KvQuantMode::Int8Key) => {
                return Err(TesseraError::internal("unchecked quantisation layout"));
            }
        };
        Ok(bytes as u64)
    }

    /// Bytes one block occupies in this layer's buffer.
    ///
    /// A merged heterogeneous geometry has no single page size; callers must
    /// pass the quantisation mode they resolved for it.
    pub fn page_size_bytes(&self, quant_override: Option<KvQuantMode>) -> Result<u64> {
        if self.heterogeneous && quant_override.is_none() {
            return Err(TesseraError::invalid_state(
                "page size of a merged heterogeneous geometry is ambiguous; resolve the quantisation mode first",
            ));
        }
        let quant_mode = quant_override.unwrap_or(self.quant_mode);
        let per_token = self.per_token_bytes(quant_mode)?;
        Ok(self.block_size as u64 * self.num_kv_heads as u64 * per_token)
    }

    pub fn type_id(&self) -> Result<GeometryTypeId> {
        let page = self.page_size_bytes(None)?;
        Ok(GeometryTypeId::compose(
            self.kind(),
            self.block_size,
            page,
            self.use_mla,
        ))
    }

    /// Bytes needed to serve one request of `max_model_len` tokens
    pub fn max_memory_usage_bytes(&self, max_model_len: usize) -> Result<u64> {
        let page = self.page_size_bytes(None)?;
        let num_blocks = match self.sliding_window {
            None => max_model_len.div_ceil(self.block_size),
            // One extra block covers a window that straddles a block boundary.
            Some(window) => {
                let tokens = (window - 1 + self.block_size).min(max_model_len);
                tokens.div_ceil(self.block_size) + 1
            }
        };
        Ok(num_blocks as u64 * page)
    }

    /// Combine geometries of layers that will share one allocation group.
    ///
    /// Inputs must agree on block size and attention family. Disagreeing page
    /// sizes yield a heterogeneous geometry whose page size must be resolved
    /// before use.
    pub fn merge(specs: &[BlockGeometry]) -> Result<BlockGeometry> {
        let first = specs
            .first()
            .ok_or_else(|| TesseraError::invalid_parameter("cannot merge zero geometries"))?;
        let family = first.kind().family();

        for spec in &specs[1..] {
            if spec.block_size != first.block_size {
                return Err(TesseraError::geometry_mismatch(format!(
                    "cannot merge block sizes {} and {} into one group",
                    first.block_size, spec.block_size
                )));
            }
            if spec.kind().family() != family {
                return Err(TesseraError::geometry_mismatch(format!(
                    "cannot merge {:?} and {:?} layers into one group",
                    first.kind(),
                    spec.kind()
                )));
            }
        }

        let first_id = if first.heterogeneous {
            None
        } else {
            Some(first.type_id()?)
        };
        let mut heterogeneous = first_id.is_none();
        for spec in &specs[1..] {
            if spec.heterogeneous || Some(spec.type_id()?) != first_id {
                heterogeneous = true;
            }
        }

        let mut merged = first.clone();
        merged.heterogeneous = heterogeneous;
        Ok(merged)
    }

    /// Settle a heterogeneous geometry on one quantisation mode
    pub fn resolve_quant(&self, quant_mode: KvQuantMode) -> Result<BlockGeometry> {
        let mut resolved = self.clone();
        resolved.quant_mode = quant_mode;
        resolved.heterogeneous = false;
        resolved.validate()?;
        Ok(resolved)
    }
}

fn check_quant(use_mla: bool, head_size: usize, quant_mode: KvQuantMode) -> Result<()> {
    match (use_mla, quant_mode) {
        (_, KvQuantMode::None) => Ok(()),
        (false, KvQuantMode::Int8Key) => Ok(()),
        (true, KvQuantMode::Fa3Fp8) if head_size > MLA_ROPE_DIM => Ok(()),
        (true, KvQuantMode::Fa3Fp8) => Err(TesseraError::invalid_parameter(format!(
            "FA3 fp8 latent needs head_size above the {}-wide rope slice, got {}",
            MLA_ROPE_DIM, head_size
        ))),
        (false, KvQuantMode::Fa3Fp8) => Err(TesseraError::invalid_parameter(
            "FA3 fp8 quantisation only applies to MLA layers",
        )),
        (true, KvQuantMode::Int8Key) => Err(TesseraError::invalid_parameter(
            "int8 key quantisation does not apply to MLA layers",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_attention_page_size() {
        let g = BlockGeometry::full(16, 8, 128, DataType::BF16).unwrap();
        // 16 tokens * 8 heads * (k + v) * 128 * 2 bytes
        assert_eq!(g.page_size_bytes(None).unwrap(), 16 * 8 * 2 * 128 * 2);
        assert_eq!(g.kind(), AllocationGroupKind::Full);
    }

    #[test]
    fn test_int8_key_page_size() {
        let g = BlockGeometry::full(16, 8, 128, DataType::BF16)
            .unwrap()
            .with_quant(KvQuantMode::Int8Key)
            .unwrap();
        assert_eq!(g.page_size_bytes(None).unwrap(), 16 * 8 * 128 * 3);
    }

    #[test]
    fn test_mla_fa3_page_size() {
        let g = BlockGeometry::mla(64, 576, DataType::BF16).unwrap();
        assert_eq!(g.per_token_bytes(KvQuantMode::None).unwrap(), 1152);

        let q = g.with_quant(KvQuantMode::Fa3Fp8).unwrap();
        // 512 fp8 latent + 4 scales of 4 bytes + 64 bf16 rope
        assert_eq!(q.per_token_bytes(KvQuantMode::Fa3Fp8).unwrap(), 656);
        assert_eq!(q.page_size_bytes(None).unwrap(), 64 * 656);
        assert_eq!(q.kind(), AllocationGroupKind::MlaQuant { fa3_quant: true });
    }

    #[test]
    fn test_invalid_layouts_rejected() {
        assert!(BlockGeometry::full(20, 8, 128, DataType::BF16).is_err());
        assert!(BlockGeometry::full(16, 0, 128, DataType::BF16).is_err());
        assert!(BlockGeometry::full(16, 8, 128, DataType::BF16)
            .unwrap()
            .with_quant(KvQuantMode::Fa3Fp8)
            .is_err());
        assert!(BlockGeometry::mla(16, 576, DataType::BF16)
            .unwrap()
            .with_quant(KvQuantMode::Int8Key)
            .is_err());
        assert!(BlockGeometry::mla(16, 64, DataType::BF16)
            .unwrap()
            .with_quant(KvQuantMode::Fa3Fp8)
            .is_err());
    }

    #[test]
    fn test_merge_identical() {
        let g = BlockGeometry::full(16, 8, 128, DataType::FP16).unwrap();
        let merged = BlockGeometry::merge(&[g.clone(), g.clone()]).unwrap();
        assert!(!merged.is_heterogeneous());
        assert_eq!(merged.page_size_bytes(None).unwrap(), g.page_size_bytes(None).unwrap());
    }

    #[test]
    fn test_merge_heterogeneous_requires_resolution() {
        let plain = BlockGeometry::full(16, 8, 128, DataType::BF16).unwrap();
        let quant = plain.clone().with_quant(KvQuantMode::Int8Key).unwrap();
        let merged = BlockGeometry::merge(&[plain, quant]).unwrap();

        assert!(merged.is_heterogeneous());
        assert!(matches!(
            merged.page_size_bytes(None),
            Err(TesseraError::InvalidState { .. })
        ));
        assert!(merged.type_id().is_err());
        assert_eq!(
            merged.page_size_bytes(Some(KvQuantMode::Int8Key)).unwrap(),
            16 * 8 * 128 * 3
        );

        let resolved = merged.resolve_quant(KvQuantMode::Int8Key).unwrap();
        assert!(!resolved.is_heterogeneous());
        assert_eq!(resolved.page_size_bytes(None).unwrap(), 16 * 8 * 128 * 3);
    }

    #[test]
    fn test_merge_rejects_different_block_sizes() {
        let a = BlockGeometry::full(16, 8, 128, DataType::BF16).unwrap();
        let b = BlockGeometry::full(32, 8, 128, DataType::BF16).unwrap();
        assert!(matches!(
            BlockGeometry::merge(&[a, b]),
            Err(TesseraError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_rejects_mixed_families() {
        let full = BlockGeometry::full(16, 8, 128, DataType::BF16).unwrap();
        let swa = BlockGeometry::sliding_window(16, 8, 128, DataType::BF16, 128).unwrap();
        let other_swa = BlockGeometry::sliding_window(16, 8, 128, DataType::BF16, 256).unwrap();
        assert!(BlockGeometry::merge(&[full, swa.clone()]).is_err());
        assert!(BlockGeometry::merge(&[swa, other_swa]).is_err());
    }

    #[test]
    fn test_type_id_distinguishes_kinds() {
        let full = BlockGeometry::full(16, 8, 128, DataType::BF16).unwrap();
        let swa = BlockGeometry::sliding_window(16, 8, 128, DataType::BF16, 128).unwrap();
        assert_ne!(full.type_id().unwrap(), swa.type_id().unwrap());
        assert_eq!(
            full.type_id().unwrap().to_string(),
            format!("full_attention_16_{}", 16 * 8 * 2 * 128 * 2)
        );
    }

    #[test]
    fn test_max_memory_usage() {
        let full = BlockGeometry::full(16, 1, 64, DataType::FP16).unwrap();
        let page = full.page_size_bytes(None).unwrap();
        assert_eq!(full.max_memory_usage_bytes(100).unwrap(), 7 * page);

        let swa = BlockGeometry::sliding_window(16, 1, 64, DataType::FP16, 32).unwrap();
        // 31 + 16 = 47 tokens -> 3 blocks, plus one straddling block
        assert_eq!(swa.max_memory_usage_bytes(4096).unwrap(), 4 * page);
        assert_eq!(swa.max_memory_usage_bytes(20).unwrap(), 3 * page);
    }
}
