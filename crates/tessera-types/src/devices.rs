//! Cache element data types

use crate::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Data type of the values stored in the KV cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit floating point
    FP32,
    /// 16-bit floating point (IEEE 754)
    FP16,
    /// 16-bit brain floating point
    BF16,
    /// 8-bit floating point (E4M3)
    FP8,
    /// 8-bit signed integer
    INT8,
    /// 8-bit unsigned integer
    UINT8,
}

impl DataType {
    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::FP32 => 4,
            DataType::FP16 | DataType::BF16 => 2,
            DataType::FP8 | DataType::INT8 | DataType::UINT8 => 1,
        }
    }

    /// Check if floating point type
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::FP32 | DataType::FP16 | DataType::BF16 | DataType::FP8
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::FP32 => "fp32",
            DataType::FP16 => "fp16",
            DataType::BF16 => "bf16",
            DataType::FP8 => "fp8",
            DataType::INT8 => "int8",
            DataType::UINT8 => "uint8",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DataType {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(DataType::FP32),
            "fp16" | "f16" | "float16" | "half" => Ok(DataType::FP16),
            "bf16" | "bfloat16" => Ok(DataType::BF16),
            "fp8" | "fp8_e4m3" => Ok(DataType::FP8),
            "int8" => Ok(DataType::INT8),
            "uint8" => Ok(DataType::UINT8),
            other => Err(TesseraError::invalid_parameter(format!(
                "Unknown cache dtype: {}",
                other
            ))),
        }
    }
}
