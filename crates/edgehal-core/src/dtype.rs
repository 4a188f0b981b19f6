//! Element data types shared by images and tensors.

use serde::{Deserialize, Serialize};

/// Pixel / tensor element type.
///
/// Matches the set the compiled-model loaders report. `Fp16`/`Bf16` elements
/// are opaque two-byte values to this layer; the HAL never interprets them,
/// it only sizes and copies buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Fp32,
    Fp16,
    Bf16,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 | DataType::Fp16 | DataType::Bf16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => 4,
        }
    }
}

/// Iteration helper used by conversion round-trip tests.
pub const ALL_DATA_TYPES: [DataType; 9] = [
    DataType::Uint8,
    DataType::Int8,
    DataType::Uint16,
    DataType::Int16,
    DataType::Uint32,
    DataType::Int32,
    DataType::Fp32,
    DataType::Fp16,
    DataType::Bf16,
];
