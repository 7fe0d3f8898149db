#![forbid(unsafe_code)]

//! The serialization boundary around the tensor core.
//!
//! Each entity is carried by exactly the information needed to rebuild it:
//! a value by its tag and payload, an axis by name, dimension and textual
//! slice labels, a tensor by hypercube, sparse index and values. Decoding
//! re-parses every slice label through its dimension, so an envelope
//! round-trips through the same grammar interactive input uses. Envelopes
//! are versioned and checksummed; decoding is strict.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use civita_core::{Dimension, DimensionType, Hypercube, Index, XVector, format_value};
use civita_tensor::{Tensor, TensorVal};

pub const TENSOR_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKindRepr {
    Str,
    Time,
    Num,
}

impl From<DimensionType> for DimensionKindRepr {
    fn from(kind: DimensionType) -> Self {
        match kind {
            DimensionType::Str => Self::Str,
            DimensionType::Time => Self::Time,
            DimensionType::Num => Self::Num,
        }
    }
}

impl From<DimensionKindRepr> for DimensionType {
    fn from(kind: DimensionKindRepr) -> Self {
        match kind {
            DimensionKindRepr::Str => Self::Str,
            DimensionKindRepr::Time => Self::Time,
            DimensionKindRepr::Num => Self::Num,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionRepr {
    pub kind: DimensionKindRepr,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XVectorRepr {
    pub name: String,
    pub dimension: DimensionRepr,
    pub slices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HypercubeRepr {
    pub xvectors: Vec<XVectorRepr>,
}

/// Wire form of a value tensor. NaN cells travel as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorEnvelope {
    pub schema_version: u32,
    pub hypercube: HypercubeRepr,
    pub index: Vec<usize>,
    pub values: Vec<Option<f64>>,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    InvalidIndex { reason: String },
    PayloadMismatch { expected: usize, found: usize },
    Label { reason: String },
    Tensor { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::InvalidIndex { reason } => write!(f, "invalid sparse index: {reason}"),
            Self::PayloadMismatch { expected, found } => {
                write!(
                    f,
                    "value payload mismatch: expected={expected} values, found={found}"
                )
            }
            Self::Label { reason } => write!(f, "slice label failure: {reason}"),
            Self::Tensor { reason } => write!(f, "tensor failure: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

fn envelope_hash(envelope: &TensorEnvelope) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    envelope.schema_version.hash(&mut hasher);
    for xv in &envelope.hypercube.xvectors {
        xv.name.hash(&mut hasher);
        (xv.dimension.kind as u8).hash(&mut hasher);
        xv.dimension.units.hash(&mut hasher);
        for slice in &xv.slices {
            slice.hash(&mut hasher);
        }
    }
    envelope.index.hash(&mut hasher);
    for value in &envelope.values {
        match value {
            Some(v) => {
                1u8.hash(&mut hasher);
                v.to_bits().hash(&mut hasher);
            }
            None => 0u8.hash(&mut hasher),
        }
    }
    format!("det64:{:016x}", hasher.finish())
}

/// Build the reconstruction envelope for any tensor, materializing its
/// values.
pub fn encode_envelope(tensor: &dyn Tensor) -> Result<TensorEnvelope, SerializeError> {
    let mut xvectors = Vec::with_capacity(tensor.hypercube().rank());
    for xv in &tensor.hypercube().xvectors {
        let mut slices = Vec::with_capacity(xv.len());
        for value in xv.iter() {
            let label = format_value(value, &xv.dimension.units)
                .map_err(|e| SerializeError::Label {
                    reason: e.to_string(),
                })?;
            slices.push(label);
        }
        xvectors.push(XVectorRepr {
            name: xv.name.clone(),
            dimension: DimensionRepr {
                kind: xv.dimension.kind.into(),
                units: xv.dimension.units.clone(),
            },
            slices,
        });
    }

    let values = tensor
        .data()
        .map_err(|e| SerializeError::Tensor {
            reason: e.to_string(),
        })?
        .into_iter()
        .map(|v| if v.is_nan() { None } else { Some(v) })
        .collect();

    let mut envelope = TensorEnvelope {
        schema_version: TENSOR_SCHEMA_VERSION,
        hypercube: HypercubeRepr { xvectors },
        index: tensor.index().positions().to_vec(),
        values,
        source_hash: String::new(),
    };
    envelope.source_hash = envelope_hash(&envelope);
    Ok(envelope)
}

pub fn encode_tensor(tensor: &dyn Tensor) -> Result<String, SerializeError> {
    let envelope = encode_envelope(tensor)?;
    serde_json::to_string(&envelope).map_err(|e| SerializeError::InvalidJson {
        diagnostic: e.to_string(),
    })
}

pub fn decode_envelope(payload: &str) -> Result<TensorEnvelope, SerializeError> {
    let envelope: TensorEnvelope =
        serde_json::from_str(payload).map_err(|e| SerializeError::InvalidJson {
            diagnostic: e.to_string(),
        })?;
    if envelope.schema_version != TENSOR_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: TENSOR_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }
    let expected = envelope_hash(&envelope);
    if expected != envelope.source_hash {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: envelope.source_hash.clone(),
        });
    }
    Ok(envelope)
}

/// Rebuild a value tensor from its envelope, re-parsing every slice label
/// through its axis dimension.
pub fn tensor_from_envelope(envelope: &TensorEnvelope) -> Result<TensorVal, SerializeError> {
    let mut xvectors = Vec::with_capacity(envelope.hypercube.xvectors.len());
    for repr in &envelope.hypercube.xvectors {
        let dimension = Dimension::new(repr.dimension.kind.into(), repr.dimension.units.clone());
        let mut xv = XVector::with_dimension(repr.name.clone(), dimension);
        for slice in &repr.slices {
            xv.push_label(slice).map_err(|e| SerializeError::Label {
                reason: format!("axis '{}': {e}", repr.name),
            })?;
        }
        xvectors.push(xv);
    }

    let index = Index::from_sorted({
        let positions = envelope.index.clone();
        if !positions.windows(2).all(|w| w[0] < w[1]) {
            return Err(SerializeError::InvalidIndex {
                reason: "positions not sorted and duplicate-free".to_string(),
            });
        }
        positions
    });

    let mut tensor =
        TensorVal::from_hypercube(Hypercube::new(xvectors)).map_err(|e| SerializeError::Tensor {
            reason: e.to_string(),
        })?;
    tensor.set_index(index).map_err(|e| SerializeError::Tensor {
        reason: e.to_string(),
    })?;

    if envelope.values.len() != tensor.size() {
        return Err(SerializeError::PayloadMismatch {
            expected: tensor.size(),
            found: envelope.values.len(),
        });
    }
    for (i, value) in envelope.values.iter().enumerate() {
        tensor.set(i, value.unwrap_or(f64::NAN));
    }
    Ok(tensor)
}

pub fn decode_tensor(payload: &str) -> Result<TensorVal, SerializeError> {
    let envelope = decode_envelope(payload)?;
    tensor_from_envelope(&envelope)
}
