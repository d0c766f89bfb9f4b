use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stable identifier of a tensor in the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TensorId(pub u32);

/// Element types understood by the fusion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    Fp8,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Width of one element in bytes.
    pub fn size_in_bytes(self) -> u64 {
        match self {
            DType::I8 | DType::U8 | DType::Fp8 => 1,
            DType::I16 | DType::U16 | DType::Bf16 | DType::F16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, DType::I64 | DType::F64)
    }
}

/// Kind of memory section a tensor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// Fixed external buffer supplied by the user of the compiled graph.
    Persistent,
    /// Scratch memory owned by the compiler.
    Workspace,
    /// Read-modify-write section allocated by the compiler.
    Rmw,
}

/// Placement of a tensor inside a memory section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionBinding {
    pub kind: SectionKind,
    pub id: u64,
    pub offset: u64,
}

impl SectionBinding {
    pub fn persistent(id: u64, offset: u64) -> Self {
        Self {
            kind: SectionKind::Persistent,
            id,
            offset,
        }
    }

    pub fn workspace(offset: u64) -> Self {
        Self {
            kind: SectionKind::Workspace,
            id: WORKSPACE_SECTION_ID,
            offset,
        }
    }
}

/// Section id reserved for compiler workspace memory.
pub const WORKSPACE_SECTION_ID: u64 = 0;

/// Half-open byte range `[start, end)` inside one memory section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SectionRange {
    pub section: u64,
    pub start: u64,
    pub end: u64,
}

impl SectionRange {
    /// Returns `true` when both ranges live in the same section and share at least one byte.
    pub fn intersects(&self, other: &SectionRange) -> bool {
        self.section == other.section && self.start < other.end && other.start < self.end
    }
}

/// Typed, shaped data buffer referenced by nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub dtype: DType,
    pub shape: SmallVec<[u64; 4]>,
    #[serde(default)]
    pub section: Option<SectionBinding>,
    /// Tensor sharing storage with this one under a different view.
    #[serde(default)]
    pub alias_of: Option<TensorId>,
}

impl Tensor {
    pub fn new(id: TensorId, name: impl Into<String>, dtype: DType, shape: &[u64]) -> Self {
        Self {
            id,
            name: name.into(),
            dtype,
            shape: SmallVec::from_slice(shape),
            section: None,
            alias_of: None,
        }
    }

    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.element_count() * self.dtype.size_in_bytes()
    }

    pub fn is_persistent(&self) -> bool {
        matches!(
            self.section,
            Some(SectionBinding {
                kind: SectionKind::Persistent,
                ..
            })
        )
    }

    pub fn is_workspace(&self) -> bool {
        matches!(
            self.section,
            Some(SectionBinding {
                kind: SectionKind::Workspace,
                ..
            })
        )
    }

    /// Byte range covered by a persistent tensor, `None` for transient tensors.
    pub fn persistent_range(&self) -> Option<SectionRange> {
        let binding = self.section.filter(|s| s.kind == SectionKind::Persistent)?;
        Some(SectionRange {
            section: binding.id,
            start: binding.offset,
            end: binding.offset + self.size_in_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_range_covers_whole_tensor() {
        let mut tensor = Tensor::new(TensorId(3), "t", DType::F32, &[2, 8]);
        assert_eq!(tensor.persistent_range(), None);
        tensor.section = Some(SectionBinding::persistent(5, 64));
        let range = tensor.persistent_range().expect("persistent range");
        assert_eq!(
            range,
            SectionRange {
                section: 5,
                start: 64,
                end: 128
            }
        );
    }

    #[test]
    fn ranges_in_different_sections_never_intersect() {
        let a = SectionRange {
            section: 1,
            start: 0,
            end: 16,
        };
        let b = SectionRange { section: 2, ..a };
        let c = SectionRange {
            section: 1,
            start: 16,
            end: 32,
        };
        let d = SectionRange {
            section: 1,
            start: 8,
            end: 9,
        };
        assert!(!a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.intersects(&d));
        assert!(d.intersects(&a));
    }
}
