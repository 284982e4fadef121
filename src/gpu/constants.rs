//! Named shader constants and their packing into the uniform block.

use std::collections::HashMap;

use crate::param::{ParamKind, ParamValue};

/// Declared type of a member of a shader's constant block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantType {
    /// `f32` or `vecN<f32>`.
    Float(u8),
    /// `i32` or `vecN<i32>`.
    Int(u8),
    /// `u32` or `vecN<u32>`, one boolean flag per component.
    Uint(u8),
    /// `array<vec4<u32>, N>`, holding `4 * N` boolean flags.
    FlagArray(u32),
}

impl ConstantType {
    pub fn accepts(&self, kind: ParamKind) -> bool {
        matches!(
            (self, kind),
            (ConstantType::Float(_), ParamKind::Float)
                | (ConstantType::Int(_), ParamKind::Int)
                | (ConstantType::Uint(_) | ConstantType::FlagArray(_), ParamKind::Bool)
        )
    }

    /// Number of 32-bit components the member can hold.
    pub fn capacity(&self) -> usize {
        match self {
            ConstantType::Float(n) | ConstantType::Int(n) | ConstantType::Uint(n) => *n as usize,
            ConstantType::FlagArray(len) => *len as usize * 4,
        }
    }
}

impl std::fmt::Display for ConstantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstantType::Float(1) => f.write_str("f32"),
            ConstantType::Int(1) => f.write_str("i32"),
            ConstantType::Uint(1) => f.write_str("u32"),
            ConstantType::Float(n) => write!(f, "vec{n}<f32>"),
            ConstantType::Int(n) => write!(f, "vec{n}<i32>"),
            ConstantType::Uint(n) => write!(f, "vec{n}<u32>"),
            ConstantType::FlagArray(n) => write!(f, "array<vec4<u32>, {n}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantSlot {
    pub offset: u32,
    pub ty: ConstantType,
}

/// Constant table of a loaded shader: member name to byte offset and type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantLayout {
    size: u32,
    slots: HashMap<String, ConstantSlot>,
}

impl ConstantLayout {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            slots: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, slot: ConstantSlot) {
        self.slots.insert(name.into(), slot);
    }

    pub fn get(&self, name: &str) -> Option<&ConstantSlot> {
        self.slots.get(name)
    }

    /// Size in bytes of the uniform block, zero when the shader declares none.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Writes `value` at `slot` into a staging block. Components beyond the
/// declared size are dropped. The caller checks the type first.
pub(crate) fn pack(block: &mut [u8], slot: &ConstantSlot, value: &ParamValue) {
    let words: Vec<u32> = match value {
        ParamValue::Float { values, .. } => values.iter().map(|v| v.to_bits()).collect(),
        ParamValue::Int { values, .. } => values.iter().map(|v| *v as u32).collect(),
        ParamValue::Bool(flags) => flags.iter().map(|f| u32::from(*f)).collect(),
    };
    let offset = slot.offset as usize;
    for (i, word) in words.iter().take(slot.ty.capacity()).enumerate() {
        let at = offset + i * 4;
        if let Some(dst) = block.get_mut(at..at + 4) {
            dst.copy_from_slice(&word.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::parse;

    #[test]
    fn packs_only_declared_components() {
        let slot = ConstantSlot {
            offset: 16,
            ty: ConstantType::Float(2),
        };
        let mut block = vec![0u8; 32];
        pack(&mut block, &slot, &parse("v=1,2,3f").unwrap().value);
        let floats: Vec<f32> = block
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn flags_fill_consecutive_words() {
        let slot = ConstantSlot {
            offset: 0,
            ty: ConstantType::FlagArray(2),
        };
        let mut block = vec![0u8; 32];
        pack(&mut block, &slot, &parse("f=1,0,1,1,0,1b").unwrap().value);
        let words: Vec<u32> = block
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![1, 0, 1, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn type_compatibility() {
        assert!(ConstantType::Float(4).accepts(ParamKind::Float));
        assert!(!ConstantType::Float(4).accepts(ParamKind::Int));
        assert!(ConstantType::Uint(1).accepts(ParamKind::Bool));
        assert!(!ConstantType::Int(1).accepts(ParamKind::Bool));
    }
}
