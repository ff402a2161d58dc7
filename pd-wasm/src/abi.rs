//! Register-Slot ABI.
//!
//! Every argument and result crossing a call boundary travels as one
//! untyped 64-bit slot. Caller and callee agree on the meaning of each
//! slot through the callee's [`FunctionDefinition`](crate::FunctionDefinition).

use std::fmt;

use crate::runtime::Reference;

/// Fixed-width generic value container used for all call arguments/results.
pub type Slot = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    I32 = 0x7F,
    I64 = 0x7E,
    F32 = 0x7D,
    F64 = 0x7C,
    FuncRef = 0x70,
    ExternRef = 0x6F,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::FuncRef => "funcref",
            ValueType::ExternRef => "externref",
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, ValueType::FuncRef | ValueType::ExternRef)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    FuncRef(Reference),
    ExternRef(Reference),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::FuncRef(_) => ValueType::FuncRef,
            Value::ExternRef(_) => ValueType::ExternRef,
        }
    }

    pub fn to_slot(self) -> Slot {
        match self {
            Value::I32(value) => encode_i32(value),
            Value::I64(value) => encode_i64(value),
            Value::F32(value) => encode_f32(value),
            Value::F64(value) => encode_f64(value),
            Value::FuncRef(reference) | Value::ExternRef(reference) => reference,
        }
    }

    pub fn from_slot(ty: ValueType, slot: Slot) -> Self {
        match ty {
            ValueType::I32 => Value::I32(decode_i32(slot)),
            ValueType::I64 => Value::I64(decode_i64(slot)),
            ValueType::F32 => Value::F32(decode_f32(slot)),
            ValueType::F64 => Value::F64(decode_f64(slot)),
            ValueType::FuncRef => Value::FuncRef(slot),
            ValueType::ExternRef => Value::ExternRef(slot),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }
}

/// Values compare by slot bit pattern, so NaN payloads are significant.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.ty() == other.ty() && self.to_slot() == other.to_slot()
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "{value}"),
            Value::I64(value) => write!(f, "{value}"),
            Value::F32(value) => write!(f, "{value}"),
            Value::F64(value) => write!(f, "{value}"),
            Value::FuncRef(0) | Value::ExternRef(0) => write!(f, "null"),
            Value::FuncRef(reference) | Value::ExternRef(reference) => {
                write!(f, "ref:{reference:#x}")
            }
        }
    }
}

/// i32 values are zero-extended into their slot.
pub fn encode_i32(value: i32) -> Slot {
    value as u32 as u64
}

pub fn decode_i32(slot: Slot) -> i32 {
    slot as u32 as i32
}

pub fn encode_i64(value: i64) -> Slot {
    value as u64
}

pub fn decode_i64(slot: Slot) -> i64 {
    slot as i64
}

/// f32 bits occupy the low half of the slot; the high half is zero.
pub fn encode_f32(value: f32) -> Slot {
    value.to_bits() as u64
}

pub fn decode_f32(slot: Slot) -> f32 {
    f32::from_bits(slot as u32)
}

pub fn encode_f64(value: f64) -> Slot {
    value.to_bits()
}

pub fn decode_f64(slot: Slot) -> f64 {
    f64::from_bits(slot)
}

pub fn encode_values(values: &[Value]) -> Vec<Slot> {
    values.iter().map(|value| value.to_slot()).collect()
}

/// Decodes `slots` pairwise against `types`; extra slots on either side are ignored.
pub fn decode_values(types: &[ValueType], slots: &[Slot]) -> Vec<Value> {
    types
        .iter()
        .zip(slots)
        .map(|(ty, slot)| Value::from_slot(*ty, *slot))
        .collect()
}

/// Renders slots as a comma separated list using their declared types.
pub fn format_slots(types: &[ValueType], slots: &[Slot]) -> String {
    decode_values(types, slots)
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
