use std::fmt;

use crate::abi::{Slot, Value, ValueType};
use crate::error::{InstanceError, InstanceResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct GlobalType {
    pub value_type: ValueType,
    pub mutable: bool,
}

impl GlobalType {
    pub fn constant(value_type: ValueType) -> Self {
        Self {
            value_type,
            mutable: false,
        }
    }

    pub fn mutable(value_type: ValueType) -> Self {
        Self {
            value_type,
            mutable: true,
        }
    }
}

/// A global's type plus its current value in slot encoding.
///
/// Generated code reads and writes `value` at
/// [`GLOBAL_INSTANCE_VALUE_OFFSET`](crate::layout::GLOBAL_INSTANCE_VALUE_OFFSET).
#[derive(Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct GlobalInstance {
    pub(crate) ty: GlobalType,
    pub(crate) value: Slot,
}

impl GlobalInstance {
    pub fn new(ty: GlobalType, value: Slot) -> Self {
        Self { ty, value }
    }

    pub fn from_value(value: Value, mutable: bool) -> Self {
        Self {
            ty: GlobalType {
                value_type: value.ty(),
                mutable,
            },
            value: value.to_slot(),
        }
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub fn value_type(&self) -> ValueType {
        self.ty.value_type
    }

    pub fn is_mutable(&self) -> bool {
        self.ty.mutable
    }

    pub fn get(&self) -> Slot {
        self.value
    }

    pub fn get_value(&self) -> Value {
        Value::from_slot(self.ty.value_type, self.value)
    }

    pub fn set(&mut self, value: Slot) -> InstanceResult<()> {
        if !self.ty.mutable {
            return Err(InstanceError::ImmutableGlobal);
        }
        self.value = value;
        Ok(())
    }
}

impl fmt::Display for GlobalInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mutability = if self.ty.mutable { "mutable" } else { "const" };
        write!(
            f,
            "global({}, {mutability}) = {}",
            self.ty.value_type,
            self.get_value()
        )
    }
}
