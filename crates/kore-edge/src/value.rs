//! Values passed into and out of methods.

use kore_delegate::{DelegateTensor, HostTensor};

use crate::memory::Tensor;
use crate::{EdgeError, Result};

/// A method input or output owned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum EValue {
    None,
    Int(i64),
    Double(f64),
    Bool(bool),
    Tensor(HostTensor),
}

impl EValue {
    pub fn tag(&self) -> &'static str {
        match self {
            EValue::None => "none",
            EValue::Int(_) => "int",
            EValue::Double(_) => "double",
            EValue::Bool(_) => "bool",
            EValue::Tensor(_) => "tensor",
        }
    }

    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            EValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<HostTensor> {
        match self {
            EValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<HostTensor> for EValue {
    fn from(t: HostTensor) -> Self {
        EValue::Tensor(t)
    }
}

/// A value slot inside a loaded method.
#[derive(Debug, Default)]
pub(crate) enum Value {
    #[default]
    None,
    Int(i64),
    Double(f64),
    Bool(bool),
    Tensor(Tensor),
}

impl Value {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
            Value::Tensor(_) => "tensor",
        }
    }

    /// Copy out to an owned value.
    pub(crate) fn to_evalue(&self) -> Result<EValue> {
        Ok(match self {
            Value::None => EValue::None,
            Value::Int(v) => EValue::Int(*v),
            Value::Double(v) => EValue::Double(*v),
            Value::Bool(v) => EValue::Bool(*v),
            Value::Tensor(t) => EValue::Tensor(HostTensor::from_f32(t.as_f32(), t.sizes())?),
        })
    }

    /// Overwrite this slot with a caller-supplied value of the same kind.
    pub(crate) fn set(&mut self, input: &EValue) -> Result<()> {
        match (self, input) {
            (Value::Tensor(t), EValue::Tensor(src)) => t.assign(src.sizes(), src.as_f32()),
            (Value::Int(v), EValue::Int(src)) => {
                *v = *src;
                Ok(())
            }
            (Value::Double(v), EValue::Double(src)) => {
                *v = *src;
                Ok(())
            }
            (Value::Bool(v), EValue::Bool(src)) => {
                *v = *src;
                Ok(())
            }
            (Value::None, EValue::None) => Ok(()),
            (slot, input) => Err(EdgeError::invalid(format!(
                "expected {} input but given {}",
                slot.tag(),
                input.tag()
            ))),
        }
    }
}

/// Move the tensor at `index` out of `values`, leaving `None` behind.
pub(crate) fn take_tensor(values: &mut [Value], index: usize) -> Result<Tensor> {
    let slot = values
        .get_mut(index)
        .ok_or_else(|| EdgeError::program(format!("value {} out of range", index)))?;
    match std::mem::take(slot) {
        Value::Tensor(t) => Ok(t),
        other => {
            let tag = other.tag();
            *slot = other;
            Err(EdgeError::program(format!("value {} is {}, expected a tensor", index, tag)))
        }
    }
}

pub(crate) fn tensor_at(values: &[Value], index: usize) -> Result<&Tensor> {
    match values.get(index) {
        Some(Value::Tensor(t)) => Ok(t),
        Some(other) => Err(EdgeError::program(format!(
            "value {} is {}, expected a tensor",
            index,
            other.tag()
        ))),
        None => Err(EdgeError::program(format!("value {} out of range", index))),
    }
}

/// Put taken tensors back into their slots.
pub(crate) fn restore(values: &mut [Value], taken: Vec<(usize, Tensor)>) {
    for (index, tensor) in taken {
        values[index] = Value::Tensor(tensor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TensorShapeDynamism;
    use kore_delegate::Arena;

    #[test]
    fn test_set_checks_kind() {
        let mut v = Value::Int(1);
        v.set(&EValue::Int(5)).unwrap();
        assert!(matches!(v, Value::Int(5)));
        let err = v.set(&EValue::Bool(true)).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: expected int input but given bool");
    }

    #[test]
    fn test_take_and_restore() {
        let arena = Arena::new(64);
        let t = Tensor::allocate(&[2], TensorShapeDynamism::Static, &arena).unwrap();
        let mut values = vec![Value::Tensor(t), Value::Int(3)];
        let taken = take_tensor(&mut values, 0).unwrap();
        assert!(matches!(values[0], Value::None));
        assert!(take_tensor(&mut values, 1).is_err());
        assert!(matches!(values[1], Value::Int(3)));
        restore(&mut values, vec![(0, taken)]);
        assert!(tensor_at(&values, 0).is_ok());
    }

    #[test]
    fn test_tensor_copies_out() {
        let arena = Arena::new(64);
        let mut t = Tensor::allocate(&[2], TensorShapeDynamism::Static, &arena).unwrap();
        t.as_f32_mut().copy_from_slice(&[4.0, 5.0]);
        let out = Value::Tensor(t).to_evalue().unwrap();
        assert_eq!(out.as_tensor().unwrap().as_f32(), &[4.0, 5.0]);
    }
}
