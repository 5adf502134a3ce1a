//! Attribute values and their storage record.
//!
//! [`Value`] is the closed set of kinds an attribute may hold: fourteen
//! scalar kinds and a homogeneous array counterpart for each. Nothing else
//! is representable, so nested arrays are ruled out at the type level.
//! [`Attribute`] is the per-element record, either materialized or a
//! deferred back-reference into the encoded source stream.

use std::time::Duration;

use uuid::Uuid as UUID;

use crate::element::ElementArray;
use crate::error::{DmError, Result};
use crate::values::{Angle, Binary, Color, Matrix4, Quaternion, Vector2, Vector3, Vector4};

/// A nullable reference to an element in the owning datamodel's registry.
pub type ElementRef = Option<UUID>;

/// One of the fourteen scalar attribute kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Element,
    Int,
    Float,
    Bool,
    String,
    Binary,
    Time,
    Color,
    Vector2,
    Vector3,
    Vector4,
    Angle,
    Quaternion,
    Matrix,
}

impl ValueKind {
    /// The scalar kind's textual name as used by the keyvalues2 form.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Element => "element",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::String => "string",
            ValueKind::Binary => "binary",
            ValueKind::Time => "time",
            ValueKind::Color => "color",
            ValueKind::Vector2 => "vector2",
            ValueKind::Vector3 => "vector3",
            ValueKind::Vector4 => "vector4",
            ValueKind::Angle => "qangle",
            ValueKind::Quaternion => "quaternion",
            ValueKind::Matrix => "matrix",
        }
    }

    /// The binary wire id for this kind, arrays offset by 14.
    pub fn wire_id(self, array: bool) -> i8 {
        let scalar = match self {
            ValueKind::Element => 1,
            ValueKind::Int => 2,
            ValueKind::Float => 3,
            ValueKind::Bool => 4,
            ValueKind::String => 5,
            ValueKind::Binary => 6,
            ValueKind::Time => 7,
            ValueKind::Color => 8,
            ValueKind::Vector2 => 9,
            ValueKind::Vector3 => 10,
            ValueKind::Vector4 => 11,
            ValueKind::Angle => 12,
            ValueKind::Quaternion => 13,
            ValueKind::Matrix => 14,
        };
        if array {
            scalar + 14
        } else {
            scalar
        }
    }

    /// Inverse of [`wire_id`](Self::wire_id); the flag reports an array kind.
    pub fn from_wire_id(id: i8) -> Option<(Self, bool)> {
        let (scalar, array) = if (15..=28).contains(&id) { (id - 14, true) } else { (id, false) };
        let kind = match scalar {
            1 => ValueKind::Element,
            2 => ValueKind::Int,
            3 => ValueKind::Float,
            4 => ValueKind::Bool,
            5 => ValueKind::String,
            6 => ValueKind::Binary,
            7 => ValueKind::Time,
            8 => ValueKind::Color,
            9 => ValueKind::Vector2,
            10 => ValueKind::Vector3,
            11 => ValueKind::Vector4,
            12 => ValueKind::Angle,
            13 => ValueKind::Quaternion,
            14 => ValueKind::Matrix,
            _ => return None,
        };
        Some((kind, array))
    }

    /// Look up a keyvalues2 type name, e.g. `"vector3"` or `"int_array"`.
    pub fn from_type_name(name: &str) -> Option<(Self, bool)> {
        let (scalar_name, array) = match name.strip_suffix("_array") {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        let kind = match scalar_name {
            "element" => ValueKind::Element,
            "int" => ValueKind::Int,
            "float" => ValueKind::Float,
            "bool" => ValueKind::Bool,
            "string" => ValueKind::String,
            "binary" => ValueKind::Binary,
            "time" => ValueKind::Time,
            "color" => ValueKind::Color,
            "vector2" => ValueKind::Vector2,
            "vector3" => ValueKind::Vector3,
            "vector4" => ValueKind::Vector4,
            "qangle" => ValueKind::Angle,
            "quaternion" => ValueKind::Quaternion,
            "matrix" => ValueKind::Matrix,
            _ => return None,
        };
        Some((kind, array))
    }
}

/// A materialized attribute value.
#[derive(Clone, Debug)]
pub enum Value {
    Element(ElementRef),
    Int(i32),
    Float(f32),
    Bool(bool),
    String(String),
    Binary(Binary),
    Time(Duration),
    Color(Color),
    Vector2(Vector2),
    Vector3(Vector3),
    Vector4(Vector4),
    Angle(Angle),
    Quaternion(Quaternion),
    Matrix(Matrix4),

    ElementArray(ElementArray),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    BoolArray(Vec<bool>),
    StringArray(Vec<String>),
    BinaryArray(Vec<Binary>),
    TimeArray(Vec<Duration>),
    ColorArray(Vec<Color>),
    Vector2Array(Vec<Vector2>),
    Vector3Array(Vec<Vector3>),
    Vector4Array(Vec<Vector4>),
    AngleArray(Vec<Angle>),
    QuaternionArray(Vec<Quaternion>),
    MatrixArray(Vec<Matrix4>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Element(_) | Value::ElementArray(_) => ValueKind::Element,
            Value::Int(_) | Value::IntArray(_) => ValueKind::Int,
            Value::Float(_) | Value::FloatArray(_) => ValueKind::Float,
            Value::Bool(_) | Value::BoolArray(_) => ValueKind::Bool,
            Value::String(_) | Value::StringArray(_) => ValueKind::String,
            Value::Binary(_) | Value::BinaryArray(_) => ValueKind::Binary,
            Value::Time(_) | Value::TimeArray(_) => ValueKind::Time,
            Value::Color(_) | Value::ColorArray(_) => ValueKind::Color,
            Value::Vector2(_) | Value::Vector2Array(_) => ValueKind::Vector2,
            Value::Vector3(_) | Value::Vector3Array(_) => ValueKind::Vector3,
            Value::Vector4(_) | Value::Vector4Array(_) => ValueKind::Vector4,
            Value::Angle(_) | Value::AngleArray(_) => ValueKind::Angle,
            Value::Quaternion(_) | Value::QuaternionArray(_) => ValueKind::Quaternion,
            Value::Matrix(_) | Value::MatrixArray(_) => ValueKind::Matrix,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::ElementArray(_)
                | Value::IntArray(_)
                | Value::FloatArray(_)
                | Value::BoolArray(_)
                | Value::StringArray(_)
                | Value::BinaryArray(_)
                | Value::TimeArray(_)
                | Value::ColorArray(_)
                | Value::Vector2Array(_)
                | Value::Vector3Array(_)
                | Value::Vector4Array(_)
                | Value::AngleArray(_)
                | Value::QuaternionArray(_)
                | Value::MatrixArray(_)
        )
    }

    /// The keyvalues2 type name, e.g. `"vector3"` or `"vector3_array"`.
    pub fn type_name(&self) -> String {
        if self.is_array() {
            format!("{}_array", self.kind().name())
        } else {
            self.kind().name().to_string()
        }
    }

    pub fn element(reference: ElementRef) -> Self {
        Value::Element(reference)
    }
}

#[derive(Clone, Debug)]
enum State {
    Materialized(Value),
    /// A back-reference into the encoded source stream, resolved through
    /// the datamodel's bound codec on first access. Offsets are never zero.
    Deferred(u64),
}

/// A named, typed slot on an element. The name is the key of the owning
/// element's attribute map; the record itself tracks only the value state.
#[derive(Clone, Debug)]
pub struct Attribute {
    state: State,
}

impl Attribute {
    pub fn new(value: Value) -> Self {
        Self {
            state: State::Materialized(value),
        }
    }

    pub(crate) fn deferred(offset: u64) -> Result<Self> {
        if offset == 0 {
            return Err(DmError::invalid("deferred attribute offset must be nonzero"));
        }
        Ok(Self {
            state: State::Deferred(offset),
        })
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.state, State::Deferred(_))
    }

    /// The pending source offset, zero once materialized.
    pub fn offset(&self) -> u64 {
        match self.state {
            State::Deferred(offset) => offset,
            State::Materialized(_) => 0,
        }
    }

    /// The held value, absent while the attribute is still deferred.
    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            State::Materialized(value) => Some(value),
            State::Deferred(_) => None,
        }
    }

    pub(crate) fn value_mut(&mut self) -> Option<&mut Value> {
        match &mut self.state {
            State::Materialized(value) => Some(value),
            State::Deferred(_) => None,
        }
    }

    /// One-way transition out of the deferred state.
    pub(crate) fn materialize(&mut self, value: Value) {
        self.state = State::Materialized(value);
    }

    pub fn get<T: AttributeValue>(&self) -> Result<&T> {
        let value = self
            .value()
            .ok_or_else(|| DmError::invalid("attribute is deferred and must be loaded through its datamodel"))?;
        T::from_value(value).ok_or_else(|| DmError::type_mismatch(T::type_name(), value.type_name()))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Conversion between Rust types and attribute [`Value`]s. Implemented for
/// exactly the closed set of legal kinds; the trait is sealed so the set
/// cannot grow outside this crate.
pub trait AttributeValue: sealed::Sealed + Sized {
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<&Self>;
    fn type_name() -> &'static str;
}

macro_rules! declare_value {
    ($type:ty, $scalar:path, $scalar_name:literal, $array:path, $array_name:literal) => {
        impl sealed::Sealed for $type {}

        impl AttributeValue for $type {
            fn into_value(self) -> Value {
                $scalar(self)
            }

            fn from_value(value: &Value) -> Option<&Self> {
                match value {
                    $scalar(value) => Some(value),
                    _ => None,
                }
            }

            fn type_name() -> &'static str {
                $scalar_name
            }
        }

        impl sealed::Sealed for Vec<$type> {}

        impl AttributeValue for Vec<$type> {
            fn into_value(self) -> Value {
                $array(self)
            }

            fn from_value(value: &Value) -> Option<&Self> {
                match value {
                    $array(value) => Some(value),
                    _ => None,
                }
            }

            fn type_name() -> &'static str {
                $array_name
            }
        }

        impl From<$type> for Value {
            fn from(value: $type) -> Value {
                $scalar(value)
            }
        }

        impl From<Vec<$type>> for Value {
            fn from(value: Vec<$type>) -> Value {
                $array(value)
            }
        }
    };
}

declare_value!(i32, Value::Int, "int", Value::IntArray, "int_array");
declare_value!(f32, Value::Float, "float", Value::FloatArray, "float_array");
declare_value!(bool, Value::Bool, "bool", Value::BoolArray, "bool_array");
declare_value!(String, Value::String, "string", Value::StringArray, "string_array");
declare_value!(Binary, Value::Binary, "binary", Value::BinaryArray, "binary_array");
declare_value!(Duration, Value::Time, "time", Value::TimeArray, "time_array");
declare_value!(Color, Value::Color, "color", Value::ColorArray, "color_array");
declare_value!(Vector2, Value::Vector2, "vector2", Value::Vector2Array, "vector2_array");
declare_value!(Vector3, Value::Vector3, "vector3", Value::Vector3Array, "vector3_array");
declare_value!(Vector4, Value::Vector4, "vector4", Value::Vector4Array, "vector4_array");
declare_value!(Angle, Value::Angle, "qangle", Value::AngleArray, "qangle_array");
declare_value!(Quaternion, Value::Quaternion, "quaternion", Value::QuaternionArray, "quaternion_array");
declare_value!(Matrix4, Value::Matrix, "matrix", Value::MatrixArray, "matrix_array");

impl sealed::Sealed for ElementRef {}

impl AttributeValue for ElementRef {
    fn into_value(self) -> Value {
        Value::Element(self)
    }

    fn from_value(value: &Value) -> Option<&Self> {
        match value {
            Value::Element(reference) => Some(reference),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "element"
    }
}

impl sealed::Sealed for ElementArray {}

impl AttributeValue for ElementArray {
    fn into_value(self) -> Value {
        Value::ElementArray(self)
    }

    fn from_value(value: &Value) -> Option<&Self> {
        match value {
            Value::ElementArray(array) => Some(array),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "element_array"
    }
}

impl From<ElementRef> for Value {
    fn from(reference: ElementRef) -> Value {
        Value::Element(reference)
    }
}

impl From<ElementArray> for Value {
    fn from(array: ElementArray) -> Value {
        Value::ElementArray(array)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::String(value.to_string())
    }
}
