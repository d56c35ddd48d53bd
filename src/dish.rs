use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DishError;

mod convert;

pub(crate) use convert::json_with_indent;

/// Closed set of representations a dish can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DishType {
    ByteArray,
    ArrayBuffer,
    String,
    Number,
    BigNumber,
    Json,
    ListFile,
    Html,
}

impl DishType {
    pub const ALL: [DishType; 8] = [
        DishType::ByteArray,
        DishType::ArrayBuffer,
        DishType::String,
        DishType::Number,
        DishType::BigNumber,
        DishType::Json,
        DishType::ListFile,
        DishType::Html,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByteArray => "byteArray",
            Self::ArrayBuffer => "arrayBuffer",
            Self::String => "string",
            Self::Number => "number",
            Self::BigNumber => "bigNumber",
            Self::Json => "json",
            Self::ListFile => "listFile",
            Self::Html => "html",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str().to_lowercase() == normalized)
    }

    /// Byte sequence and raw buffer share one [`Bytes`] payload.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::ByteArray | Self::ArrayBuffer)
    }
}

impl fmt::Display for DishType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DishType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| {
            format!(
                "Unknown dish type '{s}'. Known types: {}",
                Self::ALL.map(|ty| ty.as_str()).join(", ")
            )
        })
    }
}

/// Immutable binary payload of the `ByteArray` and `ArrayBuffer` variants.
///
/// Clones share the allocation, so reading a binary dish or retagging it
/// between the two binary types never copies the data.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(Arc<Vec<u8>>);

impl Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Hands back the buffer; copies only while another holder shares it.
    pub fn into_vec(self) -> Vec<u8> {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    pub fn shares_allocation(&self, other: &Bytes) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_slice(), f)
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::new(value))
    }
}

impl From<&[u8]> for Bytes {
    fn from(value: &[u8]) -> Self {
        Self::from(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Bytes {
    fn from(value: &[u8; N]) -> Self {
        Self::from(value.to_vec())
    }
}

/// One named binary blob of a `ListFile` dish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DishFile {
    pub name: String,
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

impl DishFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            mime: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DishValue {
    ByteArray(Bytes),
    ArrayBuffer(Bytes),
    String(String),
    Number(i64),
    BigNumber(BigDecimal),
    Json(Value),
    ListFile(Vec<DishFile>),
    Html(String),
}

impl DishValue {
    pub fn dish_type(&self) -> DishType {
        match self {
            Self::ByteArray(_) => DishType::ByteArray,
            Self::ArrayBuffer(_) => DishType::ArrayBuffer,
            Self::String(_) => DishType::String,
            Self::Number(_) => DishType::Number,
            Self::BigNumber(_) => DishType::BigNumber,
            Self::Json(_) => DishType::Json,
            Self::ListFile(_) => DishType::ListFile,
            Self::Html(_) => DishType::Html,
        }
    }

    /// Converts this value into `target`, consuming it.
    pub fn convert(self, target: DishType) -> Result<DishValue, DishError> {
        convert::convert(self, target)
    }

    pub fn into_string(self) -> Result<String, DishError> {
        match self {
            Self::String(text) | Self::Html(text) => Ok(text),
            other => Err(DishError::TypeMismatch {
                declared: DishType::String,
                found: other.dish_type(),
            }),
        }
    }

    /// Unwraps either binary representation into an owned buffer.
    pub fn into_bytes(self) -> Result<Vec<u8>, DishError> {
        self.into_shared_bytes().map(Bytes::into_vec)
    }

    pub fn into_shared_bytes(self) -> Result<Bytes, DishError> {
        match self {
            Self::ByteArray(bytes) | Self::ArrayBuffer(bytes) => Ok(bytes),
            other => Err(DishError::TypeMismatch {
                declared: DishType::ByteArray,
                found: other.dish_type(),
            }),
        }
    }

    /// Borrows either binary representation.
    pub fn as_bytes(&self) -> Result<&[u8], DishError> {
        match self {
            Self::ByteArray(bytes) | Self::ArrayBuffer(bytes) => Ok(bytes.as_slice()),
            other => Err(DishError::TypeMismatch {
                declared: DishType::ByteArray,
                found: other.dish_type(),
            }),
        }
    }

    pub fn into_json(self) -> Result<Value, DishError> {
        match self {
            Self::Json(value) => Ok(value),
            other => Err(DishError::TypeMismatch {
                declared: DishType::Json,
                found: other.dish_type(),
            }),
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<String> for DishValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for DishValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for DishValue {
    fn from(value: Vec<u8>) -> Self {
        Self::ByteArray(value.into())
    }
}

impl From<Bytes> for DishValue {
    fn from(value: Bytes) -> Self {
        Self::ByteArray(value)
    }
}

impl From<i64> for DishValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<BigDecimal> for DishValue {
    fn from(value: BigDecimal) -> Self {
        Self::BigNumber(value)
    }
}

impl From<Value> for DishValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<DishFile>> for DishValue {
    fn from(value: Vec<DishFile>) -> Self {
        Self::ListFile(value)
    }
}

/// The polymorphic container threaded through a bake.
///
/// The held value always matches its type tag: the tag is the variant of
/// [`DishValue`], and [`Dish::set`] refuses a value whose variant disagrees
/// with the declared type. Reading a different representation with
/// [`Dish::get`] never touches the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct Dish {
    value: DishValue,
}

impl Default for Dish {
    fn default() -> Self {
        Self::new(DishValue::ByteArray(Bytes::default()))
    }
}

impl Dish {
    pub fn new(value: impl Into<DishValue>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(DishValue::String(text.into()))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(DishValue::ByteArray(bytes.into()))
    }

    /// Builds a dish of type `ty`, converting `value` when it arrives in
    /// another representation.
    pub fn with_type(value: impl Into<DishValue>, ty: DishType) -> Result<Self, DishError> {
        Ok(Self::new(value.into().convert(ty)?))
    }

    pub fn dish_type(&self) -> DishType {
        self.value.dish_type()
    }

    pub fn value(&self) -> &DishValue {
        &self.value
    }

    pub fn into_value(self) -> DishValue {
        self.value
    }

    /// Replaces the held value; `ty` must describe `value`'s representation.
    pub fn set(&mut self, value: DishValue, ty: DishType) -> Result<(), DishError> {
        let found = value.dish_type();
        if found != ty {
            return Err(DishError::TypeMismatch {
                declared: ty,
                found,
            });
        }
        self.value = value;
        Ok(())
    }

    /// Returns the value re-expressed as `target`. Binary payloads come back
    /// sharing the stored allocation.
    pub fn get(&self, target: DishType) -> Result<DishValue, DishError> {
        convert::convert_ref(&self.value, target)
    }

    /// Like [`Dish::get`] but consumes the dish, so no payload outlives it.
    pub fn take_as(self, target: DishType) -> Result<DishValue, DishError> {
        self.value.convert(target)
    }

    /// Like [`Dish::get`] but never fails; a conversion failure turns into a
    /// diagnostic string. Meant for display and logging only.
    pub fn present_as(&self, target: DishType) -> DishValue {
        match self.get(target) {
            Ok(value) => value,
            Err(err) => DishValue::String(format!(
                "[{} dish, {} bytes, cannot be shown as {}: {}]",
                self.dish_type(),
                self.size(),
                target,
                err
            )),
        }
    }

    /// Size of the payload in bytes.
    pub fn size(&self) -> usize {
        match &self.value {
            DishValue::ByteArray(bytes) | DishValue::ArrayBuffer(bytes) => bytes.len(),
            DishValue::String(text) | DishValue::Html(text) => text.len(),
            DishValue::Number(n) => n.to_string().len(),
            DishValue::BigNumber(n) => convert::decimal_text(n).len(),
            DishValue::Json(value) => value.to_string().len(),
            DishValue::ListFile(files) => files.iter().map(|f| f.data.len()).sum(),
        }
    }
}

impl fmt::Display for Dish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            DishValue::Html(markup) => f.write_str(markup),
            _ => match self.present_as(DishType::String) {
                DishValue::String(text) => f.write_str(&text),
                other => write!(f, "{other:?}"),
            },
        }
    }
}
