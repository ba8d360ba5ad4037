//! Represent CA DBR data types, for data interchange with a server.
//!
//! CA describes transferred data as a combination of a basic value type and a
//! metadata category. The basic types are enumerated by [`DbrBasicType`] and
//! carried in [`DbrValue`] - all numeric data types are signed and most can
//! represent arrays:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), a special case - an index into the list of
//!   state labels held on the channel's [`DbrGraphics::Enum`] metadata.
//! - [`DbrValue::String`] - represented for interchange as [`Vec<String>`].
//!
//! The protocol also defines `SHORT` as an alias for `INT` - this is ignored
//! here to avoid excessive confusion.
//!
//! The five metadata categories are enumerated by [`DbrCategory`] and
//! represented by [`Dbr`]:
//! - [`Dbr::Basic`] - no extra metadata, just the plain data value.
//! - [`Dbr::Status`] - alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - everything from Status, plus the server timestamp.
//! - [`Dbr::Graphics`] - Status plus display information: units, display,
//!   warning and alarm limits, precision - or the state label list for enums.
//! - [`Dbr::Control`] - Graphics plus the control limits.
//!
//! Both parts are combined in the [`DbrType`] struct. The result shape of a
//! read mirrors the requested category exactly: a `Time` request produces a
//! [`Dbr::Time`] with that layer's full field set, never more, never fewer.
//!
//! This module is pure data mapping and performs no I/O. The conversion rules
//! applied when writing values to a channel live in [`coerce_put_value`].

use num::{Bounded, NumCast, cast::AsPrimitive};
use std::{cmp, str::FromStr, time::SystemTime};

use crate::status::ErrorCondition;

/// Alarm severity attached to a record's value.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmSeverity {
    #[default]
    No = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

/// Alarm condition attached to a record's value.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AlarmCondition {
    #[default]
    No = 0,
    Read = 1,
    Write = 2,
    HiHi = 3,
    High = 4,
    LoLo = 5,
    Low = 6,
    State = 7,
    Cos = 8,
    Comm = 9,
    Timeout = 10,
    HwLimit = 11,
    Calc = 12,
    Scan = 13,
    Link = 14,
    Soft = 15,
    BadSub = 16,
    Udf = 17,
    Disable = 18,
    Simm = 19,
}

/// Represent alarm status of the record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: AlarmCondition,
    pub severity: AlarmSeverity,
}

/// Represent actual data transferred over the channel layer.
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array, byte-per-element
        fn _encode_string<T>(from: &Vec<String>) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from.as_slice() {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        /// A single-element numeric value can act as an enum index
        fn _single_as_enum<T: Copy + NumCast>(from: &[T]) -> Result<DbrValue, ErrorCondition> {
            match from {
                [val] => Ok(DbrValue::Enum(
                    NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?,
                )),
                _ => Err(ErrorCondition::NoConvert),
            }
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Long(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Float(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Double(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(val.iter().map(|c| *c as u8).collect())
                        .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                _ => return Err(ErrorCondition::NoConvert),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => _single_as_enum(val)?,
                DbrValue::Int(val) => _single_as_enum(val)?,
                DbrValue::Long(val) => _single_as_enum(val)?,
                DbrValue::Float(val) => _single_as_enum(val)?,
                DbrValue::Double(val) => _single_as_enum(val)?,
                DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }

    /// Assemble a char array into a string, stopping at the first NUL.
    ///
    /// This is the post-processing step for char-array fields requested "as
    /// string": the zero padding that the field stores must not be visible to
    /// the caller. Returns `None` for non-char values or invalid UTF-8.
    pub fn chars_as_string(&self) -> Option<String> {
        let DbrValue::Char(val) = self else {
            return None;
        };
        let bytes: Vec<u8> = val
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8(bytes).ok()
    }
}

/// Implement conversion traits between a native type and a DbrValue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

/// Display, alarm and warning limit pairs, each as (lower, upper).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits<T> {
    pub display: (T, T),
    pub alarm: (T, T),
    pub warning: (T, T),
}

impl<T: Bounded> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display: (T::min_value(), T::max_value()),
            alarm: (T::min_value(), T::max_value()),
            warning: (T::min_value(), T::max_value()),
        }
    }
}

/// The graphics metadata layer: what a display needs to present a value.
///
/// For numeric types this is units and limits (plus precision for the real
/// types); for enum fields it is the list of state labels, with the state
/// count given by the length of that list.
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    Enum {
        states: Vec<String>,
    },
    String,
    Char {
        units: String,
        limits: Limits<i8>,
    },
    Int {
        units: String,
        limits: Limits<i16>,
    },
    Long {
        units: String,
        limits: Limits<i32>,
    },
    Float {
        units: String,
        limits: Limits<f32>,
        precision: i16,
    },
    Double {
        units: String,
        limits: Limits<f64>,
        precision: i16,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum { states: Vec::new() },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    /// The engineering units string, for the types that carry one
    pub fn units(&self) -> Option<&str> {
        match self {
            DbrGraphics::Char { units, .. } => Some(units),
            DbrGraphics::Int { units, .. } => Some(units),
            DbrGraphics::Long { units, .. } => Some(units),
            DbrGraphics::Float { units, .. } => Some(units),
            DbrGraphics::Double { units, .. } => Some(units),
            _ => None,
        }
    }

    pub fn precision(&self) -> Option<i16> {
        match self {
            DbrGraphics::Float { precision, .. } => Some(*precision),
            DbrGraphics::Double { precision, .. } => Some(*precision),
            _ => None,
        }
    }

    /// Enum state labels, for [`DbrGraphics::Enum`] values
    pub fn states(&self) -> Option<&[String]> {
        match self {
            DbrGraphics::Enum { states } => Some(states),
            _ => None,
        }
    }
}

/// The control limit pair (lower, upper), present only on the Control layer.
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }
}

/// Basic DBR data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

/// Represent every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
    pub fn basic(basic_type: DbrBasicType) -> Self {
        Self::new(basic_type, DbrCategory::Basic)
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if s.starts_with("DBR_") {
            s = &s[4..];
        };
        let category = if s.contains("_") {
            let cats = &s[..s.find("_").unwrap()];
            s = &s[s.find("_").unwrap() + 1..];
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let basic_type = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(()),
        };
        Ok(DbrType {
            basic_type,
            category,
        })
    }
}

/// Structured unit of exchange for record values.
///
/// The variant is exactly the metadata category that was requested, and the
/// field set of each variant is the full field set of that layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    /// Display metadata, alarm status, and value
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    /// Control limits on top of the graphics layer
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    pub fn value_mut(&mut self) -> &mut DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    /// The graphics metadata, on the layers that carry it
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } => Some(graphics),
            Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn control(&self) -> Option<&DbrControl> {
        match self {
            Dbr::Control { control, .. } => Some(control),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType {
            basic_type: self.value().get_type(),
            category,
        }
    }

    /// Re-express this DBR as a different requested type.
    ///
    /// The value is converted element-wise. Metadata the source layer does not
    /// carry is filled with defaults, metadata the target layer does not carry
    /// is dropped, so the result shape is exactly the target category.
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        let timestamp = match self {
            Dbr::Time { timestamp, .. } => *timestamp,
            _ => SystemTime::now(),
        };
        let graphics = self
            .graphics()
            .cloned()
            .unwrap_or_else(|| DbrGraphics::default_for(dbr_type.basic_type));
        let control = self
            .control()
            .cloned()
            .unwrap_or_else(|| DbrControl::default_for(dbr_type.basic_type));

        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control,
                value,
            },
        })
    }
}

/// Apply the put conversion rules to a caller-supplied value.
///
/// Returns the value as it should go out on the wire, along with the element
/// count of the request. The rules, in order:
/// - a string written to an enumerated field is resolved against the field's
///   state labels (case-sensitive exact match), never written as characters;
/// - a string written to a char-array field is exploded into one element per
///   byte, then truncated or zero-padded to the requested count;
/// - everything else is converted element-wise to the requested type and
///   silently truncated when longer than the requested count.
///
/// The requested type defaults to the channel's native type, the count to the
/// lesser of the native count and the length of the supplied value.
pub fn coerce_put_value(
    value: &DbrValue,
    req_type: Option<DbrBasicType>,
    count: Option<usize>,
    native_type: DbrBasicType,
    native_count: usize,
    enum_states: &[String],
) -> Result<(DbrValue, usize), ErrorCondition> {
    let target = req_type.unwrap_or(native_type);

    // Strings aimed at an enum field select a state by label
    if native_type == DbrBasicType::Enum
        && matches!(target, DbrBasicType::Enum | DbrBasicType::String)
    {
        if let DbrValue::String(labels) = value {
            let [label] = labels.as_slice() else {
                return Err(ErrorCondition::BadCount);
            };
            let index = enum_states
                .iter()
                .position(|s| s == label)
                .ok_or(ErrorCondition::BadStr)?;
            return Ok((DbrValue::Enum(index as u16), 1));
        }
    }

    // Strings aimed at a char field explode to one element per byte. The
    // default count includes a NUL terminator so a shorter string is not
    // left running into whatever the field held before.
    if matches!(value, DbrValue::String(_)) && target == DbrBasicType::Char {
        let mut exploded = value.convert_to(DbrBasicType::Char)?;
        let requested = count.unwrap_or(exploded.get_count() + 1);
        let requested = cmp::min(requested, native_count);
        exploded
            .resize(requested)
            .map_err(|_| ErrorCondition::NoConvert)?;
        return Ok((exploded, requested));
    }

    let mut converted = value.convert_to(target)?;
    if matches!(converted, DbrValue::Enum(_)) {
        return Ok((converted, 1));
    }
    let requested = count.unwrap_or(cmp::min(native_count, converted.get_count()));
    let requested = cmp::min(requested, native_count);
    // Longer than requested is truncated, not an error
    let send = cmp::min(requested, converted.get_count());
    converted
        .resize(send)
        .map_err(|_| ErrorCondition::NoConvert)?;
    Ok((converted, send))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());

        let v: DbrValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![500, 12])
        );

        // Single-element numerics convert to an enum index, arrays do not
        assert_eq!(
            DbrValue::Long(vec![1])
                .convert_to(DbrBasicType::Enum)
                .unwrap(),
            DbrValue::Enum(1)
        );
        assert!(
            DbrValue::Long(vec![1, 2])
                .convert_to(DbrBasicType::Enum)
                .is_err()
        );
    }

    #[test]
    fn string_char_round_trip() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();
        assert_eq!(s, re_s);
    }

    #[test]
    fn chars_as_string_stops_at_nul() {
        let v = DbrValue::Char(vec![104, 105, 0, 33, 0]);
        assert_eq!(v.chars_as_string().unwrap(), "hi");
        assert_eq!(DbrValue::Char(vec![0, 0]).chars_as_string().unwrap(), "");
        assert!(DbrValue::Long(vec![104]).chars_as_string().is_none());
    }

    #[test]
    fn dbr_type_from_str() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Control),
            "DBR_CTRL_DOUBLE".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert!("DBR_WIDE_INT".parse::<DbrType>().is_err());
    }

    #[test]
    fn dbr_layer_conversion() {
        let dbr = Dbr::Time {
            status: Status {
                status: AlarmCondition::High,
                severity: AlarmSeverity::Minor,
            },
            timestamp: SystemTime::UNIX_EPOCH,
            value: vec![42i32].into(),
        };
        // Downgrading drops fields
        let basic = dbr
            .convert_to(DbrType::basic(DbrBasicType::Double))
            .unwrap();
        assert_eq!(basic, Dbr::Basic(DbrValue::Double(vec![42.0])));
        // Upgrading keeps the status and fills graphics with defaults
        let ctrl = dbr
            .convert_to(DbrType::new(DbrBasicType::Long, DbrCategory::Control))
            .unwrap();
        assert_eq!(ctrl.status().unwrap().severity, AlarmSeverity::Minor);
        assert_eq!(ctrl.control(), Some(&DbrControl::Long(i32::MIN, i32::MAX)));
    }

    #[test]
    fn put_coercion_enum_label() {
        let states = vec!["Done".to_string(), "Busy".to_string()];
        let (value, count) =
            coerce_put_value(&"Busy".into(), None, None, DbrBasicType::Enum, 1, &states).unwrap();
        assert_eq!(value, DbrValue::Enum(1));
        assert_eq!(count, 1);
        // Labels are matched case-sensitively
        assert_eq!(
            coerce_put_value(&"busy".into(), None, None, DbrBasicType::Enum, 1, &states),
            Err(ErrorCondition::BadStr)
        );
    }

    #[test]
    fn put_coercion_char_string() {
        // Truncated to an explicit shorter count
        let (value, count) =
            coerce_put_value(&"1234".into(), None, Some(3), DbrBasicType::Char, 5, &[]).unwrap();
        assert_eq!(value, DbrValue::Char(vec![49, 50, 51]));
        assert_eq!(count, 3);
        // Zero-padded up to an explicit longer count
        let (value, _) =
            coerce_put_value(&"12".into(), None, Some(4), DbrBasicType::Char, 5, &[]).unwrap();
        assert_eq!(value, DbrValue::Char(vec![49, 50, 0, 0]));
        // The default count carries the terminator
        let (value, count) =
            coerce_put_value(&"12".into(), None, None, DbrBasicType::Char, 5, &[]).unwrap();
        assert_eq!(value, DbrValue::Char(vec![49, 50, 0]));
        assert_eq!(count, 3);
    }

    #[test]
    fn put_coercion_truncates_long_sequences() {
        let (value, count) = coerce_put_value(
            &vec![1i32, 2, 3, 4, 5].into(),
            None,
            None,
            DbrBasicType::Long,
            3,
            &[],
        )
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(value, DbrValue::Long(vec![1, 2, 3]));
    }

    #[test]
    fn put_coercion_scalar_to_native() {
        let (value, count) =
            coerce_put_value(&145i32.into(), None, None, DbrBasicType::Double, 1, &[]).unwrap();
        assert_eq!(value, DbrValue::Double(vec![145.0]));
        assert_eq!(count, 1);
    }
}
