//! Typed access to a touchpad's named properties.

#[cfg(target_os = "linux")]
pub mod evdev_store;

use crate::discovery::Capabilities;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Bool,
    Int,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Bool => write!(f, "bool"),
            PropertyKind::Int => write!(f, "int"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
        }
    }
}

/// The closed set of properties a touchpad exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    TouchpadOff,
    LeftButton,
    MiddleButton,
    RightButton,
    TwoFingerDetection,
    ThreeFingerDetection,
    PressureDetection,
    FingerWidthDetection,
    FingerDetection,
    TwoFingerEmulation,
}

impl Property {
    pub const ALL: [Property; 10] = [
        Property::TouchpadOff,
        Property::LeftButton,
        Property::MiddleButton,
        Property::RightButton,
        Property::TwoFingerDetection,
        Property::ThreeFingerDetection,
        Property::PressureDetection,
        Property::FingerWidthDetection,
        Property::FingerDetection,
        Property::TwoFingerEmulation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Property::TouchpadOff => "touchpad_off",
            Property::LeftButton => "left_button",
            Property::MiddleButton => "middle_button",
            Property::RightButton => "right_button",
            Property::TwoFingerDetection => "two_finger_detection",
            Property::ThreeFingerDetection => "three_finger_detection",
            Property::PressureDetection => "pressure_detection",
            Property::FingerWidthDetection => "finger_width_detection",
            Property::FingerDetection => "finger_detection",
            Property::TwoFingerEmulation => "two_finger_emulation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Property::FingerDetection => PropertyKind::Int,
            _ => PropertyKind::Bool,
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self, Property::TouchpadOff)
    }

    /// Value of a capability property; `None` for the writable ones.
    pub fn from_capabilities(&self, caps: &Capabilities) -> Option<PropertyValue> {
        let value = match self {
            Property::TouchpadOff => return None,
            Property::LeftButton => PropertyValue::Bool(caps.left_button),
            Property::MiddleButton => PropertyValue::Bool(caps.middle_button),
            Property::RightButton => PropertyValue::Bool(caps.right_button),
            Property::TwoFingerDetection => PropertyValue::Bool(caps.two_finger_detection),
            Property::ThreeFingerDetection => PropertyValue::Bool(caps.three_finger_detection),
            Property::PressureDetection => PropertyValue::Bool(caps.pressure_detection),
            Property::FingerWidthDetection => PropertyValue::Bool(caps.finger_width_detection),
            Property::FingerDetection => PropertyValue::Int(i64::from(caps.finger_detection())),
            Property::TwoFingerEmulation => PropertyValue::Bool(caps.has_two_finger_emulation()),
        };
        Some(value)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum PropertyError {
    #[error("property '{0}' is not supported by this device")]
    Unsupported(String),

    #[error("property '{property}' expects a {expected} value, got {got}")]
    TypeError {
        property: Property,
        expected: PropertyKind,
        got: PropertyKind,
    },

    #[error("property '{0}' is read-only")]
    ReadOnly(Property),

    #[error("device transport error: {0}")]
    Transport(String),
}

/// Named property access on one touchpad. Calls may block on the device.
pub trait PropertyStore: Send {
    fn get(&self, property: Property) -> Result<PropertyValue, PropertyError>;
    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), PropertyError>;

    /// Current on/off state as reported by the device.
    fn is_off(&self) -> Result<bool, PropertyError> {
        match self.get(Property::TouchpadOff)? {
            PropertyValue::Bool(off) => Ok(off),
            other => Err(PropertyError::TypeError {
                property: Property::TouchpadOff,
                expected: PropertyKind::Bool,
                got: other.kind(),
            }),
        }
    }
}

impl<S: PropertyStore + ?Sized> PropertyStore for Box<S> {
    fn get(&self, property: Property) -> Result<PropertyValue, PropertyError> {
        (**self).get(property)
    }

    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), PropertyError> {
        (**self).set(property, value)
    }
}

/// Rejects writes with the wrong type or to read-only properties before
/// they reach the device.
pub fn check_write(property: Property, value: &PropertyValue) -> Result<(), PropertyError> {
    if !property.writable() {
        return Err(PropertyError::ReadOnly(property));
    }
    if value.kind() != property.kind() {
        return Err(PropertyError::TypeError {
            property,
            expected: property.kind(),
            got: value.kind(),
        });
    }
    Ok(())
}

/// Switches a touchpad on or off, reading the device first so a write only
/// happens when the device disagrees with the wanted state.
pub struct TouchpadSwitch<S> {
    store: S,
}

impl<S: PropertyStore> TouchpadSwitch<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns whether a write was issued.
    pub fn apply(&mut self, off: bool) -> Result<bool, PropertyError> {
        if self.store.is_off()? == off {
            debug!("touchpad already {}, no write", if off { "off" } else { "on" });
            return Ok(false);
        }
        self.store
            .set(Property::TouchpadOff, PropertyValue::Bool(off))?;
        Ok(true)
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }
}
