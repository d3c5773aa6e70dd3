use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input-intent descriptor relayed from the controller toward the owner
/// endpoint. The set of event types is closed; anything else fails to
/// deserialize at the relay boundary.
///
/// Pointer coordinates are normalized to the owner's capture surface
/// (0.0..=1.0) so the owner side can map them onto whatever resolution it
/// is actually streaming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    #[serde(rename_all = "camelCase")]
    MouseMove { x: f64, y: f64 },
    #[serde(rename_all = "camelCase")]
    MouseClick { x: f64, y: f64, button: MouseButton },
    #[serde(rename_all = "camelCase")]
    MouseDown { x: f64, y: f64, button: MouseButton },
    #[serde(rename_all = "camelCase")]
    MouseUp { x: f64, y: f64, button: MouseButton },
    #[serde(rename_all = "camelCase")]
    Wheel {
        #[serde(default)]
        delta_x: f64,
        #[serde(default)]
        delta_y: f64,
    },
    #[serde(rename_all = "camelCase")]
    KeyDown {
        key: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        key_code: Option<u32>,
        #[serde(default)]
        ctrl_key: bool,
        #[serde(default)]
        alt_key: bool,
        #[serde(default)]
        shift_key: bool,
        #[serde(default)]
        meta_key: bool,
    },
    #[serde(rename_all = "camelCase")]
    KeyUp {
        key: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        key_code: Option<u32>,
        #[serde(default)]
        ctrl_key: bool,
        #[serde(default)]
        alt_key: bool,
        #[serde(default)]
        shift_key: bool,
        #[serde(default)]
        meta_key: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Coarse capability class an event falls under, matched against the
/// session's permission set before fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    Pointer,
    Keyboard,
}

#[derive(Debug, Error, PartialEq)]
pub enum ControlEventError {
    #[error("coordinate out of range: {axis}={value}")]
    CoordinateOutOfRange { axis: &'static str, value: f64 },
    #[error("key must not be empty")]
    EmptyKey,
}

impl ControlEvent {
    pub fn input_class(&self) -> InputClass {
        match self {
            ControlEvent::MouseMove { .. }
            | ControlEvent::MouseClick { .. }
            | ControlEvent::MouseDown { .. }
            | ControlEvent::MouseUp { .. }
            | ControlEvent::Wheel { .. } => InputClass::Pointer,
            ControlEvent::KeyDown { .. } | ControlEvent::KeyUp { .. } => InputClass::Keyboard,
        }
    }

    /// Boundary validation over and above what the type system enforces:
    /// normalized coordinates must land in 0..=1 and key events must name
    /// a key.
    pub fn validate(&self) -> Result<(), ControlEventError> {
        match self {
            ControlEvent::MouseMove { x, y }
            | ControlEvent::MouseClick { x, y, .. }
            | ControlEvent::MouseDown { x, y, .. }
            | ControlEvent::MouseUp { x, y, .. } => {
                check_coordinate("x", *x)?;
                check_coordinate("y", *y)
            }
            ControlEvent::Wheel { delta_x, delta_y } => {
                if !delta_x.is_finite() {
                    return Err(ControlEventError::CoordinateOutOfRange {
                        axis: "deltaX",
                        value: *delta_x,
                    });
                }
                if !delta_y.is_finite() {
                    return Err(ControlEventError::CoordinateOutOfRange {
                        axis: "deltaY",
                        value: *delta_y,
                    });
                }
                Ok(())
            }
            ControlEvent::KeyDown { key, .. } | ControlEvent::KeyUp { key, .. } => {
                if key.is_empty() {
                    Err(ControlEventError::EmptyKey)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn check_coordinate(axis: &'static str, value: f64) -> Result<(), ControlEventError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ControlEventError::CoordinateOutOfRange { axis, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mousemove_wire_shape() {
        let event = ControlEvent::MouseMove { x: 0.25, y: 0.75 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "mousemove", "x": 0.25, "y": 0.75})
        );
    }

    #[test]
    fn keydown_defaults_modifiers_off() {
        let event: ControlEvent =
            serde_json::from_str(r#"{"type":"keydown","key":"a","code":"KeyA"}"#).unwrap();
        match event {
            ControlEvent::KeyDown {
                key,
                ctrl_key,
                meta_key,
                ..
            } => {
                assert_eq!(key, "a");
                assert!(!ctrl_key);
                assert!(!meta_key);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn wheel_uses_camel_case_deltas() {
        let event: ControlEvent =
            serde_json::from_str(r#"{"type":"wheel","deltaX":3.0,"deltaY":-12.5}"#).unwrap();
        assert_eq!(
            event,
            ControlEvent::Wheel {
                delta_x: 3.0,
                delta_y: -12.5
            }
        );
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = serde_json::from_str::<ControlEvent>(r#"{"type":"format-disk"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn out_of_range_coordinates_fail_validation() {
        let event = ControlEvent::MouseClick {
            x: 1.5,
            y: 0.5,
            button: MouseButton::Left,
        };
        assert_eq!(
            event.validate(),
            Err(ControlEventError::CoordinateOutOfRange {
                axis: "x",
                value: 1.5
            })
        );
    }

    #[test]
    fn input_class_splits_pointer_and_keyboard() {
        let wheel = ControlEvent::Wheel {
            delta_x: 0.0,
            delta_y: 1.0,
        };
        assert_eq!(wheel.input_class(), InputClass::Pointer);

        let key = ControlEvent::KeyUp {
            key: "Escape".into(),
            code: None,
            key_code: None,
            ctrl_key: false,
            alt_key: false,
            shift_key: false,
            meta_key: false,
        };
        assert_eq!(key.input_class(), InputClass::Keyboard);
    }
}
