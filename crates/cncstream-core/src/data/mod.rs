//! Data models for positions, controller state, and status snapshots
//!
//! This module provides:
//! - Unit management (MM, INCH)
//! - Three axis positions tagged with their reporting unit
//! - The controller state machine states
//! - Immutable status snapshots and the builder that produces them

mod status;

pub use status::{
    AccessoryStates, BufferState, ControllerStatus, ControllerStatusBuilder, EnabledPins,
    OverridePercents,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Units {
    /// Millimeters (metric)
    MM,
    /// Inches (imperial)
    INCH,
    /// Unknown or uninitialized
    #[default]
    Unknown,
}

impl Units {
    /// Convert a value from one unit to another
    ///
    /// Returns the original value if the units match or either is unknown.
    pub fn convert(value: f64, from: Units, to: Units) -> f64 {
        match (from, to) {
            (Units::MM, Units::INCH) => value / 25.4,
            (Units::INCH, Units::MM) => value * 25.4,
            _ => value,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
            Units::Unknown => write!(f, "unknown"),
        }
    }
}

/// Position in 3D space, tagged with the unit the firmware reported it in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// Coordinate unit
    pub unit: Units,
}

impl Position {
    /// Create a new position
    pub fn new(x: f64, y: f64, z: f64, unit: Units) -> Self {
        debug_assert!(
            x.is_finite() && y.is_finite() && z.is_finite(),
            "Position axes must be finite: x={x}, y={y}, z={z}"
        );
        Self { x, y, z, unit }
    }

    /// Origin in the given unit
    pub fn zero(unit: Units) -> Self {
        Self::new(0.0, 0.0, 0.0, unit)
    }

    /// Add another position (component-wise), converting it to this unit first
    pub fn add(&self, other: &Position) -> Self {
        let other = other.convert_to(self.unit);
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z, self.unit)
    }

    /// Subtract another position (component-wise), converting it to this unit first
    pub fn subtract(&self, other: &Position) -> Self {
        let other = other.convert_to(self.unit);
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z, self.unit)
    }

    /// Convert this position to a different unit
    pub fn convert_to(&self, target: Units) -> Self {
        if self.unit == Units::Unknown || target == Units::Unknown {
            return *self;
        }
        Self {
            x: Units::convert(self.x, self.unit, target),
            y: Units::convert(self.y, self.unit, target),
            z: Units::convert(self.z, self.unit, target),
            unit: target,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::zero(Units::Unknown)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X:{:.3} Y:{:.3} Z:{:.3} ({})",
            self.x, self.y, self.z, self.unit
        )
    }
}

/// Controller state machine states
///
/// Exactly one value is current at any time. `Disconnected` is the
/// initial state and the state after any transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ControllerState {
    /// Not connected to any controller
    #[default]
    Disconnected,
    /// Connected and idle, ready for commands
    Idle,
    /// Executing a job
    Run,
    /// Feed hold, awaiting resume
    Hold,
    /// Safety door interlock triggered
    Door,
    /// Alarm state, requires an explicit unlock
    Alarm,
    /// Manual jog motion
    Jog,
    /// Homing cycle in progress
    Home,
    /// Check mode (dry run without machine movement)
    Check,
    /// Low-power sleep state
    Sleep,
    /// Connected but the firmware reported something unrecognised
    Unknown,
}

impl ControllerState {
    /// Check if this state indicates the controller is connected
    pub fn is_connected(&self) -> bool {
        *self != ControllerState::Disconnected
    }

    /// Check if this state accepts new manual commands
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ControllerState::Idle | ControllerState::Check | ControllerState::Sleep
        )
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ControllerState::Run | ControllerState::Jog | ControllerState::Home
        )
    }

    /// Check if a transition from this state to `target` is valid.
    ///
    /// - Any state can drop to Disconnected (transport failure)
    /// - Disconnected can move to any connected state on the first report
    /// - Alarm only leaves through Idle (explicit unlock)
    pub fn can_transition_to(&self, target: ControllerState) -> bool {
        use ControllerState::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (_, Disconnected) | (Disconnected, _) => true,
            (Alarm, Idle) => true,
            (Alarm, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Idle => write!(f, "Idle"),
            Self::Run => write!(f, "Run"),
            Self::Hold => write!(f, "Hold"),
            Self::Door => write!(f, "Door"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Jog => write!(f, "Jog"),
            Self::Home => write!(f, "Home"),
            Self::Check => write!(f, "Check"),
            Self::Sleep => write!(f, "Sleep"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_unit_conversion() {
        let p = Position::new(25.4, 50.8, 0.0, Units::MM);
        let inches = p.convert_to(Units::INCH);
        assert!((inches.x - 1.0).abs() < 1e-9);
        assert!((inches.y - 2.0).abs() < 1e-9);
        assert_eq!(inches.unit, Units::INCH);
    }

    #[test]
    fn test_position_subtract_mixed_units() {
        let mpos = Position::new(30.0, 10.0, 0.0, Units::MM);
        let wco = Position::new(1.0, 0.0, 0.0, Units::INCH);
        let wpos = mpos.subtract(&wco);
        assert!((wpos.x - 4.6).abs() < 1e-9);
        assert_eq!(wpos.unit, Units::MM);
    }

    #[test]
    fn test_alarm_only_leaves_through_idle() {
        assert!(ControllerState::Alarm.can_transition_to(ControllerState::Idle));
        assert!(ControllerState::Alarm.can_transition_to(ControllerState::Disconnected));
        assert!(!ControllerState::Alarm.can_transition_to(ControllerState::Run));
        assert!(!ControllerState::Alarm.can_transition_to(ControllerState::Hold));
        assert!(ControllerState::Run.can_transition_to(ControllerState::Alarm));
    }

    #[test]
    fn test_state_predicates() {
        assert!(!ControllerState::Disconnected.is_connected());
        assert!(ControllerState::Unknown.is_connected());
        assert!(ControllerState::Idle.is_ready());
        assert!(!ControllerState::Run.is_ready());
        assert!(ControllerState::Jog.is_moving());
    }
}
