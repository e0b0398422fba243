//! Immutable controller status snapshots
//!
//! A [`ControllerStatus`] is never mutated after it is built. Every new
//! report from the firmware produces a fresh snapshot through
//! [`ControllerStatusBuilder`], either from scratch or seeded with the
//! previous snapshot so fields missing from a partial report carry over.

use super::{ControllerState, Position, Units};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Feed, rapid and spindle override percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePercents {
    /// Feed override (percent)
    pub feed: u16,
    /// Rapid override (percent)
    pub rapid: u16,
    /// Spindle override (percent)
    pub spindle: u16,
}

impl Default for OverridePercents {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Input pins reported as active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnabledPins {
    pub x: bool,
    pub y: bool,
    pub z: bool,
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub probe: bool,
    pub door: bool,
    pub hold: bool,
    pub soft_reset: bool,
    pub cycle_start: bool,
}

impl EnabledPins {
    /// Parse a pin letter string such as `XZP`
    ///
    /// Unknown letters are ignored.
    pub fn from_letters(letters: &str) -> Self {
        let mut pins = Self::default();
        for c in letters.chars() {
            match c.to_ascii_uppercase() {
                'X' => pins.x = true,
                'Y' => pins.y = true,
                'Z' => pins.z = true,
                'A' => pins.a = true,
                'B' => pins.b = true,
                'C' => pins.c = true,
                'P' => pins.probe = true,
                'D' => pins.door = true,
                'H' => pins.hold = true,
                'R' => pins.soft_reset = true,
                'S' => pins.cycle_start = true,
                _ => {}
            }
        }
        pins
    }

    /// True when no pin is active
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Spindle and coolant accessories reported as active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessoryStates {
    pub spindle_cw: bool,
    pub spindle_ccw: bool,
    pub flood: bool,
    pub mist: bool,
}

impl AccessoryStates {
    /// Parse an accessory letter string such as `SF`
    pub fn from_letters(letters: &str) -> Self {
        let mut states = Self::default();
        for c in letters.chars() {
            match c.to_ascii_uppercase() {
                'S' => states.spindle_cw = true,
                'C' => states.spindle_ccw = true,
                'F' => states.flood = true,
                'M' => states.mist = true,
                _ => {}
            }
        }
        states
    }
}

/// Firmware side buffer occupancy (`Bf:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// Free planner blocks
    pub planner_blocks: u16,
    /// Free RX buffer bytes
    pub rx_bytes: u16,
}

/// Immutable snapshot of the machine as last reported by the firmware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    state: ControllerState,
    state_string: String,
    sub_state: Option<String>,
    machine_coord: Option<Position>,
    work_coord: Option<Position>,
    work_coordinate_offset: Option<Position>,
    feed_speed: Option<f64>,
    feed_speed_units: Units,
    spindle_speed: Option<f64>,
    overrides: Option<OverridePercents>,
    enabled_pins: EnabledPins,
    accessory_states: AccessoryStates,
    buffer: Option<BufferState>,
}

impl ControllerStatus {
    /// Start a snapshot from scratch
    pub fn builder() -> ControllerStatusBuilder {
        ControllerStatusBuilder::new()
    }

    /// Start a snapshot seeded with every field of this one
    pub fn to_builder(&self) -> ControllerStatusBuilder {
        ControllerStatusBuilder {
            status: self.clone(),
        }
    }

    /// Snapshot used before anything has been reported
    pub fn disconnected() -> Self {
        Self::builder().build()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Raw state text as the firmware sent it (e.g. `Hold`)
    pub fn state_string(&self) -> &str {
        &self.state_string
    }

    /// Sub-state code (e.g. the `0` in `Hold:0`)
    pub fn sub_state(&self) -> Option<&str> {
        self.sub_state.as_deref()
    }

    pub fn machine_coord(&self) -> Option<Position> {
        self.machine_coord
    }

    pub fn work_coord(&self) -> Option<Position> {
        self.work_coord
    }

    pub fn work_coordinate_offset(&self) -> Option<Position> {
        self.work_coordinate_offset
    }

    pub fn feed_speed(&self) -> Option<f64> {
        self.feed_speed
    }

    pub fn feed_speed_units(&self) -> Units {
        self.feed_speed_units
    }

    pub fn spindle_speed(&self) -> Option<f64> {
        self.spindle_speed
    }

    pub fn overrides(&self) -> Option<OverridePercents> {
        self.overrides
    }

    pub fn enabled_pins(&self) -> EnabledPins {
        self.enabled_pins
    }

    pub fn accessory_states(&self) -> AccessoryStates {
        self.accessory_states
    }

    pub fn buffer(&self) -> Option<BufferState> {
        self.buffer
    }
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(sub) = &self.sub_state {
            write!(f, ":{}", sub)?;
        }
        if let Some(mpos) = &self.machine_coord {
            write!(f, " MPos[{}]", mpos)?;
        }
        if let Some(wpos) = &self.work_coord {
            write!(f, " WPos[{}]", wpos)?;
        }
        Ok(())
    }
}

/// Builder for [`ControllerStatus`]
#[derive(Debug, Clone)]
pub struct ControllerStatusBuilder {
    status: ControllerStatus,
}

impl ControllerStatusBuilder {
    /// Create a builder with every field empty and the state `Disconnected`
    pub fn new() -> Self {
        Self {
            status: ControllerStatus {
                state: ControllerState::Disconnected,
                state_string: String::new(),
                sub_state: None,
                machine_coord: None,
                work_coord: None,
                work_coordinate_offset: None,
                feed_speed: None,
                feed_speed_units: Units::Unknown,
                spindle_speed: None,
                overrides: None,
                enabled_pins: EnabledPins::default(),
                accessory_states: AccessoryStates::default(),
                buffer: None,
            },
        }
    }

    pub fn state(mut self, state: ControllerState) -> Self {
        self.status.state = state;
        self
    }

    pub fn state_string(mut self, raw: impl Into<String>) -> Self {
        self.status.state_string = raw.into();
        self
    }

    pub fn sub_state(mut self, sub_state: Option<String>) -> Self {
        self.status.sub_state = sub_state;
        self
    }

    pub fn machine_coord(mut self, position: Position) -> Self {
        self.status.machine_coord = Some(position);
        self
    }

    pub fn work_coord(mut self, position: Position) -> Self {
        self.status.work_coord = Some(position);
        self
    }

    pub fn work_coordinate_offset(mut self, offset: Position) -> Self {
        self.status.work_coordinate_offset = Some(offset);
        self
    }

    pub fn feed_speed(mut self, speed: f64, units: Units) -> Self {
        self.status.feed_speed = Some(speed);
        self.status.feed_speed_units = units;
        self
    }

    pub fn spindle_speed(mut self, speed: f64) -> Self {
        self.status.spindle_speed = Some(speed);
        self
    }

    pub fn overrides(mut self, overrides: OverridePercents) -> Self {
        self.status.overrides = Some(overrides);
        self
    }

    pub fn enabled_pins(mut self, pins: EnabledPins) -> Self {
        self.status.enabled_pins = pins;
        self
    }

    pub fn accessory_states(mut self, states: AccessoryStates) -> Self {
        self.status.accessory_states = states;
        self
    }

    pub fn buffer(mut self, buffer: BufferState) -> Self {
        self.status.buffer = Some(buffer);
        self
    }

    /// Fill whichever of machine/work coordinates is missing from the
    /// other plus the work coordinate offset.
    pub fn derive_missing_coordinates(mut self) -> Self {
        let s = &mut self.status;
        if let Some(wco) = s.work_coordinate_offset {
            match (s.machine_coord, s.work_coord) {
                (Some(mpos), None) => s.work_coord = Some(mpos.subtract(&wco)),
                (None, Some(wpos)) => s.machine_coord = Some(wpos.add(&wco)),
                _ => {}
            }
        }
        self
    }

    pub fn build(self) -> ControllerStatus {
        self.status
    }
}

impl Default for ControllerStatusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_update_carries_fields_over() {
        let first = ControllerStatus::builder()
            .state(ControllerState::Run)
            .machine_coord(Position::new(1.0, 2.0, 3.0, Units::MM))
            .feed_speed(500.0, Units::MM)
            .overrides(OverridePercents {
                feed: 110,
                rapid: 100,
                spindle: 90,
            })
            .build();

        let second = first
            .to_builder()
            .machine_coord(Position::new(4.0, 2.0, 3.0, Units::MM))
            .build();

        assert_eq!(second.state(), ControllerState::Run);
        assert_eq!(second.feed_speed(), Some(500.0));
        assert_eq!(second.overrides().map(|o| o.feed), Some(110));
        assert_eq!(second.machine_coord().map(|p| p.x), Some(4.0));
        // The earlier snapshot is untouched
        assert_eq!(first.machine_coord().map(|p| p.x), Some(1.0));
    }

    #[test]
    fn test_derive_work_from_machine_and_offset() {
        let status = ControllerStatus::builder()
            .machine_coord(Position::new(10.0, 20.0, 5.0, Units::MM))
            .work_coordinate_offset(Position::new(2.0, 5.0, 5.0, Units::MM))
            .derive_missing_coordinates()
            .build();

        let wpos = status.work_coord().expect("work coordinates derived");
        assert_eq!((wpos.x, wpos.y, wpos.z), (8.0, 15.0, 0.0));
    }

    #[test]
    fn test_pin_and_accessory_letters() {
        let pins = EnabledPins::from_letters("XZP");
        assert!(pins.x && pins.z && pins.probe);
        assert!(!pins.y && !pins.door);

        let acc = AccessoryStates::from_letters("SM");
        assert!(acc.spindle_cw && acc.mist);
        assert!(!acc.flood && !acc.spindle_ccw);
    }

    #[test]
    fn test_snapshot_serializes_for_remote_displays() {
        let status = ControllerStatus::builder()
            .state(ControllerState::Hold)
            .sub_state(Some("0".to_string()))
            .machine_coord(Position::new(1.5, 0.0, -2.0, Units::MM))
            .enabled_pins(EnabledPins::from_letters("D"))
            .build();

        let json = serde_json::to_string(&status).unwrap();
        let back: ControllerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
        assert!(back.enabled_pins().door);
    }
}
