//! GRBL adapter
//!
//! GRBL acknowledges every line with `ok` or `error:<code>`, reports alarms
//! as `ALARM:<code>` and answers the realtime `?` byte with a status report
//! of the form `<Idle|MPos:0.000,0.000,0.000|FS:0,0|WCO:0.000,0.000,0.000>`.

use super::{ControllerType, FirmwareAdapter, FirmwareSetting, QuerySpec, ResponseKind};
use cncstream_core::{
    classify_response, AccessoryStates, BufferState, ControllerState, ControllerStatus,
    EnabledPins, OverridePercents, Position, ResponseClass, Units,
};

/// Serial RX buffer of a stock GRBL build, less a little headroom
pub const GRBL_BUFFER_SIZE: usize = 123;

const STATUS_REQUEST: &[u8] = b"?";
const FEED_HOLD: &[u8] = b"!";
const CYCLE_START: &[u8] = b"~";
const SOFT_RESET: &[u8] = &[0x18];

/// Adapter for GRBL 1.1 and compatible firmware
#[derive(Debug, Clone, Default)]
pub struct GrblAdapter;

impl GrblAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl FirmwareAdapter for GrblAdapter {
    fn controller_type(&self) -> ControllerType {
        ControllerType::Grbl
    }

    fn buffer_size(&self) -> usize {
        GRBL_BUFFER_SIZE
    }

    fn classify(&self, line: &str) -> ResponseKind {
        let line = line.trim();
        if line.starts_with('<') && line.ends_with('>') {
            return ResponseKind::Status;
        }

        if line.to_ascii_lowercase().starts_with("alarm") {
            let code = line
                .split_once(':')
                .and_then(|(_, code)| code.trim().parse::<u32>().ok());
            let message = code
                .and_then(describe_alarm)
                .map(str::to_string)
                .unwrap_or_else(|| line.to_string());
            return ResponseKind::Alarm { code, message };
        }

        match classify_response(line) {
            ResponseClass::Ok => ResponseKind::Ok,
            ResponseClass::Error(message) => ResponseKind::Error(describe_error_text(&message)),
            ResponseClass::Verbose if line.starts_with('$') && line.contains('=') => {
                ResponseKind::Setting
            }
            ResponseClass::Verbose => ResponseKind::Message,
        }
    }

    fn parse_status(&self, line: &str, prior: &ControllerStatus) -> Option<ControllerStatus> {
        parse_status_report(line, prior)
    }

    fn status_request(&self) -> &[u8] {
        STATUS_REQUEST
    }

    fn pause_bytes(&self) -> &[u8] {
        FEED_HOLD
    }

    fn resume_bytes(&self) -> &[u8] {
        CYCLE_START
    }

    fn cancel_bytes(&self) -> &[u8] {
        FEED_HOLD
    }

    /// A soft reset flushes the planner once the hold has settled
    fn after_cancel_bytes(&self) -> &[u8] {
        SOFT_RESET
    }

    fn reset_bytes(&self) -> &[u8] {
        SOFT_RESET
    }

    fn unlock_command(&self) -> &str {
        "$X"
    }

    fn settings_query(&self) -> QuerySpec {
        QuerySpec::new(
            "$$",
            |line| FirmwareSetting::parse_dollar_line(line).is_some(),
            |line| classify_response(line) == ResponseClass::Ok,
        )
    }

    fn parse_settings(&self, lines: &[String]) -> Vec<FirmwareSetting> {
        lines
            .iter()
            .filter_map(|line| FirmwareSetting::parse_dollar_line(line))
            .collect()
    }
}

/// Map a GRBL state word to a controller state, case-insensitively
pub fn state_from_string(state: &str) -> ControllerState {
    match state.to_ascii_lowercase().as_str() {
        "idle" => ControllerState::Idle,
        "run" => ControllerState::Run,
        "hold" => ControllerState::Hold,
        "door" => ControllerState::Door,
        "alarm" => ControllerState::Alarm,
        "jog" => ControllerState::Jog,
        "home" => ControllerState::Home,
        "check" => ControllerState::Check,
        "sleep" => ControllerState::Sleep,
        _ => ControllerState::Unknown,
    }
}

/// Parse a GRBL 1.1 status report.
///
/// - The work coordinate offset falls back to the prior snapshot, then zero
/// - Whichever of `MPos`/`WPos` is missing is derived from the other
/// - Overrides, pins and accessories only come with an `Ov:` report; other
///   reports carry them over
pub fn parse_status_report(line: &str, prior: &ControllerStatus) -> Option<ControllerStatus> {
    let body = line.trim().strip_prefix('<')?.strip_suffix('>')?;
    let mut parts = body.split('|');

    let head = parts.next()?;
    let (state_string, sub_state) = match head.split_once(':') {
        Some((state, sub)) => (state, Some(sub.to_string())),
        None => (head, None),
    };

    let mut mpos = None;
    let mut wpos = None;
    let mut wco = None;
    let mut units = None;
    let mut overrides = None;
    let mut pins = None;
    let mut accessories = None;
    let mut feed = None;
    let mut spindle = None;
    let mut buffer = None;

    for part in parts {
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        match key {
            "MPos" | "WPos" | "WCO" => {
                let unit = *units.get_or_insert_with(|| units_from_precision(value));
                let position = parse_position(value, unit)?;
                match key {
                    "MPos" => mpos = Some(position),
                    "WPos" => wpos = Some(position),
                    _ => wco = Some(position),
                }
            }
            "Ov" => {
                let values = parse_numbers(value);
                overrides = Some(match values[..] {
                    [feed, rapid, spindle] => OverridePercents {
                        feed: feed as u16,
                        rapid: rapid as u16,
                        spindle: spindle as u16,
                    },
                    _ => OverridePercents::default(),
                });
            }
            "F" => feed = value.trim().parse::<f64>().ok(),
            "FS" => {
                let values = parse_numbers(value);
                feed = values.first().copied();
                spindle = values.get(1).copied();
            }
            "Pn" => pins = Some(EnabledPins::from_letters(value)),
            "A" => accessories = Some(AccessoryStates::from_letters(value)),
            "Bf" => {
                if let [blocks, bytes] = parse_numbers(value)[..] {
                    buffer = Some(BufferState {
                        planner_blocks: blocks as u16,
                        rx_bytes: bytes as u16,
                    });
                }
            }
            _ => {}
        }
    }

    let units = units.unwrap_or(Units::MM);
    let wco = wco
        .or_else(|| prior.work_coordinate_offset())
        .unwrap_or_else(|| Position::zero(units));

    let mut builder = ControllerStatus::builder()
        .state(state_from_string(state_string))
        .state_string(state_string)
        .sub_state(sub_state)
        .work_coordinate_offset(wco);

    if let Some(mpos) = mpos {
        builder = builder.machine_coord(mpos);
    }
    if let Some(wpos) = wpos {
        builder = builder.work_coord(wpos);
    }
    builder = builder.derive_missing_coordinates();

    if let Some(feed) = feed {
        builder = builder.feed_speed(feed, units);
    }
    if let Some(spindle) = spindle {
        builder = builder.spindle_speed(spindle);
    }
    if let Some(buffer) = buffer {
        builder = builder.buffer(buffer);
    }

    match overrides {
        Some(overrides) => {
            builder = builder
                .overrides(overrides)
                .enabled_pins(pins.unwrap_or_default())
                .accessory_states(accessories.unwrap_or_default());
        }
        None => {
            if let Some(prior_overrides) = prior.overrides() {
                builder = builder.overrides(prior_overrides);
            }
            builder = builder
                .enabled_pins(prior.enabled_pins())
                .accessory_states(prior.accessory_states());
        }
    }

    Some(builder.build())
}

/// GRBL prints three decimals in millimeter mode and four in inch mode
fn units_from_precision(coords: &str) -> Units {
    let first = coords.split(',').next().unwrap_or_default();
    match first.split_once('.') {
        Some((_, decimals)) if decimals.len() == 3 => Units::MM,
        Some(_) => Units::INCH,
        None => Units::MM,
    }
}

fn parse_position(value: &str, unit: Units) -> Option<Position> {
    let coords = parse_numbers(value);
    if coords.len() < 3 {
        return None;
    }
    Some(Position::new(coords[0], coords[1], coords[2], unit))
}

fn parse_numbers(value: &str) -> Vec<f64> {
    value
        .split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect()
}

/// Expand a numeric `error:<code>` payload with its description
fn describe_error_text(message: &str) -> String {
    match message.trim().parse::<u32>().ok().and_then(describe_error) {
        Some(description) => format!("{} ({})", message.trim(), description),
        None => message.to_string(),
    }
}

/// Short description of a GRBL error code
pub fn describe_error(code: u32) -> Option<&'static str> {
    let text = match code {
        1 => "Expected command letter",
        2 => "Bad number format",
        3 => "Invalid statement",
        4 => "Negative value",
        5 => "Homing not enabled",
        6 => "Step pulse too short",
        7 => "EEPROM read failed",
        8 => "Not idle",
        9 => "Locked by alarm or jog",
        10 => "Soft limits need homing",
        11 => "Line too long",
        12 => "Step rate exceeded",
        13 => "Safety door open",
        14 => "Startup line too long",
        15 => "Jog travel exceeded",
        16 => "Invalid jog command",
        17 => "Laser mode needs PWM",
        20 => "Unsupported command",
        21 => "Modal group violation",
        22 => "Undefined feed rate",
        23 => "Integer value required",
        24 => "Axis command conflict",
        25 => "Repeated word",
        26 => "No axis words",
        27 => "Invalid line number",
        28 => "Missing value word",
        29 => "Unsupported coordinate system",
        30 => "G53 needs G0 or G1",
        31 => "Unused axis words",
        32 => "Arc without axis words",
        33 => "Invalid motion target",
        34 => "Arc radius error",
        35 => "Arc offset missing",
        36 => "Unused words",
        37 => "Tool offset axis error",
        38 => "Tool number too large",
        _ => return None,
    };
    Some(text)
}

/// Short description of a GRBL alarm code
pub fn describe_alarm(code: u32) -> Option<&'static str> {
    let text = match code {
        1 => "Hard limit triggered",
        2 => "Soft limit exceeded",
        3 => "Reset while in motion",
        4 => "Probe fail, initial state",
        5 => "Probe fail, no contact",
        6 => "Homing fail, reset during cycle",
        7 => "Homing fail, door opened",
        8 => "Homing fail, pull off",
        9 => "Homing fail, switch not found",
        10 => "Homing fail, second switch",
        _ => return None,
    };
    Some(text)
}
