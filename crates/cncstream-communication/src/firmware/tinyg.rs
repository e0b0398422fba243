//! TinyG adapter
//!
//! TinyG speaks JSON. Every command is answered with an `{"r":{..},"f":[..]}`
//! envelope whose footer carries a status code (0 on success), and status
//! reports arrive as `{"sr":{..}}` objects holding only the fields that
//! changed.

use super::{ControllerType, FirmwareAdapter, FirmwareSetting, QuerySpec, ResponseKind};
use cncstream_core::{ControllerState, ControllerStatus, Position, Units};
use serde_json::{Map, Value};

/// TinyG serial RX buffer, less a little headroom
pub const TINYG_BUFFER_SIZE: usize = 254;

const STATUS_REQUEST: &[u8] = b"?";
const FEED_HOLD: &[u8] = b"!";
const CYCLE_START: &[u8] = b"~";
const QUEUE_FLUSH: &[u8] = b"%";
const RESET: &[u8] = &[0x18];

/// Adapter for TinyG and g2core in JSON mode
#[derive(Debug, Clone, Default)]
pub struct TinyGAdapter;

impl TinyGAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn parse_json(line: &str) -> Option<Map<String, Value>> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Status code from the `f` footer, which newer firmware puts at the top
/// level and older firmware inside `r`
fn footer_status(envelope: &Map<String, Value>) -> Option<i64> {
    let footer = envelope
        .get("f")
        .or_else(|| envelope.get("r").and_then(|r| r.get("f")))?;
    footer.as_array()?.get(1)?.as_i64()
}

impl FirmwareAdapter for TinyGAdapter {
    fn controller_type(&self) -> ControllerType {
        ControllerType::TinyG
    }

    fn buffer_size(&self) -> usize {
        TINYG_BUFFER_SIZE
    }

    fn classify(&self, line: &str) -> ResponseKind {
        let Some(envelope) = parse_json(line) else {
            return ResponseKind::Message;
        };

        if envelope.contains_key("r") {
            return match footer_status(&envelope) {
                Some(0) | None => ResponseKind::Ok,
                Some(code) => ResponseKind::Error(format!("status {}", code)),
            };
        }

        if matches!(envelope.get("sr"), Some(Value::Object(_))) {
            return ResponseKind::Status;
        }

        ResponseKind::Message
    }

    fn parse_status(&self, line: &str, prior: &ControllerStatus) -> Option<ControllerStatus> {
        let envelope = parse_json(line)?;
        let report = envelope.get("sr")?.as_object()?;
        Some(merge_status_report(report, prior))
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

    /// Queue flush discards the planner once the hold has settled
    fn after_cancel_bytes(&self) -> &[u8] {
        QUEUE_FLUSH
    }

    fn reset_bytes(&self) -> &[u8] {
        RESET
    }

    fn unlock_command(&self) -> &str {
        r#"{"clear":n}"#
    }

    fn settings_query(&self) -> QuerySpec {
        QuerySpec::new(
            r#"{"sys":n}"#,
            |line| {
                parse_json(line).is_some_and(|envelope| {
                    envelope
                        .get("r")
                        .and_then(|r| r.get("sys"))
                        .is_some_and(Value::is_object)
                })
            },
            |line| parse_json(line).is_some_and(|envelope| envelope.contains_key("r")),
        )
    }

    fn parse_settings(&self, lines: &[String]) -> Vec<FirmwareSetting> {
        let mut settings = Vec::new();
        for envelope in lines.iter().filter_map(|line| parse_json(line)) {
            let Some(Value::Object(response)) = envelope.get("r") else {
                continue;
            };
            for (group, values) in response {
                let Value::Object(values) = values else {
                    continue;
                };
                for (name, value) in values {
                    let id = if group == "sys" {
                        name.clone()
                    } else {
                        format!("{}{}", group, name)
                    };
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    settings.push(FirmwareSetting::new(id, value));
                }
            }
        }
        settings
    }
}

/// Map a TinyG `stat` code to a controller state
pub fn state_from_code(code: i64) -> ControllerState {
    match code {
        1 | 3 | 4 => ControllerState::Idle,
        2 | 13 => ControllerState::Alarm,
        5 => ControllerState::Run,
        6 => ControllerState::Hold,
        9 => ControllerState::Home,
        10 => ControllerState::Jog,
        _ => ControllerState::Unknown,
    }
}

fn number(report: &Map<String, Value>, key: &str) -> Option<f64> {
    report.get(key).and_then(Value::as_f64)
}

fn override_percent(report: &Map<String, Value>, key: &str) -> Option<u16> {
    number(report, key).map(|factor| (factor * 100.0).round() as u16)
}

/// Apply a partial `sr` report on top of the prior snapshot.
///
/// Work coordinates and the feed rate use the reported `unit`; machine
/// coordinates are always millimeters.
pub fn merge_status_report(report: &Map<String, Value>, prior: &ControllerStatus) -> ControllerStatus {
    let prior_work = prior.work_coord().unwrap_or_else(|| Position::zero(Units::MM));
    let units = match number(report, "unit") {
        Some(unit) if unit as i64 == 1 => Units::MM,
        Some(_) => Units::INCH,
        None => prior_work.unit,
    };

    let mut work = Position { unit: units, ..prior_work };
    if let Some(x) = number(report, "posx") {
        work.x = x;
    }
    if let Some(y) = number(report, "posy") {
        work.y = y;
    }
    if let Some(z) = number(report, "posz") {
        work.z = z;
    }

    let mut machine = prior
        .machine_coord()
        .map(|p| p.convert_to(Units::MM))
        .unwrap_or_else(|| Position::zero(Units::MM));
    if let Some(x) = number(report, "mpox") {
        machine.x = x;
    }
    if let Some(y) = number(report, "mpoy") {
        machine.y = y;
    }
    if let Some(z) = number(report, "mpoz") {
        machine.z = z;
    }

    let mut overrides = prior.overrides().unwrap_or_default();
    if let Some(feed) = override_percent(report, "mfo") {
        overrides.feed = feed;
    }
    if let Some(spindle) = override_percent(report, "sso") {
        overrides.spindle = spindle;
    }
    if let Some(rapid) = override_percent(report, "mto") {
        overrides.rapid = rapid;
    }

    let mut builder = prior
        .to_builder()
        .work_coord(work)
        .machine_coord(machine)
        .overrides(overrides);

    let feed_units = if report.contains_key("unit") {
        units
    } else {
        prior.feed_speed_units()
    };
    if let Some(velocity) = number(report, "vel").or(prior.feed_speed()) {
        builder = builder.feed_speed(velocity, feed_units);
    }

    if let Some(code) = report.get("stat").and_then(Value::as_i64) {
        let state = state_from_code(code);
        builder = builder.state(state).state_string(state.to_string());
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_footer() {
        let tinyg = TinyGAdapter::new();
        assert_eq!(tinyg.classify(r#"{"r":{"gc":"G0X1"},"f":[1,0,5]}"#), ResponseKind::Ok);
        assert_eq!(
            tinyg.classify(r#"{"r":{},"f":[1,108,4]}"#),
            ResponseKind::Error("status 108".to_string())
        );
        assert_eq!(tinyg.classify(r#"{"r":{"f":[1,0,5]}}"#), ResponseKind::Ok);
        assert_eq!(tinyg.classify(r#"{"sr":{"posx":1.0}}"#), ResponseKind::Status);
        assert_eq!(tinyg.classify("tinyg [mm] ok>"), ResponseKind::Message);
        assert_eq!(tinyg.classify(r#"{"er":{"st":204}}"#), ResponseKind::Message);
    }

    #[test]
    fn test_partial_report_merges_over_prior() {
        let tinyg = TinyGAdapter::new();
        let first = tinyg
            .parse_status(
                r#"{"sr":{"unit":1,"posx":1.0,"posy":2.0,"posz":3.0,"mpox":1.0,"vel":250,"stat":5}}"#,
                &ControllerStatus::disconnected(),
            )
            .unwrap();
        assert_eq!(first.state(), ControllerState::Run);
        assert_eq!(first.feed_speed(), Some(250.0));
        assert_eq!(first.work_coord().unwrap().unit, Units::MM);

        let second = tinyg
            .parse_status(r#"{"sr":{"posx":4.5,"stat":6,"mfo":1.2}}"#, &first)
            .unwrap();
        let wpos = second.work_coord().unwrap();
        assert_eq!((wpos.x, wpos.y, wpos.z), (4.5, 2.0, 3.0));
        assert_eq!(second.state(), ControllerState::Hold);
        assert_eq!(second.feed_speed(), Some(250.0));
        assert_eq!(second.overrides().unwrap().feed, 120);
        assert_eq!(second.machine_coord().unwrap().x, 1.0);
    }

    #[test]
    fn test_inch_units() {
        let tinyg = TinyGAdapter::new();
        let status = tinyg
            .parse_status(
                r#"{"sr":{"unit":0,"posx":1.0,"mpox":25.4}}"#,
                &ControllerStatus::disconnected(),
            )
            .unwrap();
        assert_eq!(status.work_coord().unwrap().unit, Units::INCH);
        assert_eq!(status.machine_coord().unwrap().unit, Units::MM);
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(state_from_code(1), ControllerState::Idle);
        assert_eq!(state_from_code(13), ControllerState::Alarm);
        assert_eq!(state_from_code(10), ControllerState::Jog);
        assert_eq!(state_from_code(7), ControllerState::Unknown);
    }

    #[test]
    fn test_settings_query() {
        let tinyg = TinyGAdapter::new();
        let query = tinyg.settings_query();
        let reply = r#"{"r":{"sys":{"fv":0.97,"jv":5}},"f":[1,0,10]}"#;
        assert!(query.is_match(reply));
        assert!(query.is_terminal(reply));
        assert!(!query.is_match(r#"{"r":{},"f":[1,0,4]}"#));

        let settings = tinyg.parse_settings(&[
            reply.to_string(),
            r#"{"r":{"x":{"vm":16000}},"f":[1,0,9]}"#.to_string(),
        ]);
        assert!(settings.contains(&FirmwareSetting::new("fv", "0.97")));
        assert!(settings.contains(&FirmwareSetting::new("xvm", "16000")));
    }
}
