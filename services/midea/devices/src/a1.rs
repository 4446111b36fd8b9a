//! Dehumidifier (family 0xA1) codec.
//!
//! Status bodies (0xC8 replies, 0xA0 notifications) are fixed-offset:
//!
//! ```text
//! byte  1: power (bit 0)        byte 10: tank level (bits 0-6)
//! byte  2: mode (bits 0-3)      byte 15: water level set point
//! byte  3: fan speed (bits 0-6) byte 16: current humidity
//! byte  7: target humidity      byte 17: temperature, (v - 50) / 2
//! byte  8: child lock (bit 7)   byte 19: swing (bit 5)
//! byte  9: anion (bit 6)
//! ```
//!
//! Outgoing bodies end with the message serial and a CRC-8.

use midea_session::{
    AttributeMap, AttributeValue, CodecError, Command, DeviceKind, MessageSerial, SetAction,
};
use midea_wire::{
    crc8, pack_record, parse_records, MessageRequest, MessageResponse, MessageType, RecordWidth,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Family code
pub const DEVICE_TYPE: u8 = 0xA1;

/// New-protocol tag of the display light
pub const LIGHT_TAG: u16 = 0x005B;

const QUERY_BODY_TYPE: u8 = 0x41;
const SET_BODY_TYPE: u8 = 0x48;
const NEW_PROTOCOL_SET_BODY_TYPE: u8 = 0xB0;
const NEW_PROTOCOL_QUERY_BODY_TYPE: u8 = 0xB1;
const NEW_PROTOCOL_BODY_TYPES: [u8; 3] = [0xB0, 0xB1, 0xB5];
const NOTIFY_BODY_TYPE: u8 = 0xA0;

const MIN_TARGET_HUMIDITY: u8 = 35;
const MIN_FAN_SPEED: u8 = 5;
const STATUS_BODY_LENGTH: usize = 20;

const DEFAULT_MODE: u8 = 1;
const DEFAULT_FAN_SPEED: u8 = 40;

const DEFAULT_MODES: [(u8, &str); 5] = [
    (1, "Manual"),
    (2, "Continuous"),
    (3, "Auto"),
    (4, "Clothes-Dry"),
    (5, "Shoes-Dry"),
];

const DEFAULT_SPEEDS: [(u8, &str); 6] = [
    (1, "Lowest"),
    (40, "Low"),
    (60, "Medium"),
    (80, "High"),
    (102, "Auto"),
    (127, "Off"),
];

/// Accepted water level set points
pub const WATER_LEVEL_SETS: [&str; 4] = ["25", "50", "75", "100"];

/// Attribute names
pub mod attr {
    /// Power switch
    pub const POWER: &str = "power";
    /// Beep on commands (local only)
    pub const PROMPT_TONE: &str = "prompt_tone";
    /// Child lock
    pub const CHILD_LOCK: &str = "child_lock";
    /// Operating mode name
    pub const MODE: &str = "mode";
    /// Fan speed name
    pub const FAN_SPEED: &str = "fan_speed";
    /// Swing
    pub const SWING: &str = "swing";
    /// Target humidity, percent
    pub const TARGET_HUMIDITY: &str = "target_humidity";
    /// Anion generator
    pub const ANION: &str = "anion";
    /// Tank level
    pub const TANK: &str = "tank";
    /// Water level set point, as text
    pub const WATER_LEVEL_SET: &str = "water_level_set";
    /// Tank level reached the set point
    pub const TANK_FULL: &str = "tank_full";
    /// Current humidity, percent
    pub const CURRENT_HUMIDITY: &str = "current_humidity";
    /// Current temperature, °C
    pub const CURRENT_TEMPERATURE: &str = "current_temperature";
    /// Filter needs cleaning
    pub const FILTER_CLEANING_REMINDER: &str = "filter_cleaning_reminder";
    /// Display light
    pub const LIGHT: &str = "light";
}

/// Decoded 0xC8/0xA0 status body
#[derive(Debug, Clone, PartialEq)]
pub struct A1GeneralBody {
    /// Power switch
    pub power: bool,
    /// Mode code
    pub mode: u8,
    /// Fan speed code
    pub fan_speed: u8,
    /// Target humidity, clamped to at least 35
    pub target_humidity: u8,
    /// Child lock
    pub child_lock: bool,
    /// Anion generator
    pub anion: bool,
    /// Tank level
    pub tank: u8,
    /// Water level set point
    pub water_level_set: u8,
    /// Current humidity
    pub current_humidity: u8,
    /// Current temperature
    pub current_temperature: f64,
    /// Swing
    pub swing: bool,
}

impl A1GeneralBody {
    /// Decode a body starting with its body type byte
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < STATUS_BODY_LENGTH {
            return Err(CodecError::Truncated {
                needed: STATUS_BODY_LENGTH,
                actual: body.len(),
            });
        }

        let mut fan_speed = body[3] & 0x7F;
        if fan_speed < MIN_FAN_SPEED {
            fan_speed = 1;
        }

        Ok(Self {
            power: body[1] & 0x01 > 0,
            mode: body[2] & 0x0F,
            fan_speed,
            target_humidity: body[7].max(MIN_TARGET_HUMIDITY),
            child_lock: body[8] & 0x80 > 0,
            anion: body[9] & 0x40 > 0,
            tank: body[10] & 0x7F,
            water_level_set: body[15],
            current_humidity: body[16],
            current_temperature: (body[17] as f64 - 50.0) / 2.0,
            swing: body[19] & 0x20 > 0,
        })
    }
}

/// Fields of the 0x48 set body
#[derive(Debug, Clone, PartialEq, Eq)]
struct A1SetBody {
    power: bool,
    prompt_tone: bool,
    mode: u8,
    fan_speed: u8,
    target_humidity: u8,
    child_lock: bool,
    anion: bool,
    swing: bool,
    water_level_set: u8,
}

impl A1SetBody {
    fn encode(&self) -> Vec<u8> {
        let prompt_tone = if self.prompt_tone { 0x40 } else { 0 };
        let mut payload = vec![0u8; 20];
        payload[0] = self.power as u8 | prompt_tone | 0x02;
        payload[1] = self.mode;
        payload[2] = self.fan_speed;
        payload[6] = self.target_humidity;
        payload[7] = if self.child_lock { 0x80 } else { 0 };
        payload[8] = if self.anion { 0x40 } else { 0 };
        payload[9] = if self.swing { 0x08 } else { 0 };
        payload[12] = self.water_level_set;
        payload
    }
}

/// Mode and fan speed names overriding the defaults
#[derive(Debug, Default, Deserialize)]
struct Customize {
    #[serde(default)]
    speeds: Option<BTreeMap<String, String>>,
    #[serde(default)]
    modes: Option<BTreeMap<String, String>>,
}

/// Last known dehumidifier state
#[derive(Debug, Clone, PartialEq)]
struct A1State {
    power: bool,
    prompt_tone: bool,
    child_lock: bool,
    mode: Option<String>,
    fan_speed: Option<String>,
    swing: bool,
    target_humidity: u8,
    anion: bool,
    tank: u8,
    water_level_set: u8,
    tank_full: Option<bool>,
    current_humidity: Option<u8>,
    current_temperature: Option<f64>,
    filter_cleaning_reminder: bool,
    light: Option<bool>,
}

impl Default for A1State {
    fn default() -> Self {
        Self {
            power: false,
            prompt_tone: true,
            child_lock: false,
            mode: None,
            fan_speed: Some("Medium".to_string()),
            swing: false,
            target_humidity: MIN_TARGET_HUMIDITY,
            anion: false,
            tank: 0,
            water_level_set: 50,
            tank_full: None,
            current_humidity: None,
            current_temperature: None,
            filter_cleaning_reminder: false,
            light: None,
        }
    }
}

impl A1State {
    fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new();
        map.insert(attr::POWER.into(), self.power.into());
        map.insert(attr::PROMPT_TONE.into(), self.prompt_tone.into());
        map.insert(attr::CHILD_LOCK.into(), self.child_lock.into());
        map.insert(attr::MODE.into(), self.mode.clone().into());
        map.insert(attr::FAN_SPEED.into(), self.fan_speed.clone().into());
        map.insert(attr::SWING.into(), self.swing.into());
        map.insert(attr::TARGET_HUMIDITY.into(), self.target_humidity.into());
        map.insert(attr::ANION.into(), self.anion.into());
        map.insert(attr::TANK.into(), self.tank.into());
        map.insert(
            attr::WATER_LEVEL_SET.into(),
            self.water_level_set.to_string().into(),
        );
        map.insert(attr::TANK_FULL.into(), self.tank_full.into());
        map.insert(attr::CURRENT_HUMIDITY.into(), self.current_humidity.into());
        map.insert(attr::CURRENT_TEMPERATURE.into(), self.current_temperature.into());
        map.insert(
            attr::FILTER_CLEANING_REMINDER.into(),
            self.filter_cleaning_reminder.into(),
        );
        if let Some(light) = self.light {
            map.insert(attr::LIGHT.into(), light.into());
        }
        map
    }
}

/// Dehumidifier codec
#[derive(Debug)]
pub struct A1Dehumidifier {
    serial: Arc<MessageSerial>,
    state: A1State,
    modes: BTreeMap<u8, String>,
    speeds: BTreeMap<u8, String>,
}

impl A1Dehumidifier {
    /// Codec with the default mode and fan speed names
    pub fn new(serial: Arc<MessageSerial>) -> Self {
        Self {
            serial,
            state: A1State::default(),
            modes: DEFAULT_MODES
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
            speeds: DEFAULT_SPEEDS
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        }
    }

    /// Replace mode and/or fan speed names from a JSON object such as
    /// `{"speeds": {"1": "Silent", "60": "Normal"}}`
    pub fn set_customize(&mut self, customize: &str) -> Result<(), CodecError> {
        if customize.trim().is_empty() {
            return Ok(());
        }

        let invalid = |value: String| CodecError::InvalidValue {
            attribute: "customize".to_string(),
            value,
        };
        let params: Customize =
            serde_json::from_str(customize).map_err(|e| invalid(e.to_string()))?;

        let to_codes = |names: BTreeMap<String, String>| {
            names
                .into_iter()
                .map(|(k, v)| k.trim().parse::<u8>().map(|k| (k, v)).map_err(|_| invalid(k)))
                .collect::<Result<BTreeMap<u8, String>, CodecError>>()
        };

        self.speeds = match params.speeds {
            Some(speeds) => to_codes(speeds)?,
            None => DEFAULT_SPEEDS
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        };
        if let Some(modes) = params.modes {
            self.modes = to_codes(modes)?;
        }
        Ok(())
    }

    /// Mode names in code order
    pub fn modes(&self) -> Vec<&str> {
        self.modes.values().map(String::as_str).collect()
    }

    /// Fan speed names in code order
    pub fn fan_speeds(&self) -> Vec<&str> {
        self.speeds.values().map(String::as_str).collect()
    }

    fn frame_body(&self, body_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(payload.len() + 3);
        body.push(body_type);
        body.extend_from_slice(payload);
        body.push(self.serial.next());
        body.push(crc8(&body));
        body
    }

    fn query(&self, protocol_version: u8) -> MessageRequest {
        let mut payload = vec![0u8; 19];
        payload[0] = 0x81;
        payload[2] = 0xFF;
        MessageRequest::new(
            DEVICE_TYPE,
            protocol_version,
            MessageType::Query,
            self.frame_body(QUERY_BODY_TYPE, &payload),
        )
    }

    fn light_query(&self, protocol_version: u8) -> MessageRequest {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&LIGHT_TAG.to_le_bytes());
        MessageRequest::new(
            DEVICE_TYPE,
            protocol_version,
            MessageType::Query,
            self.frame_body(NEW_PROTOCOL_QUERY_BODY_TYPE, &payload),
        )
    }

    fn light_set(&self, light: bool, protocol_version: u8) -> Result<MessageRequest, CodecError> {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&pack_record(LIGHT_TAG, &[light as u8], RecordWidth::Narrow)?);
        Ok(MessageRequest::new(
            DEVICE_TYPE,
            protocol_version,
            MessageType::Set,
            self.frame_body(NEW_PROTOCOL_SET_BODY_TYPE, &payload),
        ))
    }

    fn code_of(table: &BTreeMap<u8, String>, name: Option<&str>) -> Option<u8> {
        let name = name?;
        table.iter().find(|(_, v)| v.as_str() == name).map(|(k, _)| *k)
    }

    /// Set body reflecting the current state
    fn current_set_body(&self) -> A1SetBody {
        A1SetBody {
            power: self.state.power,
            prompt_tone: self.state.prompt_tone,
            mode: Self::code_of(&self.modes, self.state.mode.as_deref()).unwrap_or(DEFAULT_MODE),
            fan_speed: Self::code_of(&self.speeds, self.state.fan_speed.as_deref())
                .unwrap_or(DEFAULT_FAN_SPEED),
            target_humidity: self.state.target_humidity,
            child_lock: self.state.child_lock,
            anion: self.state.anion,
            swing: self.state.swing,
            water_level_set: self.state.water_level_set,
        }
    }

    fn apply_general(&mut self, body: A1GeneralBody) -> AttributeMap {
        let state = &mut self.state;
        state.power = body.power;
        state.mode = self.modes.get(&body.mode).cloned();
        state.fan_speed = self.speeds.get(&body.fan_speed).cloned();
        state.target_humidity = body.target_humidity;
        state.child_lock = body.child_lock;
        state.anion = body.anion;
        state.tank = body.tank;
        state.water_level_set = body.water_level_set;
        state.current_humidity = Some(body.current_humidity);
        state.current_temperature = Some(body.current_temperature);
        state.swing = body.swing;

        let mut changes = state.to_attributes();
        changes.remove(attr::PROMPT_TONE);
        changes.remove(attr::FILTER_CLEANING_REMINDER);
        changes.remove(attr::TANK_FULL);
        changes.remove(attr::LIGHT);

        let tank_full = state.tank > 0 && state.tank >= state.water_level_set;
        debug!(
            "Tank: {}, water level: {}, tank full: {}",
            state.tank, state.water_level_set, tank_full
        );
        if state.tank_full != Some(tank_full) {
            state.tank_full = Some(tank_full);
            changes.insert(attr::TANK_FULL.into(), tank_full.into());
        }
        changes
    }

    fn apply_new_protocol(&mut self, body: &[u8]) -> AttributeMap {
        let mut changes = AttributeMap::new();
        let records = parse_records(body);
        if let Some(value) = records.get(&LIGHT_TAG).and_then(|v| v.first()) {
            let light = *value > 0;
            self.state.light = Some(light);
            changes.insert(attr::LIGHT.into(), light.into());
        }
        changes
    }
}

fn expect_bool(name: &str, value: &AttributeValue) -> Result<bool, CodecError> {
    value.as_bool().ok_or_else(|| invalid_value(name, value))
}

fn expect_text<'a>(name: &str, value: &'a AttributeValue) -> Result<&'a str, CodecError> {
    value.as_str().ok_or_else(|| invalid_value(name, value))
}

fn invalid_value(name: &str, value: &AttributeValue) -> CodecError {
    CodecError::InvalidValue {
        attribute: name.to_string(),
        value: value.to_string(),
    }
}

impl DeviceKind for A1Dehumidifier {
    fn device_type(&self) -> u8 {
        DEVICE_TYPE
    }

    fn initial_attributes(&self) -> AttributeMap {
        self.state.to_attributes()
    }

    fn build_query(&self, protocol_version: u8) -> Vec<Command> {
        vec![Command::new("query", self.query(protocol_version))]
    }

    fn capabilities_query(&self, protocol_version: u8) -> Vec<Command> {
        vec![Command::new(
            "new_protocol_query",
            self.light_query(protocol_version),
        )]
    }

    fn process_message(&mut self, response: &MessageResponse) -> Result<AttributeMap, CodecError> {
        let message_type = MessageType::try_from(response.message_type()).ok();
        let body_type = response.body_type();

        match (message_type, body_type) {
            (
                Some(MessageType::Query | MessageType::Set | MessageType::Notify1),
                Some(body_type),
            ) if NEW_PROTOCOL_BODY_TYPES.contains(&body_type) => {
                Ok(self.apply_new_protocol(&response.body))
            }
            (Some(MessageType::Query | MessageType::Set | MessageType::Notify1), _)
            | (Some(MessageType::Notify2), Some(NOTIFY_BODY_TYPE)) => {
                let body = A1GeneralBody::parse(&response.body)?;
                Ok(self.apply_general(body))
            }
            _ => Ok(AttributeMap::new()),
        }
    }

    fn set_attribute(
        &mut self,
        name: &str,
        value: &AttributeValue,
        protocol_version: u8,
    ) -> Result<SetAction, CodecError> {
        let mut set = self.current_set_body();

        match name {
            attr::PROMPT_TONE => {
                let prompt_tone = expect_bool(name, value)?;
                self.state.prompt_tone = prompt_tone;
                let mut changes = AttributeMap::new();
                changes.insert(attr::PROMPT_TONE.into(), prompt_tone.into());
                return Ok(SetAction::Local(changes));
            }
            attr::LIGHT => {
                let light = expect_bool(name, value)?;
                return Ok(SetAction::Send(self.light_set(light, protocol_version)?));
            }
            attr::POWER => set.power = expect_bool(name, value)?,
            attr::CHILD_LOCK => set.child_lock = expect_bool(name, value)?,
            attr::SWING => set.swing = expect_bool(name, value)?,
            attr::ANION => set.anion = expect_bool(name, value)?,
            attr::MODE => {
                set.mode = Self::code_of(&self.modes, Some(expect_text(name, value)?))
                    .ok_or_else(|| invalid_value(name, value))?;
            }
            attr::FAN_SPEED => {
                set.fan_speed = Self::code_of(&self.speeds, Some(expect_text(name, value)?))
                    .ok_or_else(|| invalid_value(name, value))?;
            }
            attr::TARGET_HUMIDITY => {
                set.target_humidity = value
                    .as_i64()
                    .and_then(|v| u8::try_from(v).ok())
                    .filter(|v| *v <= 100)
                    .ok_or_else(|| invalid_value(name, value))?;
            }
            attr::WATER_LEVEL_SET => {
                let level = value.to_string();
                if !WATER_LEVEL_SETS.contains(&level.as_str()) {
                    return Err(invalid_value(name, value));
                }
                set.water_level_set = level
                    .parse()
                    .map_err(|_| invalid_value(name, value))?;
            }
            _ => {
                warn!("Attribute {} cannot be set on a dehumidifier", name);
                return Err(CodecError::UnknownAttribute(name.to_string()));
            }
        }

        Ok(SetAction::Send(MessageRequest::new(
            DEVICE_TYPE,
            protocol_version,
            MessageType::Set,
            self.frame_body(SET_BODY_TYPE, &set.encode()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> A1Dehumidifier {
        A1Dehumidifier::new(Arc::new(MessageSerial::new()))
    }

    fn response(message_type: MessageType, body: Vec<u8>) -> MessageResponse {
        let envelope = MessageRequest::new(DEVICE_TYPE, 2, message_type, body)
            .serialize()
            .unwrap();
        MessageResponse::parse(&envelope).unwrap()
    }

    fn status_body() -> Vec<u8> {
        let mut body = vec![0u8; 22];
        body[0] = 0xC8;
        body[1] = 0x01;
        body[2] = 0x03;
        body[3] = 60;
        body[7] = 50;
        body[8] = 0x80;
        body[9] = 0x40;
        body[10] = 50;
        body[15] = 50;
        body[16] = 55;
        body[17] = 100;
        body[19] = 0x20;
        body
    }

    #[test]
    fn test_query_body() {
        let codec = codec();
        let queries = codec.build_query(3);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].class, "query");

        let request = &queries[0].request;
        assert_eq!(request.message_type, 0x03);
        assert_eq!(request.protocol_version, 3);

        let mut expected = vec![0x41, 0x81, 0x00, 0xFF];
        expected.extend_from_slice(&[0u8; 16]);
        expected.extend_from_slice(&[0x01, 0xAB]);
        assert_eq!(&request.body[..], &expected[..]);

        // serial advances per message
        assert_eq!(codec.build_query(3)[0].request.body[20], 0x02);
    }

    #[test]
    fn test_light_query_body() {
        let codec = codec();
        let queries = codec.capabilities_query(0);
        assert_eq!(&queries[0].request.body[..], &[0xB1, 0x01, 0x5B, 0x00, 0x01, 0xE9]);
    }

    #[test]
    fn test_parse_status() {
        let mut codec = codec();
        let changes = codec
            .process_message(&response(MessageType::Query, status_body()))
            .unwrap();

        assert_eq!(changes[attr::POWER], AttributeValue::Bool(true));
        assert_eq!(changes[attr::MODE], AttributeValue::Text("Auto".into()));
        assert_eq!(changes[attr::FAN_SPEED], AttributeValue::Text("Medium".into()));
        assert_eq!(changes[attr::TARGET_HUMIDITY], AttributeValue::Int(50));
        assert_eq!(changes[attr::CHILD_LOCK], AttributeValue::Bool(true));
        assert_eq!(changes[attr::ANION], AttributeValue::Bool(true));
        assert_eq!(changes[attr::TANK], AttributeValue::Int(50));
        assert_eq!(changes[attr::WATER_LEVEL_SET], AttributeValue::Text("50".into()));
        assert_eq!(changes[attr::CURRENT_HUMIDITY], AttributeValue::Int(55));
        assert_eq!(changes[attr::CURRENT_TEMPERATURE], AttributeValue::Float(25.0));
        assert_eq!(changes[attr::SWING], AttributeValue::Bool(true));
        assert_eq!(changes[attr::TANK_FULL], AttributeValue::Bool(true));
        assert!(!changes.contains_key(attr::PROMPT_TONE));

        // tank_full only reported when it changes
        let changes = codec
            .process_message(&response(MessageType::Notify1, status_body()))
            .unwrap();
        assert!(!changes.contains_key(attr::TANK_FULL));
    }

    #[test]
    fn test_parse_status_clamps() {
        let mut codec = codec();
        let mut body = status_body();
        body[2] = 0x09;
        body[3] = 0x83;
        body[7] = 20;
        body[10] = 0;

        let changes = codec
            .process_message(&response(MessageType::Notify2, {
                body[0] = 0xA0;
                body
            }))
            .unwrap();

        assert_eq!(changes[attr::MODE], AttributeValue::Null);
        assert_eq!(changes[attr::FAN_SPEED], AttributeValue::Text("Lowest".into()));
        assert_eq!(changes[attr::TARGET_HUMIDITY], AttributeValue::Int(35));
        assert_eq!(changes[attr::TANK_FULL], AttributeValue::Bool(false));
    }

    #[test]
    fn test_parse_truncated_and_ignored() {
        let mut codec = codec();
        assert_eq!(
            codec.process_message(&response(MessageType::Query, vec![0xC8, 0x01])),
            Err(CodecError::Truncated {
                needed: 20,
                actual: 2
            })
        );

        let ignored = codec
            .process_message(&response(MessageType::Notify2, status_body()))
            .unwrap();
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_parse_light() {
        let mut codec = codec();
        let changes = codec
            .process_message(&response(
                MessageType::Notify1,
                vec![0xB1, 0x01, 0x5B, 0x00, 0x00, 0x01, 0x01],
            ))
            .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[attr::LIGHT], AttributeValue::Bool(true));
    }

    #[test]
    fn test_set_power() {
        let mut codec = codec();
        let action = codec
            .set_attribute(attr::POWER, &AttributeValue::Bool(true), 2)
            .unwrap();
        let SetAction::Send(request) = action else {
            panic!("expected a request");
        };

        assert_eq!(request.message_type, 0x02);
        let body = &request.body;
        assert_eq!(body.len(), 23);
        assert_eq!(body[0], 0x48);
        assert_eq!(body[1], 0x01 | 0x40 | 0x02);
        assert_eq!(body[2], 1);
        assert_eq!(body[3], 60);
        assert_eq!(body[7], 35);
        assert_eq!(body[13], 50);
        assert_eq!(body[21], 0x01);
        assert_eq!(body[22], crc8(&body[..22]));
    }

    #[test]
    fn test_set_uses_current_state() {
        let mut codec = codec();
        codec
            .process_message(&response(MessageType::Query, status_body()))
            .unwrap();

        let SetAction::Send(request) = codec
            .set_attribute(attr::FAN_SPEED, &AttributeValue::from("High"), 2)
            .unwrap()
        else {
            panic!("expected a request");
        };
        let body = &request.body;
        assert_eq!(body[1], 0x01 | 0x40 | 0x02);
        assert_eq!(body[2], 3);
        assert_eq!(body[3], 80);
        assert_eq!(body[7], 50);
        assert_eq!(body[8], 0x80);
        assert_eq!(body[9], 0x40);
        assert_eq!(body[10], 0x08);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut codec = codec();
        assert!(matches!(
            codec.set_attribute(attr::MODE, &AttributeValue::from("Turbo"), 2),
            Err(CodecError::InvalidValue { .. })
        ));
        assert!(matches!(
            codec.set_attribute(attr::WATER_LEVEL_SET, &AttributeValue::from("60"), 2),
            Err(CodecError::InvalidValue { .. })
        ));
        assert!(matches!(
            codec.set_attribute(attr::POWER, &AttributeValue::Int(1), 2),
            Err(CodecError::InvalidValue { .. })
        ));
        assert_eq!(
            codec.set_attribute("tank", &AttributeValue::Int(1), 2),
            Err(CodecError::UnknownAttribute("tank".into()))
        );
    }

    #[test]
    fn test_set_water_level_accepts_int() {
        let mut codec = codec();
        let SetAction::Send(request) = codec
            .set_attribute(attr::WATER_LEVEL_SET, &AttributeValue::Int(75), 2)
            .unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(request.body[13], 75);
    }

    #[test]
    fn test_prompt_tone_is_local() {
        let mut codec = codec();
        let action = codec
            .set_attribute(attr::PROMPT_TONE, &AttributeValue::Bool(false), 2)
            .unwrap();

        let mut expected = AttributeMap::new();
        expected.insert(attr::PROMPT_TONE.into(), false.into());
        assert_eq!(action, SetAction::Local(expected));

        let SetAction::Send(request) = codec
            .set_attribute(attr::POWER, &AttributeValue::Bool(false), 2)
            .unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(request.body[1], 0x02);
    }

    #[test]
    fn test_set_light() {
        let mut codec = codec();
        let SetAction::Send(request) = codec
            .set_attribute(attr::LIGHT, &AttributeValue::Bool(true), 2)
            .unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(
            &request.body[..],
            &[0xB0, 0x01, 0x5B, 0x00, 0x01, 0x01, 0x01, 0x60]
        );
    }

    #[test]
    fn test_customize() {
        let mut codec = codec();
        codec
            .set_customize(r#"{"speeds": {"1": "Silent", "60": "Normal"}, "modes": {"3": "Smart"}}"#)
            .unwrap();
        assert_eq!(codec.fan_speeds(), vec!["Silent", "Normal"]);
        assert_eq!(codec.modes(), vec!["Smart"]);

        let changes = codec
            .process_message(&response(MessageType::Query, status_body()))
            .unwrap();
        assert_eq!(changes[attr::MODE], AttributeValue::Text("Smart".into()));
        assert_eq!(changes[attr::FAN_SPEED], AttributeValue::Text("Normal".into()));

        assert!(codec.set_customize(r#"{"speeds": {"x": "Bad"}}"#).is_err());
        assert!(codec.set_customize("not json").is_err());
    }

    #[test]
    fn test_initial_attributes() {
        let attributes = codec().initial_attributes();
        assert_eq!(attributes[attr::PROMPT_TONE], AttributeValue::Bool(true));
        assert_eq!(attributes[attr::FAN_SPEED], AttributeValue::Text("Medium".into()));
        assert_eq!(attributes[attr::WATER_LEVEL_SET], AttributeValue::Text("50".into()));
        assert_eq!(attributes[attr::TANK_FULL], AttributeValue::Null);
        assert_eq!(attributes[attr::MODE], AttributeValue::Null);
    }
}
