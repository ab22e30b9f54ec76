//! Govee OpenAPI capability encoding.
//!
//! Maps attributes to the vendor's `(type, instance)` capability pairs and
//! decodes the JSON envelopes returned by the device list, device state and
//! device control endpoints.
//!
//! | Attribute | Instance | Wire value |
//! |-----------|----------|------------|
//! | `power` | `powerSwitch` | `1` / `0` |
//! | `brightness` | `brightness` | integer |
//! | `color` | `colorRgb` | packed `0xRRGGBB` |
//! | `color_temp` | `colorTemperatureK` | Kelvin |
//! | `segment_rgb` / `segment_brightness` | `segmentedColorRgb` / `segmentedBrightness` | `{"segment": [..], "rgb" \| "brightness": n}` |
//! | `gradient` / `nightlight` / `dreamview` / `warm_mist` | `*Toggle` | `1` / `0` |
//! | `nightlight_scene` | `nightlightScene` | option code |
//! | `work_mode` | `workMode` | `{"workMode": n, "modeValue": n}` |
//! | `music_*` | `musicMode` | `{"musicMode": n, "sensitivity": n, "autoColor": 0/1, "rgb": n}` |
//! | `temperature` / `humidity` | `sensor*` | number, read only |
//! | `air_quality` / `filter_life` | `airQuality` / `filterLifeTime` | number or label, read only |
//! | `online` | `online` | boolean, read only |

use govee_sync_core::{
    Attribute, AttributeValue, Capability, Command, DeviceDescriptor, ModeOption, Reported,
    ValueRange,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// `devices.capabilities.on_off`
pub const TYPE_ON_OFF: &str = "devices.capabilities.on_off";
/// `devices.capabilities.range`
pub const TYPE_RANGE: &str = "devices.capabilities.range";
/// `devices.capabilities.color_setting`
pub const TYPE_COLOR_SETTING: &str = "devices.capabilities.color_setting";
/// `devices.capabilities.segment_color_setting`
pub const TYPE_SEGMENT_COLOR: &str = "devices.capabilities.segment_color_setting";
/// `devices.capabilities.toggle`
pub const TYPE_TOGGLE: &str = "devices.capabilities.toggle";
/// `devices.capabilities.mode`
pub const TYPE_MODE: &str = "devices.capabilities.mode";
/// `devices.capabilities.work_mode`
pub const TYPE_WORK_MODE: &str = "devices.capabilities.work_mode";
/// `devices.capabilities.music_setting`
pub const TYPE_MUSIC: &str = "devices.capabilities.music_setting";
/// `devices.capabilities.property`
pub const TYPE_PROPERTY: &str = "devices.capabilities.property";
/// `devices.capabilities.online`
pub const TYPE_ONLINE: &str = "devices.capabilities.online";

/// Sensitivity sent when a music command does not name one.
const DEFAULT_MUSIC_SENSITIVITY: u32 = 100;

/// Vendor instance name for an attribute.
#[must_use]
pub fn instance_for(attribute: Attribute) -> &'static str {
    match attribute {
        Attribute::Power => "powerSwitch",
        Attribute::Color => "colorRgb",
        Attribute::ColorTemp => "colorTemperatureK",
        Attribute::Brightness => "brightness",
        Attribute::SegmentColor => "segmentedColorRgb",
        Attribute::SegmentBrightness => "segmentedBrightness",
        Attribute::Gradient => "gradientToggle",
        Attribute::Nightlight => "nightlightToggle",
        Attribute::DreamView => "dreamViewToggle",
        Attribute::NightlightScene => "nightlightScene",
        Attribute::WarmMist => "warmMistToggle",
        Attribute::WorkMode => "workMode",
        Attribute::MusicMode
        | Attribute::MusicSensitivity
        | Attribute::MusicAutoColor
        | Attribute::MusicRgb => "musicMode",
        Attribute::Online => "online",
        Attribute::Temperature => "sensorTemperature",
        Attribute::Humidity => "sensorHumidity",
        Attribute::AirQuality => "airQuality",
        Attribute::FilterLife => "filterLifeTime",
    }
}

/// Attribute for a vendor instance name, if it is one we handle.
///
/// Instances that carry several attributes map to their anchor.
#[must_use]
pub fn attribute_for(instance: &str) -> Option<Attribute> {
    Attribute::ALL
        .into_iter()
        .find(|attr| instance_for(*attr) == instance)
        .map(|attr| attr.anchor())
}

/// Vendor capability type for an attribute.
#[must_use]
pub fn capability_type(attribute: Attribute) -> &'static str {
    match attribute {
        Attribute::Power => TYPE_ON_OFF,
        Attribute::Brightness => TYPE_RANGE,
        Attribute::Color | Attribute::ColorTemp => TYPE_COLOR_SETTING,
        Attribute::SegmentColor | Attribute::SegmentBrightness => TYPE_SEGMENT_COLOR,
        Attribute::Gradient | Attribute::Nightlight | Attribute::DreamView | Attribute::WarmMist => {
            TYPE_TOGGLE
        }
        Attribute::NightlightScene => TYPE_MODE,
        Attribute::WorkMode => TYPE_WORK_MODE,
        Attribute::MusicMode
        | Attribute::MusicSensitivity
        | Attribute::MusicAutoColor
        | Attribute::MusicRgb => TYPE_MUSIC,
        Attribute::Online => TYPE_ONLINE,
        Attribute::Temperature
        | Attribute::Humidity
        | Attribute::AirQuality
        | Attribute::FilterLife => TYPE_PROPERTY,
    }
}

/// Wire form of a value that needs no device knowledge.
///
/// Named options are sent as-is; use [`control_request`] to resolve them
/// against the device's advertised options.
#[must_use]
pub fn encode_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Switch(on) => json!(u8::from(*on)),
        AttributeValue::Level(n) | AttributeValue::Kelvin(n) => json!(n),
        AttributeValue::Rgb(rgb) => json!(rgb.to_packed()),
        AttributeValue::Reading(r) => json!(r),
        AttributeValue::Choice(label) => json!(label),
        AttributeValue::SegmentLevel { segments, level } => {
            json!({ "segment": segments, "brightness": level })
        }
        AttributeValue::SegmentRgb { segments, rgb } => {
            json!({ "segment": segments, "rgb": rgb.to_packed() })
        }
    }
}

/// Body for `POST /device/state`.
#[must_use]
pub fn state_request(request_id: &str, device: &DeviceDescriptor) -> Value {
    json!({
        "requestId": request_id,
        "payload": {
            "sku": device.sku,
            "device": device.raw_id,
        }
    })
}

/// Body for `POST /device/control`.
///
/// # Errors
///
/// Returns error unless the command maps to exactly one capability; the
/// control endpoint takes a single capability per request. Named options
/// the device does not advertise are rejected too.
pub fn control_request(
    request_id: &str,
    device: &DeviceDescriptor,
    command: &Command,
) -> Result<Value, EncodingError> {
    let mut groups: BTreeMap<Attribute, BTreeMap<Attribute, &AttributeValue>> = BTreeMap::new();
    for (attribute, value) in &command.values {
        groups
            .entry(attribute.anchor())
            .or_default()
            .insert(*attribute, value);
    }
    let count = groups.len();
    let mut entries = groups.into_iter();
    let (Some((anchor, group)), None) = (entries.next(), entries.next()) else {
        return Err(EncodingError::NotSingleCapability(count));
    };

    let value = if anchor == Attribute::MusicMode {
        encode_music(device, &group)?
    } else {
        let Some(value) = group.get(&anchor) else {
            return Err(EncodingError::Incomplete(anchor));
        };
        encode_for(device, anchor, value)?
    };

    Ok(json!({
        "requestId": request_id,
        "payload": {
            "sku": device.sku,
            "device": device.raw_id,
            "capability": {
                "type": capability_type(anchor),
                "instance": instance_for(anchor),
                "value": value,
            }
        }
    }))
}

fn resolve(
    device: &DeviceDescriptor,
    attribute: Attribute,
    label: &str,
) -> Result<ModeOption, EncodingError> {
    device
        .capability(attribute)
        .cloned()
        .unwrap_or_else(|| Capability::new(attribute))
        .resolve_option(label)
        .ok_or_else(|| EncodingError::UnknownOption {
            attribute,
            label: label.to_string(),
        })
}

fn encode_for(
    device: &DeviceDescriptor,
    attribute: Attribute,
    value: &AttributeValue,
) -> Result<Value, EncodingError> {
    let AttributeValue::Choice(label) = value else {
        return Ok(encode_value(value));
    };
    let option = resolve(device, attribute, label)?;
    if attribute == Attribute::WorkMode {
        return Ok(json!({
            "workMode": option.code,
            "modeValue": option.sub_code.unwrap_or(0),
        }));
    }
    Ok(json!(option.code))
}

fn encode_music(
    device: &DeviceDescriptor,
    group: &BTreeMap<Attribute, &AttributeValue>,
) -> Result<Value, EncodingError> {
    let Some(AttributeValue::Choice(label)) = group.get(&Attribute::MusicMode) else {
        return Err(EncodingError::Incomplete(Attribute::MusicMode));
    };
    let mode = resolve(device, Attribute::MusicMode, label)?;

    let mut body = Map::new();
    body.insert("musicMode".into(), json!(mode.code));
    let sensitivity = match group.get(&Attribute::MusicSensitivity) {
        Some(AttributeValue::Level(level)) => *level,
        _ => DEFAULT_MUSIC_SENSITIVITY,
    };
    body.insert("sensitivity".into(), json!(sensitivity));
    if let Some(AttributeValue::Switch(on)) = group.get(&Attribute::MusicAutoColor) {
        body.insert("autoColor".into(), json!(u8::from(*on)));
    }
    if let Some(AttributeValue::Rgb(rgb)) = group.get(&Attribute::MusicRgb) {
        body.insert("rgb".into(), json!(rgb.to_packed()));
    }
    Ok(Value::Object(body))
}

/// Check the `code` field of a response envelope.
///
/// # Errors
///
/// Returns the vendor code and message when it is not 200.
pub fn check_envelope(body: &Value) -> Result<(), EncodingError> {
    match body.get("code").and_then(Value::as_u64) {
        None | Some(200) => Ok(()),
        Some(code) => Err(EncodingError::Vendor {
            code: u16::try_from(code).unwrap_or(u16::MAX),
            message: body
                .get("message")
                .or_else(|| body.get("msg"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
    }
}

/// Decode the `GET /user/devices` response.
///
/// Entries that cannot be interpreted are skipped with a warning so one
/// malformed advertisement does not hide the rest of the inventory.
///
/// # Errors
///
/// Returns error if the envelope has no `data` array.
pub fn decode_device_list(body: &Value) -> Result<Vec<DeviceDescriptor>, EncodingError> {
    let entries = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or(EncodingError::Missing("data"))?;

    let mut devices = Vec::with_capacity(entries.len());
    for entry in entries {
        match decode_device(entry) {
            Ok(device) => devices.push(device),
            Err(e) => tracing::warn!(error = %e, entry = %entry, "Skipping malformed device"),
        }
    }
    Ok(devices)
}

/// Decode one device list entry.
///
/// # Errors
///
/// Returns error if `device` or `sku` is missing.
pub fn decode_device(entry: &Value) -> Result<DeviceDescriptor, EncodingError> {
    let raw_id = entry
        .get("device")
        .and_then(Value::as_str)
        .ok_or(EncodingError::Missing("device"))?;
    let sku = entry
        .get("sku")
        .and_then(Value::as_str)
        .ok_or(EncodingError::Missing("sku"))?;
    let name = entry
        .get("deviceName")
        .and_then(Value::as_str)
        .unwrap_or(raw_id);

    let mut capabilities = Vec::new();
    for cap in entry
        .get("capabilities")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for decoded in decode_capability(cap) {
            if capabilities
                .iter()
                .any(|c: &Capability| c.attribute == decoded.attribute)
            {
                continue;
            }
            capabilities.push(decoded);
        }
    }

    Ok(DeviceDescriptor::new(raw_id, sku, name, capabilities))
}

/// Capabilities advertised by one device list entry. Structured instances
/// expand into one capability per attribute they carry.
fn decode_capability(cap: &Value) -> Vec<Capability> {
    let Some(instance) = cap.get("instance").and_then(Value::as_str) else {
        return Vec::new();
    };
    let Some(attribute) = attribute_for(instance) else {
        return Vec::new();
    };
    let parameters = cap.get("parameters").unwrap_or(&Value::Null);

    match attribute {
        Attribute::MusicMode => {
            let mut caps = vec![Capability::with_options(
                Attribute::MusicMode,
                field(parameters, "musicMode").map(options).unwrap_or_default(),
            )];
            if let Some(sensitivity) = field(parameters, "sensitivity") {
                caps.push(Capability {
                    range: range(sensitivity),
                    ..Capability::new(Attribute::MusicSensitivity)
                });
            }
            if field(parameters, "autoColor").is_some() {
                caps.push(Capability::new(Attribute::MusicAutoColor));
            }
            if field(parameters, "rgb").is_some() {
                caps.push(Capability::new(Attribute::MusicRgb));
            }
            caps
        }
        Attribute::WorkMode => {
            let modes = field(parameters, "workMode").map(options).unwrap_or_default();
            let mut all = modes.clone();
            for entry in field(parameters, "modeValue")
                .and_then(|f| f.get("options"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let parent = entry.get("name").and_then(Value::as_str).unwrap_or_default();
                let Some(mode) = modes.iter().find(|m| m.name.eq_ignore_ascii_case(parent)) else {
                    continue;
                };
                for level in options(entry) {
                    all.push(ModeOption::nested(level.name, mode.code, level.code));
                }
            }
            vec![Capability::with_options(Attribute::WorkMode, all)]
        }
        Attribute::NightlightScene => {
            vec![Capability::with_options(attribute, options(parameters))]
        }
        Attribute::SegmentBrightness => vec![Capability {
            range: field(parameters, "brightness").and_then(range),
            ..Capability::new(attribute)
        }],
        _ => vec![Capability {
            range: range(parameters),
            ..Capability::new(attribute)
        }],
    }
}

/// The `fields` entry named `name` of a structured capability.
fn field<'a>(parameters: &'a Value, name: &str) -> Option<&'a Value> {
    parameters
        .get("fields")?
        .as_array()?
        .iter()
        .find(|f| f.get("fieldName").and_then(Value::as_str) == Some(name))
}

/// Named integer options of a parameter block.
fn options(block: &Value) -> Vec<ModeOption> {
    block
        .get("options")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|option| {
            let name = option.get("name").and_then(Value::as_str)?;
            let code = option.get("value").and_then(Value::as_i64)?;
            Some(ModeOption::new(name, code))
        })
        .collect()
}

fn range(block: &Value) -> Option<ValueRange> {
    let range = block.get("range")?;
    Some(ValueRange {
        min: range.get("min")?.as_i64()?,
        max: range.get("max")?.as_i64()?,
    })
}

/// Values carried by one reported capability.
fn decode_reported(
    device: &DeviceDescriptor,
    attribute: Attribute,
    raw: &Value,
) -> Vec<(Attribute, AttributeValue)> {
    let label = |attribute: Attribute, code: i64, sub_code: Option<i64>| {
        device
            .capability(attribute)
            .map_or_else(|| code.to_string(), |cap| cap.label_for(code, sub_code))
    };

    match (attribute, raw) {
        (Attribute::MusicMode, Value::Object(music)) => {
            let mut values = Vec::new();
            if let Some(code) = music.get("musicMode").and_then(Value::as_i64) {
                values.push((
                    Attribute::MusicMode,
                    AttributeValue::Choice(label(Attribute::MusicMode, code, None)),
                ));
            }
            for (name, attr) in [
                ("sensitivity", Attribute::MusicSensitivity),
                ("autoColor", Attribute::MusicAutoColor),
                ("rgb", Attribute::MusicRgb),
            ] {
                if let Some(Ok(value)) = music.get(name).map(|v| AttributeValue::parse(attr, v)) {
                    values.push((attr, value));
                }
            }
            values
        }
        (Attribute::WorkMode, Value::Object(mode)) => mode
            .get("workMode")
            .and_then(Value::as_i64)
            .map(|code| {
                let sub_code = mode.get("modeValue").and_then(Value::as_i64);
                vec![(
                    Attribute::WorkMode,
                    AttributeValue::Choice(label(Attribute::WorkMode, code, sub_code)),
                )]
            })
            .unwrap_or_default(),
        (Attribute::NightlightScene, Value::Number(n)) => n
            .as_i64()
            .map(|code| {
                vec![(
                    attribute,
                    AttributeValue::Choice(label(attribute, code, None)),
                )]
            })
            .unwrap_or_default(),
        _ => match AttributeValue::parse(attribute, raw) {
            Ok(value) => vec![(attribute, value)],
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable state value");
                Vec::new()
            }
        },
    }
}

/// Decode the `POST /device/state` response.
///
/// Option codes are reported by the names `device` advertised for them.
///
/// # Errors
///
/// Returns error if the envelope has no `payload.capabilities` array.
pub fn decode_state(body: &Value, device: &DeviceDescriptor) -> Result<Reported, EncodingError> {
    let caps = body
        .get("payload")
        .and_then(|p| p.get("capabilities"))
        .and_then(Value::as_array)
        .ok_or(EncodingError::Missing("payload.capabilities"))?;

    let mut reported = Reported::new();
    for cap in caps {
        let Some(attribute) = cap
            .get("instance")
            .and_then(Value::as_str)
            .and_then(attribute_for)
        else {
            continue;
        };
        let Some(raw) = cap.get("state").and_then(|s| s.get("value")) else {
            continue;
        };
        // the API reports "" for values it does not track
        if raw.is_null() || raw.as_str() == Some("") {
            continue;
        }
        reported.extend(decode_reported(device, attribute, raw));
    }
    Ok(reported)
}

/// Decode the `POST /device/control` response into echoed values.
///
/// An acknowledgement without a successful capability echo is still an
/// acknowledgement; it just reports nothing.
#[must_use]
pub fn decode_control_response(body: &Value, device: &DeviceDescriptor) -> Reported {
    let mut reported = Reported::new();
    let Some(cap) = body.get("capability") else {
        return reported;
    };
    let succeeded = cap
        .get("state")
        .and_then(|s| s.get("status"))
        .and_then(Value::as_str)
        == Some("success");
    let attribute = cap
        .get("instance")
        .and_then(Value::as_str)
        .and_then(attribute_for);

    if let (true, Some(attribute), Some(raw)) = (succeeded, attribute, cap.get("value")) {
        reported.extend(decode_reported(device, attribute, raw));
    }
    reported
}

/// Errors interpreting vendor payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// A required field is absent
    #[error("missing field: {0}")]
    Missing(&'static str),
    /// Vendor reported an error in the envelope
    #[error("vendor error {code}: {message}")]
    Vendor {
        /// Vendor code
        code: u16,
        /// Vendor message
        message: String,
    },
    /// The control endpoint takes exactly one capability
    #[error("command carries {0} capabilities, expected exactly one")]
    NotSingleCapability(usize),
    /// A named option the device does not advertise
    #[error("{attribute} has no option {label:?}")]
    UnknownOption {
        /// Target attribute
        attribute: Attribute,
        /// Requested option
        label: String,
    },
    /// A structured capability is missing its required part
    #[error("command lacks {0}")]
    Incomplete(Attribute),
}
