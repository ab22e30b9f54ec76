//! Device model: attributes, typed values and descriptors.
//!
//! Attribute names double as bus names, so the string forms here are part of
//! the wire contract with the publishing layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Bus-safe device identifier (vendor id with separators removed, upper-case).
pub type DeviceId = String;

/// A device attribute that can be reported, commanded, or both.
///
/// Declaration order is the order in which attributes are sent to the remote
/// API: power first, then color and brightness, then mode-specific extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// On/off switch
    Power,
    /// RGB color
    Color,
    /// White color temperature in Kelvin
    ColorTemp,
    /// Brightness level
    Brightness,
    /// RGB color of selected segments
    SegmentColor,
    /// Brightness of selected segments
    SegmentBrightness,
    /// Gradient ambient mode
    Gradient,
    /// Nightlight ambient mode
    Nightlight,
    /// `DreamView` ambient mode
    #[serde(rename = "dreamview")]
    DreamView,
    /// Nightlight scene, by name
    NightlightScene,
    /// Humidifier warm mist
    WarmMist,
    /// Appliance work mode, by name
    WorkMode,
    /// Music reactive mode, by name
    MusicMode,
    /// Microphone sensitivity in music mode
    MusicSensitivity,
    /// Automatic color cycling in music mode
    MusicAutoColor,
    /// Fixed color in music mode
    MusicRgb,
    /// Cloud connectivity of the device
    Online,
    /// Sensor temperature reading
    Temperature,
    /// Sensor humidity reading
    Humidity,
    /// Air quality reading
    AirQuality,
    /// Remaining filter life in percent
    FilterLife,
}

/// Stage of a command within one batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandStage {
    /// Power on/off
    Power,
    /// Color, color temperature and brightness
    Light,
    /// Mode-specific extras
    Extras,
}

impl Attribute {
    /// All attributes in send order.
    pub const ALL: [Attribute; 21] = [
        Attribute::Power,
        Attribute::Color,
        Attribute::ColorTemp,
        Attribute::Brightness,
        Attribute::SegmentColor,
        Attribute::SegmentBrightness,
        Attribute::Gradient,
        Attribute::Nightlight,
        Attribute::DreamView,
        Attribute::NightlightScene,
        Attribute::WarmMist,
        Attribute::WorkMode,
        Attribute::MusicMode,
        Attribute::MusicSensitivity,
        Attribute::MusicAutoColor,
        Attribute::MusicRgb,
        Attribute::Online,
        Attribute::Temperature,
        Attribute::Humidity,
        Attribute::AirQuality,
        Attribute::FilterLife,
    ];

    /// Canonical bus name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Power => "power",
            Attribute::Color => "color",
            Attribute::ColorTemp => "color_temp",
            Attribute::Brightness => "brightness",
            Attribute::SegmentColor => "segment_rgb",
            Attribute::SegmentBrightness => "segment_brightness",
            Attribute::Gradient => "gradient",
            Attribute::Nightlight => "nightlight",
            Attribute::DreamView => "dreamview",
            Attribute::NightlightScene => "nightlight_scene",
            Attribute::WarmMist => "warm_mist",
            Attribute::WorkMode => "work_mode",
            Attribute::MusicMode => "music_mode",
            Attribute::MusicSensitivity => "music_sensitivity",
            Attribute::MusicAutoColor => "music_auto_color",
            Attribute::MusicRgb => "music_rgb",
            Attribute::Online => "online",
            Attribute::Temperature => "temperature",
            Attribute::Humidity => "humidity",
            Attribute::AirQuality => "air_quality",
            Attribute::FilterLife => "filter_life",
        }
    }

    /// Whether a change request may target this attribute.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Attribute::Online
                | Attribute::Temperature
                | Attribute::Humidity
                | Attribute::AirQuality
                | Attribute::FilterLife
        )
    }

    /// Whether the remote API reports this attribute back when polled.
    ///
    /// Ambient modes are only ever known from locally applied commands.
    #[must_use]
    pub fn is_reported(&self) -> bool {
        !self.is_ambient_mode()
    }

    /// Ambient lighting modes are mutually exclusive on the device.
    #[must_use]
    pub fn is_ambient_mode(&self) -> bool {
        matches!(
            self,
            Attribute::Gradient | Attribute::Nightlight | Attribute::DreamView
        )
    }

    /// Color modes are mutually exclusive within one batch.
    #[must_use]
    pub fn is_color_mode(&self) -> bool {
        matches!(self, Attribute::Color | Attribute::ColorTemp)
    }

    /// Whether setting this attribute switches a light on by itself.
    #[must_use]
    pub fn implies_power_on(&self) -> bool {
        self.stage() == CommandStage::Light
    }

    /// The attribute that names the remote capability this one is sent in.
    ///
    /// Music settings travel as one capability keyed by the music mode;
    /// every other attribute is its own anchor.
    #[must_use]
    pub fn anchor(&self) -> Attribute {
        match self {
            Attribute::MusicSensitivity | Attribute::MusicAutoColor | Attribute::MusicRgb => {
                Attribute::MusicMode
            }
            other => *other,
        }
    }

    /// Send stage of this attribute.
    #[must_use]
    pub fn stage(&self) -> CommandStage {
        match self {
            Attribute::Power => CommandStage::Power,
            Attribute::Color | Attribute::ColorTemp | Attribute::Brightness => CommandStage::Light,
            _ => CommandStage::Extras,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "power" | "state" | "light" => Ok(Attribute::Power),
            "color" | "rgb" | "rgb_color" => Ok(Attribute::Color),
            "color_temp" | "colortemp" => Ok(Attribute::ColorTemp),
            "brightness" => Ok(Attribute::Brightness),
            "gradient" => Ok(Attribute::Gradient),
            "nightlight" => Ok(Attribute::Nightlight),
            "dreamview" => Ok(Attribute::DreamView),
            "segment_rgb" | "segment_color" => Ok(Attribute::SegmentColor),
            "segment_brightness" => Ok(Attribute::SegmentBrightness),
            "nightlight_scene" => Ok(Attribute::NightlightScene),
            "warm_mist" => Ok(Attribute::WarmMist),
            "work_mode" => Ok(Attribute::WorkMode),
            "music_mode" => Ok(Attribute::MusicMode),
            "music_sensitivity" => Ok(Attribute::MusicSensitivity),
            "music_auto_color" => Ok(Attribute::MusicAutoColor),
            "music_rgb" => Ok(Attribute::MusicRgb),
            "online" => Ok(Attribute::Online),
            "temperature" => Ok(Attribute::Temperature),
            "humidity" => Ok(Attribute::Humidity),
            "air_quality" => Ok(Attribute::AirQuality),
            "filter_life" => Ok(Attribute::FilterLife),
            _ => Err(ValueError::UnknownAttribute(s.to_string())),
        }
    }
}

/// An RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
}

impl Rgb {
    /// Create a color from channels.
    #[must_use]
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Pack into `0xRRGGBB`.
    #[must_use]
    pub fn to_packed(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }

    /// Unpack from `0xRRGGBB`; higher bits are ignored.
    #[must_use]
    pub fn from_packed(packed: u32) -> Self {
        let [_, r, g, b] = packed.to_be_bytes();
        Self { r, g, b }
    }

    /// The brightest channel, which carries the intensity of the color.
    #[must_use]
    pub fn max_channel(self) -> u8 {
        self.r.max(self.g).max(self.b)
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// On/off
    Switch(bool),
    /// Brightness level
    Level(u32),
    /// RGB color
    Rgb(Rgb),
    /// Color temperature in Kelvin
    Kelvin(u32),
    /// Sensor reading
    Reading(f64),
    /// A named option, or a label the device reported
    Choice(String),
    /// Brightness applied to a set of segments
    SegmentLevel {
        /// Segment indices
        segments: Vec<u32>,
        /// Brightness level
        level: u32,
    },
    /// Color applied to a set of segments
    SegmentRgb {
        /// Segment indices
        segments: Vec<u32>,
        /// Color
        rgb: Rgb,
    },
}

impl AttributeValue {
    /// Interpret a loosely-typed JSON value for `attribute`.
    ///
    /// Accepts the shapes home-automation frontends send: `"ON"`/`"OFF"`,
    /// booleans, numbers or numeric strings, `[r, g, b]`, `"r,g,b"`,
    /// `"#RRGGBB"`, `{"r":..,"g":..,"b":..}` and packed integers for colors.
    /// Segment values are objects such as `{"segment": [0, 1], "brightness": 40}`.
    ///
    /// # Errors
    ///
    /// Returns error if the value has the wrong shape or is out of the
    /// representable range for the attribute.
    pub fn parse(attribute: Attribute, raw: &Value) -> Result<Self, ValueError> {
        match attribute {
            Attribute::Power
            | Attribute::Gradient
            | Attribute::Nightlight
            | Attribute::DreamView
            | Attribute::WarmMist
            | Attribute::MusicAutoColor
            | Attribute::Online => parse_switch(attribute, raw).map(Self::Switch),
            Attribute::Brightness | Attribute::MusicSensitivity => {
                parse_unsigned(attribute, raw).map(Self::Level)
            }
            Attribute::ColorTemp => parse_unsigned(attribute, raw).map(Self::Kelvin),
            Attribute::Color | Attribute::MusicRgb => parse_rgb(attribute, raw).map(Self::Rgb),
            Attribute::NightlightScene | Attribute::WorkMode | Attribute::MusicMode => {
                parse_choice(attribute, raw).map(Self::Choice)
            }
            Attribute::SegmentBrightness => {
                let (segments, level) = parse_segmented(attribute, raw, &["brightness"])?;
                let level = parse_unsigned(attribute, level)?;
                Ok(Self::SegmentLevel { segments, level })
            }
            Attribute::SegmentColor => {
                let (segments, rgb) = parse_segmented(attribute, raw, &["rgb", "color"])?;
                let rgb = parse_rgb(attribute, rgb)?;
                Ok(Self::SegmentRgb { segments, rgb })
            }
            Attribute::Temperature | Attribute::Humidity => {
                parse_reading(attribute, raw).map(Self::Reading)
            }
            Attribute::FilterLife => {
                parse_reading(attribute, field_or_self(raw, &["value", "percent"]))
                    .map(Self::Reading)
            }
            Attribute::AirQuality => {
                let raw = field_or_self(raw, &["value", "level", "name"]);
                match parse_reading(attribute, raw) {
                    Ok(reading) => Ok(Self::Reading(reading)),
                    Err(_) => parse_choice(attribute, raw).map(Self::Choice),
                }
            }
        }
    }

    /// JSON form used in published snapshots.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Switch(on) => Value::from(if *on { "ON" } else { "OFF" }),
            Self::Level(n) | Self::Kelvin(n) => Value::from(*n),
            Self::Rgb(c) => serde_json::json!([c.r, c.g, c.b]),
            Self::Reading(f) => serde_json::json!(f),
            Self::Choice(label) => Value::from(label.as_str()),
            Self::SegmentLevel { segments, level } => {
                serde_json::json!({ "segment": segments, "brightness": level })
            }
            Self::SegmentRgb { segments, rgb } => {
                serde_json::json!({ "segment": segments, "rgb": [rgb.r, rgb.g, rgb.b] })
            }
        }
    }

    /// The switch state, if this is a switch value.
    #[must_use]
    pub fn as_switch(&self) -> Option<bool> {
        match self {
            Self::Switch(on) => Some(*on),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(true) => f.write_str("ON"),
            Self::Switch(false) => f.write_str("OFF"),
            Self::Level(n) => write!(f, "{n}"),
            Self::Rgb(c) => write!(f, "{},{},{}", c.r, c.g, c.b),
            Self::Kelvin(k) => write!(f, "{k}K"),
            Self::Reading(r) => write!(f, "{r}"),
            Self::Choice(label) => f.write_str(label),
            Self::SegmentLevel { segments, level } => write!(f, "{segments:?}@{level}"),
            Self::SegmentRgb { segments, rgb } => {
                write!(f, "{segments:?}@{},{},{}", rgb.r, rgb.g, rgb.b)
            }
        }
    }
}

fn invalid(attribute: Attribute, raw: &Value, reason: &str) -> ValueError {
    ValueError::Invalid {
        attribute,
        value: raw.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_switch(attribute: Attribute, raw: &Value) -> Result<bool, ValueError> {
    match raw {
        Value::Bool(on) => Ok(*on),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(attribute, raw, "expected 0 or 1")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "online" => Ok(true),
            "off" | "false" | "0" | "offline" => Ok(false),
            _ => Err(invalid(attribute, raw, "expected ON or OFF")),
        },
        _ => Err(invalid(attribute, raw, "expected ON or OFF")),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_unsigned(attribute: Attribute, raw: &Value) -> Result<u32, ValueError> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    parsed
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(attribute, raw, "expected a non-negative integer"))
}

fn parse_reading(attribute: Attribute, raw: &Value) -> Result<f64, ValueError> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(attribute, raw, "expected a number"))
}

fn parse_choice(attribute: Attribute, raw: &Value) -> Result<String, ValueError> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(attribute, raw, "expected an option name")),
    }
}

/// The first present field of an object, or the value itself.
fn field_or_self<'a>(raw: &'a Value, fields: &[&str]) -> &'a Value {
    match raw {
        Value::Object(map) => fields
            .iter()
            .find_map(|field| map.get(*field).filter(|v| !v.is_null()))
            .unwrap_or(raw),
        _ => raw,
    }
}

fn parse_segmented<'a>(
    attribute: Attribute,
    raw: &'a Value,
    fields: &[&str],
) -> Result<(Vec<u32>, &'a Value), ValueError> {
    let Value::Object(map) = raw else {
        return Err(invalid(attribute, raw, "expected {\"segment\": [..], ..}"));
    };
    let segments = match map.get("segment").or_else(|| map.get("segments")) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| parse_unsigned(attribute, item))
            .collect::<Result<Vec<u32>, _>>()?,
        Some(single) => vec![parse_unsigned(attribute, single)?],
        None => Vec::new(),
    };
    if segments.is_empty() {
        return Err(invalid(attribute, raw, "expected at least one segment"));
    }
    let value = fields
        .iter()
        .find_map(|field| map.get(*field))
        .ok_or_else(|| invalid(attribute, raw, "missing segment value"))?;
    Ok((segments, value))
}

fn parse_channel(raw: &Value) -> Option<u8> {
    match raw {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u8>().ok(),
        _ => None,
    }
}

fn parse_rgb(attribute: Attribute, raw: &Value) -> Result<Rgb, ValueError> {
    let channels: Option<[u8; 3]> = match raw {
        Value::Array(items) if items.len() == 3 => {
            match (
                parse_channel(&items[0]),
                parse_channel(&items[1]),
                parse_channel(&items[2]),
            ) {
                (Some(r), Some(g), Some(b)) => Some([r, g, b]),
                _ => None,
            }
        }
        Value::String(s) if s.trim().starts_with('#') || s.trim().starts_with("0x") => {
            let hex = s.trim().trim_start_matches('#').trim_start_matches("0x");
            u32::from_str_radix(hex, 16)
                .ok()
                .filter(|packed| *packed <= 0x00FF_FFFF)
                .map(|packed| {
                    let c = Rgb::from_packed(packed);
                    [c.r, c.g, c.b]
                })
        }
        Value::String(s) if s.contains(',') => {
            let parts: Vec<Option<u8>> = s.split(',').map(|p| p.trim().parse().ok()).collect();
            match parts.as_slice() {
                [Some(r), Some(g), Some(b)] => Some([*r, *g, *b]),
                _ => None,
            }
        }
        Value::Object(map) => match (
            map.get("r").and_then(parse_channel),
            map.get("g").and_then(parse_channel),
            map.get("b").and_then(parse_channel),
        ) {
            (Some(r), Some(g), Some(b)) => Some([r, g, b]),
            _ => None,
        },
        Value::Number(n) => n
            .as_u64()
            .filter(|packed| *packed <= 0x00FF_FFFF)
            .and_then(|packed| u32::try_from(packed).ok())
            .map(|packed| {
                let c = Rgb::from_packed(packed);
                [c.r, c.g, c.b]
            }),
        _ => None,
    };

    channels
        .map(|[r, g, b]| Rgb::new(r, g, b))
        .ok_or_else(|| invalid(attribute, raw, "expected three channels in 0..=255"))
}

/// Coarse device family, derived from the vendor model (SKU).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    /// Lights (`H6xxx`, `H7xxx`, `H8xxx`)
    Light,
    /// Sensors (`H5xxx`)
    Sensor,
    /// Anything else
    Other,
}

impl DeviceCategory {
    /// Classify a SKU.
    #[must_use]
    pub fn from_sku(sku: &str) -> Self {
        let mut chars = sku.chars();
        if chars.next() != Some('H') {
            return Self::Other;
        }
        let family = chars.next();
        let rest: Vec<char> = chars.collect();
        if rest.len() < 3 || !rest.iter().all(char::is_ascii_digit) {
            return Self::Other;
        }
        match family {
            Some('6' | '7' | '8') => Self::Light,
            Some('5') => Self::Sensor,
            _ => Self::Other,
        }
    }
}

/// Inclusive numeric range advertised for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Minimum value
    pub min: i64,
    /// Maximum value
    pub max: i64,
}

/// A named value a device advertises for a mode-like capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeOption {
    /// Display name
    pub name: String,
    /// Value sent to select this option
    pub code: i64,
    /// Secondary value for options nested under a mode (a mist level
    /// under "Manual", for instance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_code: Option<i64>,
}

impl ModeOption {
    /// A top-level option.
    #[must_use]
    pub fn new(name: impl Into<String>, code: i64) -> Self {
        Self {
            name: name.into(),
            code,
            sub_code: None,
        }
    }

    /// An option nested under mode `code`.
    #[must_use]
    pub fn nested(name: impl Into<String>, code: i64, sub_code: i64) -> Self {
        Self {
            name: name.into(),
            code,
            sub_code: Some(sub_code),
        }
    }
}

/// One advertised capability of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// The attribute this capability controls or reports
    pub attribute: Attribute,
    /// Advertised value range, if any
    pub range: Option<ValueRange>,
    /// Advertised named options, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ModeOption>,
}

impl Capability {
    /// Capability without a range.
    #[must_use]
    pub fn new(attribute: Attribute) -> Self {
        Self {
            attribute,
            range: None,
            options: Vec::new(),
        }
    }

    /// Capability with an advertised range.
    #[must_use]
    pub fn with_range(attribute: Attribute, min: i64, max: i64) -> Self {
        Self {
            range: Some(ValueRange { min, max }),
            ..Self::new(attribute)
        }
    }

    /// Capability with named options.
    #[must_use]
    pub fn with_options(attribute: Attribute, options: Vec<ModeOption>) -> Self {
        Self {
            options,
            ..Self::new(attribute)
        }
    }

    /// Resolve a requested option by name (case-insensitive) or by a bare
    /// numeric code.
    #[must_use]
    pub fn resolve_option(&self, requested: &str) -> Option<ModeOption> {
        let requested = requested.trim();
        if let Some(option) = self
            .options
            .iter()
            .find(|option| option.name.eq_ignore_ascii_case(requested))
        {
            return Some(option.clone());
        }
        let code: i64 = requested.parse().ok()?;
        Some(
            self.options
                .iter()
                .find(|option| option.code == code && option.sub_code.is_none())
                .cloned()
                .unwrap_or_else(|| ModeOption::new(requested, code)),
        )
    }

    /// Name of the option matching a reported value, falling back to the
    /// numeric text when the device did not advertise it.
    #[must_use]
    pub fn label_for(&self, code: i64, sub_code: Option<i64>) -> String {
        let exact = self
            .options
            .iter()
            .find(|option| option.code == code && option.sub_code == sub_code);
        let parent = || {
            self.options
                .iter()
                .find(|option| option.code == code && option.sub_code.is_none())
        };
        exact
            .or_else(parent)
            .map_or_else(|| code.to_string(), |option| option.name.clone())
    }
}

/// A device as listed by the remote inventory.
///
/// Replaced wholesale on every successful inventory refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Bus-safe identifier
    pub id: DeviceId,
    /// Identifier as the vendor API knows it
    pub raw_id: String,
    /// Vendor model
    pub sku: String,
    /// Human-readable name
    pub name: String,
    /// Device family
    pub category: DeviceCategory,
    /// Advertised capabilities
    pub capabilities: Vec<Capability>,
}

impl DeviceDescriptor {
    /// Build a descriptor, deriving the bus id and category.
    #[must_use]
    pub fn new(
        raw_id: impl Into<String>,
        sku: impl Into<String>,
        name: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        let raw_id = raw_id.into();
        let sku = sku.into();
        Self {
            id: normalize_device_id(&raw_id),
            category: DeviceCategory::from_sku(&sku),
            raw_id,
            sku,
            name: name.into(),
            capabilities,
        }
    }

    /// Whether the device advertises `attribute`.
    #[must_use]
    pub fn supports(&self, attribute: Attribute) -> bool {
        self.capability(attribute).is_some()
    }

    /// The advertised capability for `attribute`.
    #[must_use]
    pub fn capability(&self, attribute: Attribute) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|cap| cap.attribute == attribute)
    }
}

/// Turn a vendor id such as `AA:BB:CC` into a bus-safe id (`AABBCC`).
#[must_use]
pub fn normalize_device_id(raw_id: &str) -> DeviceId {
    raw_id
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Errors interpreting attribute names or values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    /// Attribute name not recognized
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
    /// Value has the wrong shape for the attribute
    #[error("invalid value {value} for {attribute}: {reason}")]
    Invalid {
        /// Target attribute
        attribute: Attribute,
        /// Offending value, as JSON text
        value: String,
        /// What was expected
        reason: String,
    },
}
