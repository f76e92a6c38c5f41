use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::converter;

/// What a key was last read or written as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Byte,
    Integer,
    UnsignedInteger,
    Double,
    Char,
    String,
    Guid,
    Date,
    Color,
    Point,
    Point3d,
    Size,
    Rectangle,
    StringList,
    StringDictionary,
    Enum,
}

/// Stored form of a setting.
///
/// Scalars keep their invariant text. Lists and dictionaries keep their items;
/// `to_text` produces the XML fragment written by older hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingData {
    Scalar(String),
    List(Vec<String>),
    Dictionary(Vec<(String, String)>),
}

impl Default for SettingData {
    fn default() -> Self {
        SettingData::Scalar(String::new())
    }
}

impl SettingData {
    pub fn scalar(text: impl Into<String>) -> Self {
        SettingData::Scalar(text.into())
    }

    /// True only for the empty scalar.
    pub fn is_empty(&self) -> bool {
        matches!(self, SettingData::Scalar(s) if s.is_empty())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            SettingData::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            SettingData::Scalar(s) => s.clone(),
            SettingData::List(items) => converter::string_list_to_string(items),
            SettingData::Dictionary(pairs) => converter::string_dictionary_to_string(pairs),
        }
    }

    /// Reads raw text. Parsable `<list>` / `<dictionary>` fragments become
    /// structured values, everything else stays a scalar.
    pub fn from_text(text: &str) -> Self {
        if converter::is_string_list(text) {
            if let Some(items) = converter::try_parse_string_list(text) {
                return SettingData::List(converter::normalize_list(&items));
            }
        } else if converter::is_string_dictionary(text) {
            if let Some(pairs) = converter::try_parse_string_dictionary(text) {
                return SettingData::Dictionary(pairs);
            }
        }
        SettingData::Scalar(text.to_string())
    }

    /// Ordinal equality of the stored text.
    pub fn text_eq(&self, other: &SettingData) -> bool {
        match (self, other) {
            (SettingData::Scalar(a), SettingData::Scalar(b)) => a == b,
            (SettingData::List(a), SettingData::List(b)) => a == b,
            (SettingData::Dictionary(a), SettingData::Dictionary(b)) => a == b,
            _ => self.to_text() == other.to_text(),
        }
    }

    /// Text used when this value replaces `%root%` in a legacy list.
    pub(crate) fn root_text(&self) -> String {
        match self {
            SettingData::List(items) => items.join(&converter::STRING_LIST_SEPARATOR.to_string()),
            other => other.to_text(),
        }
    }
}

impl fmt::Display for SettingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// One setting: current and default value plus bookkeeping flags.
#[derive(Debug, Clone, Default)]
pub struct SettingValue {
    name: String,
    current: SettingData,
    default: SettingData,
    runtime_type: Option<ValueKind>,
    read_only: bool,
    hidden: bool,
    changed_since_save: bool,
}

impl SettingValue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub(crate) fn with_values(
        name: impl Into<String>,
        runtime_type: Option<ValueKind>,
        current: SettingData,
        default: SettingData,
    ) -> Self {
        Self {
            name: name.into(),
            current,
            default,
            runtime_type,
            ..Default::default()
        }
    }

    /// Same cell under another key; used when a legacy key is remapped.
    pub(crate) fn renamed(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self, use_default: bool) -> &SettingData {
        if use_default {
            &self.default
        } else {
            &self.current
        }
    }

    /// Replaces the default or the current value.
    ///
    /// Read-only cells ignore current value changes. Returns `true` when the
    /// changed-since-save flag was raised by this call.
    pub fn set_value(&mut self, use_default: bool, data: SettingData, raise_changed: bool) -> bool {
        if use_default {
            self.default = data;
            return false;
        }
        if self.read_only {
            return false;
        }
        let raised = raise_changed && !self.current.text_eq(&data);
        if raised {
            self.changed_since_save = true;
        }
        self.current = data;
        raised
    }

    pub fn is_at_default(&self) -> bool {
        self.current.text_eq(&self.default)
    }

    pub fn differs_from_default(&self) -> bool {
        !self.is_at_default()
    }

    pub fn copy_from(&mut self, other: &SettingValue) {
        self.current = other.current.clone();
        self.default = other.default.clone();
        self.hidden = other.hidden;
        self.read_only = other.read_only;
        self.runtime_type = other.runtime_type;
    }

    pub fn runtime_type(&self) -> Option<ValueKind> {
        self.runtime_type
    }

    pub fn set_runtime_type(&mut self, kind: ValueKind) {
        self.runtime_type = Some(kind);
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn changed_since_save(&self) -> bool {
        self.changed_since_save
    }

    pub fn set_changed_since_save(&mut self, changed: bool) {
        self.changed_since_save = changed;
    }

    /// Typed read. `root` is the all-users value used to expand `%root%` in
    /// legacy string lists.
    pub fn try_get<T: SettingType>(&mut self, use_default: bool, root: Option<&SettingData>) -> Option<T> {
        self.runtime_type = Some(T::KIND);
        T::from_data(self.value(use_default), root)
    }

    pub fn set<T: SettingType>(&mut self, use_default: bool, value: T, raise_changed: bool) -> bool {
        self.runtime_type = Some(T::KIND);
        self.set_value(use_default, value.into_data(), raise_changed)
    }
}

/// A Rust type that can be stored in a setting.
pub trait SettingType: Sized {
    const KIND: ValueKind;

    fn into_data(self) -> SettingData;

    fn from_data(data: &SettingData, root: Option<&SettingData>) -> Option<Self>;
}

/// Plain text of a value for scalar parsers.
fn scalar_text(data: &SettingData) -> Option<&str> {
    data.as_scalar()
}

impl SettingType for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn into_data(self) -> SettingData {
        SettingData::scalar(if self { "True" } else { "False" })
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let text = scalar_text(data)?.trim();
        if text.eq_ignore_ascii_case("true") {
            return Some(true);
        }
        if text.eq_ignore_ascii_case("false") {
            return Some(false);
        }
        text.parse::<i64>().ok().map(|i| i != 0)
    }
}

macro_rules! integer_setting_type {
    ($ty:ty, $kind:expr) => {
        impl SettingType for $ty {
            const KIND: ValueKind = $kind;

            fn into_data(self) -> SettingData {
                SettingData::Scalar(self.to_string())
            }

            fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
                scalar_text(data)?.trim().parse::<$ty>().ok()
            }
        }
    };
}

integer_setting_type!(u8, ValueKind::Byte);
integer_setting_type!(i32, ValueKind::Integer);
integer_setting_type!(u32, ValueKind::UnsignedInteger);

impl SettingType for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(converter::double_to_string(self))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        converter::try_parse_double(scalar_text(data)?)
    }
}

impl SettingType for char {
    const KIND: ValueKind = ValueKind::Char;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(self.to_string())
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let mut chars = scalar_text(data)?.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

impl SettingType for String {
    const KIND: ValueKind = ValueKind::String;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(self)
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        Some(data.to_text())
    }
}

impl SettingType for Uuid {
    const KIND: ValueKind = ValueKind::Guid;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(self.hyphenated().to_string())
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        Uuid::parse_str(scalar_text(data)?.trim()).ok()
    }
}

/// Date format written to settings files.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_READ_FORMATS: &[&str] = &[DATE_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%A, %d %B %Y %H:%M:%S"];

impl SettingType for NaiveDateTime {
    const KIND: ValueKind = ValueKind::Date;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(self.format(DATE_FORMAT).to_string())
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let text = scalar_text(data)?.trim();
        if text.is_empty() {
            return None;
        }
        for format in DATE_READ_FORMATS {
            if let Ok(date) = NaiveDateTime::parse_from_str(text, format) {
                return Some(date);
            }
        }
        if let Ok(date) = DateTime::parse_from_rfc3339(text) {
            return Some(date.naive_local());
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    }
}

/// ARGB colour, written as `A,R,G,B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn from_argb(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self { a, r, g, b }
    }

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self { a: 255, r, g, b }
    }
}

impl SettingType for Color {
    const KIND: ValueKind = ValueKind::Color;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(format!("{},{},{},{}", self.a, self.r, self.g, self.b))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let fields = converter::parse_number_list(scalar_text(data)?, 4)?;
        let mut argb = [0u8; 4];
        for (slot, field) in argb.iter_mut().zip(fields) {
            *slot = field.trim().parse::<u8>().ok()?;
        }
        Some(Color::from_argb(argb[0], argb[1], argb[2], argb[3]))
    }
}

/// An optional colour; `None` is stored as the empty string.
impl SettingType for Option<Color> {
    const KIND: ValueKind = ValueKind::Color;

    fn into_data(self) -> SettingData {
        match self {
            Some(color) => color.into_data(),
            None => SettingData::default(),
        }
    }

    fn from_data(data: &SettingData, root: Option<&SettingData>) -> Option<Self> {
        if data.is_empty() {
            return Some(None);
        }
        Color::from_data(data, root).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

fn parse_i32_fields<const N: usize>(data: &SettingData) -> Option<[i32; N]> {
    let fields = converter::parse_number_list(scalar_text(data)?, N)?;
    let mut out = [0i32; N];
    for (slot, field) in out.iter_mut().zip(fields) {
        *slot = field.trim().parse::<i32>().ok()?;
    }
    Some(out)
}

impl SettingType for Point {
    const KIND: ValueKind = ValueKind::Point;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(format!("{},{}", self.x, self.y))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let [x, y] = parse_i32_fields::<2>(data)?;
        Some(Point { x, y })
    }
}

impl SettingType for Size {
    const KIND: ValueKind = ValueKind::Size;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(format!("{},{}", self.width, self.height))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let [width, height] = parse_i32_fields::<2>(data)?;
        Some(Size { width, height })
    }
}

impl SettingType for Rectangle {
    const KIND: ValueKind = ValueKind::Rectangle;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(format!(
            "{},{},{},{}",
            self.left, self.top, self.width, self.height
        ))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let [left, top, width, height] = parse_i32_fields::<4>(data)?;
        Some(Rectangle {
            left,
            top,
            width,
            height,
        })
    }
}

impl SettingType for Point3d {
    const KIND: ValueKind = ValueKind::Point3d;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(format!(
            "{},{},{}",
            converter::double_to_string(self.x),
            converter::double_to_string(self.y),
            converter::double_to_string(self.z)
        ))
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let fields = converter::parse_number_list(scalar_text(data)?, 3)?;
        Some(Point3d {
            x: converter::try_parse_double(fields[0])?,
            y: converter::try_parse_double(fields[1])?,
            z: converter::try_parse_double(fields[2])?,
        })
    }
}

impl SettingType for Vec<String> {
    const KIND: ValueKind = ValueKind::StringList;

    fn into_data(self) -> SettingData {
        SettingData::List(converter::normalize_list(&self))
    }

    fn from_data(data: &SettingData, root: Option<&SettingData>) -> Option<Self> {
        match data {
            SettingData::List(items) => Some(items.clone()),
            SettingData::Dictionary(_) => None,
            SettingData::Scalar(text) if converter::is_string_list(text) => {
                converter::try_parse_string_list(text)
            }
            SettingData::Scalar(text) => {
                let root = root.map(SettingData::root_text).unwrap_or_default();
                Some(converter::parse_legacy_string_list(text, &root))
            }
        }
    }
}

impl SettingType for Vec<(String, String)> {
    const KIND: ValueKind = ValueKind::StringDictionary;

    fn into_data(self) -> SettingData {
        SettingData::Dictionary(self)
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        match data {
            SettingData::Dictionary(pairs) => Some(pairs.clone()),
            SettingData::List(_) => None,
            SettingData::Scalar(text) => converter::try_parse_string_dictionary(text),
        }
    }
}

/// An enum stored by its integer value.
///
/// With strum this is usually a thin layer over `FromRepr`, `IntoStaticStr`
/// and `EnumString`.
pub trait SettingEnum: Sized + Copy {
    fn to_i32(self) -> i32;

    fn from_i32(value: i32) -> Option<Self>;

    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self>;

    /// Key used by `get_enum_value_or`.
    fn type_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Adapter that lets a [`SettingEnum`] go through the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumSetting<E>(pub E);

impl<E: SettingEnum> SettingType for EnumSetting<E> {
    const KIND: ValueKind = ValueKind::Enum;

    fn into_data(self) -> SettingData {
        SettingData::Scalar(self.0.to_i32().to_string())
    }

    fn from_data(data: &SettingData, _root: Option<&SettingData>) -> Option<Self> {
        let text = scalar_text(data)?.trim();
        match text.parse::<i32>() {
            Ok(value) => E::from_i32(value).map(EnumSetting),
            Err(_) => E::from_name(text).map(EnumSetting),
        }
    }
}
