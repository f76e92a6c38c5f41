use thiserror::Error;

use crate::value::ValueKind;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("value of `{key}` is not supported as {kind}")]
    NotSupported { key: String, kind: ValueKind },

    #[error("unsupported settings format version: {found}")]
    VersionMismatch { found: String },

    #[error("settings document has no root element")]
    MissingRoot,

    #[error("config error: {0}")]
    Config(String),

    #[error("other: {0}")]
    Other(String),
}

impl From<quick_xml::events::attributes::AttrError> for SettingsError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        SettingsError::Xml(err.into())
    }
}

impl From<quick_xml::encoding::EncodingError> for SettingsError {
    fn from(err: quick_xml::encoding::EncodingError) -> Self {
        SettingsError::Xml(err.into())
    }
}

impl From<quick_xml::escape::EscapeError> for SettingsError {
    fn from(err: quick_xml::escape::EscapeError) -> Self {
        SettingsError::Xml(err.into())
    }
}

pub type Result<T, E = SettingsError> = std::result::Result<T, E>;
