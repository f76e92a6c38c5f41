//! Settings document layout.
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <settings id="2.0">
//!   <settings>
//!     <entry key="Foo">7</entry>
//!     <child key="Advanced">…</child>
//!   </settings>
//!   <command name="MyCommand">…</command>
//! </settings>
//! ```
//!
//! Only cells that differ from their default (or from the all-users value) are
//! written. Nodes without such cells are left out entirely.

use std::sync::Arc;

use tracing::debug;

use crate::converter;
use crate::errors::{Result, SettingsError};
use crate::node::SettingsNode;
use crate::value::SettingData;
use crate::xml::XmlElement;

/// Format version written to the `id` attribute of the root element.
pub const SETTINGS_VERSION: &str = "2.0";

pub const ROOT_ELEMENT: &str = "settings";
pub const SETTINGS_ELEMENT: &str = "settings";
pub const COMMAND_ELEMENT: &str = "command";
const ENTRY_ELEMENT: &str = "entry";
const CHILD_ELEMENT: &str = "child";
const LIST_ELEMENT: &str = "list";
const DICTIONARY_ELEMENT: &str = "dictionary";
const ID_ATTRIBUTE: &str = "id";
const XML_ID_ATTRIBUTE: &str = "xml:id";
const KEY_ATTRIBUTE: &str = "key";
const NAME_ATTRIBUTE: &str = "name";
const HIDDEN_ATTRIBUTE: &str = "hidden";
const HIDDEN_VALUE: &str = "True";

/// A command section to write: its name, node and all-users counterpart.
pub struct CommandSection<'a> {
    pub name: &'a str,
    pub node: &'a SettingsNode,
    pub all_users: Option<&'a SettingsNode>,
}

/// Appends `node` to `parent` as `element_name`, if it has anything worth
/// writing. Returns whether an element was written.
pub fn write_xml_element(
    parent: &mut XmlElement,
    element_name: &str,
    node: &SettingsNode,
    attribute: &str,
    attribute_value: &str,
    all_users: Option<&SettingsNode>,
) -> bool {
    if !node.contains_modified_values(all_users) {
        return false;
    }

    let snapshot = node.snapshot();
    let all_users_values = all_users.map(SettingsNode::current_values);

    let mut element = XmlElement::new(element_name);
    if !attribute.is_empty() && !attribute_value.is_empty() {
        element = element.with_attribute(attribute, attribute_value);
    }
    if snapshot.hidden_from_ui {
        element = element.with_attribute(HIDDEN_ATTRIBUTE, HIDDEN_VALUE);
    }

    for (key, value) in &snapshot.settings {
        let current = value.value(false);
        let differs_from_all_users = all_users_values
            .as_ref()
            .and_then(|values| values.get(key))
            .is_some_and(|all_users_value| !current.text_eq(all_users_value));
        if !differs_from_all_users && !value.differs_from_default() {
            continue;
        }

        let mut entry = XmlElement::new(ENTRY_ELEMENT).with_attribute(KEY_ATTRIBUTE, key.as_str());
        match current {
            SettingData::List(items) => entry.push_element(converter::string_list_element(items)),
            SettingData::Dictionary(pairs) => {
                entry.push_element(converter::string_dictionary_element(pairs))
            }
            SettingData::Scalar(text) => entry = entry.with_text(text.as_str()),
        }
        element.push_element(entry);
    }

    for (key, child) in &snapshot.children {
        write_xml_element(&mut element, CHILD_ELEMENT, child, KEY_ATTRIBUTE, key, None);
    }

    parent.push_element(element);
    true
}

/// Loads `entry` and `child` elements of `element` into `node`.
pub fn parse_xml_nodes(node: &SettingsNode, element: &XmlElement) {
    for entry in element.elements_named(ENTRY_ELEMENT) {
        let Some(key) = entry.attribute(KEY_ATTRIBUTE).filter(|key| !key.is_empty()) else {
            continue;
        };

        if let Some(list) = entry.first_element(LIST_ELEMENT) {
            node.set_data(key, SettingData::List(converter::list_items(list)));
        } else if let Some(dictionary) = entry.first_element(DICTIONARY_ELEMENT) {
            node.set_data(key, SettingData::Dictionary(converter::dictionary_items(dictionary)));
        } else {
            node.set_string(key, &entry.inner_text());
        }

        if entry.attribute(HIDDEN_ATTRIBUTE) == Some(HIDDEN_VALUE) {
            // Missing only when a validator rejected the value.
            if let Err(err) = node.hide_setting(key) {
                debug!(key, "Hidden flag not applied: {}", err);
            }
        }
    }

    for child_element in element.elements_named(CHILD_ELEMENT) {
        let Some(key) = child_element
            .attribute(KEY_ATTRIBUTE)
            .filter(|key| !key.is_empty())
        else {
            continue;
        };
        let child = node.add_child(key);
        if child_element.attribute(HIDDEN_ATTRIBUTE) == Some(HIDDEN_VALUE) {
            child.set_hidden_from_ui(true);
        }
        parse_xml_nodes(&child, child_element);
    }
}

/// Builds the whole document. `settings` is `None` when the main node has
/// nothing to write; window-position documents pass no commands.
pub fn settings_document(
    settings: Option<&SettingsNode>,
    all_users: Option<&SettingsNode>,
    commands: &[CommandSection<'_>],
) -> XmlElement {
    let mut root = XmlElement::new(ROOT_ELEMENT).with_attribute(ID_ATTRIBUTE, SETTINGS_VERSION);
    if let Some(settings) = settings {
        write_xml_element(&mut root, SETTINGS_ELEMENT, settings, "", "", all_users);
    }
    for command in commands {
        write_xml_element(
            &mut root,
            COMMAND_ELEMENT,
            command.node,
            NAME_ATTRIBUTE,
            command.name,
            command.all_users,
        );
    }
    root
}

pub fn to_bytes(document: &XmlElement) -> Result<Vec<u8>> {
    document.to_document()
}

/// Sections of a parsed settings document.
#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub settings: Option<XmlElement>,
    pub commands: Vec<(String, XmlElement)>,
}

impl ParsedDocument {
    /// Applies the `<settings>` section to `node`.
    pub fn apply_settings(&self, node: &SettingsNode) {
        if let Some(section) = &self.settings {
            parse_xml_nodes(node, section);
        }
    }

    /// Parses every command section into a fresh node built by `make_node`.
    pub fn command_nodes(
        &self,
        mut make_node: impl FnMut(&str) -> Arc<SettingsNode>,
    ) -> Vec<(String, Arc<SettingsNode>)> {
        self.commands
            .iter()
            .map(|(name, element)| {
                let node = make_node(name);
                parse_xml_nodes(&node, element);
                (name.clone(), node)
            })
            .collect()
    }
}

/// Only the integer part of the version is compared.
pub fn check_version(id: &str) -> Result<()> {
    let mismatch = || SettingsError::VersionMismatch {
        found: id.to_string(),
    };
    let found: f64 = id.trim().parse().map_err(|_| mismatch())?;
    let current: f64 = SETTINGS_VERSION.parse().map_err(|_| mismatch())?;
    if !found.is_finite() || found.trunc() != current.trunc() {
        return Err(mismatch());
    }
    Ok(())
}

/// Parses document bytes and checks the root element and its version.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedDocument> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{feff}');
    let root = XmlElement::parse(text)?;
    if root.name != ROOT_ELEMENT {
        return Err(SettingsError::MissingRoot);
    }
    let id = root
        .attribute(ID_ATTRIBUTE)
        .or_else(|| root.attribute(XML_ID_ATTRIBUTE))
        .ok_or_else(|| SettingsError::VersionMismatch {
            found: String::new(),
        })?;
    check_version(id)?;

    let settings = root.first_element(SETTINGS_ELEMENT).cloned();
    let commands = root
        .elements_named(COMMAND_ELEMENT)
        .filter_map(|command| {
            let name = command.attribute(NAME_ATTRIBUTE).filter(|name| !name.is_empty())?;
            Some((name.to_string(), command.clone()))
        })
        .collect::<Vec<_>>();
    debug!(commands = commands.len(), "Parsed settings document");
    Ok(ParsedDocument { settings, commands })
}
