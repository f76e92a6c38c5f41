//! Text encodings shared by every setting value.
//!
//! Lists and dictionaries are stored as small XML fragments
//! (`<list><value>a</value></list>`, `<dictionary><value key="k">v</value></dictionary>`).
//! Older files may still contain pipe separated lists with a `%root%` token
//! that expands to the all-users value of the same key.

use crate::value::SettingEnum;
use crate::xml::XmlElement;

pub const STRING_LIST_SEPARATOR: char = '|';
pub const STRING_LIST_ROOT_KEY: &str = "%root%";
/// Key used when a plain string is read as a dictionary.
pub const UNNAMED_KEY: &str = "Unnamed";

const LIST_ELEMENT: &str = "list";
const DICTIONARY_ELEMENT: &str = "dictionary";
const VALUE_ELEMENT: &str = "value";
const KEY_ATTRIBUTE: &str = "key";

pub fn is_string_list(s: &str) -> bool {
    !s.is_empty() && s.contains("<list")
}

pub fn is_string_dictionary(s: &str) -> bool {
    !s.is_empty() && s.contains("<dictionary")
}

/// Parses `<list>` text. `None` when the text is not a list or is malformed.
pub fn try_parse_string_list(s: &str) -> Option<Vec<String>> {
    if !is_string_list(s) {
        return None;
    }
    let root = XmlElement::parse(s).ok()?;
    Some(list_items(&root))
}

/// Values of the `./value` children of a list element.
pub fn list_items(element: &XmlElement) -> Vec<String> {
    element
        .elements_named(VALUE_ELEMENT)
        .map(XmlElement::inner_text)
        .collect()
}

/// Parses `<dictionary>` text. Values without a `key` attribute are skipped.
pub fn try_parse_string_dictionary(s: &str) -> Option<Vec<(String, String)>> {
    if !is_string_dictionary(s) {
        return None;
    }
    let root = XmlElement::parse(s).ok()?;
    Some(dictionary_items(&root))
}

pub fn dictionary_items(element: &XmlElement) -> Vec<(String, String)> {
    element
        .elements_named(VALUE_ELEMENT)
        .filter_map(|value| {
            value
                .attribute(KEY_ATTRIBUTE)
                .map(|key| (key.to_string(), value.inner_text()))
        })
        .collect()
}

/// Reads anything as a dictionary: real dictionaries parse normally, blank
/// text is empty and any other text becomes a single `Unnamed` entry.
pub fn coerce_string_dictionary(s: &str) -> Vec<(String, String)> {
    if let Some(items) = try_parse_string_dictionary(s) {
        return items;
    }
    if s.trim().is_empty() {
        Vec::new()
    } else {
        vec![(UNNAMED_KEY.to_string(), s.to_string())]
    }
}

/// Whitespace-only items are not stored.
pub fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .collect()
}

pub fn string_list_element(values: &[String]) -> XmlElement {
    let mut list = XmlElement::new(LIST_ELEMENT);
    for value in values.iter().filter(|value| !value.trim().is_empty()) {
        list.push_element(XmlElement::new(VALUE_ELEMENT).with_text(value.as_str()));
    }
    list
}

pub fn string_dictionary_element(pairs: &[(String, String)]) -> XmlElement {
    let mut dictionary = XmlElement::new(DICTIONARY_ELEMENT);
    for (key, value) in pairs {
        dictionary.push_element(
            XmlElement::new(VALUE_ELEMENT)
                .with_attribute(KEY_ATTRIBUTE, key.as_str())
                .with_text(value.as_str()),
        );
    }
    dictionary
}

pub fn string_list_to_string(values: &[String]) -> String {
    string_list_element(values)
        .to_fragment()
        .unwrap_or_default()
}

pub fn string_dictionary_to_string(pairs: &[(String, String)]) -> String {
    string_dictionary_element(pairs)
        .to_fragment()
        .unwrap_or_default()
}

/// Expands a pipe separated list. The four replacements run in this order;
/// they overlap, so the order matters.
pub fn parse_legacy_string_list(s: &str, root: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    let sep = STRING_LIST_SEPARATOR.to_string();
    let token = STRING_LIST_ROOT_KEY;
    let has_root = !root.is_empty();

    let both = format!("{sep}{token}{sep}");
    let leading = format!("{sep}{token}");
    let trailing = format!("{token}{sep}");

    let s = s.replace(
        &both,
        &if has_root {
            format!("{sep}{root}{sep}")
        } else {
            sep.clone()
        },
    );
    let s = s.replace(
        &leading,
        &if has_root {
            format!("{sep}{root}")
        } else {
            String::new()
        },
    );
    let s = s.replace(
        &trailing,
        &if has_root {
            format!("{root}{sep}")
        } else {
            String::new()
        },
    );
    let s = s.replace(token, if has_root { root } else { "" });

    s.split(STRING_LIST_SEPARATOR).map(str::to_string).collect()
}

/// Splits `s` on `,` and requires exactly `count` non-empty fields.
pub fn parse_number_list(s: &str, count: usize) -> Option<Vec<&str>> {
    if s.is_empty() {
        return None;
    }
    let fields: Vec<&str> = s.split(',').collect();
    if fields.len() != count || fields.iter().any(|field| field.trim().is_empty()) {
        return None;
    }
    Some(fields)
}

pub fn double_to_string(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        value.to_string()
    }
}

pub fn try_parse_double(s: &str) -> Option<f64> {
    let s = s.trim();
    match s {
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => s.parse::<f64>().ok(),
    }
}

/// Integer text (`"2"`) to the enum member name.
pub fn try_parse_enum_name<E: SettingEnum>(int_value: &str) -> Option<&'static str> {
    let value = int_value.trim().parse::<i32>().ok()?;
    E::from_i32(value).map(SettingEnum::name)
}

/// Enum member name to its integer value.
pub fn try_parse_enum_value<E: SettingEnum>(name: &str) -> Option<i32> {
    if name.is_empty() {
        return None;
    }
    E::from_name(name).map(SettingEnum::to_i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn list_text_round_trip_skips_blank_items() {
        let text = string_list_to_string(&strings(&["a.3dm", "  ", "b & c"]));
        assert_eq!(
            text,
            "<list><value>a.3dm</value><value>b &amp; c</value></list>"
        );
        assert_eq!(
            try_parse_string_list(&text),
            Some(strings(&["a.3dm", "b & c"]))
        );
    }

    #[test]
    fn malformed_list_does_not_parse() {
        assert_eq!(try_parse_string_list("<list><value>a</list>"), None);
        assert_eq!(try_parse_string_list("plain"), None);
    }

    #[test]
    fn dictionary_skips_values_without_key() {
        let parsed = try_parse_string_dictionary(
            r#"<dictionary><value key="a">1</value><value>orphan</value><value key="b" /></dictionary>"#,
        );
        assert_eq!(
            parsed,
            Some(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), String::new()),
            ])
        );
    }

    #[test]
    fn coerce_plain_text_into_unnamed_entry() {
        assert_eq!(coerce_string_dictionary("  "), Vec::new());
        assert_eq!(
            coerce_string_dictionary("hello"),
            vec![(UNNAMED_KEY.to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn legacy_list_expands_root_token() {
        assert_eq!(parse_legacy_string_list("a|%root%|b", "R"), strings(&["a", "R", "b"]));
        assert_eq!(parse_legacy_string_list("a|%root%|b", ""), strings(&["a", "b"]));
        assert_eq!(parse_legacy_string_list("%root%|x", "R"), strings(&["R", "x"]));
        assert_eq!(parse_legacy_string_list("x|%root%", ""), strings(&["x"]));
        assert_eq!(parse_legacy_string_list("%root%", "R"), strings(&["R"]));
        assert_eq!(parse_legacy_string_list("", "R"), Vec::<String>::new());
    }

    #[test]
    fn number_list_requires_exact_count() {
        assert_eq!(parse_number_list("1,2,3", 3), Some(vec!["1", "2", "3"]));
        assert_eq!(parse_number_list("1,2", 3), None);
        assert_eq!(parse_number_list("1,,3", 3), None);
        assert_eq!(parse_number_list("", 1), None);
    }

    #[test]
    fn doubles_use_invariant_text() {
        assert_eq!(double_to_string(0.1), "0.1");
        assert_eq!(double_to_string(-2.5), "-2.5");
        assert_eq!(try_parse_double(" 1.5e3 "), Some(1500.0));
        assert_eq!(try_parse_double("Infinity"), Some(f64::INFINITY));
        assert_eq!(try_parse_double("1,5"), None);
    }
}
