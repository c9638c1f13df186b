//! Placeholder substitution.
//!
//! Two placeholder styles are in use: `{{name}}` inside double-quoted
//! string literals and `{name}` inside ADDRESS payloads. A placeholder
//! body must look like a variable reference (letters, digits, `_` and
//! dotted property paths); anything else, such as the braces of a JSON
//! document, is left alone. Substitution is a single pass over the
//! template, so text produced by a substitution is never rescanned.

/// Which placeholder syntax to recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `{name}`
    Single,
    /// `{{name}}`
    Double,
}

impl PlaceholderStyle {
    fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            PlaceholderStyle::Single => ("{", "}"),
            PlaceholderStyle::Double => ("{{", "}}"),
        }
    }
}

/// How unresolved placeholders are handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpolationOptions {
    /// Fail on the first unresolved placeholder.
    pub strict: bool,
    /// Replace unresolved placeholders with this text instead of leaving
    /// them verbatim.
    pub missing_marker: Option<String>,
}

/// A placeholder that had no value under strict interpolation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved placeholder '{name}'")]
pub struct Unresolved {
    pub name: String,
}

/// Substitute placeholders in `template` using `resolve`.
pub fn interpolate<F>(
    template: &str,
    style: PlaceholderStyle,
    options: &InterpolationOptions,
    resolve: F,
) -> Result<String, Unresolved>
where
    F: Fn(&str) -> Option<String>,
{
    let (open, close) = style.delimiters();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];

        // `{{` in single-brace text is literal braces, not a placeholder.
        let doubled = style == PlaceholderStyle::Single && after_open.starts_with('{');
        let body_end = if doubled { None } else { after_open.find(close) };

        match body_end {
            Some(end) if is_placeholder_name(after_open[..end].trim()) => {
                let name = after_open[..end].trim();
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None if options.strict => {
                        return Err(Unresolved {
                            name: name.to_string(),
                        });
                    }
                    None => match &options.missing_marker {
                        Some(marker) => out.push_str(marker),
                        None => out.push_str(&rest[start..start + open.len() + end + close.len()]),
                    },
                }
                rest = &after_open[end + close.len()..];
            }
            _ => {
                // Not a placeholder: emit the opener and keep scanning.
                let skip = if doubled { open.len() + 1 } else { open.len() };
                out.push_str(&rest[start..start + skip]);
                rest = &rest[start + skip..];
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Placeholder names are variable references with optional dotted path
/// segments, e.g. `name`, `user.address.city`, `items.1`.
pub fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.ends_with('.')
        && !name.contains("..")
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '#' | '@' | '?'))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn lookup<'a>(vars: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("name", "Ada"), ("user.city", "London"), ("n", "3")])
    }

    #[test]
    fn test_double_style() {
        let v = vars();
        let out = interpolate(
            "Hi {{name}} from {{ user.city }}",
            PlaceholderStyle::Double,
            &InterpolationOptions::default(),
            lookup(&v),
        )
        .unwrap();
        assert_eq!(out, "Hi Ada from London");
    }

    #[test]
    fn test_single_style() {
        let v = vars();
        let out = interpolate("count={n}", PlaceholderStyle::Single, &InterpolationOptions::default(), lookup(&v)).unwrap();
        assert_eq!(out, "count=3");
    }

    #[test]
    fn test_unresolved_left_verbatim() {
        let v = vars();
        let out = interpolate("a {{missing}} b", PlaceholderStyle::Double, &InterpolationOptions::default(), lookup(&v)).unwrap();
        assert_eq!(out, "a {{missing}} b");
    }

    #[test]
    fn test_missing_marker() {
        let v = vars();
        let options = InterpolationOptions {
            strict: false,
            missing_marker: Some("?".to_string()),
        };
        let out = interpolate("a {missing} b", PlaceholderStyle::Single, &options, lookup(&v)).unwrap();
        assert_eq!(out, "a ? b");
    }

    #[test]
    fn test_strict_fails() {
        let v = vars();
        let options = InterpolationOptions {
            strict: true,
            missing_marker: None,
        };
        let err = interpolate("{nope}", PlaceholderStyle::Single, &options, lookup(&v)).unwrap_err();
        assert_eq!(err.name, "nope");
    }

    #[test]
    fn test_json_braces_untouched() {
        let v = vars();
        let json = r#"{"name": "{name}", "nested": {"k": 1}}"#;
        let out = interpolate(json, PlaceholderStyle::Single, &InterpolationOptions::default(), lookup(&v)).unwrap();
        assert_eq!(out, r#"{"name": "Ada", "nested": {"k": 1}}"#);
    }

    #[test]
    fn test_single_style_ignores_double_braces() {
        let v = vars();
        let out = interpolate("{{name}}", PlaceholderStyle::Single, &InterpolationOptions::default(), lookup(&v)).unwrap();
        assert_eq!(out, "{{name}}");
    }

    #[test]
    fn test_substituted_text_is_not_rescanned() {
        let calls = RefCell::new(0);
        let out = interpolate(
            "{{a}}",
            PlaceholderStyle::Double,
            &InterpolationOptions::default(),
            |_| {
                *calls.borrow_mut() += 1;
                Some("{{a}}".to_string())
            },
        )
        .unwrap();
        assert_eq!(out, "{{a}}");
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_placeholder_names() {
        assert!(is_placeholder_name("user.name"));
        assert!(is_placeholder_name("items.1"));
        assert!(!is_placeholder_name("1abc"));
        assert!(!is_placeholder_name("a b"));
        assert!(!is_placeholder_name("\"k\": 1"));
        assert!(!is_placeholder_name("trailing."));
    }

    fn fragment() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z ,.:]{0,6}",
            Just("{{name}}".to_string()),
            Just("{{user.city}}".to_string()),
            Just("{{missing}}".to_string()),
            Just("{{ n }}".to_string()),
            Just("{".to_string()),
            Just("}}".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn interpolation_is_idempotent(parts in prop::collection::vec(fragment(), 0..8)) {
            let template = parts.concat();
            let v = vars();
            let options = InterpolationOptions::default();
            let once = interpolate(&template, PlaceholderStyle::Double, &options, lookup(&v)).unwrap();
            let twice = interpolate(&once, PlaceholderStyle::Double, &options, lookup(&v)).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
