//! `{{name}}` placeholder substitution for notification templates.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// Placeholder name to value.
pub type TemplateVars = BTreeMap<String, String>;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("valid regex"))
}

/// Replace every `{{key}}` with its value.
///
/// Plain string replacement: values are not escaped, and a value that itself
/// contains `{{other}}` may be expanded again by a later key. Unknown
/// placeholders stay in the output.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Placeholder names still present after rendering.
pub fn unresolved(rendered: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(rendered)
        .map(|c| c[1].to_string())
        .collect()
}

/// Build `TemplateVars` from `(name, value)` pairs.
pub fn vars<const N: usize>(pairs: [(&str, String); N]) -> TemplateVars {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_every_occurrence() {
        let rendered = render(
            "{{lead_name}} mudou para {{new_status}}. Abrir {{lead_name}}",
            &vars([
                ("lead_name", "Maria".to_string()),
                ("new_status", "qualified".to_string()),
            ]),
        );
        assert_eq!(rendered, "Maria mudou para qualified. Abrir Maria");
    }

    #[test]
    fn test_unknown_placeholders_are_left_intact() {
        let rendered = render(
            "Negócio {{deal_title}} por {{deal_value}}",
            &vars([("deal_title", "Contrato".to_string())]),
        );
        assert_eq!(rendered, "Negócio Contrato por {{deal_value}}");
        assert_eq!(unresolved(&rendered), vec!["deal_value".to_string()]);
    }

    #[test]
    fn test_values_are_not_escaped() {
        let rendered = render("<b>{{name}}</b>", &vars([("name", "<i>x</i>".to_string())]));
        assert_eq!(rendered, "<b><i>x</i></b>");
    }
}
