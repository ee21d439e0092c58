//! `$name` / `${name}` substitution for auto-post status templates.

use regex::Regex;
use thiserror::Error;

static PLACEHOLDER: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"\$(?:(?P<escaped>\$)|(?P<named>[_A-Za-z][_A-Za-z0-9]*)|\{(?P<braced>[_A-Za-z][_A-Za-z0-9]*)\}|(?P<invalid>))")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template references unknown placeholder: {0}")]
    UnknownPlaceholder(String),
    #[error("invalid placeholder at byte {0}")]
    InvalidPlaceholder(usize),
}

/// Substitute placeholders in `template` with `vars`.
///
/// `$$` renders a literal `$`.
///
/// # Errors
///
/// Returns an error if the template names a variable that is not in `vars`
/// or contains a `$` that does not start a placeholder.
pub fn render(template: &str, vars: &[(&str, String)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        if caps.name("escaped").is_some() {
            out.push('$');
            continue;
        }
        if caps.name("invalid").is_some() {
            return Err(TemplateError::InvalidPlaceholder(whole.start()));
        }

        let name = caps
            .name("named")
            .or_else(|| caps.name("braced"))
            .map_or("", |m| m.as_str());
        let value = vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
        out.push_str(value);
    }

    out.push_str(&template[last..]);
    Ok(out)
}
