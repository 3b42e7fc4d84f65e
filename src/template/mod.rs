//! Notification template rendering.
//!
//! Titles, bodies and action URLs are plain text with `{{variable}}`
//! placeholders. Whitespace inside the braces is ignored, so `{{ user_name }}`
//! and `{{user_name}}` are equivalent.
//!
//! # Example
//!
//! ```ignore
//! let vars = payload.template_vars(&helpers);
//! let title = render("Workspace {{labels.name}} deleted", &vars)?;
//! ```

use std::collections::HashMap;

use thiserror::Error;

/// Template-specific error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown template variable: {0}")]
    UnknownVariable(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),
}

/// Substitute every `{{variable}}` placeholder in `template`.
///
/// Rendering fails on a placeholder with no matching variable rather than
/// silently producing a half-rendered message.
pub fn render(template: &str, variables: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(RenderError::Unterminated(offset + start))?;

        let name = after_open[..end].trim();
        if name.is_empty() {
            return Err(RenderError::EmptyPlaceholder(offset + start));
        }
        let value = variables
            .get(name)
            .ok_or_else(|| RenderError::UnknownVariable(name.to_string()))?;
        out.push_str(value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("user_name".to_string(), "Bobby".to_string()),
            ("labels.name".to_string(), "dev".to_string()),
            ("access_url".to_string(), "https://ara.example.com".to_string()),
        ])
    }

    #[test]
    fn test_render_simple() {
        let out = render("Hello, {{user_name}}!", &vars()).unwrap();
        assert_eq!(out, "Hello, Bobby!");
    }

    #[test]
    fn test_render_multiple_and_whitespace() {
        let out = render(
            "{{ user_name }}, workspace {{labels.name}} is at {{access_url}}/{{labels.name}}",
            &vars(),
        )
        .unwrap();
        assert_eq!(
            out,
            "Bobby, workspace dev is at https://ara.example.com/dev"
        );
    }

    #[test]
    fn test_render_without_placeholders() {
        assert_eq!(render("plain text", &vars()).unwrap(), "plain text");
        assert_eq!(render("", &vars()).unwrap(), "");
    }

    #[test]
    fn test_render_unknown_variable() {
        assert_eq!(
            render("Hi {{nope}}", &vars()),
            Err(RenderError::UnknownVariable("nope".to_string()))
        );
    }

    #[test]
    fn test_render_unterminated() {
        assert_eq!(
            render("Hi {{user_name", &vars()),
            Err(RenderError::Unterminated(3))
        );
    }

    #[test]
    fn test_render_empty_placeholder() {
        assert!(matches!(
            render("Hi {{  }}", &vars()),
            Err(RenderError::EmptyPlaceholder(3))
        ));
    }

    #[test]
    fn test_values_are_not_reexpanded() {
        let vars = HashMap::from([("a".to_string(), "{{b}}".to_string())]);
        assert_eq!(render("{{a}}", &vars).unwrap(), "{{b}}");
    }
}
