//! Minimal `{{.NAME}}` template renderer for environment values.
//!
//! Templates may only reference names bound in the replacement scope;
//! anything else inside `{{ }}` is a parse error, and a well-formed
//! reference to an unbound name is a render error. Text outside the
//! delimiters is copied through verbatim.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("{reason}")]
    Parse { reason: String },
    #[error("template refers to unbound variable {name:?}")]
    Unbound { name: String },
}

/// Renders `input`, substituting each `{{.NAME}}` with `scope[NAME]`.
pub fn render(input: &str, scope: &HashMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| TemplateError::Parse {
            reason: "unterminated \"{{\"".to_string(),
        })?;

        let expr = after[..end].trim();
        let name = expr
            .strip_prefix('.')
            .ok_or_else(|| TemplateError::Parse {
                reason: format!("expected \".name\" inside delimiters, found {expr:?}"),
            })?
            .trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TemplateError::Parse {
                reason: format!("invalid variable reference {expr:?}"),
            });
        }

        let value = scope.get(name).ok_or_else(|| TemplateError::Unbound {
            name: name.to_string(),
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> HashMap<String, String> {
        HashMap::from([
            ("FOO".to_string(), "BAR".to_string()),
            ("BIZ".to_string(), "BAZ".to_string()),
        ])
    }

    #[test]
    fn substitutes_bound_names() {
        let out = render("this:{{ .FOO }}:is:{{ .BIZ }}", &scope()).unwrap();
        assert_eq!(out, "this:BAR:is:BAZ");
        let out = render("some:{{.FOO}}", &scope()).unwrap();
        assert_eq!(out, "some:BAR");
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(render("no templates here", &scope()).unwrap(), "no templates here");
    }

    #[test]
    fn rejects_expressions_without_a_leading_dot() {
        let err = render("this:{{ is }}invalid", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));
    }

    #[test]
    fn rejects_unterminated_delimiters() {
        let err = render("oops {{ .FOO", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));
    }

    #[test]
    fn unbound_names_are_render_errors() {
        let err = render("{{ .MISSING }}", &scope()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unbound {
                name: "MISSING".to_string()
            }
        );
    }
}
