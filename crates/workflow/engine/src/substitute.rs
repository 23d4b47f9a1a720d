//! `{{name}}` parameter substitution
//!
//! Structured values are substituted through their JSON form so a single
//! pass covers every string field, with replacement values escaped for
//! JSON.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

use crate::{EngineError, EngineResult};

/// Flat parameter scope, e.g. `inputs.parameters.message` → `hello`
pub type Params = BTreeMap<String, String>;

/// Replace every `{{ key }}` in `text`.
///
/// Unknown keys are left in place when `allow_unresolved` is set and are an
/// error otherwise.
pub fn replace(text: &str, params: &Params, allow_unresolved: bool) -> EngineResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = after[..end].trim();
        match params.get(key) {
            Some(value) => out.push_str(value),
            None if allow_unresolved => out.push_str(&rest[start..start + 2 + end + 2]),
            None => {
                return Err(EngineError::UnresolvedReference(format!(
                    "failed to resolve {{{{{}}}}}",
                    key
                )))
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Substitute parameters into every string of a serializable value.
pub fn replace_json<T>(value: &T, params: &Params, allow_unresolved: bool) -> EngineResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    let mut escaped = Params::new();
    for (key, raw) in params {
        let quoted = serde_json::to_string(raw)?;
        escaped.insert(key.clone(), quoted[1..quoted.len() - 1].to_string());
    }
    let replaced = replace(&json, &escaped, allow_unresolved)?;
    Ok(serde_json::from_str(&replaced)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::Arguments;

    fn params() -> Params {
        let mut p = Params::new();
        p.insert("inputs.parameters.msg".into(), "hello \"world\"".into());
        p.insert("workflow.name".into(), "wf".into());
        p
    }

    #[test]
    fn test_replace_known_keys() {
        let out = replace("{{workflow.name}}: {{ inputs.parameters.msg }}", &params(), false).unwrap();
        assert_eq!(out, "wf: hello \"world\"");
    }

    #[test]
    fn test_unresolved_kept_or_rejected() {
        let text = "a {{steps.x.outputs.result}} b";
        assert_eq!(replace(text, &params(), true).unwrap(), text);
        let err = replace(text, &params(), false).unwrap_err();
        assert!(err.to_string().contains("steps.x.outputs.result"));
    }

    #[test]
    fn test_unterminated_braces_pass_through() {
        assert_eq!(replace("x {{oops", &params(), false).unwrap(), "x {{oops");
    }

    #[test]
    fn test_replace_json_escapes_values() {
        let args = Arguments::default().with_parameter("m", "{{inputs.parameters.msg}}");
        let out = replace_json(&args, &params(), false).unwrap();
        assert_eq!(
            out.get_parameter("m").unwrap().value.as_deref(),
            Some("hello \"world\"")
        );
    }
}
