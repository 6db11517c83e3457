use anyhow::Result;
use regex::Regex;

/// A compiled external endpoint template.
///
/// `source` is the rewritten template (`/payments/(\d*)$`). `regex` is the
/// same source anchored at the start of the path so that `/x/me` cannot match
/// a rule for `/me`.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex: Regex,
    var_names: Vec<String>,
}

impl CompiledPattern {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match `path` and return `(name, value)` pairs for every declared
    /// variable, in declaration order. `None` when the path does not match.
    pub fn captures<'p>(&self, path: &'p str) -> Option<Vec<(&str, &'p str)>> {
        let caps = self.regex.captures(path)?;
        let mut out = Vec::with_capacity(self.var_names.len());
        for (i, name) in self.var_names.iter().enumerate() {
            let value = caps.get(i + 1).map(|m| m.as_str()).unwrap_or("");
            out.push((name.as_str(), value));
        }
        Some(out)
    }
}

/// Compile an external template into a matchable pattern.
///
/// `var_names` and `var_expressions` are space-separated lists, positionally
/// aligned: the n-th name is bound to the n-th regex fragment.
pub fn compile_pattern(
    template: &str,
    var_names: Option<&str>,
    var_expressions: Option<&str>,
) -> Result<CompiledPattern> {
    let names: Vec<&str> = var_names
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    let fragments: Vec<&str> = var_expressions
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();

    if names.len() != fragments.len() {
        anyhow::bail!(
            "endpoint '{}': {} variable name(s) but {} expression(s)",
            template,
            names.len(),
            fragments.len()
        );
    }

    let placeholders = placeholder_names(template);
    for p in &placeholders {
        if !names.contains(p) {
            anyhow::bail!("endpoint '{}': placeholder '{{{}}}' has no expression", template, p);
        }
    }

    let source = if names.is_empty() {
        format!("{}$", template)
    } else {
        let mut source = template.to_string();
        for (i, (name, fragment)) in names.iter().zip(&fragments).enumerate() {
            let placeholder = format!("{{{}}}", name);
            if !source.contains(&placeholder) {
                anyhow::bail!(
                    "endpoint '{}': variable '{}' does not appear in the template",
                    template,
                    name
                );
            }
            let is_last = i == names.len() - 1;
            let ends_here = source.ends_with(&placeholder);
            let mut group = format!("({})", fragment);
            if is_last && ends_here && !fragment.ends_with('$') {
                group.push('$');
            }
            source = source.replacen(&placeholder, &group, 1);
        }
        source
    };

    let regex = Regex::new(&format!("^(?:{})", source))
        .map_err(|e| anyhow::anyhow!("endpoint '{}': invalid pattern '{}': {}", template, source, e))?;

    Ok(CompiledPattern {
        source,
        regex,
        var_names: names.into_iter().map(String::from).collect(),
    })
}

/// Names of all `{name}` placeholders in a template, in order of appearance.
/// Regex quantifiers such as `{3}` or `{2,4}` are not placeholders.
pub fn placeholder_names(template: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if is_identifier(name) {
                    out.push(name);
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_template_is_end_anchored() {
        let p = compile_pattern("/me", None, None).unwrap();
        assert_eq!(p.source(), "/me$");
        assert!(p.is_match("/me"));
        assert!(!p.is_match("/me/extra"));
        assert!(!p.is_match("/meh"));
    }

    #[test]
    fn test_literal_template_is_start_anchored() {
        let p = compile_pattern("/me", None, None).unwrap();
        assert!(!p.is_match("/other/me"));
    }

    #[test]
    fn test_final_placeholder_gets_end_anchor() {
        let p = compile_pattern("/payments/{id}", Some("id"), Some(r"\d*")).unwrap();
        assert_eq!(p.source(), r"/payments/(\d*)$");
        assert!(p.is_match("/payments/42"));
        assert!(!p.is_match("/payments/42/info"));
    }

    #[test]
    fn test_inner_placeholder_has_no_end_anchor() {
        let p = compile_pattern("/payments/{id}/info", Some("id"), Some(r"\d*")).unwrap();
        assert_eq!(p.source(), r"/payments/(\d*)/info");
        assert!(p.is_match("/payments/42/info"));
    }

    #[test]
    fn test_fragment_with_own_anchor_not_doubled() {
        let p = compile_pattern("/items/{id}", Some("id"), Some(r"\w+$")).unwrap();
        assert_eq!(p.source(), r"/items/(\w+$)");
    }

    #[test]
    fn test_multiple_placeholders() {
        let p = compile_pattern(
            "/users/{user}/orders/{order}",
            Some("user order"),
            Some(r"\d+ [a-z0-9]+"),
        )
        .unwrap();
        assert_eq!(p.source(), r"/users/(\d+)/orders/([a-z0-9]+)$");

        let caps = p.captures("/users/7/orders/ab12").unwrap();
        assert_eq!(caps, vec![("user", "7"), ("order", "ab12")]);
    }

    #[test]
    fn test_captures_none_on_miss() {
        let p = compile_pattern("/payments/{id}", Some("id"), Some(r"\d+")).unwrap();
        assert!(p.captures("/payments/abc").is_none());
    }

    #[test]
    fn test_invalid_fragment_fails() {
        let err = compile_pattern("/x/{id}", Some("id"), Some("(unclosed")).unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_name_expression_count_mismatch_fails() {
        assert!(compile_pattern("/x/{a}/{b}", Some("a b"), Some(r"\d+")).is_err());
    }

    #[test]
    fn test_undeclared_placeholder_fails() {
        assert!(compile_pattern("/x/{a}", None, None).is_err());
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(placeholder_names("/a/{x}/b/{y}"), vec!["x", "y"]);
        assert!(placeholder_names("/plain").is_empty());
        assert!(placeholder_names(r"/codes/\d{3}").is_empty());
    }
}
