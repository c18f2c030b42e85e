//! `{key}` placeholder rendering for command lines and artifact names.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::BuildError;

/// Values available to a template.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace every `{key}` where `key` is an identifier. `{{` and `}}`
    /// produce literal braces. Any other brace text is kept verbatim, so
    /// shell such as `awk '{print $1}'`, `${VAR}` or `f() { ...; }` passes
    /// through untouched. An identifier with no value is an error.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
            out.push_str(&rest[..pos]);
            let after_dollar = out.ends_with('$');
            let tail = &rest[pos..];
            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }
            let key = tail[1..].find('}').map(|end| &tail[1..end + 1]);
            match key {
                Some(key) if !after_dollar && is_placeholder(key) => {
                    let value = self.get(key).ok_or_else(|| BuildError::Template {
                        template: template.to_string(),
                        key: key.to_string(),
                    })?;
                    out.push_str(value);
                    rest = &tail[key.len() + 2..];
                }
                _ => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_placeholder(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.set("name", "vyos-intel-ixgbe")
            .set("version", "5.19.6")
            .set("arch", "amd64");
        vars
    }

    #[test]
    fn renders_artifact_pattern() {
        let out = vars().render("{name}_{version}_{arch}.deb").unwrap();
        assert_eq!(out, "vyos-intel-ixgbe_5.19.6_amd64.deb");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let out = vars().render("echo ${{HOME}} {name}").unwrap();
        assert_eq!(out, "echo ${HOME} vyos-intel-ixgbe");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = vars().render("{name}-{release}").unwrap_err();
        assert!(err.to_string().contains("'{release}'"));
    }

    #[test]
    fn unterminated_brace_is_kept_verbatim() {
        assert_eq!(vars().render("awk '{print").unwrap(), "awk '{print");
    }

    #[test]
    fn shell_braces_pass_through() {
        let out = vars()
            .render("make -C src && awk '{print $1}' Module.symvers > {name}.syms")
            .unwrap();
        assert_eq!(
            out,
            "make -C src && awk '{print $1}' Module.symvers > vyos-intel-ixgbe.syms"
        );
        assert_eq!(vars().render("echo ${HOME}").unwrap(), "echo ${HOME}");
        assert_eq!(
            vars().render("f() { echo {version}; }; f").unwrap(),
            "f() { echo 5.19.6; }; f"
        );
    }
}
