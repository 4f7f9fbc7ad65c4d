//! Placeholder expansion for repository templates

/// Values available to a template
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub generation: i64,
    pub kind: String,
    pub group: String,
}

impl TemplateVars {
    fn lookup(&self, placeholder: &str) -> Option<String> {
        match placeholder {
            "namespace" => Some(self.namespace.clone()),
            "name" => Some(self.name.clone()),
            "uid" => Some(self.uid.clone()),
            "generation" => Some(self.generation.to_string()),
            "kind" => Some(self.kind.to_lowercase()),
            "group" => Some(self.group.clone()),
            _ => None,
        }
    }
}

/// Replace every `{placeholder}` in `template`
pub fn expand(template: &str, vars: &TemplateVars) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unclosed placeholder in '{}'", template))?;
        let placeholder = after[..close].trim();
        let value = vars
            .lookup(placeholder)
            .ok_or_else(|| format!("unknown placeholder '{{{}}}'", placeholder))?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(format!("unmatched '}}' in '{}'", template));
    }
    out.push_str(rest);
    Ok(out)
}
