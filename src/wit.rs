//! WIT extraction and import/export scanning

use crate::tools::{ToolError, Tools};
use crate::types::Wit;
use tokio_util::sync::CancellationToken;

/// Render the WIT of `binary` using the embedded WIT tool
pub async fn extract(
    tools: &Tools,
    binary: &[u8],
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    tools.extract_wit(binary, cancel).await
}

/// Extract and scan `binary` in one go
pub async fn extract_imports_exports(
    tools: &Tools,
    binary: &[u8],
    cancel: &CancellationToken,
) -> Result<Wit, ToolError> {
    let text = extract(tools, binary, cancel).await?;
    let (imports, exports) = parse_imports_exports(&text);
    Ok(Wit { imports, exports })
}

/// Scan WIT text for `import` and `export` statements, in document order
///
/// This is a textual scan rather than a parse. Comments are ignored and a
/// statement may span lines. Inline interface declarations are reported as
/// `name: interface`; function items keep their signature, e.g.
/// `run: func()`.
pub fn parse_imports_exports(wit: &str) -> (Vec<String>, Vec<String>) {
    let text = strip_comments(wit);
    let mut imports = Vec::new();
    let mut exports = Vec::new();

    let mut pos = 0;
    while let Some((keyword, start)) = next_keyword(&text, pos) {
        let body = start + keyword.len();
        let Some((end, item)) = statement(&text, body) else {
            break;
        };
        pos = end;
        if item.is_empty() {
            continue;
        }
        match keyword {
            "import" => imports.push(item),
            _ => exports.push(item),
        }
    }

    (imports, exports)
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map(|i| &after[i..]).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map(|i| &after[i + 2..]).unwrap_or("");
            out.push(' ');
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '%'
}

/// Find the next `import`/`export` keyword standing on its own
fn next_keyword(text: &str, from: usize) -> Option<(&'static str, usize)> {
    let mut search = from;
    loop {
        let rest = text.get(search..)?;
        let found = ["import", "export"]
            .into_iter()
            .filter_map(|kw| rest.find(kw).map(|i| (kw, search + i)))
            .min_by_key(|(_, i)| *i)?;
        let (keyword, start) = found;
        let before_ok = text[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_ident_char(c));
        let after_ok = text[start + keyword.len()..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace);
        if before_ok && after_ok {
            return Some(found);
        }
        search = start + keyword.len();
    }
}

/// Read one statement body starting at `from`
///
/// Ends at a `;` outside braces, or at the `}` closing an inline body.
/// Returns the position after the statement and its normalized text.
fn statement(text: &str, from: usize) -> Option<(usize, String)> {
    let mut depth = 0usize;
    let mut brace_start = None;
    for (offset, c) in text[from..].char_indices() {
        let at = from + offset;
        match c {
            '{' => {
                if depth == 0 {
                    brace_start = Some(at);
                }
                depth += 1;
            }
            '}' if depth == 0 => {
                // closing brace of the enclosing world: malformed statement
                return Some((at + 1, String::new()));
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let header = &text[from..brace_start.unwrap_or(at)];
                    return Some((at + 1, normalize(header)));
                }
            }
            ';' if depth == 0 => return Some((at + 1, normalize(&text[from..at]))),
            _ => {}
        }
    }
    None
}

fn normalize(item: &str) -> String {
    item.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_world() {
        let wit = r#"
package root:component;

world root {
  import wasi:config/store@0.2.0-draft;
  import wasi:logging/logging;
  export wasi:http/incoming-handler@0.2.0;
}
"#;
        let (imports, exports) = parse_imports_exports(wit);
        assert_eq!(
            imports,
            vec!["wasi:config/store@0.2.0-draft", "wasi:logging/logging"]
        );
        assert_eq!(exports, vec!["wasi:http/incoming-handler@0.2.0"]);
    }

    #[test]
    fn test_comments_are_ignored() {
        let wit = r#"
world root {
  /// import a:b/c;
  // export x:y/z;
  /* import d:e/f; */
  import real:pkg/iface;
}
"#;
        let (imports, exports) = parse_imports_exports(wit);
        assert_eq!(imports, vec!["real:pkg/iface"]);
        assert!(exports.is_empty());
    }

    #[test]
    fn test_multi_line_and_functions() {
        let wit = "world root {\n  export run:\n    func(a: u32) -> string;\n  import\n  a:b/c;\n}";
        let (imports, exports) = parse_imports_exports(wit);
        assert_eq!(imports, vec!["a:b/c"]);
        assert_eq!(exports, vec!["run: func(a: u32) -> string"]);
    }

    #[test]
    fn test_inline_interface() {
        let wit = r#"
world root {
  import host: interface {
    log: func(msg: string);
  }
  export a:b/c;
}
"#;
        let (imports, exports) = parse_imports_exports(wit);
        assert_eq!(imports, vec!["host: interface"]);
        assert_eq!(exports, vec!["a:b/c"]);
    }

    #[test]
    fn test_keywords_inside_identifiers_are_skipped() {
        let wit = "world root {\n  import my-import-thing: func();\n  export reexport;\n}";
        let (imports, exports) = parse_imports_exports(wit);
        assert_eq!(imports, vec!["my-import-thing: func()"]);
        assert_eq!(exports, vec!["reexport"]);
    }

    #[test]
    fn test_empty_world() {
        let (imports, exports) = parse_imports_exports("package root:component;\n\nworld root {\n}\n");
        assert!(imports.is_empty());
        assert!(exports.is_empty());
    }
}
