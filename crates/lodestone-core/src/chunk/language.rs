//! Language detection and the line-start grammar used for structural splits.
//!
//! A "unit start" is a line at column 0 that opens a top-level function,
//! type, or impl block. Attribute, decorator, and doc-comment lines directly
//! above it travel with the unit.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Bash,
    Sql,
    Markdown,
    Text,
    Unknown,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Language::Rust,
            "py" | "pyw" | "pyi" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Language::Cpp,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "sh" | "bash" | "zsh" => Language::Bash,
            "sql" => Language::Sql,
            "md" | "markdown" | "mdx" => Language::Markdown,
            "txt" | "rst" | "adoc" => Language::Text,
            _ => Language::Unknown,
        }
    }

    /// Map a fenced-block tag (```` ```py ````) to a language.
    pub fn from_fence_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "rust" => Language::Rust,
            "python" => Language::Python,
            "javascript" => Language::JavaScript,
            "typescript" => Language::TypeScript,
            "golang" => Language::Go,
            "shell" | "console" => Language::Bash,
            "c++" => Language::Cpp,
            "c#" | "csharp" => Language::CSharp,
            "ruby" => Language::Ruby,
            other => Self::from_extension(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Bash => "bash",
            Language::Sql => "sql",
            Language::Markdown => "markdown",
            Language::Text => "text",
            Language::Unknown => "unknown",
        }
    }

    /// Programming languages, as opposed to prose formats.
    pub fn is_code(self) -> bool {
        !matches!(
            self,
            Language::Markdown | Language::Text | Language::Unknown
        )
    }

    /// Whether [`is_unit_start`](Self::is_unit_start) knows this language.
    pub fn has_unit_grammar(self) -> bool {
        matches!(
            self,
            Language::Rust
                | Language::Python
                | Language::JavaScript
                | Language::TypeScript
                | Language::Go
                | Language::Ruby
        )
    }

    /// Does `line` open a new top-level unit?
    pub fn is_unit_start(self, line: &str) -> bool {
        if line.starts_with(char::is_whitespace) || line.is_empty() {
            return false;
        }
        let (qualifiers, keywords): (&[&str], &[&str]) = match self {
            Language::Rust => (
                &[
                    "pub",
                    "pub(crate)",
                    "pub(super)",
                    "async",
                    "unsafe",
                    "extern",
                    "default",
                ],
                &[
                    "fn",
                    "impl",
                    "impl<",
                    "struct",
                    "enum",
                    "trait",
                    "mod",
                    "type",
                    "union",
                    "const",
                    "static",
                    "macro_rules!",
                ],
            ),
            Language::Python => (&["async"], &["def", "class"]),
            Language::JavaScript | Language::TypeScript => (
                &["export", "default", "async", "declare", "abstract"],
                &[
                    "function",
                    "function*",
                    "class",
                    "interface",
                    "type",
                    "enum",
                    "const",
                    "let",
                    "namespace",
                ],
            ),
            Language::Go => (&[], &["func", "type", "const", "var"]),
            Language::Ruby => (&[], &["def", "class", "module"]),
            _ => return false,
        };

        let mut tokens = line.split_whitespace();
        let mut token = tokens.next();
        while let Some(t) = token {
            if qualifiers.contains(&t) {
                token = tokens.next();
                continue;
            }
            return keywords.iter().any(|k| t == *k || t.starts_with(&format!("{}<", k)));
        }
        false
    }

    /// Lines that attach to the unit below them (attributes, decorators,
    /// doc comments).
    pub fn is_unit_prefix(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if line.len() - trimmed.len() > 1 || trimmed.is_empty() {
            return false;
        }
        match self {
            Language::Rust => trimmed.starts_with("#[") || trimmed.starts_with("///"),
            Language::Python => trimmed.starts_with('@') || trimmed.starts_with('#'),
            Language::JavaScript | Language::TypeScript => {
                trimmed.starts_with('@')
                    || trimmed.starts_with("//")
                    || trimmed.starts_with("/*")
                    || trimmed.starts_with('*')
            }
            Language::Go => trimmed.starts_with("//"),
            Language::Ruby => trimmed.starts_with('#'),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path(Path::new("src/main.rs")), Language::Rust);
        assert_eq!(Language::from_path(Path::new("app.PY")), Language::Python);
        assert_eq!(Language::from_path(Path::new("README.md")), Language::Markdown);
        assert_eq!(Language::from_path(Path::new("Makefile")), Language::Unknown);
    }

    #[test]
    fn test_rust_unit_starts() {
        let rust = Language::Rust;
        assert!(rust.is_unit_start("fn main() {"));
        assert!(rust.is_unit_start("pub async fn run() -> Result<()> {"));
        assert!(rust.is_unit_start("impl<T: Clone> Store for Memory<T> {"));
        assert!(rust.is_unit_start("pub(crate) struct Inner;"));
        assert!(!rust.is_unit_start("    fn nested() {}"));
        assert!(!rust.is_unit_start("let x = 1;"));
        assert!(!rust.is_unit_start("}"));
    }

    #[test]
    fn test_python_unit_starts() {
        assert!(Language::Python.is_unit_start("def handler(event):"));
        assert!(Language::Python.is_unit_start("async def fetch():"));
        assert!(Language::Python.is_unit_start("class Config:"));
        assert!(!Language::Python.is_unit_start("    def method(self):"));
        assert!(Language::Python.is_unit_prefix("@dataclass"));
    }

    #[test]
    fn test_no_grammar_for_java() {
        assert!(!Language::Java.has_unit_grammar());
        assert!(!Language::Java.is_unit_start("public class Main {"));
    }
}
