//! Supported languages and how to launch them.

use crate::config::Interpreters;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    #[serde(alias = "py", alias = "python3")]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }

    /// File the submitted code is written to inside the workspace.
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
        }
    }

    pub fn interpreter<'a>(&self, interpreters: &'a Interpreters) -> &'a str {
        match self {
            Language::Python => &interpreters.python,
            Language::JavaScript => &interpreters.node,
        }
    }

    /// Whether RLIMIT_AS can bound this interpreter's memory. V8 reserves a
    /// large virtual range at startup and aborts under an address-space
    /// limit, so node gets a heap cap on its command line instead.
    pub fn caps_address_space(&self) -> bool {
        match self {
            Language::Python => true,
            Language::JavaScript => false,
        }
    }

    /// argv for running `source` with the resolved interpreter binary.
    pub fn command(&self, program: &Path, source: &str, memory_kb: u64) -> Vec<String> {
        let program = program.to_string_lossy().into_owned();
        match self {
            Language::Python => vec![program, source.to_string()],
            Language::JavaScript => vec![
                program,
                format!("--max-old-space-size={}", (memory_kb / 1024).max(16)),
                source.to_string(),
            ],
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            other => Err(Error::InvalidInput(format!("unsupported language: {}", other))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve an interpreter name to an absolute path by searching `PATH`.
/// Names containing a slash are taken as paths.
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("PY".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("node".parse::<Language>().unwrap(), Language::JavaScript);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn deserializes_aliases() {
        let lang: Language = serde_json::from_str("\"js\"").unwrap();
        assert_eq!(lang, Language::JavaScript);
        let lang: Language = serde_json::from_str("\"python3\"").unwrap();
        assert_eq!(lang, Language::Python);
    }

    #[test]
    fn node_heap_follows_memory_limit() {
        let argv = Language::JavaScript.command(Path::new("/usr/bin/node"), "main.js", 262_144);
        assert_eq!(argv, ["/usr/bin/node", "--max-old-space-size=256", "main.js"]);
        assert!(!Language::JavaScript.caps_address_space());

        let argv = Language::Python.command(Path::new("/usr/bin/python3"), "main.py", 262_144);
        assert_eq!(argv, ["/usr/bin/python3", "main.py"]);
        assert!(Language::Python.caps_address_space());
    }

    #[test]
    fn resolves_shell_from_path() {
        let sh = resolve_program("sh").expect("sh on PATH");
        assert!(sh.is_absolute());
        assert!(resolve_program("definitely-not-an-interpreter-x9").is_none());
    }
}
