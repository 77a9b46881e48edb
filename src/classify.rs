//! Content-type classification.
//!
//! Every scanned file lands in one of two buckets, `code` or `docs`, which
//! decides the vector collection it is indexed into. Path hints win over
//! extensions: a TypeScript file under `/docs/` is documentation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::RuntimeConfig;

/// The bucket a file is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Docs,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Docs => "docs",
        }
    }

    /// Collection suffix for this bucket (`__code` / `__docs`).
    pub fn collection_suffix(&self) -> &'static str {
        match self {
            ContentType::Code => "__code",
            ContentType::Docs => "__docs",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "code" => Ok(ContentType::Code),
            "docs" => Ok(ContentType::Docs),
            other => Err(format!("unknown content type: '{other}'")),
        }
    }
}

/// Classify a repo-relative path, returning the bucket and the doc path
/// hint that matched, if any.
///
/// The path is lowered to POSIX form and wrapped with `/` on both sides so
/// hints can anchor on component boundaries. The first configured hint that
/// is a substring wins; otherwise the extension decides; otherwise `code`.
pub fn classify_content(path: &str, runtime: &RuntimeConfig) -> (ContentType, Option<String>) {
    let normalized = path.trim().replace('\\', "/").to_lowercase();
    let wrapped = format!("/{}/", normalized.trim_matches('/'));

    for hint in &runtime.doc_path_hints {
        if wrapped.contains(hint.as_str()) {
            return (ContentType::Docs, Some(hint.clone()));
        }
    }

    let suffix = Path::new(&normalized)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    if runtime.doc_extensions.contains(&suffix) {
        return (ContentType::Docs, None);
    }

    (ContentType::Code, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_runtime_config;

    fn runtime() -> RuntimeConfig {
        load_runtime_config(|_| None)
    }

    #[test]
    fn classifies_readme_by_path_hint_before_extension() {
        let (content_type, hint) = classify_content("README.md", &runtime());
        assert_eq!(content_type, ContentType::Docs);
        assert_eq!(hint.as_deref(), Some("/readme"));
    }

    #[test]
    fn classifies_code_file_under_docs_dir_as_docs() {
        let (content_type, hint) = classify_content("apps/docs/api/auth.ts", &runtime());
        assert_eq!(content_type, ContentType::Docs);
        assert_eq!(hint.as_deref(), Some("/docs/"));
    }

    #[test]
    fn classifies_docs_by_extension_without_hint() {
        let (content_type, hint) = classify_content("notes/ideas.txt", &runtime());
        assert_eq!(content_type, ContentType::Docs);
        assert_eq!(hint, None);
    }

    #[test]
    fn classifies_regular_source_as_code() {
        let (content_type, hint) = classify_content("src/services/auth.py", &runtime());
        assert_eq!(content_type, ContentType::Code);
        assert_eq!(hint, None);
    }

    #[test]
    fn content_type_parsing_and_suffix() {
        assert_eq!("code".parse::<ContentType>().unwrap(), ContentType::Code);
        assert_eq!(" Docs ".parse::<ContentType>().unwrap(), ContentType::Docs);
        assert!("all".parse::<ContentType>().is_err());
        assert_eq!(ContentType::Code.collection_suffix(), "__code");
        assert_eq!(ContentType::Docs.collection_suffix(), "__docs");
    }
}
