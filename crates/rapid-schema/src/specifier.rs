//! Parsing of user supplied package references.

use std::fmt;

/// Optional scheme prefix accepted on specifiers.
pub const SCHEME: &str = "rapid://";

/// A user supplied package reference.
///
/// `repo:tag` names a tag in one repository; anything without a colon is a
/// display name searched across every repository. A leading `rapid://` is
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageSpec {
    /// `repository:tag`
    Tagged {
        /// Repository short name.
        repository: String,
        /// Tag within that repository.
        tag: String,
    },
    /// A display name.
    Name(String),
}

impl PackageSpec {
    /// Parse a specifier. Never fails; an empty name simply resolves to nothing.
    pub fn parse(input: &str) -> Self {
        let s = input.trim();
        let s = s.strip_prefix(SCHEME).unwrap_or(s);
        match s.split_once(':') {
            Some((repository, tag)) if !repository.is_empty() && !tag.is_empty() => {
                Self::Tagged {
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                }
            }
            _ => Self::Name(s.to_string()),
        }
    }

    /// Keys to try, in order, against a repository index.
    ///
    /// Published tags usually carry the repository prefix (`byar:test`),
    /// but bare tags are accepted too.
    pub fn tag_keys(&self) -> Vec<String> {
        match self {
            Self::Tagged { repository, tag } => vec![format!("{repository}:{tag}"), tag.clone()],
            Self::Name(_) => Vec::new(),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tagged { repository, tag } => write!(f, "{repository}:{tag}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for PackageSpec {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
