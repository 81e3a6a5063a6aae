// Hierarchical name-space identifier.
//
// A `Path` is rooted and `/`-separated; each segment is stored unescaped but
// rendered with `/` and `\` backslash-escaped so the rendered form always
// round-trips through `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path, `/`.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Builds the child path `self/segment`.
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    fn escape_segment(segment: &str, out: &mut String) {
        for ch in segment.chars() {
            if ch == '/' || ch == '\\' {
                out.push('\\');
            }
            out.push(ch);
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            let mut escaped = String::with_capacity(seg.len());
            Self::escape_segment(seg, &mut escaped);
            write!(f, "{escaped}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid path: {0}")]
pub struct PathParseError(String);

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| PathParseError(format!("path must start with '/': {s}")))?;

        if rest.is_empty() {
            return Ok(Path::root());
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    } else {
                        return Err(PathParseError(format!("trailing escape in: {s}")));
                    }
                }
                '/' => {
                    segments.push(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }
        segments.push(current);

        Ok(Path { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trips() {
        let root = Path::root();
        assert_eq!(root.to_string(), "/");
        assert_eq!("/".parse::<Path>().unwrap(), root);
    }

    #[test]
    fn child_and_parent() {
        let a = Path::root().child("a");
        let b = a.child("b");
        assert_eq!(b.to_string(), "/a/b");
        assert_eq!(b.parent(), Some(a.clone()));
        assert_eq!(a.parent(), Some(Path::root()));
        assert_eq!(b.name(), Some("b"));
    }

    #[test]
    fn escaping_round_trips() {
        let p = Path::root().child("weird/seg").child("back\\slash");
        let rendered = p.to_string();
        let parsed: Path = rendered.parse().unwrap();
        assert_eq!(parsed, p);
    }
}
