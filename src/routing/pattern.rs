/// Compiled path pattern.
///
/// Grammar: segments separated by `/`. A literal matches itself, `*` matches
/// exactly one segment, `{name}` matches one segment and captures it, and a
/// trailing `**` matches zero or more remaining segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Param(String),
    CatchAll,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("path pattern '{}' must start with '/'", raw));
        }
        let parts = split_path_segments(raw);
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let seg = match *part {
                "**" => {
                    if i + 1 != parts.len() {
                        return Err(format!(
                            "path pattern '{}': '**' is only allowed as the last segment",
                            raw
                        ));
                    }
                    Segment::CatchAll
                }
                "*" => Segment::Any,
                p if p.starts_with('{') && p.ends_with('}') => {
                    let name = &p[1..p.len() - 1];
                    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(format!(
                            "path pattern '{}': invalid parameter '{}'",
                            raw, p
                        ));
                    }
                    Segment::Param(name.to_string())
                }
                p if p.contains(['*', '{', '}']) => {
                    return Err(format!("path pattern '{}': invalid segment '{}'", raw, p));
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(seg);
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.captures(path).is_some()
    }

    /// Match `path` (query string ignored) and return the `{name}` captures
    /// in pattern order.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts = split_path_segments(path);
        let mut params = Vec::new();
        let mut i = 0;
        for seg in &self.segments {
            match seg {
                Segment::CatchAll => return Some(params),
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Any => {
                    parts.get(i)?;
                }
                Segment::Param(name) => {
                    let value = parts.get(i)?;
                    params.push((name.clone(), value.to_string()));
                }
            }
            i += 1;
        }
        (i == parts.len()).then_some(params)
    }

    /// Whether some concrete path matches both patterns.
    pub fn overlaps(&self, other: &PathPattern) -> bool {
        unify(&self.segments, &other.segments)
    }
}

fn unify(a: &[Segment], b: &[Segment]) -> bool {
    match (a.split_first(), b.split_first()) {
        (None, None) => true,
        (Some((Segment::CatchAll, _)), _) | (_, Some((Segment::CatchAll, _))) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some((x, a_rest)), Some((y, b_rest))) => {
            let compatible = match (x, y) {
                (Segment::Literal(l), Segment::Literal(r)) => l == r,
                _ => true,
            };
            compatible && unify(a_rest, b_rest)
        }
    }
}

/// Split a request path into segments.
/// "/v1/users/list?x=1" -> ["v1", "users", "list"]
/// "/" -> []
pub fn split_path_segments(uri: &str) -> Vec<&str> {
    let path = uri.split('?').next().unwrap_or(uri);
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    trimmed.split('/').collect()
}
