use crate::config::HeaderMatcher;

/// A pre-compiled header matcher for fast request-time evaluation.
#[derive(Debug)]
pub struct CompiledHeaderMatcher {
    pub name: String,
    pub value: String,
    pub match_type: HeaderMatchType,
    pub invert: bool,
    pub regex: Option<regex::Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMatchType {
    Exact,
    Prefix,
    Regex,
    Present,
}

impl CompiledHeaderMatcher {
    pub fn matches(&self, header_value: Option<&str>) -> bool {
        let raw_match = match self.match_type {
            HeaderMatchType::Present => header_value.is_some(),
            HeaderMatchType::Exact => header_value.is_some_and(|v| v == self.value),
            HeaderMatchType::Prefix => header_value.is_some_and(|v| v.starts_with(&self.value)),
            HeaderMatchType::Regex => match self.regex {
                Some(ref re) => header_value.is_some_and(|v| re.is_match(v)),
                None => false,
            },
        };
        if self.invert {
            !raw_match
        } else {
            raw_match
        }
    }
}

/// All matchers must pass (AND semantics).
pub fn headers_match(matchers: &[CompiledHeaderMatcher], headers: &http::HeaderMap) -> bool {
    matchers.iter().all(|hm| {
        let header_val = headers.get(&hm.name).and_then(|v| v.to_str().ok());
        hm.matches(header_val)
    })
}

pub fn compile_header_matchers(
    headers: &[HeaderMatcher],
) -> Result<Vec<CompiledHeaderMatcher>, String> {
    headers
        .iter()
        .map(|h| {
            let match_type = match h.match_type.as_str() {
                "exact" => HeaderMatchType::Exact,
                "prefix" => HeaderMatchType::Prefix,
                "regex" => HeaderMatchType::Regex,
                "present" => HeaderMatchType::Present,
                other => {
                    return Err(format!(
                        "header '{}' has unknown match_type '{}'",
                        h.name, other
                    ))
                }
            };
            let regex = if match_type == HeaderMatchType::Regex {
                Some(regex::Regex::new(&h.value).map_err(|e| {
                    format!("header '{}' has invalid regex '{}': {}", h.name, h.value, e)
                })?)
            } else {
                None
            };
            Ok(CompiledHeaderMatcher {
                name: h.name.to_ascii_lowercase(),
                value: h.value.clone(),
                match_type,
                invert: h.invert,
                regex,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(name: &str, value: &str, match_type: &str, invert: bool) -> HeaderMatcher {
        HeaderMatcher {
            name: name.into(),
            value: value.into(),
            match_type: match_type.into(),
            invert,
        }
    }

    fn compile_one(m: HeaderMatcher) -> CompiledHeaderMatcher {
        compile_header_matchers(&[m]).unwrap().remove(0)
    }

    #[test]
    fn test_exact() {
        let m = compile_one(matcher("X-Env", "canary", "exact", false));
        assert_eq!(m.name, "x-env");
        assert!(m.matches(Some("canary")));
        assert!(!m.matches(Some("canary-2")));
        assert!(!m.matches(None));
    }

    #[test]
    fn test_prefix_and_present() {
        let m = compile_one(matcher("x-version", "v2", "prefix", false));
        assert!(m.matches(Some("v2.1")));
        assert!(!m.matches(Some("v1")));

        let m = compile_one(matcher("x-debug", "", "present", false));
        assert!(m.matches(Some("")));
        assert!(!m.matches(None));
    }

    #[test]
    fn test_regex_and_invert() {
        let m = compile_one(matcher("x-user", r"^\d+$", "regex", false));
        assert!(m.matches(Some("1234")));
        assert!(!m.matches(Some("abc")));

        let m = compile_one(matcher("x-env", "prod", "exact", true));
        assert!(m.matches(Some("dev")));
        assert!(m.matches(None));
        assert!(!m.matches(Some("prod")));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(compile_header_matchers(&[matcher("x", "(", "regex", false)]).is_err());
    }

    #[test]
    fn test_unknown_match_type_rejected() {
        assert!(compile_header_matchers(&[matcher("x", "a", "glob", false)]).is_err());
    }

    #[test]
    fn test_headers_match_and_semantics() {
        let ms = compile_header_matchers(&[
            matcher("x-a", "1", "exact", false),
            matcher("x-b", "", "present", false),
        ])
        .unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-a", "1".parse().unwrap());
        assert!(!headers_match(&ms, &headers));
        headers.insert("x-b", "yes".parse().unwrap());
        assert!(headers_match(&ms, &headers));
    }
}
