use http::{HeaderMap, HeaderName, HeaderValue};

/// A pre-compiled header transform operation.
///
/// Values may reference path captures as `{name}`; those are expanded per
/// request from the matched route's parameters.
#[derive(Debug)]
pub struct HeaderOp {
    pub name: HeaderName,
    pub value: HeaderValue,
    template: Option<String>,
    pub action: HeaderOpAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOpAction {
    Set,
    Add,
    Remove,
}

impl HeaderOp {
    pub fn compile(action: HeaderOpAction, name: &str, value: &str) -> Result<Self, String> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name '{}': {}", name, e))?;
        let template = (value.contains('{') && value.contains('}')).then(|| value.to_string());
        let value = match action {
            HeaderOpAction::Remove => HeaderValue::from_static(""),
            _ => HeaderValue::from_str(value)
                .map_err(|e| format!("invalid value for header '{}': {}", name, e))?,
        };
        Ok(Self {
            name,
            value,
            template,
            action,
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap, params: &[(String, String)]) {
        if self.action == HeaderOpAction::Remove {
            headers.remove(&self.name);
            return;
        }
        let value = match self.template {
            Some(ref template) if !params.is_empty() => {
                match HeaderValue::from_str(&expand(template, params)) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(
                            "filter: header: expanded value rejected, header={}, error={}",
                            self.name,
                            e
                        );
                        return;
                    }
                }
            }
            _ => self.value.clone(),
        };
        match self.action {
            HeaderOpAction::Set => {
                headers.insert(self.name.clone(), value);
            }
            HeaderOpAction::Add => {
                headers.append(self.name.clone(), value);
            }
            HeaderOpAction::Remove => {}
        }
    }
}

fn expand(template: &str, params: &[(String, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in params {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_add_remove() {
        let mut headers = HeaderMap::new();
        headers.insert("x-a", "old".parse().unwrap());

        HeaderOp::compile(HeaderOpAction::Set, "x-a", "new")
            .unwrap()
            .apply(&mut headers, &[]);
        assert_eq!(headers["x-a"], "new");

        HeaderOp::compile(HeaderOpAction::Add, "x-a", "second")
            .unwrap()
            .apply(&mut headers, &[]);
        assert_eq!(headers.get_all("x-a").iter().count(), 2);

        HeaderOp::compile(HeaderOpAction::Remove, "x-a", "")
            .unwrap()
            .apply(&mut headers, &[]);
        assert!(!headers.contains_key("x-a"));
    }

    #[test]
    fn test_template_expansion() {
        let op = HeaderOp::compile(HeaderOpAction::Set, "x-order-id", "order-{id}").unwrap();
        let mut headers = HeaderMap::new();
        op.apply(&mut headers, &[("id".into(), "42".into())]);
        assert_eq!(headers["x-order-id"], "order-42");
    }

    #[test]
    fn test_invalid_header_rejected() {
        assert!(HeaderOp::compile(HeaderOpAction::Set, "bad header", "v").is_err());
        assert!(HeaderOp::compile(HeaderOpAction::Set, "x-a", "bad\nvalue").is_err());
    }
}
