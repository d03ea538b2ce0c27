/// Decides whether a query name belongs to this forwarder: it must sit at or
/// below `from` and must not fall under any `except` entry. The origin
/// itself is always allowed, even when an exclusion would cover it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardZone {
    from: String,
    except: Vec<String>,
}

impl ForwardZone {
    pub fn new(from: &str, except: &[String]) -> Self {
        Self {
            from: normalize(from),
            except: except.iter().map(|e| normalize(e)).collect(),
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn except(&self) -> &[String] {
        &self.except
    }

    pub fn matches(&self, qname: &str) -> bool {
        let qname = normalize(qname);
        is_subdomain(&qname, &self.from) && self.is_allowed(&qname)
    }

    fn is_allowed(&self, qname: &str) -> bool {
        if qname == self.from {
            return true;
        }
        !self.except.iter().any(|ignore| is_subdomain(qname, ignore))
    }
}

impl Default for ForwardZone {
    fn default() -> Self {
        Self::new(".", &[])
    }
}

/// Lowercase, fully qualified form of `name`.
pub fn normalize(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.ends_with('.') {
        name
    } else {
        format!("{}.", name)
    }
}

fn is_subdomain(child: &str, parent: &str) -> bool {
    if parent == "." || child == parent {
        return true;
    }
    child
        .strip_suffix(parent)
        .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_trailing_dot() {
        assert_eq!(normalize("Example.COM"), "example.com.");
        assert_eq!(normalize("example.com."), "example.com.");
        assert_eq!(normalize("."), ".");
    }

    #[test]
    fn test_is_subdomain_respects_label_boundary() {
        assert!(is_subdomain("a.example.com.", "example.com."));
        assert!(!is_subdomain("badexample.com.", "example.com."));
        assert!(is_subdomain("anything.", "."));
    }
}
