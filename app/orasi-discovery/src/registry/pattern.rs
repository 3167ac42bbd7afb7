//! Discovery pattern matching

use crate::providers::NodeInfo;
use crate::types::Service;

/// Case-insensitive glob match supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position of the last `*` and the text index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Whether the pattern matches the service name or any of its tags
pub fn service_matches(pattern: &str, service: &Service) -> bool {
    glob_match(pattern, &service.name)
        || service
            .metadata
            .tags
            .iter()
            .any(|tag| glob_match(pattern, tag))
}

/// Whether the requester may see the service
///
/// Services without requirements are visible to everyone, including
/// requesters unknown to the topology.
pub fn access_permitted(service: &Service, requester: Option<&NodeInfo>) -> bool {
    let requirements = &service.metadata.capability_requirements;
    if requirements.is_empty() {
        return true;
    }
    match requester {
        Some(node) => node.satisfies(requirements),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("pay*", "payments-api"));
        assert!(glob_match("PAY*", "payments-api"));
        assert!(glob_match("*-api", "inventory-api"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("pay?ents-*", "payments-api"));
        assert!(glob_match("*ment*", "payments-api"));
        assert!(glob_match("payments-api", "Payments-API"));

        assert!(!glob_match("pay*", "inventory-api"));
        assert!(!glob_match("payments", "payments-api"));
        assert!(!glob_match("*-api", "payments-api-v2"));
        assert!(!glob_match("", "payments-api"));
    }

    #[test]
    fn test_glob_backtracking() {
        assert!(glob_match("a*b*c", "aXbYbZc"));
        assert!(glob_match("*aab", "aaab"));
        assert!(!glob_match("a*b*c", "aXbYbZ"));
    }
}
