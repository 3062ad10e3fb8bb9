//! Symmetric difference between desired and currently assigned back-ends.

use std::collections::BTreeSet;

/// Compute `(assign, remove)` so that applying both converges the observed
/// membership to the desired one. Either list may be empty; ordering within
/// each is unspecified.
pub fn diff(desired: &[String], observed: &[String]) -> (Vec<String>, Vec<String>) {
    let mut pending: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let mut remove = Vec::new();
    for id in observed {
        if !pending.remove(id.as_str()) {
            remove.push(id.clone());
        }
    }
    let assign = pending.into_iter().map(str::to_string).collect();
    (assign, remove)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_node_replacement() {
        let (assign, remove) = diff(
            &owned(&["vm2", "vm3", "vm4"]),
            &owned(&["vm1", "vm2", "vm3"]),
        );
        assert_eq!(assign, owned(&["vm4"]));
        assert_eq!(remove, owned(&["vm1"]));
    }

    #[test]
    fn test_converged_membership_is_empty_diff() {
        let (assign, remove) = diff(&owned(&["vm1", "vm2"]), &owned(&["vm2", "vm1"]));
        assert!(assign.is_empty());
        assert!(remove.is_empty());
    }

    #[test]
    fn test_fresh_rule_assigns_everything() {
        let (assign, remove) = diff(&owned(&["vm1", "vm2"]), &[]);
        assert_eq!(assign, owned(&["vm1", "vm2"]));
        assert!(remove.is_empty());
    }

    #[test]
    fn test_empty_desired_removes_everything() {
        let (assign, remove) = diff(&[], &owned(&["vm1"]));
        assert!(assign.is_empty());
        assert_eq!(remove, owned(&["vm1"]));
    }
}
