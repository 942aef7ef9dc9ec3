//! Subprotocol negotiation (spec.md §4.2 step 2). The result is used both to
//! accept the client's upgrade and to dial upstream, so both legs agree.

/// Returns the subprotocols to keep, or `Err(())` if the client requested at
/// least one and none survived the allowlist (a 403 at the call site).
pub fn negotiate(requested: &[String], allowed: &[String]) -> Result<Vec<String>, ()> {
    if allowed.is_empty() {
        return Ok(requested.to_vec());
    }
    let kept: Vec<String> = requested
        .iter()
        .filter(|p| allowed.iter().any(|a| a == *p))
        .cloned()
        .collect();
    if !requested.is_empty() && kept.is_empty() {
        Err(())
    } else {
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_allowlist_passes_everything() {
        let requested = vec!["foo".to_string()];
        assert_eq!(negotiate(&requested, &[]).unwrap(), requested);
    }

    #[test]
    fn intersects_when_allowlist_present() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let allowed = vec!["b".to_string(), "c".to_string()];
        assert_eq!(negotiate(&requested, &allowed).unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn empty_intersection_with_nonempty_request_is_rejected() {
        let requested = vec!["a".to_string()];
        let allowed = vec!["b".to_string()];
        assert!(negotiate(&requested, &allowed).is_err());
    }

    #[test]
    fn client_requesting_nothing_is_always_fine() {
        assert_eq!(negotiate(&[], &["b".to_string()]).unwrap(), Vec::<String>::new());
    }
}
