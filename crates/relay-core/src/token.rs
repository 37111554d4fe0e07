use rand::RngCore;

/// Length in bytes of the generated shared secret before hex-encoding.
const TOKEN_BYTES: usize = 32;

/// Generates a fresh per-process shared secret for the internal
/// coordination API. Not persisted anywhere; a restart mints a new one
/// and every sidechannel config written afterward picks it up.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time comparison so a mistyped or guessed token cannot be
/// distinguished from a correct one by timing.
pub fn tokens_match(expected: &str, candidate: &str) -> bool {
    let expected = expected.as_bytes();
    let candidate = candidate.as_bytes();
    if expected.len() != candidate.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (a, b) in expected.iter().zip(candidate.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_sized() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
    }

    #[test]
    fn matching_tokens_compare_equal() {
        let token = generate_token();
        assert!(tokens_match(&token, &token));
    }

    #[test]
    fn mismatched_length_is_rejected() {
        assert!(!tokens_match("abc", "abcd"));
    }

    #[test]
    fn mismatched_content_is_rejected() {
        assert!(!tokens_match("abcdef", "abcdeg"));
    }
}
