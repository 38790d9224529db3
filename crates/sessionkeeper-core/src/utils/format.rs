/// Number of leading characters of a token kept visible in logs
const TOKEN_VISIBLE_PREFIX: usize = 4;

/// Mask a token for logging, keeping only a short prefix.
/// Tokens are never written to logs in full.
pub fn mask_token(token: &str) -> String {
    let count = token.chars().count();
    if count == 0 {
        return "<empty>".to_string();
    }
    // Short tokens would be fully revealed by the prefix, hide them entirely
    if count <= TOKEN_VISIBLE_PREFIX * 2 {
        return format!("*** ({} chars)", count);
    }
    let prefix: String = token.chars().take(TOKEN_VISIBLE_PREFIX).collect();
    format!("{}*** ({} chars)", prefix, count)
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}
