//! Prompt-side string helpers shared by callers that feed page text and
//! anchor context into the model.

/// Cap a prompt fragment at `max_bytes`, backing off to the nearest char
/// boundary so multi-byte text never splits mid-character.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Peel a markdown code fence off a model reply. Replies asked for as bare
/// JSON still come back fenced often enough that every parse goes through
/// this first.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn short_input_passes_through_whole() {
        assert_eq!(truncate_to_char_boundary("Hello", 100), "Hello");
    }

    #[test]
    fn fences_are_peeled_bare_json_untouched() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
        assert_eq!(strip_code_blocks("  ```json\n{\"a\":1}\n```  "), "{\"a\":1}");
    }
}
