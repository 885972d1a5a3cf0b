// src/tokenizer.rs

//! Cheap token estimate used as the quota cost of a request before the
//! provider reports the real count.

use crate::generator::GenerationRequest;

/// Output allowance assumed when a request sets no `max_output_tokens`.
pub const DEFAULT_OUTPUT_ALLOWANCE: u64 = 8_192;

/// Approximate token count: words split into ~4 character pieces, and
/// every ASCII punctuation mark counted as its own token.
pub fn estimate_tokens(text: &str) -> u64 {
    let mut tokens = 0u64;
    let mut word_len = 0usize;

    for ch in text.chars() {
        if ch.is_whitespace() || ch.is_ascii_punctuation() {
            tokens += word_tokens(word_len);
            word_len = 0;
            if ch.is_ascii_punctuation() {
                tokens += 1;
            }
        } else {
            word_len += 1;
        }
    }
    tokens + word_tokens(word_len)
}

fn word_tokens(len: usize) -> u64 {
    len.div_ceil(4) as u64
}

/// Prompt estimate plus the output the request may consume.
pub fn estimate_request_cost(request: &GenerationRequest) -> u64 {
    let output = request
        .max_output_tokens
        .map_or(DEFAULT_OUTPUT_ALLOWANCE, u64::from);
    estimate_tokens(&request.prompt) + output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t"), 0);
    }

    #[test]
    fn words_and_punctuation() {
        // "Hello" -> 2, "," -> 1, "world" -> 2, "!" -> 1
        assert_eq!(estimate_tokens("Hello, world!"), 6);
        assert_eq!(estimate_tokens("a bb ccc dddd"), 4);
    }

    #[test]
    fn request_cost_includes_output_allowance() {
        let mut request = GenerationRequest::new("four");
        assert_eq!(estimate_request_cost(&request), 1 + DEFAULT_OUTPUT_ALLOWANCE);
        request.max_output_tokens = Some(100);
        assert_eq!(estimate_request_cost(&request), 101);
    }
}
