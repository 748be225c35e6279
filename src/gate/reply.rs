//! Cleanup of backend reply text before it is spoken and remembered.

use super::text;
use crate::config::ReplyPolicy;

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            // keep runs like "?!" or "..." with their sentence
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    cut.trim_end().to_string()
}

/// Strips markdown emphasis, collapses whitespace, drops near-duplicate
/// consecutive sentences and caps sentence count and length.
pub fn sanitize_reply(reply: &str, policy: &ReplyPolicy) -> String {
    let stripped: String = reply
        .chars()
        .filter(|c| !matches!(c, '*' | '`' | '_' | '~'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return String::new();
    }

    let mut kept: Vec<String> = Vec::new();
    for sentence in split_sentences(&collapsed) {
        if let Some(previous) = kept.last() {
            if text::token_overlap(previous, &sentence) >= policy.dedupe_overlap {
                continue;
            }
        }
        kept.push(sentence);
        if policy.max_sentences > 0 && kept.len() >= policy.max_sentences {
            break;
        }
    }

    let joined = kept.join(" ");
    if policy.max_chars > 0 {
        truncate_chars(&joined, policy.max_chars)
    } else {
        joined
    }
}

/// True for the backend's own "I could not hear you" answers, which are not
/// worth speaking back to the caller.
pub fn is_backend_clarify(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    if !lower.contains("hear") {
        return false;
    }
    ["please try again", "could not hear that clearly", "couldn't hear that clearly"]
        .iter()
        .any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_runs() {
        assert_eq!(
            split_sentences("Really?! Yes. ok"),
            vec!["Really?!".to_string(), "Yes.".to_string(), "ok".to_string()]
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
    }
}
