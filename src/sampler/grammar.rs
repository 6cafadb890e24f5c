//! Grammar trigger compilation.
//!
//! WORD triggers are regex-escaped and joined with PATTERN triggers into a
//! single "anywhere in the output so far" pattern; PATTERN_FULL triggers are
//! anchored as-is; TOKEN triggers are passed through as raw ids.

use regex::Regex;

use super::config::GrammarTrigger;
use crate::error::{CoreError, Result};

pub struct CompiledTriggers {
    pub anywhere: Option<Regex>,
    pub full: Vec<Regex>,
    pub tokens: Vec<i32>,
}

pub fn compile_triggers(triggers: &[GrammarTrigger]) -> Result<CompiledTriggers> {
    let mut anywhere_parts = Vec::new();
    let mut full = Vec::new();
    let mut tokens = Vec::new();

    for trigger in triggers {
        match trigger {
            GrammarTrigger::Word(word) => anywhere_parts.push(regex::escape(word)),
            GrammarTrigger::Pattern(pattern) => anywhere_parts.push(pattern.clone()),
            GrammarTrigger::PatternFull(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| CoreError::Configuration(format!("bad grammar trigger pattern: {e}")))?;
                full.push(re);
            }
            GrammarTrigger::Token(id) => tokens.push(*id),
        }
    }

    let anywhere = if anywhere_parts.is_empty() {
        None
    } else {
        let combined = format!(r"^[\s\S]*?({})[\s\S]*", anywhere_parts.join("|"));
        Some(
            Regex::new(&combined)
                .map_err(|e| CoreError::Configuration(format!("bad grammar trigger word/pattern: {e}")))?,
        )
    };

    Ok(CompiledTriggers { anywhere, full, tokens })
}

impl CompiledTriggers {
    /// Whether `text` (the accumulated generated text so far) or `token`
    /// (the last sampled token id) activates the grammar.
    pub fn matches(&self, text: &str, token: i32) -> bool {
        if self.tokens.contains(&token) {
            return true;
        }
        if let Some(re) = &self.anywhere {
            if re.is_match(text) {
                return true;
            }
        }
        self.full.iter().any(|re| re.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_trigger_matches_anywhere() {
        let triggers = vec![GrammarTrigger::Word("JSON".into())];
        let compiled = compile_triggers(&triggers).unwrap();
        assert!(compiled.matches("here comes JSON now", 0));
        assert!(!compiled.matches("nothing to see", 0));
    }

    #[test]
    fn token_trigger_matches_by_id() {
        let triggers = vec![GrammarTrigger::Token(42)];
        let compiled = compile_triggers(&triggers).unwrap();
        assert!(compiled.matches("", 42));
        assert!(!compiled.matches("", 7));
    }

    #[test]
    fn pattern_full_is_anchored() {
        let triggers = vec![GrammarTrigger::PatternFull(r"^\{.*\}$".into())];
        let compiled = compile_triggers(&triggers).unwrap();
        assert!(compiled.matches("{\"a\":1}", 0));
        assert!(!compiled.matches("prefix {\"a\":1}", 0));
    }
}
