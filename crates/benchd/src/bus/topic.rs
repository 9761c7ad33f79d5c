// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topic grammar: lowercase dotted segments, `*` matches exactly one
//! segment, `#` matches the tail (only legal as the final segment).

/// A concrete (publish-side) topic must be all `[a-z][a-z0-9_-]*` segments,
/// no wildcards.
pub fn is_valid_concrete_topic(topic: &str) -> bool {
    if topic.is_empty() {
        return false;
    }
    topic.split('.').all(is_valid_segment)
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// A subscription-side topic pattern: concrete segments plus `*` (one
/// segment) and a trailing `#` (tail).
#[derive(Debug, Clone)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Star,
    Hash,
}

impl TopicPattern {
    /// Parse a pattern string, validating the grammar (`#` only as the
    /// final segment, segments otherwise matching the concrete-topic rule).
    pub fn parse(pattern: &str) -> crate::error::Result<Self> {
        let parts: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let seg = match *part {
                "*" => Segment::Star,
                "#" => {
                    if i != parts.len() - 1 {
                        return Err(crate::error::OrchestratorError::Protocol(format!(
                            "'#' must be the final segment in pattern {pattern:?}"
                        )));
                    }
                    Segment::Hash
                }
                lit if is_valid_segment(lit) => Segment::Literal(lit.to_owned()),
                other => {
                    return Err(crate::error::OrchestratorError::Protocol(format!(
                        "invalid topic segment {other:?} in pattern {pattern:?}"
                    )))
                }
            };
            segments.push(seg);
        }
        Ok(Self { segments })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let topic_segments: Vec<&str> = topic.split('.').collect();
        Self::matches_from(&self.segments, &topic_segments)
    }

    fn matches_from(pattern: &[Segment], topic: &[&str]) -> bool {
        match pattern.first() {
            None => topic.is_empty(),
            Some(Segment::Hash) => true,
            Some(Segment::Star) => {
                !topic.is_empty() && Self::matches_from(&pattern[1..], &topic[1..])
            }
            Some(Segment::Literal(lit)) => {
                !topic.is_empty() && topic[0] == lit && Self::matches_from(&pattern[1..], &topic[1..])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_topic_rejects_uppercase_and_wildcards() {
        assert!(is_valid_concrete_topic("frontpanel.power.changed"));
        assert!(!is_valid_concrete_topic("FrontPanel.power"));
        assert!(!is_valid_concrete_topic("frontpanel.*"));
        assert!(!is_valid_concrete_topic(""));
    }

    #[test]
    fn star_matches_exactly_one_segment() -> anyhow::Result<()> {
        let pattern = TopicPattern::parse("frontpanel.*.changed")?;
        assert!(pattern.matches("frontpanel.power.changed"));
        assert!(!pattern.matches("frontpanel.power.sub.changed"));
        assert!(!pattern.matches("frontpanel.changed"));
        Ok(())
    }

    #[test]
    fn hash_matches_tail_only_as_final_segment() -> anyhow::Result<()> {
        let pattern = TopicPattern::parse("mouse.#")?;
        assert!(pattern.matches("mouse.move.relative"));
        assert!(pattern.matches("mouse"));
        assert!(TopicPattern::parse("mouse.#.extra").is_err());
        Ok(())
    }

    #[test]
    fn literal_pattern_matches_only_itself() -> anyhow::Result<()> {
        let pattern = TopicPattern::parse("a.b")?;
        assert!(pattern.matches("a.b"));
        assert!(!pattern.matches("a.c"));
        Ok(())
    }
}
