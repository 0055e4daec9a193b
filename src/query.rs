//! Web-search style lexical queries.
//!
//! Supported syntax:
//!
//! | Input | Meaning |
//! |-------|---------|
//! | `deploy rollback` | both terms must appear |
//! | `"blue green"` | exact phrase |
//! | `deploy or release` | either term |
//! | `-staging` | term must not appear |
//!
//! A parsed [`LexicalQuery`] renders to an FTS5 `MATCH` expression for the
//! SQLite store and can be evaluated directly against tokenized text by
//! the in-memory store.

/// A phrase is a run of normalized tokens that must appear contiguously.
pub type Phrase = Vec<String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexicalQuery {
    /// Every group must match; a group matches if any of its phrases does.
    groups: Vec<Vec<Phrase>>,
    excluded: Vec<Phrase>,
}

enum Item {
    Phrase(Phrase),
    Exclude(Phrase),
    Or,
}

impl LexicalQuery {
    pub fn parse(input: &str) -> Self {
        let mut query = LexicalQuery::default();
        let mut pending_or = false;

        for item in lex(input) {
            match item {
                Item::Or => pending_or = !query.groups.is_empty(),
                Item::Exclude(phrase) => {
                    query.excluded.push(phrase);
                    pending_or = false;
                }
                Item::Phrase(phrase) => {
                    match query.groups.last_mut() {
                        Some(group) if pending_or => group.push(phrase),
                        _ => query.groups.push(vec![phrase]),
                    }
                    pending_or = false;
                }
            }
        }
        query
    }

    /// True if the query cannot match anything.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Render as an FTS5 match expression, or `None` for an empty query.
    pub fn to_fts5(&self) -> Option<String> {
        if self.groups.is_empty() {
            return None;
        }
        let mut expr = self
            .groups
            .iter()
            .map(|group| {
                let alternatives: Vec<String> = group.iter().map(|p| quote(p)).collect();
                if alternatives.len() == 1 {
                    alternatives[0].clone()
                } else {
                    format!("({})", alternatives.join(" OR "))
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        for phrase in &self.excluded {
            expr.push_str(" NOT ");
            expr.push_str(&quote(phrase));
        }
        Some(expr)
    }

    /// Score pre-tokenized text, or `None` if it does not match.
    ///
    /// Each group contributes `ln(1 + occurrences)`; the sum is damped by
    /// document length so short, focused segments rank first.
    pub fn score(&self, tokens: &[String]) -> Option<f64> {
        if self.groups.is_empty() {
            return None;
        }
        if self.excluded.iter().any(|p| occurrences(tokens, p) > 0) {
            return None;
        }

        let mut total = 0.0;
        for group in &self.groups {
            let hits: usize = group.iter().map(|p| occurrences(tokens, p)).sum();
            if hits == 0 {
                return None;
            }
            total += (1.0 + hits as f64).ln();
        }
        Some(total / (1.0 + (tokens.len() as f64).ln_1p()))
    }
}

/// Lowercased alphanumeric runs, the same split the store tokenizer uses.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn quote(phrase: &[String]) -> String {
    format!("\"{}\"", phrase.join(" ").replace('"', "\"\""))
}

fn occurrences(tokens: &[String], phrase: &[String]) -> usize {
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return 0;
    }
    tokens.windows(phrase.len()).filter(|w| *w == phrase).count()
}

fn lex(input: &str) -> Vec<Item> {
    let mut items = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let negated = c == '-';
        if negated {
            chars.next();
        }

        let raw: String = if chars.peek() == Some(&'"') {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            phrase
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            if !negated && word.eq_ignore_ascii_case("or") {
                items.push(Item::Or);
                continue;
            }
            word
        };

        let phrase = tokenize(&raw);
        if phrase.is_empty() {
            continue;
        }
        items.push(if negated {
            Item::Exclude(phrase)
        } else {
            Item::Phrase(phrase)
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_are_anded() {
        let q = LexicalQuery::parse("deploy rollback");
        assert_eq!(q.to_fts5().unwrap(), "\"deploy\" AND \"rollback\"");
    }

    #[test]
    fn test_phrase_and_exclusion() {
        let q = LexicalQuery::parse("\"Blue Green\" -staging");
        assert_eq!(q.to_fts5().unwrap(), "\"blue green\" NOT \"staging\"");
    }

    #[test]
    fn test_or_groups() {
        let q = LexicalQuery::parse("deploy or release notes");
        assert_eq!(q.to_fts5().unwrap(), "(\"deploy\" OR \"release\") AND \"notes\"");
    }

    #[test]
    fn test_punctuation_only_is_empty() {
        let q = LexicalQuery::parse("  ?? -- ");
        assert!(q.is_empty());
        assert!(q.to_fts5().is_none());
    }

    #[test]
    fn test_leading_or_is_a_term_separator() {
        let q = LexicalQuery::parse("or deploy");
        assert_eq!(q.to_fts5().unwrap(), "\"deploy\"");
    }

    #[test]
    fn test_punctuated_word_becomes_phrase() {
        let q = LexicalQuery::parse("main.py");
        assert_eq!(q.to_fts5().unwrap(), "\"main py\"");
    }

    #[test]
    fn test_score_requires_all_groups() {
        let q = LexicalQuery::parse("alpha beta");
        assert!(q.score(&tokenize("alpha gamma")).is_none());
        assert!(q.score(&tokenize("Alpha, beta!")).is_some());
    }

    #[test]
    fn test_score_exclusion() {
        let q = LexicalQuery::parse("alpha -beta");
        assert!(q.score(&tokenize("alpha")).is_some());
        assert!(q.score(&tokenize("alpha beta")).is_none());
    }

    #[test]
    fn test_score_phrase_is_contiguous() {
        let q = LexicalQuery::parse("\"install deps\"");
        assert!(q.score(&tokenize("install the deps")).is_none());
        assert!(q.score(&tokenize("please install deps now")).is_some());
    }

    #[test]
    fn test_score_prefers_more_occurrences() {
        let q = LexicalQuery::parse("rust");
        let once = q.score(&tokenize("rust is a language about memory")).unwrap();
        let thrice = q.score(&tokenize("rust rust rust is a language about")).unwrap();
        assert!(thrice > once);
    }
}
