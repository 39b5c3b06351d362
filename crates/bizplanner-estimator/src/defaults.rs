//! Category defaults for cold-start estimates.
//!
//! When a context has no comparable history, the title is matched against
//! a short list of keyword categories. The first category with a keyword
//! starting a word of the lowercased title wins; otherwise the global
//! default applies.

use aho_corasick::AhoCorasick;
use tracing::{error, trace};

/// Global fallback when no category matches, in minutes.
pub const GLOBAL_DEFAULT_MINUTES: u32 = 60;

/// One keyword category.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: &'static str,
    pub keywords: &'static [&'static str],
    pub minutes: u32,
}

static BUILTIN: &[Category] = &[
    Category {
        name: "call",
        keywords: &["call", "phone", "позвонить", "звонок", "созвон"],
        minutes: 15,
    },
    Category {
        name: "message",
        keywords: &["email", "e-mail", "reply", "написать", "письмо", "ответить"],
        minutes: 20,
    },
    Category {
        name: "meeting",
        keywords: &["meeting", "meet", "встреча", "совещание", "встретиться"],
        minutes: 60,
    },
    Category {
        name: "purchase",
        keywords: &["order", "buy", "purchase", "заказать", "купить", "закупка"],
        minutes: 30,
    },
    Category {
        name: "document",
        keywords: &["report", "proposal", "contract", "отчет", "отчёт", "договор", "кп"],
        minutes: 120,
    },
    Category {
        name: "research",
        keywords: &["research", "analyze", "investigate", "исследовать", "анализ", "изучить"],
        minutes: 180,
    },
];

/// Keyword table with a global fallback.
///
/// All keywords of all categories are compiled into one Aho-Corasick
/// automaton; `owners[i]` is the category index of pattern `i`.
#[derive(Debug, Clone)]
pub struct CategoryDefaults {
    categories: Vec<Category>,
    automaton: Option<AhoCorasick>,
    owners: Vec<usize>,
    fallback_minutes: u32,
}

impl Default for CategoryDefaults {
    fn default() -> Self {
        Self::new(BUILTIN.to_vec(), GLOBAL_DEFAULT_MINUTES)
    }
}

impl CategoryDefaults {
    pub fn new(categories: Vec<Category>, fallback_minutes: u32) -> Self {
        let (patterns, owners): (Vec<String>, Vec<usize>) = categories
            .iter()
            .enumerate()
            .flat_map(|(idx, c)| c.keywords.iter().map(move |k| (k.to_lowercase(), idx)))
            .unzip();

        let automaton = if patterns.is_empty() {
            None
        } else {
            match AhoCorasick::new(&patterns) {
                Ok(ac) => {
                    trace!(count = patterns.len(), "category automaton built");
                    Some(ac)
                }
                Err(e) => {
                    error!(error = %e, "failed to build category automaton");
                    None
                }
            }
        };

        Self {
            categories,
            automaton,
            owners,
            fallback_minutes,
        }
    }

    pub fn with_fallback(mut self, minutes: u32) -> Self {
        self.fallback_minutes = minutes;
        self
    }

    /// Matching category for a title, if any. Earlier categories win when
    /// keywords of several categories occur.
    pub fn categorize(&self, title: &str) -> Option<&Category> {
        let ac = self.automaton.as_ref()?;
        let title = title.to_lowercase();

        ac.find_overlapping_iter(&title)
            .filter(|m| starts_word(&title, m.start()))
            .map(|m| self.owners[m.pattern().as_usize()])
            .min()
            .map(|idx| &self.categories[idx])
    }

    /// Default minutes for a title.
    pub fn minutes_for(&self, title: &str) -> u32 {
        self.categorize(title)
            .map_or(self.fallback_minutes, |c| c.minutes)
    }
}

/// Short keywords like "кп" would otherwise match inside unrelated words.
fn starts_word(text: &str, at: usize) -> bool {
    text[..at]
        .chars()
        .next_back()
        .is_none_or(|c| !c.is_alphanumeric())
}
