//! Reserved vocabulary ids
//!
//! Vocabulary construction lives outside this crate; only the sentinel ids
//! that loss bookkeeping depends on are defined here.

/// Start-of-sentence id
pub const SS: u32 = 0;
/// End-of-sentence id, also used as target padding
pub const ES: u32 = 1;

pub const SS_STR: &str = "<s>";
pub const ES_STR: &str = "</s>";

/// Number of real target tokens in one sentence (everything but `ES`)
pub fn count_words(tokens: &[u32]) -> usize {
    tokens.iter().filter(|&&t| t != ES).count()
}
