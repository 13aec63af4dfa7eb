//! Fuzzy command-name lookup.

use crate::registry::INTROSPECTION_PREFIX;

/// True when every character of `query` appears in `candidate` in order,
/// ignoring case. Characters need not be contiguous.
pub fn is_subsequence(query: &str, candidate: &str) -> bool {
    let candidate = candidate.to_lowercase();
    let mut remaining = candidate.chars();
    query
        .to_lowercase()
        .chars()
        .all(|wanted| remaining.any(|c| c == wanted))
}

/// Candidates matching `query` as a subsequence, shortest name first.
///
/// Shorter matches are more likely to be the intended command. Equal lengths
/// sort alphabetically.
pub fn find_command<I, S>(query: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut matches: Vec<String> = candidates
        .into_iter()
        .filter(|name| is_subsequence(query, name.as_ref()))
        .map(|name| name.as_ref().to_string())
        .collect();
    matches.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    matches.dedup();
    matches
}

/// Ranked suggestions for an unknown command name, introspection names excluded.
pub fn suggest<I, S>(name: &str, candidates: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let public = candidates
        .into_iter()
        .filter(|candidate| !candidate.as_ref().starts_with(INTROSPECTION_PREFIX));
    let mut ranked = find_command(name, public);
    ranked.truncate(limit);
    ranked
}
