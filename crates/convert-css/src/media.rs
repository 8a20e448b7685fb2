//! Media query acceptance for `@media` blocks and `<link media>`.

/// Decides which media query lists apply to the rendering target.
///
/// Only media types are inspected; feature expressions such as
/// `(min-width: 600px)` are ignored and the query is judged on its type.
#[derive(Debug, Clone)]
pub struct MediaFilter {
    accepted: Vec<String>,
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self::new(["all", "screen"])
    }
}

impl MediaFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            accepted: types
                .into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// True when any query in the comma separated list applies. An empty
    /// list applies to everything.
    pub fn accepts(&self, media: &str) -> bool {
        let media = media.trim();
        if media.is_empty() {
            return true;
        }
        media.split(',').any(|query| self.accepts_query(query))
    }

    fn accepts_query(&self, query: &str) -> bool {
        let mut words = query.split_whitespace().peekable();
        let mut negated = false;
        match words.peek().map(|w| w.to_ascii_lowercase()) {
            Some(w) if w == "not" => {
                negated = true;
                words.next();
            }
            Some(w) if w == "only" => {
                words.next();
            }
            _ => {}
        }
        let media_type = match words.next() {
            // Bare feature expression: implied `all`.
            Some(w) if w.starts_with('(') => "all".to_string(),
            Some(w) => w.to_ascii_lowercase(),
            None => return !negated,
        };
        let matched = media_type == "all" || self.accepted.iter().any(|t| *t == media_type);
        matched != negated
    }
}
