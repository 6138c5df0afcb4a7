use strsim::jaro_winkler;

/// Closest-name matcher used to repair misspelled or abbreviated identifiers.
pub struct NameMatcher {
    /// Similarity threshold (0.0-1.0) for accepting a candidate
    pub similarity_threshold: f64,
}

impl Default for NameMatcher {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.80,
        }
    }
}

impl NameMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Lowercase, and fold separators so `Storage Cost`, `storage-cost` and
    /// `storage_cost` compare equal.
    pub fn normalize(&self, s: &str) -> String {
        s.trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect::<String>()
            .split('_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Similarity between two identifiers in 0.0..=1.0.
    ///
    /// The score is the better of whole-string Jaro-Winkler and a token score
    /// that understands abbreviations (`intl_sales` vs `international_sales`).
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let na = self.normalize(a);
        let nb = self.normalize(b);
        if na.is_empty() || nb.is_empty() {
            return 0.0;
        }
        if na == nb {
            return 1.0;
        }

        let whole = jaro_winkler(&na, &nb);
        let tokens = token_similarity(&na, &nb).unwrap_or(0.0);
        whole.max(tokens).min(1.0)
    }

    pub fn is_match(&self, a: &str, b: &str) -> bool {
        self.similarity(a, b) >= self.similarity_threshold
    }

    /// Best candidate at or above the threshold. Ties go to the lexically
    /// smallest candidate so the choice is deterministic.
    pub fn best_match<'a, I>(&self, target: &str, candidates: I) -> Option<(&'a str, f64)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<(&'a str, f64)> = None;
        for candidate in candidates {
            let score = self.similarity(target, candidate);
            if score < self.similarity_threshold {
                continue;
            }
            best = match best {
                None => Some((candidate, score)),
                Some((current, current_score)) => {
                    if score > current_score
                        || (score == current_score && candidate.to_lowercase() < current.to_lowercase())
                    {
                        Some((candidate, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
        best
    }

    /// Up to `limit` candidates ranked by similarity, ignoring the threshold.
    /// Used for feedback messages.
    pub fn suggestions<'a, I>(&self, target: &str, candidates: I, limit: usize) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut scored: Vec<(&'a str, f64)> = candidates
            .into_iter()
            .map(|c| (c, self.similarity(target, c)))
            .filter(|(_, s)| *s > 0.5)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.into_iter().take(limit).map(|(c, _)| c).collect()
    }
}

/// Token-wise score for identifiers with the same number of `_` parts.
fn token_similarity(a: &str, b: &str) -> Option<f64> {
    let ta: Vec<&str> = a.split('_').collect();
    let tb: Vec<&str> = b.split('_').collect();
    if ta.len() != tb.len() || ta.len() < 2 {
        return None;
    }
    let total: f64 = ta
        .iter()
        .zip(tb.iter())
        .map(|(x, y)| {
            if x == y {
                1.0
            } else if is_abbreviation(x, y) || is_abbreviation(y, x) {
                0.9
            } else {
                jaro_winkler(x, y)
            }
        })
        .sum();
    Some(total / ta.len() as f64)
}

/// `short` abbreviates `long` when both start with the same character and
/// `short` is an in-order subsequence of `long`.
fn is_abbreviation(short: &str, long: &str) -> bool {
    if short.len() < 2 || short.len() >= long.len() {
        return false;
    }
    if short.chars().next() != long.chars().next() {
        return false;
    }
    let mut long_chars = long.chars();
    short.chars().all(|c| long_chars.any(|l| l == c))
}
