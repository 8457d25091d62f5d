//! Stop-trigger detection and content-policy screening.
//!
//! Both checks are case-insensitive substring matches over configured
//! phrases, precomputed to lowercase at construction.

/// Detects the configured stop phrase.
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    phrase: String,
}

impl TriggerDetector {
    pub fn new(phrase: &str) -> Self {
        Self {
            phrase: phrase.to_lowercase(),
        }
    }

    pub fn fires(&self, text: &str) -> bool {
        text.to_lowercase().contains(&self.phrase)
    }
}

/// Screens step content for disqualifying keywords. A match means the step
/// represents a terminal outcome and the funnel ends without sending.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    keywords: Vec<String>,
}

impl ContentPolicy {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn disqualifies(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|keyword| text.contains(keyword))
    }
}
