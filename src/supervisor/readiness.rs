/// Watches backend stdout for the banner printed once the web server is up.
///
/// This is a heuristic: any line containing one of the sentinels (case-sensitive) counts,
/// wherever it appears among unrelated log lines.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    sentinels: Vec<String>,
    ready: bool,
}

impl ReadinessDetector {
    pub fn new(sentinels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            sentinels: sentinels.into_iter().map(Into::into).collect(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn matches_sentinel(&self, line: &str) -> bool {
        self.sentinels
            .iter()
            .any(|sentinel| !sentinel.is_empty() && line.contains(sentinel.as_str()))
    }

    /// Feed one line, returning `true` only for the line that flips the detector to ready.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.ready || !self.matches_sentinel(line) {
            return false;
        }
        self.ready = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_READY_SENTINELS;
    use rstest::rstest;

    #[rstest]
    #[case("INFO:     Application startup complete.", true)]
    #[case("INFO:     Uvicorn running on http://127.0.0.1:8153 (Press CTRL+C to quit)", true)]
    #[case("INFO:     Started server process [4242]", false)]
    #[case("info:     uvicorn running on http://127.0.0.1:8153", false)]
    #[case("", false)]
    fn matches_default_sentinels(#[case] line: &str, #[case] expected: bool) {
        let detector = ReadinessDetector::new(DEFAULT_READY_SENTINELS);
        assert_eq!(detector.matches_sentinel(line), expected);
    }

    #[test]
    fn transition_happens_once() {
        let mut detector = ReadinessDetector::new(DEFAULT_READY_SENTINELS);
        assert!(!detector.observe("INFO:     Waiting for application startup."));
        assert!(!detector.is_ready());
        assert!(detector.observe("INFO:     Application startup complete."));
        assert!(!detector.observe("INFO:     Uvicorn running on http://127.0.0.1:8153"));
        assert!(detector.is_ready());
    }

    #[test]
    fn empty_sentinel_never_matches() {
        let mut detector = ReadinessDetector::new([""]);
        assert!(!detector.observe("anything"));
    }
}
