// Edge Tunnel Manager - Output Parser
// Incremental scan of subprocess output for the public URL or failure hints

use regex::Regex;

/// Longest provisional error line kept on a record
const MAX_ERROR_LINE: usize = 160;

/// Keywords that mark a line as a failure indicator while no URL has been seen
const FAILURE_KEYWORDS: &[&str] = &[
    "error",
    "fail",
    "fatal",
    "cannot",
    "refused",
    "denied",
    "unauthorized",
];

/// Side effect requested by one observation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSignal {
    /// The public endpoint URL appeared in the output
    PublicUrl(String),
    /// No URL yet; the most recent failure-looking line (truncated)
    ProvisionalError(String),
}

/// Scans accumulated subprocess output. Cheap enough to run on every chunk,
/// synchronously on the capture task.
pub struct OutputParser {
    url_re: Regex,
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            url_re: Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").unwrap(),
        }
    }

    /// Observe the accumulated buffer.
    ///
    /// Once `url_found` is set by the caller this is a no-op, which makes the
    /// URL side effect idempotent. Until then, a URL match wins over any
    /// failure keyword; failing that, the most recent keyword line is
    /// reported as a provisional error only.
    pub fn observe(&self, buffer: &str, url_found: bool) -> Option<OutputSignal> {
        if url_found {
            return None;
        }

        if let Some(m) = self.url_re.find(buffer) {
            return Some(OutputSignal::PublicUrl(m.as_str().to_string()));
        }

        let mut last_failure: Option<&str> = None;
        for line in buffer.lines() {
            let lower = line.to_lowercase();
            if FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
                last_failure = Some(line.trim());
            }
        }

        last_failure.map(|line| OutputSignal::ProvisionalError(truncate(line)))
    }
}

fn truncate(line: &str) -> String {
    if line.len() <= MAX_ERROR_LINE {
        return line.to_string();
    }
    let mut cut = MAX_ERROR_LINE;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_public_url() {
        let parser = OutputParser::new();
        let buf = "INF Starting tunnel\nINF https://witty-crab.trycloudflare.com\n";
        assert_eq!(
            parser.observe(buf, false),
            Some(OutputSignal::PublicUrl(
                "https://witty-crab.trycloudflare.com".to_string()
            ))
        );
    }

    #[test]
    fn no_op_once_url_found() {
        let parser = OutputParser::new();
        let buf = "https://witty-crab.trycloudflare.com\nERR something broke\n";
        assert_eq!(parser.observe(buf, true), None);
    }

    #[test]
    fn url_wins_over_failure_keywords() {
        let parser = OutputParser::new();
        let buf = "ERR connection refused\nhttps://witty-crab.trycloudflare.com\n";
        assert!(matches!(
            parser.observe(buf, false),
            Some(OutputSignal::PublicUrl(_))
        ));
    }

    #[test]
    fn reports_most_recent_failure_line() {
        let parser = OutputParser::new();
        let buf = "ERR first error\nINF retrying\nERR connection refused\n";
        assert_eq!(
            parser.observe(buf, false),
            Some(OutputSignal::ProvisionalError(
                "ERR connection refused".to_string()
            ))
        );
    }

    #[test]
    fn quiet_output_yields_nothing() {
        let parser = OutputParser::new();
        assert_eq!(parser.observe("INF all good\n", false), None);
        assert_eq!(parser.observe("", false), None);
    }

    #[test]
    fn long_failure_lines_are_truncated() {
        let parser = OutputParser::new();
        let long = format!("error: {}", "x".repeat(500));
        match parser.observe(&long, false) {
            Some(OutputSignal::ProvisionalError(line)) => {
                assert_eq!(line.len(), MAX_ERROR_LINE);
            }
            other => panic!("expected provisional error, got {other:?}"),
        }
    }
}
