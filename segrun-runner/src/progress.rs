//! Progress parsing
//!
//! Turns raw lines of inference tool output into [`ProgressEvent`]s. The
//! parser is a pure function over one line plus a small context that carries
//! the case the tool is currently working on.

use std::sync::LazyLock;

use regex::Regex;
use segrun_core::domain::log::{LogLevel, ProgressEvent, Stage};

static CASE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:predicting|processing case|starting case)\s+([^\s:]+)\s*:?\s*$")
        .expect("valid regex")
});

static CASE_DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*done with\s+([^\s:]+)").expect("valid regex"));

static ERROR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\b\w*(?:error|exception)\b|\bfailed\b|\bfailure\b|traceback \(most recent call last\)|\bkilled\b|out of memory|exit (?:code|status)\D{0,3}[1-9]\d*)",
    )
    .expect("valid regex")
});

static PREPROCESSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)preprocess").expect("valid regex"));

static POSTPROCESSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)postprocess|resampl|export|saving|writing").expect("valid regex")
});

static INFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)predict|inference|sliding window").expect("valid regex")
});

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})\s?%").expect("valid regex"));

static FRACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,5})\s*/\s*(\d{1,5})\b").expect("valid regex"));

/// Largest denominator accepted as a progress fraction
const MAX_FRACTION_TOTAL: u32 = 10_000;

/// State threaded from one parsed line to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseContext {
    /// Case the tool most recently announced
    pub case_id: Option<String>,
}

/// Outcome of parsing one line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub event: ProgressEvent,
    pub context: ParseContext,
}

/// Parses one output line
///
/// Returns `None` for blank lines. Every other line yields an event: lines
/// that match no known pattern become `Debug`-level [`Stage::Output`] events,
/// so no output is ever lost. Never fails.
pub fn parse_line(line: &str, context: &ParseContext) -> Option<ParsedLine> {
    if line.trim().is_empty() {
        return None;
    }
    let message = line.trim_end();
    let mut next = context.clone();

    if let Some(caps) = CASE_START.captures(message) {
        let case_id = caps[1].to_string();
        next.case_id = Some(case_id.clone());
        let event = ProgressEvent::info(Stage::Setup, message).for_case(case_id);
        return Some(ParsedLine {
            event,
            context: next,
        });
    }

    if let Some(caps) = CASE_DONE.captures(message) {
        let event = ProgressEvent::info(Stage::Postprocessing, message)
            .for_case(&caps[1])
            .with_percent(100);
        return Some(ParsedLine {
            event,
            context: next,
        });
    }

    let is_error = ERROR_MARKER.is_match(message);
    let stage = detect_stage(message);
    let percent = extract_percent(message);

    let level = if is_error {
        LogLevel::Error
    } else if stage.is_some() || percent.is_some() {
        LogLevel::Info
    } else {
        LogLevel::Debug
    };
    let stage = match (stage, percent) {
        (Some(stage), _) => stage,
        (None, Some(_)) => Stage::Inference,
        (None, None) => Stage::Output,
    };

    let mut event = ProgressEvent::new(stage, level, message);
    if let Some(case_id) = &context.case_id {
        event = event.for_case(case_id);
    }
    if let Some(percent) = percent {
        event = event.with_percent(percent);
    }

    Some(ParsedLine {
        event,
        context: next,
    })
}

fn detect_stage(line: &str) -> Option<Stage> {
    // Checked before inference: "postprocessing predictions" is postprocessing.
    if PREPROCESSING.is_match(line) {
        Some(Stage::Preprocessing)
    } else if POSTPROCESSING.is_match(line) {
        Some(Stage::Postprocessing)
    } else if INFERENCE.is_match(line) {
        Some(Stage::Inference)
    } else {
        None
    }
}

/// Explicit `NN%` wins over an `a/b` fraction
fn extract_percent(line: &str) -> Option<u8> {
    for caps in PERCENT.captures_iter(line) {
        match caps[1].parse::<u32>() {
            Ok(value) if value <= 100 => return Some(value as u8),
            _ => continue,
        }
    }

    for caps in FRACTION.captures_iter(line) {
        let (Ok(done), Ok(total)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        if total > 0 && total <= MAX_FRACTION_TOTAL && done <= total {
            return Some((done * 100 / total) as u8);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ParsedLine {
        parse_line(line, &ParseContext::default()).unwrap()
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert!(parse_line("", &ParseContext::default()).is_none());
        assert!(parse_line("   \t", &ParseContext::default()).is_none());
    }

    #[test]
    fn test_case_start_updates_context() {
        let parsed = parse("Predicting liver_12:");
        assert_eq!(parsed.context.case_id.as_deref(), Some("liver_12"));
        assert_eq!(parsed.event.case_id.as_deref(), Some("liver_12"));
        assert_eq!(parsed.event.stage, Stage::Setup);
        assert_eq!(parsed.event.level, LogLevel::Info);
    }

    #[test]
    fn test_context_is_carried_to_following_lines() {
        let first = parse("Predicting case_a:");
        let second = parse_line("resampling to target spacing", &first.context).unwrap();
        assert_eq!(second.event.case_id.as_deref(), Some("case_a"));
        assert_eq!(second.event.stage, Stage::Postprocessing);
        assert_eq!(second.context, first.context);
    }

    #[test]
    fn test_case_done_reports_full_percent() {
        let parsed = parse("done with case_a");
        assert_eq!(parsed.event.percent, Some(100));
        assert_eq!(parsed.event.case_id.as_deref(), Some("case_a"));
        assert_eq!(parsed.event.stage, Stage::Postprocessing);
    }

    #[test]
    fn test_percent_from_progress_bar() {
        let parsed = parse(" 45%|████▌     | 9/20 [00:03<00:04,  2.61it/s]");
        assert_eq!(parsed.event.percent, Some(45));
        assert_eq!(parsed.event.stage, Stage::Inference);
        assert_eq!(parsed.event.level, LogLevel::Info);
    }

    #[test]
    fn test_percent_from_fraction() {
        assert_eq!(parse("sliding window 3/12").event.percent, Some(25));
        assert_eq!(parse("step 12/12").event.percent, Some(100));
    }

    #[test]
    fn test_implausible_fractions_are_ignored() {
        assert_eq!(parse("step 13/12").event.percent, None);
        assert_eq!(parse("ratio 1/0").event.percent, None);
        assert_eq!(parse("date 2024/20000").event.percent, None);
    }

    #[test]
    fn test_percent_over_hundred_falls_back_to_fraction() {
        assert_eq!(parse("450% overdrive 1/4").event.percent, Some(25));
        assert_eq!(parse("450% overdrive").event.percent, None);
    }

    #[test]
    fn test_stage_keywords() {
        assert_eq!(parse("Preprocessing image").event.stage, Stage::Preprocessing);
        assert_eq!(
            parse("postprocessing predictions").event.stage,
            Stage::Postprocessing
        );
        assert_eq!(parse("saving segmentation").event.stage, Stage::Postprocessing);
        assert_eq!(parse("running inference").event.stage, Stage::Inference);
    }

    #[test]
    fn test_error_lines_are_flagged() {
        for line in [
            "Traceback (most recent call last):",
            "RuntimeError: CUDA out of memory",
            "ValueError: bad shape",
            "prediction failed",
            "process exited with exit code 137",
            "Killed",
        ] {
            let parsed = parse(line);
            assert!(parsed.event.is_error, "expected error for {:?}", line);
            assert_eq!(parsed.event.level, LogLevel::Error);
        }
    }

    #[test]
    fn test_benign_lines_are_not_errors() {
        for line in ["exit code 0", "0 errors found", "errorless run"] {
            assert!(!parse(line).event.is_error, "unexpected error for {:?}", line);
        }
    }

    #[test]
    fn test_unmatched_lines_become_output_events() {
        let parsed = parse("loading checkpoint from disk");
        assert_eq!(parsed.event.stage, Stage::Output);
        assert_eq!(parsed.event.level, LogLevel::Debug);
        assert_eq!(parsed.event.message, "loading checkpoint from disk");
        assert!(!parsed.event.is_error);
    }

    #[test]
    fn test_trailing_whitespace_is_trimmed() {
        assert_eq!(parse("hello   \t").event.message, "hello");
        assert_eq!(parse("  indented").event.message, "  indented");
    }
}
