// Incremental splitter that classifies streamed model output into a
// thinking phase (between <think> and </think>) and an answer phase.

use std::ops::Range;
use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, MatchKind};

use crate::agents::events::StreamEvent;
use crate::models::ContextSource;

pub const THINK_START: &str = "<think>";
pub const THINK_END: &str = "</think>";

const START_ID: usize = 0;
const END_ID: usize = 1;

// A marker completed by a new fragment can begin at most this many bytes
// before the end of the previously scanned text.
const SCAN_OVERLAP: usize = THINK_END.len() - 1;

static MARKERS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostFirst)
        .build([THINK_START, THINK_END])
        .expect("Valid think marker patterns")
});

/// Byte ranges of the first opening marker and the first closing marker.
///
/// The two are located independently, so `end` may precede `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerPositions {
    pub start: Option<Range<usize>>,
    pub end: Option<Range<usize>>,
}

impl MarkerPositions {
    pub fn is_complete(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

/// Locate the meaningful markers in `text`.
///
/// Only the first `<think>` and the first `</think>` count. Any later
/// occurrences are ordinary content.
pub fn locate_markers(text: &str) -> MarkerPositions {
    let mut positions = MarkerPositions::default();
    scan_markers(text, 0, &mut positions);
    positions
}

fn scan_markers(text: &str, from: usize, positions: &mut MarkerPositions) {
    for found in MARKERS.find_iter(&text.as_bytes()[from..]) {
        let range = from + found.start()..from + found.end();
        match found.pattern().as_usize() {
            START_ID if positions.start.is_none() => positions.start = Some(range),
            END_ID if positions.end.is_none() => positions.end = Some(range),
            _ => {}
        }
        if positions.is_complete() {
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitterState {
    Thinking,
    Answering,
}

/// Per-request stream state.
///
/// Feed every fragment to [`PhaseSplitter::push`] in arrival order and call
/// [`PhaseSplitter::finish`] once the backend signals end-of-stream. The
/// state only ever moves from `Thinking` to `Answering`.
#[derive(Debug, Clone)]
pub struct PhaseSplitter {
    sources: Vec<ContextSource>,
    accumulated: String,
    state: SplitterState,
    markers: MarkerPositions,
    scanned: usize,
    think: String,
    delivered_answer: Option<String>,
    emitted: usize,
    finished: bool,
}

impl PhaseSplitter {
    pub fn new(sources: Vec<ContextSource>) -> Self {
        Self {
            sources,
            accumulated: String::new(),
            state: SplitterState::Thinking,
            markers: MarkerPositions::default(),
            scanned: 0,
            think: String::new(),
            delivered_answer: None,
            emitted: 0,
            finished: false,
        }
    }

    pub fn state(&self) -> SplitterState {
        self.state
    }

    pub fn markers(&self) -> &MarkerPositions {
        &self.markers
    }

    pub fn events_emitted(&self) -> usize {
        self.emitted
    }

    /// Consume one fragment, returning the event it produces, if any.
    pub fn push(&mut self, fragment: &str) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.accumulated.push_str(fragment);
        self.rescan();

        let event = match self.state {
            SplitterState::Thinking => self.step_thinking(),
            SplitterState::Answering => Some(self.answer_event()),
        };
        if event.is_some() {
            self.emitted += 1;
        }
        event
    }

    /// Flush at end-of-stream.
    ///
    /// Output that never opened a thinking block becomes a single response.
    /// Answer text that arrived together with the closing marker and was never
    /// delivered is sent as a last response event.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;

        if self.accumulated.is_empty() {
            return None;
        }

        let event = match self.state {
            SplitterState::Thinking if self.markers.start.is_none() => Some(StreamEvent::response(
                "",
                self.accumulated.trim(),
                &self.sources,
            )),
            SplitterState::Thinking => None,
            SplitterState::Answering => {
                let pending = self.answer_text();
                if self.delivered_answer.as_deref() == Some(pending) {
                    None
                } else {
                    Some(self.answer_event())
                }
            }
        };
        if event.is_some() {
            self.emitted += 1;
        }
        event
    }

    fn rescan(&mut self) {
        if !self.markers.is_complete() {
            let from = self.scanned.saturating_sub(SCAN_OVERLAP);
            scan_markers(&self.accumulated, from, &mut self.markers);
        }
        self.scanned = self.accumulated.len();
    }

    fn step_thinking(&mut self) -> Option<StreamEvent> {
        let start = self.markers.start.clone()?;
        match self.markers.end.clone() {
            None => {
                let partial = self.accumulated[start.end..].trim();
                Some(StreamEvent::thinking(partial, &self.sources))
            }
            Some(end) => {
                // A closing marker ahead of the opening one leaves nothing between them.
                self.think = self
                    .accumulated
                    .get(start.end..end.start)
                    .map(|think| think.trim().to_string())
                    .unwrap_or_default();
                self.state = SplitterState::Answering;
                Some(StreamEvent::thinking(self.think.clone(), &self.sources))
            }
        }
    }

    fn answer_text(&self) -> &str {
        match &self.markers.end {
            Some(end) => self.accumulated[end.end..].trim(),
            None => "",
        }
    }

    fn answer_event(&mut self) -> StreamEvent {
        let answer = self.answer_text().to_string();
        self.delivered_answer = Some(answer.clone());
        StreamEvent::response(self.think.clone(), answer, &self.sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::events::Phase;

    fn sources() -> Vec<ContextSource> {
        (0..3)
            .map(|i| ContextSource {
                source: format!("data/act_{}.pdf", i),
                text: format!("passage {}", i),
                score: i as f32 * 0.1,
            })
            .collect()
    }

    fn run(fragments: &[&str]) -> Vec<StreamEvent> {
        let mut splitter = PhaseSplitter::new(sources());
        let mut events: Vec<StreamEvent> = fragments
            .iter()
            .filter_map(|fragment| splitter.push(fragment))
            .collect();
        events.extend(splitter.finish());
        events
    }

    #[test]
    fn test_section_302_scenario() {
        let events = run(&["<think>", "analyzing...", "</think>", "Yes, Section 302 applies."]);

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::thinking("", &sources()));
        assert_eq!(events[1], StreamEvent::thinking("analyzing...", &sources()));
        assert_eq!(events[2], StreamEvent::thinking("analyzing...", &sources()));
        assert_eq!(
            events[3],
            StreamEvent::response("analyzing...", "Yes, Section 302 applies.", &sources())
        );
    }

    #[test]
    fn test_exactly_one_finalizing_thinking_event() {
        let mut splitter = PhaseSplitter::new(sources());
        let mut finalizing = 0;
        let mut seen_response = false;
        for fragment in ["<think>", " step one ", "</think>", "Yes", ", punishable", "."] {
            let before = splitter.state();
            let Some(event) = splitter.push(fragment) else { continue };
            if before == SplitterState::Thinking && splitter.state() == SplitterState::Answering {
                finalizing += 1;
                assert_eq!(event.phase, Phase::Thinking);
                assert_eq!(event.think, "step one");
                assert!(event.response.is_empty());
            }
            if event.phase == Phase::Response {
                seen_response = true;
                assert_eq!(event.think, "step one");
            } else {
                assert!(!seen_response, "thinking event after a response event");
            }
        }
        assert_eq!(finalizing, 1);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_markers_split_across_fragments() {
        let whole = run(&["<think>", "reasoning", "</think>", " answer"]);
        let split = run(&["<th", "ink>reason", "ing</th", "ink> answer"]);

        let last_whole = whole.last().unwrap();
        let last_split = split.last().unwrap();
        assert_eq!(last_whole, last_split);
        assert_eq!(last_split.think, "reasoning");
        assert_eq!(last_split.response, "answer");

        let finalized: Vec<_> = split
            .iter()
            .filter(|e| e.phase == Phase::Thinking && e.think == "reasoning")
            .collect();
        assert!(!finalized.is_empty());
    }

    #[test]
    fn test_marker_split_one_byte_at_a_time() {
        let text = "<think>weigh IPC 302</think>Yes, it applies.";
        let fragments: Vec<String> = text.chars().map(String::from).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let events = run(&refs);

        let last = events.last().unwrap();
        assert_eq!(last.phase, Phase::Response);
        assert_eq!(last.think, "weigh IPC 302");
        assert_eq!(last.response, "Yes, it applies.");
    }

    #[test]
    fn test_no_markers_single_terminal_event() {
        let mut splitter = PhaseSplitter::new(sources());
        assert!(splitter.push("  Hello").is_none());
        assert!(splitter.push(", namaste. ").is_none());

        let event = splitter.finish().unwrap();
        assert_eq!(event.phase, Phase::Response);
        assert_eq!(event.think, "");
        assert_eq!(event.response, "Hello, namaste.");
        assert_eq!(event.context_sources, sources());
        assert_eq!(splitter.events_emitted(), 1);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_empty_output_emits_nothing() {
        let mut splitter = PhaseSplitter::new(sources());
        assert!(splitter.push("").is_none());
        assert!(splitter.finish().is_none());
        assert_eq!(splitter.events_emitted(), 0);
    }

    #[test]
    fn test_only_first_markers_count() {
        let events = run(&["<think>a</think>", "b <think>c</think> d"]);
        let last = events.last().unwrap();
        assert_eq!(last.think, "a");
        assert_eq!(last.response, "b <think>c</think> d");
        assert!(events.iter().skip(1).all(|e| e.phase == Phase::Response));
    }

    #[test]
    fn test_answer_in_closing_fragment_is_flushed() {
        let mut splitter = PhaseSplitter::new(sources());
        let first = splitter.push("<think>check</think>No, it is not.").unwrap();
        assert_eq!(first.phase, Phase::Thinking);
        assert_eq!(first.think, "check");
        assert!(first.response.is_empty());

        let last = splitter.finish().unwrap();
        assert_eq!(last.phase, Phase::Response);
        assert_eq!(last.response, "No, it is not.");
    }

    #[test]
    fn test_unterminated_thinking_stays_thinking() {
        let events = run(&["<think>still", " going"]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.phase == Phase::Thinking));
        assert_eq!(events[1].think, "still going");
    }

    #[test]
    fn test_closing_marker_before_opening_ends_empty_thinking() {
        let positions = locate_markers("</think>x<think>y</think>z");
        assert_eq!(positions.start, Some(9..16));
        assert_eq!(positions.end, Some(0..8));

        let events = run(&["</think>x", "<think>y</think>", "z"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::thinking("", &sources()));
        assert_eq!(events[1].phase, Phase::Response);
        assert_eq!(events[1].think, "");
        assert_eq!(events[1].response, "x<think>y</think>z");
    }

    #[test]
    fn test_closing_marker_without_opening_is_plain_output() {
        let events = run(&["a </think>", " b"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::Response);
        assert_eq!(events[0].response, "a </think> b");
    }

    #[test]
    fn test_locate_markers_is_pure() {
        let text = "pre <think> mid </think> post </think>";
        assert_eq!(locate_markers(text), locate_markers(text));
        assert_eq!(locate_markers("no markers here"), MarkerPositions::default());
    }

    #[test]
    fn test_incremental_scan_matches_full_scan() {
        let text = "लेख <think>धारा 302: murder</think> उत्तर: हाँ </think><think>";
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        for &a in &boundaries {
            for &b in boundaries.iter().filter(|&&b| b >= a) {
                let mut splitter = PhaseSplitter::new(Vec::new());
                splitter.push(&text[..a]);
                splitter.push(&text[a..b]);
                splitter.push(&text[b..]);
                assert_eq!(splitter.markers(), &locate_markers(text), "split at {a}/{b}");
            }
        }
    }
}
