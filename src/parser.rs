/// Flair training-log parsing: turn chunks of log text into typed metric events.
///
/// Recognized lines look like:
/// - `EPOCH 3 done: loss 0.452 - lr 0.05`
/// - `DEV : loss 0.31 - score 0.88`
/// - `- F1-score (micro) 0.91` / `- F1-score (macro) 0.87`
/// - `PER tp: 5 - fp: 1 - fn: 2 - precision: 0.83 - recall: 0.71 - f1-score: 0.77`
///
/// Every chunk is scanned against every rule, not first-match-wins. Rules run
/// in declared order and each rule yields its matches in textual order.
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::str::FromStr;
use std::sync::LazyLock;

/// Tag for each recognized metric pattern, in declared rule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Epoch,
    Dev,
    F1Micro,
    F1Macro,
    Label,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Epoch => "epoch",
            MetricKind::Dev => "dev",
            MetricKind::F1Micro => "f1_micro",
            MetricKind::F1Macro => "f1_macro",
            MetricKind::Label => "label",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed occurrence of a recognized metric line.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// End-of-epoch training summary.
    Epoch {
        epoch_num: u64,
        train_loss: f64,
        train_lr: f64,
    },
    /// Evaluation on the dev split.
    Dev { dev_loss: f64, dev_score: f64 },
    F1Micro { f1_micro: f64 },
    F1Macro { f1_macro: f64 },
    /// Per-label row of the final classification report.
    Label {
        label: String,
        tp: u64,
        fp: u64,
        fn_: u64,
        precision: f64,
        recall: f64,
        f1: f64,
    },
}

impl MetricEvent {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricEvent::Epoch { .. } => MetricKind::Epoch,
            MetricEvent::Dev { .. } => MetricKind::Dev,
            MetricEvent::F1Micro { .. } => MetricKind::F1Micro,
            MetricEvent::F1Macro { .. } => MetricKind::F1Macro,
            MetricEvent::Label { .. } => MetricKind::Label,
        }
    }
}

/// A match had the right shape but a captured number did not convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMetricError {
    pub kind: MetricKind,
    pub field: &'static str,
    pub text: String,
}

impl std::fmt::Display for MalformedMetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "malformed {} metric: field `{}` has unparseable value {:?}",
            self.kind, self.field, self.text
        )
    }
}

impl std::error::Error for MalformedMetricError {}

/// Builds an event from the captures of a single match.
pub type Extractor = fn(&Captures<'_>) -> Result<MetricEvent, MalformedMetricError>;

/// A (kind, matcher, field-extractor) triple.
#[derive(Clone)]
pub struct PatternRule {
    kind: MetricKind,
    regex: Regex,
    extract: Extractor,
}

impl std::fmt::Debug for PatternRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRule")
            .field("kind", &self.kind)
            .field("pattern", &self.regex.as_str())
            .finish()
    }
}

impl PatternRule {
    pub fn new(kind: MetricKind, pattern: &str, extract: Extractor) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            regex: Regex::new(pattern)?,
            extract,
        })
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    fn matches<'a>(
        &'a self,
        text: &'a str,
    ) -> impl Iterator<Item = Result<MetricEvent, MalformedMetricError>> + 'a {
        self.regex
            .captures_iter(text)
            .map(move |caps| (self.extract)(&caps))
    }
}

/// Built-in Flair rule table, compiled once per process.
///
/// Digit classes are ASCII-only: `\d` would also admit Unicode digits that
/// `u64`/`f64` parsing rejects.
static FLAIR_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        PatternRule::new(
            MetricKind::Epoch,
            r"EPOCH ([0-9]+) done: loss ([0-9.]+) - lr ([0-9.]+)",
            extract_epoch,
        )
        .unwrap(),
        PatternRule::new(
            MetricKind::Dev,
            r"DEV : loss ([0-9.]+) - score ([0-9.]+)",
            extract_dev,
        )
        .unwrap(),
        PatternRule::new(
            MetricKind::F1Micro,
            r"- F1-score \(micro\) ([0-9.]+)",
            extract_f1_micro,
        )
        .unwrap(),
        PatternRule::new(
            MetricKind::F1Macro,
            r"- F1-score \(macro\) ([0-9.]+)",
            extract_f1_macro,
        )
        .unwrap(),
        PatternRule::new(
            MetricKind::Label,
            concat!(
                r"(\w+)\s*tp: ([0-9]+) - fp: ([0-9]+) - fn: ([0-9]+)",
                r" - precision: ([0-9.]+) - recall: ([0-9.]+) - f1-score: ([0-9.]+)",
            ),
            extract_label,
        )
        .unwrap(),
    ]
});

fn field<T: FromStr>(
    caps: &Captures<'_>,
    index: usize,
    kind: MetricKind,
    name: &'static str,
) -> Result<T, MalformedMetricError> {
    let text = caps.get(index).map_or("", |m| m.as_str());
    text.parse().map_err(|_| MalformedMetricError {
        kind,
        field: name,
        text: text.to_string(),
    })
}

fn extract_epoch(caps: &Captures<'_>) -> Result<MetricEvent, MalformedMetricError> {
    let kind = MetricKind::Epoch;
    Ok(MetricEvent::Epoch {
        epoch_num: field(caps, 1, kind, "epoch_num")?,
        train_loss: field(caps, 2, kind, "train_loss")?,
        train_lr: field(caps, 3, kind, "train_lr")?,
    })
}

fn extract_dev(caps: &Captures<'_>) -> Result<MetricEvent, MalformedMetricError> {
    let kind = MetricKind::Dev;
    Ok(MetricEvent::Dev {
        dev_loss: field(caps, 1, kind, "dev_loss")?,
        dev_score: field(caps, 2, kind, "dev_score")?,
    })
}

fn extract_f1_micro(caps: &Captures<'_>) -> Result<MetricEvent, MalformedMetricError> {
    Ok(MetricEvent::F1Micro {
        f1_micro: field(caps, 1, MetricKind::F1Micro, "f1_micro")?,
    })
}

fn extract_f1_macro(caps: &Captures<'_>) -> Result<MetricEvent, MalformedMetricError> {
    Ok(MetricEvent::F1Macro {
        f1_macro: field(caps, 1, MetricKind::F1Macro, "f1_macro")?,
    })
}

fn extract_label(caps: &Captures<'_>) -> Result<MetricEvent, MalformedMetricError> {
    let kind = MetricKind::Label;
    Ok(MetricEvent::Label {
        label: caps[1].to_string(),
        tp: field(caps, 2, kind, "tp")?,
        fp: field(caps, 3, kind, "fp")?,
        fn_: field(caps, 4, kind, "fn")?,
        precision: field(caps, 5, kind, "precision")?,
        recall: field(caps, 6, kind, "recall")?,
        f1: field(caps, 7, kind, "f1")?,
    })
}

/// Scans text chunks against an immutable rule table.
///
/// Holds no per-call state, so one parser can serve concurrent writers.
#[derive(Debug, Clone)]
pub struct LineParser {
    rules: Cow<'static, [PatternRule]>,
}

impl LineParser {
    /// Parser over the built-in Flair rules.
    pub fn new() -> Self {
        Self {
            rules: Cow::Borrowed(FLAIR_RULES.as_slice()),
        }
    }

    /// Parser over a caller-supplied rule table, evaluated in the given order.
    pub fn with_rules(rules: Vec<PatternRule>) -> Self {
        Self {
            rules: Cow::Owned(rules),
        }
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Every match of every rule, including the ones whose numbers failed to convert.
    pub fn try_parse<'a>(
        &'a self,
        text: &'a str,
    ) -> impl Iterator<Item = Result<MetricEvent, MalformedMetricError>> + 'a {
        self.rules.iter().flat_map(move |rule| rule.matches(text))
    }

    /// Lazily yield the events found in `text`.
    ///
    /// A malformed match is logged and skipped; the other matches in the same
    /// chunk are still produced.
    pub fn parse<'a>(&'a self, text: &'a str) -> impl Iterator<Item = MetricEvent> + 'a {
        self.try_parse(text).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed metric line");
                None
            }
        })
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}
