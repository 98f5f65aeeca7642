use regex::Regex;

/// What a matched line tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// The backend reached the chain tip; ends the watch.
    CaughtUp,
    /// Height processed so far.
    Current,
    /// Height the backend is syncing towards.
    Total,
}

/// One log pattern with a single integer capture group.
#[derive(Debug, Clone)]
pub struct ProgressPattern {
    pub kind: PatternKind,
    pub regex: Regex,
}

/// Ordered, mutually exclusive patterns. The first match wins.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<ProgressPattern>,
}

impl PatternSet {
    pub fn new(patterns: Vec<ProgressPattern>) -> Self {
        Self { patterns }
    }

    /// Build from `(kind, regex)` pairs.
    pub fn compile(specs: &[(PatternKind, &str)]) -> Result<Self, regex::Error> {
        let patterns = specs
            .iter()
            .map(|(kind, re)| {
                Ok(ProgressPattern {
                    kind: *kind,
                    regex: Regex::new(re)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self::new(patterns))
    }

    /// Neutrino (light client) cfheaders sync as logged by lnd.
    ///
    /// Simnet nodes have no checkpoints and log a different progress line.
    pub fn neutrino(simnet: bool) -> Self {
        let current = if simnet {
            r"^.*Writing cfheaders at height=(\d+) to next checkpoint$"
        } else {
            r"^.*Fetching set of checkpointed cfheaders filters from height=(\d+).*$"
        };
        let specs = [
            (
                PatternKind::CaughtUp,
                r"^.*Fully caught up with cfheaders at height (\d+), waiting at tip for new blocks$",
            ),
            (PatternKind::Current, current),
            (PatternKind::Total, r"^.*Syncing to block height (\d+) from peer.*$"),
        ];
        let patterns = specs
            .into_iter()
            .filter_map(|(kind, re)| match Regex::new(re) {
                Ok(regex) => Some(ProgressPattern { kind, regex }),
                Err(e) => {
                    tracing::error!("Invalid built-in log pattern {}: {}", re, e);
                    None
                }
            })
            .collect();
        Self::new(patterns)
    }

    /// Block notifications lnd logs as its chain backend advances. The
    /// captured height is reported as [`PatternKind::Current`].
    pub fn lnd_new_block() -> Self {
        Self::compile(&[(PatternKind::Current, r"^.*NTFN: New block: height=(\d+), sha=(.+)$")])
            .unwrap_or_else(|e| {
                tracing::error!("Invalid built-in log pattern: {}", e);
                Self::new(Vec::new())
            })
    }

    /// First matching pattern and its parsed capture.
    ///
    /// A line that matches but whose capture does not parse is logged and
    /// treated as unmatched.
    pub fn match_line(&self, line: &str) -> Option<(PatternKind, u64)> {
        let pattern = self.patterns.iter().find(|p| p.regex.is_match(line))?;
        let raw = pattern.regex.captures(line)?.get(1)?.as_str();
        match raw.parse::<u64>() {
            Ok(value) => Some((pattern.kind, value)),
            Err(e) => {
                tracing::warn!(line = %line, "Failed to parse height {:?}: {}", raw, e);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
