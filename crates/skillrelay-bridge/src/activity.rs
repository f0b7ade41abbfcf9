//! Heuristic mapping from relay output lines to human-readable activity.
//!
//! The relay program prints free text, so this is best-effort keyword
//! matching. Rules are checked in order and the first hit wins.

use std::time::{Duration, Instant};

/// Activity reported before any output arrives.
pub const INITIAL_ACTIVITY: &str = "🧠 Thinking...";

/// Minimum spacing between two reported activity changes.
pub const MIN_ACTIVITY_GAP: Duration = Duration::from_millis(500);

enum Rule {
    /// The trimmed line equals one of the words.
    Exact(&'static [&'static str]),
    /// The lowercased line contains any of the needles.
    Any(&'static [&'static str]),
    /// The lowercased line contains every needle.
    All(&'static [&'static str]),
}

const RULES: &[(Rule, &str)] = &[
    // Tool markers.
    (Rule::Exact(&["Read", "Reading"]), "📖 Reading file..."),
    (Rule::Exact(&["Edit", "Editing"]), "✏️ Editing code..."),
    (Rule::Exact(&["Write", "Writing"]), "📝 Writing file..."),
    (Rule::Exact(&["Bash", "Running"]), "⚡ Running command..."),
    (Rule::Exact(&["Glob", "Globbing"]), "🔍 Finding files..."),
    (Rule::Exact(&["Grep", "Grepping"]), "🔎 Searching code..."),
    // Build / deploy.
    (Rule::Any(&["npm run build", "building"]), "🔨 Building..."),
    (Rule::Any(&["fly deploy", "deploying"]), "🚀 Deploying to Fly.io..."),
    (Rule::Any(&["nuxt build"]), "🔨 Building Nuxt..."),
    // Free-text file operations.
    (
        Rule::Any(&["reading", "read tool", "read file", "let me read"]),
        "📖 Reading files...",
    ),
    (
        Rule::Any(&["writing", "write tool", "write file", "creating file"]),
        "📝 Writing files...",
    ),
    (
        Rule::Any(&[
            "editing",
            "edit tool",
            "modifying",
            "updating file",
            "let me edit",
            "let me update",
        ]),
        "✏️ Editing code...",
    ),
    (
        Rule::Any(&[
            "searching",
            "grep",
            "glob",
            "finding",
            "looking for",
            "let me search",
            "let me find",
        ]),
        "🔍 Searching codebase...",
    ),
    (
        Rule::Any(&[
            "running",
            "bash",
            "executing",
            "npm",
            "yarn",
            "pnpm",
            "git ",
            "command",
        ]),
        "⚡ Running command...",
    ),
    (
        Rule::Any(&["fetching", "webfetch", "web search", "websearch"]),
        "🌐 Fetching web content...",
    ),
    (Rule::All(&["task", "agent"]), "🤖 Running sub-agent..."),
    (
        Rule::Any(&["analyzing", "examining", "checking", "reviewing"]),
        "🔬 Analyzing...",
    ),
    (Rule::Any(&["<thinking>", "let me think"]), "🧠 Reasoning..."),
    (
        Rule::Any(&["planning", "creating plan", "let me plan"]),
        "📋 Planning...",
    ),
];

/// Classify one line of relay output.
pub fn classify_line(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    let lower = line.to_lowercase();

    RULES.iter().find_map(|(rule, activity)| {
        let hit = match rule {
            Rule::Exact(words) => words.contains(&trimmed),
            Rule::Any(needles) => needles.iter().any(|n| lower.contains(n)),
            Rule::All(needles) => needles.iter().all(|n| lower.contains(n)),
        };
        hit.then_some(*activity)
    })
}

/// Suppresses repeats and bursts of activity updates.
#[derive(Debug)]
pub struct ActivityThrottle {
    last: &'static str,
    last_at: Instant,
    min_gap: Duration,
}

impl ActivityThrottle {
    pub fn new(started: Instant) -> Self {
        Self {
            last: INITIAL_ACTIVITY,
            last_at: started,
            min_gap: MIN_ACTIVITY_GAP,
        }
    }

    pub fn with_min_gap(mut self, min_gap: Duration) -> Self {
        self.min_gap = min_gap;
        self
    }

    /// Returns `true` if `activity` should be reported now.
    pub fn offer(&mut self, activity: &'static str, now: Instant) -> bool {
        if activity == self.last || now.saturating_duration_since(self.last_at) <= self.min_gap {
            return false;
        }
        self.last = activity;
        self.last_at = now;
        true
    }

    pub fn current(&self) -> &'static str {
        self.last
    }
}
