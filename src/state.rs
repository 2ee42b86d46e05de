//! Document state: the heading-context stack and the resumption pointer.
//!
//! [`DocumentState`] is owned by the orchestrator and changes only through
//! [`DocumentState::apply_markdown`] and [`DocumentState::mark_processed`].
//! It is written back with [`DocumentState::save`] after every committed page
//! via temp-file-then-rename, so an interrupted run loses at most the page in
//! flight.

use crate::fsutil::write_atomic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One entry of the heading path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingNode {
    /// 1 = outermost (`#`).
    pub level: usize,
    pub title: String,
}

impl HeadingNode {
    pub fn new(level: usize, title: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
        }
    }
}

/// The live path from the document root to the current position.
///
/// Levels strictly increase from first to last entry. The only mutator is
/// [`HeadingStack::push`], which maintains that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeadingStack(Vec<HeadingNode>);

impl HeadingStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heading: drop every entry at the same or a deeper level,
    /// then append.
    pub fn push(&mut self, node: HeadingNode) {
        while self.0.last().is_some_and(|top| top.level >= node.level) {
            self.0.pop();
        }
        self.0.push(node);
    }

    /// Feed every heading in `markdown`, in document order.
    /// Returns how many headings were applied.
    pub fn apply_markdown(&mut self, markdown: &str) -> usize {
        let headings = extract_headings(markdown);
        let n = headings.len();
        for h in headings {
            self.push(h);
        }
        n
    }

    pub fn nodes(&self) -> &[HeadingNode] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Level of the innermost heading, 0 at the document root.
    pub fn depth(&self) -> usize {
        self.0.last().map(|h| h.level).unwrap_or(0)
    }

    /// Render the path as `# A > ## B > ### C`.
    pub fn path(&self) -> String {
        self.0
            .iter()
            .map(|h| format!("{} {}", "#".repeat(h.level), h.title))
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// The context block that seeds the next page's prompt.
    pub fn context_prompt(&self) -> String {
        let body = if self.is_empty() {
            "No current context (This is likely the beginning of the document).".to_string()
        } else {
            format!(
                "Current Path: {}\nCurrent Heading Depth: {}",
                self.path(),
                self.depth()
            )
        };
        format!("--- DOCUMENT CONTEXT ---\n{body}\n--- END DOCUMENT CONTEXT ---\n")
    }
}

impl<'de> Deserialize<'de> for HeadingStack {
    /// Rebuild through `push`, so a hand-edited state file can never produce
    /// a stack that violates the ordering.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nodes = Vec::<HeadingNode>::deserialize(deserializer)?;
        let mut stack = HeadingStack::new();
        for node in nodes {
            if node.level == 0 {
                return Err(serde::de::Error::custom("heading level must be ≥ 1"));
            }
            stack.push(node);
        }
        Ok(stack)
    }
}

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#+)\s+(.*)$").unwrap());
static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s{0,3}(```|~~~)").unwrap());
/// Optional closing sequence of an ATX heading: a run of `#` set off by whitespace.
static RE_CLOSING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s+)#+\s*$").unwrap());

/// Extract ATX headings, skipping fenced code blocks.
pub fn extract_headings(markdown: &str) -> Vec<HeadingNode> {
    let mut out = Vec::new();
    let mut fence: Option<&str> = None;
    for line in markdown.lines() {
        if let Some(caps) = RE_FENCE.captures(line) {
            let marker = caps.get(1).map(|m| m.as_str()).unwrap_or("```");
            fence = match fence {
                Some(open) if open == marker => None,
                Some(open) => Some(open),
                None => Some(marker),
            };
            continue;
        }
        if fence.is_some() {
            continue;
        }
        if let Some(caps) = RE_HEADING.captures(line) {
            let title = RE_CLOSING.replace(caps[2].trim(), "");
            let title = title.trim_end();
            if title.is_empty() {
                continue;
            }
            out.push(HeadingNode::new(caps[1].len(), title));
        }
    }
    out
}

/// On-disk shape of the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StateFile {
    last_processed_page: Option<String>,
    heading_context_stack: HeadingStack,
}

/// Heading context plus resumption pointer, bound to its state file.
#[derive(Debug)]
pub struct DocumentState {
    path: PathBuf,
    inner: StateFile,
}

impl DocumentState {
    /// Load the state at `path`. A missing or malformed file yields a fresh
    /// state (logged), never an error.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<StateFile>(&text) {
                Ok(state) => {
                    info!(
                        "Loaded document state from {} (last page: {})",
                        path.display(),
                        state.last_processed_page.as_deref().unwrap_or("none")
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        "State file {} is malformed ({}); starting a new document",
                        path.display(),
                        e
                    );
                    StateFile::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No state file at {}; starting a new document", path.display());
                StateFile::default()
            }
            Err(e) => {
                warn!(
                    "Cannot read state file {} ({}); starting a new document",
                    path.display(),
                    e
                );
                StateFile::default()
            }
        };
        Self { path, inner }
    }

    /// Persist via temp-file-then-rename.
    pub async fn save(&self) -> io::Result<()> {
        let json = serde_json::to_string_pretty(&self.inner).map_err(io::Error::other)?;
        write_atomic(&self.path, json).await?;
        debug!("Saved document state to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_processed_page(&self) -> Option<&str> {
        self.inner.last_processed_page.as_deref()
    }

    pub fn headings(&self) -> &HeadingStack {
        &self.inner.heading_context_stack
    }

    pub fn context_prompt(&self) -> String {
        self.inner.heading_context_stack.context_prompt()
    }

    /// Update the heading stack from a finished page.
    pub fn apply_markdown(&mut self, markdown: &str) {
        let n = self.inner.heading_context_stack.apply_markdown(markdown);
        if n == 0 {
            debug!("No headings on this page; context unchanged");
        } else {
            debug!(
                "Applied {} headings; path is now '{}'",
                n,
                self.inner.heading_context_stack.path()
            );
        }
    }

    pub fn mark_processed(&mut self, page: &str) {
        self.inner.last_processed_page = Some(page.to_string());
    }

    /// Index in `pages` to resume from: right after the last processed page,
    /// or 0 when the pointer is absent or names a page not in the list.
    pub fn resume_index<S: AsRef<str>>(&self, pages: &[S]) -> usize {
        match self.last_processed_page() {
            Some(last) => match pages.iter().position(|p| p.as_ref() == last) {
                Some(i) => i + 1,
                None => {
                    warn!("Last processed page '{}' is not in the page list; starting over", last);
                    0
                }
            },
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(nodes: &[(usize, &str)]) -> HeadingStack {
        let mut s = HeadingStack::new();
        for (l, t) in nodes {
            s.push(HeadingNode::new(*l, *t));
        }
        s
    }

    fn assert_strictly_increasing(s: &HeadingStack) {
        for w in s.nodes().windows(2) {
            assert!(w[0].level < w[1].level, "not increasing: {:?}", s.nodes());
        }
    }

    #[test]
    fn sibling_heading_replaces_subtree() {
        let mut s = stack(&[(1, "A"), (2, "B"), (3, "C")]);
        s.push(HeadingNode::new(2, "D"));
        assert_eq!(s, stack(&[(1, "A"), (2, "D")]));
    }

    #[test]
    fn invariant_holds_over_arbitrary_sequences() {
        let levels = [3, 1, 4, 1, 5, 2, 6, 2, 2, 1, 3, 3, 6, 4];
        let mut s = HeadingStack::new();
        for (i, l) in levels.iter().enumerate() {
            s.push(HeadingNode::new(*l, format!("h{i}")));
            assert_strictly_increasing(&s);
            assert_eq!(s.depth(), *l);
        }
    }

    #[test]
    fn extracts_headings_in_order_and_skips_code() {
        let md = "# Chapter 2\ntext\n```python\n# not a heading\n```\n## 2.1 Types  \n#hashtag\n### \n";
        let h = extract_headings(md);
        assert_eq!(
            h,
            vec![HeadingNode::new(1, "Chapter 2"), HeadingNode::new(2, "2.1 Types")]
        );
    }

    #[test]
    fn trailing_hash_in_title_is_kept() {
        assert_eq!(
            extract_headings("## Intro to C#\n# F#\n"),
            vec![HeadingNode::new(2, "Intro to C#"), HeadingNode::new(1, "F#")]
        );
        assert_eq!(
            extract_headings("## Closed ##\n### Spaced #  \n# ##\n"),
            vec![HeadingNode::new(2, "Closed"), HeadingNode::new(3, "Spaced")]
        );
    }

    #[test]
    fn context_prompt_rendering() {
        assert!(HeadingStack::new()
            .context_prompt()
            .contains("No current context"));
        let s = stack(&[(1, "Type theory"), (2, "Function types")]);
        let p = s.context_prompt();
        assert!(p.contains("Current Path: # Type theory > ## Function types"));
        assert!(p.contains("Current Heading Depth: 2"));
    }

    #[test]
    fn deserialising_repairs_unordered_stack() {
        let s: HeadingStack =
            serde_json::from_str(r#"[{"level":1,"title":"A"},{"level":3,"title":"C"},{"level":2,"title":"B"}]"#)
                .unwrap();
        assert_eq!(s, stack(&[(1, "A"), (2, "B")]));
        assert!(serde_json::from_str::<HeadingStack>(r#"[{"level":0,"title":"x"}]"#).is_err());
    }

    #[tokio::test]
    async fn resume_index_follows_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DocumentState::load(dir.path().join("state.json")).await;
        let pages = ["page-003.jpg", "page-004.jpg", "page-005.jpg", "page-006.jpg"];
        assert_eq!(state.resume_index(&pages), 0);

        state.mark_processed("page-004.jpg");
        assert_eq!(pages[state.resume_index(&pages)], "page-005.jpg");

        state.mark_processed("page-999.jpg");
        assert_eq!(state.resume_index(&pages), 0);
    }

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = DocumentState::load(&path).await;
        state.apply_markdown("# Intro\n## Scope\n");
        state.mark_processed("page-001.jpg");
        state.save().await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["last_processed_page"], "page-001.jpg");
        assert_eq!(json["heading_context_stack"][1]["title"], "Scope");

        let reloaded = DocumentState::load(&path).await;
        assert_eq!(reloaded.last_processed_page(), Some("page-001.jpg"));
        assert_eq!(reloaded.headings().depth(), 2);
    }

    #[tokio::test]
    async fn malformed_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"last_processed_page": 7}"#).unwrap();
        let state = DocumentState::load(&path).await;
        assert_eq!(state.last_processed_page(), None);
        assert!(state.headings().is_empty());
    }
}
