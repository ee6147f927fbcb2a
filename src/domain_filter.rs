use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
const MAX_ENTRIES: usize = 1_000_000;
const BUFFER_SIZE: usize = 64 * 1024;

/// Host blocklist. A host is blocked when any entry occurs anywhere in it.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    entries: Vec<String>,
    case_sensitive: bool,
}

impl Blocklist {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            entries: Vec::new(),
            case_sensitive,
        }
    }

    pub fn from_entries<I, S>(entries: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new(case_sensitive);
        for entry in entries {
            list.add(entry.as_ref());
        }
        list
    }

    pub fn add(&mut self, entry: &str) {
        let entry = entry.trim();
        if entry.is_empty() {
            return;
        }
        let entry = if self.case_sensitive {
            entry.to_string()
        } else {
            entry.to_ascii_lowercase()
        };
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty hosts count as blocked so that no empty target is ever dialed.
    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return true;
        }
        if self.entries.is_empty() {
            return false;
        }
        if self.case_sensitive {
            self.entries.iter().any(|e| host.contains(e.as_str()))
        } else {
            let host = host.to_ascii_lowercase();
            self.entries.iter().any(|e| host.contains(e.as_str()))
        }
    }

    /// Appends entries from a line-oriented file. Blank lines and lines
    /// starting with `#` or `//` are skipped.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for blocklist file: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("blocklist file too large");
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open blocklist file: {:?}", path))?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let before = self.entries.len();
        let mut raw_count = 0;

        for line in reader.lines() {
            let line = line?;
            raw_count += 1;

            if let Some(entry) = parse_entry_line(&line) {
                self.add(entry);
            }

            if self.entries.len() > MAX_ENTRIES {
                anyhow::bail!("Too many entries in blocklist {:?}", path);
            }
        }

        let added = self.entries.len() - before;
        tracing::info!(
            "Loaded blocklist: {} entries from {} lines ({:?})",
            added,
            raw_count,
            path
        );
        Ok(added)
    }
}

fn parse_entry_line(line: &str) -> Option<&str> {
    let entry = line.trim();

    if entry.is_empty() || entry.starts_with('#') || entry.starts_with("//") {
        return None;
    }

    // Allow trailing comments: "ads.example   # tracker"
    entry.split_whitespace().next()
}
