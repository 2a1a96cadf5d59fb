//! Utility functions for integration tests

#![allow(dead_code)]

use anyhow::{Context, Result};
use rexec::{CommandOptions, CommandTask};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Lines and terminal events observed through command callbacks
#[derive(Clone, Default)]
pub struct Recorder {
    stdout: Arc<Mutex<Vec<String>>>,
    stderr: Arc<Mutex<Vec<String>>>,
    finished: Arc<AtomicUsize>,
    timed_out: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options recording stdout, finished and timed out events
    ///
    /// Stderr stays combined into stdout.
    pub fn options(&self) -> CommandOptions {
        let stdout = self.stdout.clone();
        let finished = self.finished.clone();
        let timed_out = self.timed_out.clone();
        CommandOptions::new()
            .on_stdout(move |_: &CommandTask, line: &str| stdout.lock().unwrap().push(line.to_string()))
            .on_finished(move |_: &CommandTask| {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .on_timed_out(move |_: &CommandTask| {
                timed_out.fetch_add(1, Ordering::SeqCst);
            })
    }

    /// Like [`Recorder::options`], with a separate stderr callback
    pub fn separate_options(&self) -> CommandOptions {
        let stderr = self.stderr.clone();
        self.options()
            .on_stderr(move |_: &CommandTask, line: &str| stderr.lock().unwrap().push(line.to_string()))
    }

    pub fn stdout(&self) -> Vec<String> {
        self.stdout.lock().unwrap().clone()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.stderr.lock().unwrap().clone()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> usize {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Test directory trees and their comparison
pub struct TreeTestUtils;

impl TreeTestUtils {
    /// Create a tree with one subdirectory holding one file
    pub fn create_tree() -> Result<(TempDir, PathBuf)> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(root.join("sub")).context("Failed to create test tree")?;
        fs::write(root.join("sub/file.txt"), b"file content\n").context("Failed to write test file")?;
        fs::write(root.join("top.bin"), (0..=255u8).collect::<Vec<_>>()).context("Failed to write test file")?;
        Ok((temp_dir, root))
    }

    /// Relative paths and contents of every entry under `root`, sorted
    pub fn snapshot(root: &Path) -> Result<Vec<(PathBuf, Option<Vec<u8>>)>> {
        let mut entries = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
                let path = entry?.path();
                let relative = path.strip_prefix(root)?.to_path_buf();
                if path.is_dir() {
                    entries.push((relative, None));
                    pending.push(path);
                } else {
                    entries.push((relative, Some(fs::read(&path)?)));
                }
            }
        }
        entries.sort();
        Ok(entries)
    }
}
