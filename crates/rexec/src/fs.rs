//! Filesystem access of a session and copies between sessions

use crate::{Result, RexecError};
use std::cell::Cell;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Chunk size used by copies
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read from the start
    Read,
    /// Create or truncate, then write
    Write,
    /// Create if needed, then write at the end
    Append,
}

/// An open file of a session
///
/// The file is released when dropped.
pub trait SessionFile: Read + Write + Send {}

impl<T: Read + Write + Send> SessionFile for T {}

/// Filesystem of an execution context
pub trait FileSystem {
    /// Open `path`
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn SessionFile>>;

    /// Paths of the entries of directory `path`
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Whether `path` exists, following links; a dangling link does not exist
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Whether `path` is a directory, following links
    fn is_dir(&self, path: &Path) -> Result<bool>;

    /// Whether `path` is a symbolic link
    fn is_link(&self, path: &Path) -> Result<bool>;

    /// Create directory `path`; its parent must exist
    fn mkdir(&self, path: &Path) -> Result<()>;

    /// Walk the tree under `top`, see [`Walk`]
    fn walk(&self, top: &Path, options: WalkOptions) -> Walk<'_>
    where
        Self: Sized,
    {
        Walk::new(self, top, options)
    }
}

/// Options of a [`Walk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    /// Yield a directory before its subdirectories
    pub top_down: bool,
    /// Descend into linked directories
    pub follow_links: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            top_down: true,
            follow_links: false,
        }
    }
}

/// One directory of a walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path of the directory
    pub dir: PathBuf,
    /// Names of its subdirectories, links to directories included
    pub dirs: Vec<PathBuf>,
    /// Names of its other entries
    pub files: Vec<PathBuf>,
}

enum Frame {
    Pending(PathBuf),
    Listed(WalkEntry),
}

type ErrorHook<'a> = Box<dyn FnMut(&Path, RexecError) + 'a>;

/// Lazy walk over a directory tree of any [`FileSystem`]
///
/// Directories that cannot be listed are skipped; their error goes to the
/// hook set with [`Walk::on_error`], or is dropped. Entries are sorted by name.
pub struct Walk<'a> {
    fs: &'a dyn FileSystem,
    options: WalkOptions,
    stack: Vec<Frame>,
    on_error: Option<ErrorHook<'a>>,
}

impl<'a> Walk<'a> {
    /// Walk the tree under `top`
    pub fn new(fs: &'a dyn FileSystem, top: &Path, options: WalkOptions) -> Self {
        Self {
            fs,
            options,
            stack: vec![Frame::Pending(top.to_path_buf())],
            on_error: None,
        }
    }

    /// Call `hook` with each listing error, then continue
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Path, RexecError) + 'a,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    fn list(&mut self, dir: PathBuf) -> Option<WalkEntry> {
        let mut children = match self.fs.list_dir(&dir) {
            Ok(children) => children,
            Err(e) => {
                debug!("Skipping {}: {}", dir.display(), e);
                if let Some(hook) = self.on_error.as_mut() {
                    hook(&dir, e);
                }
                return None;
            }
        };
        children.sort();

        let mut entry = WalkEntry {
            dir,
            dirs: Vec::new(),
            files: Vec::new(),
        };
        let mut descend = Vec::new();
        for child in children {
            let Some(name) = child.file_name().map(PathBuf::from) else {
                continue;
            };
            if self.fs.is_dir(&child).unwrap_or(false) {
                if self.options.follow_links || !self.fs.is_link(&child).unwrap_or(false) {
                    descend.push(child);
                }
                entry.dirs.push(name);
            } else {
                entry.files.push(name);
            }
        }

        // reversed so the first child is visited first
        self.stack.extend(descend.into_iter().rev().map(Frame::Pending));
        Some(entry)
    }
}

impl Iterator for Walk<'_> {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Listed(entry) => return Some(entry),
                Frame::Pending(dir) if self.options.top_down => {
                    if let Some(entry) = self.list(dir) {
                        return Some(entry);
                    }
                }
                Frame::Pending(dir) => {
                    // children are pushed above the listed entry
                    let depth = self.stack.len();
                    if let Some(entry) = self.list(dir) {
                        self.stack.insert(depth, Frame::Listed(entry));
                    }
                }
            }
        }
        None
    }
}

/// Copy `src` of `src_fs` to `dest` of `dest_fs` in chunks of `chunk_size`
///
/// Returns the number of bytes copied.
pub fn copy_file(
    src_fs: &dyn FileSystem,
    src: &Path,
    dest_fs: &dyn FileSystem,
    dest: &Path,
    chunk_size: usize,
) -> Result<u64> {
    let mut reader = src_fs.open(src, OpenMode::Read)?;
    let mut writer = dest_fs.open(dest, OpenMode::Write)?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;

    debug!("Copied {} bytes from {} to {}", total, src.display(), dest.display());
    Ok(total)
}

/// Mirror the tree under `src` of `src_fs` at `dest` of `dest_fs`
///
/// `dest` must not exist. Every directory is created before the files it
/// holds are copied.
pub fn copy_dir(
    src_fs: &dyn FileSystem,
    src: &Path,
    dest_fs: &dyn FileSystem,
    dest: &Path,
    chunk_size: usize,
) -> Result<()> {
    if dest_fs.exists(dest)? {
        return Err(RexecError::DestinationExists(dest.to_path_buf()));
    }
    dest_fs.mkdir(dest)?;

    let failure: Cell<Option<RexecError>> = Cell::new(None);
    let walk = Walk::new(src_fs, src, WalkOptions::default()).on_error(|_, e| {
        failure.set(Some(e));
    });

    for entry in walk {
        if let Some(e) = failure.take() {
            return Err(e);
        }
        let relative = entry.dir.strip_prefix(src).map_err(|_| {
            RexecError::Session(format!("{} is outside of {}", entry.dir.display(), src.display()))
        })?;
        let target = dest.join(relative);

        for dir in &entry.dirs {
            dest_fs.mkdir(&target.join(dir))?;
        }
        for file in &entry.files {
            copy_file(src_fs, &entry.dir.join(file), dest_fs, &target.join(file), chunk_size)?;
        }
    }

    match failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalSession;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("top.txt"), b"top").unwrap();
        fs::create_dir(root.path().join("a")).unwrap();
        fs::write(root.path().join("a/one.txt"), b"one").unwrap();
        fs::create_dir(root.path().join("a/nested")).unwrap();
        fs::create_dir(root.path().join("b")).unwrap();
        root
    }

    fn dirs_of(walk: impl Iterator<Item = WalkEntry>, root: &Path) -> Vec<PathBuf> {
        walk.map(|entry| entry.dir.strip_prefix(root).unwrap().to_path_buf()).collect()
    }

    #[test]
    fn test_walk_top_down() {
        let root = tree();
        let session = LocalSession::new();

        let entries: Vec<_> = session.walk(root.path(), WalkOptions::default()).collect();
        assert_eq!(entries[0].dir, root.path());
        assert_eq!(entries[0].dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(entries[0].files, vec![PathBuf::from("top.txt")]);

        let order = dirs_of(entries.into_iter(), root.path());
        assert_eq!(
            order,
            vec![PathBuf::new(), PathBuf::from("a"), PathBuf::from("a/nested"), PathBuf::from("b")]
        );
    }

    #[test]
    fn test_walk_bottom_up() {
        let root = tree();
        let session = LocalSession::new();
        let options = WalkOptions {
            top_down: false,
            ..WalkOptions::default()
        };

        let order = dirs_of(session.walk(root.path(), options), root.path());
        assert_eq!(
            order,
            vec![PathBuf::from("a/nested"), PathBuf::from("a"), PathBuf::from("b"), PathBuf::new()]
        );
    }

    #[test]
    fn test_walk_error_hook() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("missing");
        let session = LocalSession::new();

        let mut failed = Vec::new();
        let entries: Vec<_> = session
            .walk(&missing, WalkOptions::default())
            .on_error(|path, _| failed.push(path.to_path_buf()))
            .collect();

        assert!(entries.is_empty());
        assert_eq!(failed, vec![missing]);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_links() {
        let root = tree();
        std::os::unix::fs::symlink(root.path().join("a"), root.path().join("link")).unwrap();
        let session = LocalSession::new();

        let entries: Vec<_> = session.walk(root.path(), WalkOptions::default()).collect();
        assert!(entries[0].dirs.contains(&PathBuf::from("link")));
        assert!(!entries.iter().any(|e| e.dir == root.path().join("link")));

        let options = WalkOptions {
            follow_links: true,
            ..WalkOptions::default()
        };
        let entries: Vec<_> = session.walk(root.path(), options).collect();
        assert!(entries.iter().any(|e| e.dir == root.path().join("link/nested")));
    }

    #[test]
    fn test_copy_file_in_chunks() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src.bin");
        let dest = root.path().join("dest.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();
        let session = LocalSession::new();

        let copied = copy_file(&session, &src, &session, &dest, 7).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_copy_file_missing_source() {
        let root = TempDir::new().unwrap();
        let session = LocalSession::new();
        let result = copy_file(
            &session,
            &root.path().join("nope"),
            &session,
            &root.path().join("dest"),
            DEFAULT_CHUNK_SIZE,
        );
        assert!(matches!(result, Err(RexecError::Io(_))));
        assert!(!root.path().join("dest").exists());
    }

    #[test]
    fn test_copy_dir() {
        let src = tree();
        let target = TempDir::new().unwrap();
        let dest = target.path().join("copy");
        let session = LocalSession::new();

        copy_dir(&session, src.path(), &session, &dest, DEFAULT_CHUNK_SIZE).unwrap();

        assert_eq!(fs::read(dest.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read(dest.join("a/one.txt")).unwrap(), b"one");
        assert!(dest.join("a/nested").is_dir());
        assert!(dest.join("b").is_dir());
    }

    #[test]
    fn test_copy_dir_destination_exists() {
        let src = tree();
        let target = TempDir::new().unwrap();
        let session = LocalSession::new();

        let result = copy_dir(&session, src.path(), &session, target.path(), DEFAULT_CHUNK_SIZE);
        assert!(matches!(result, Err(RexecError::DestinationExists(path)) if path == target.path()));
    }
}
