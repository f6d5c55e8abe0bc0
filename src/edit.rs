//! Text edits with a single level of undo.
//!
//! Paths handed to [`EditManager`] have already been resolved by the sandbox.
//! Each successful edit first stores the file's previous bytes in the
//! [`BackupStore`], replacing any earlier backup for that path, so `undo_edit`
//! always returns to the state before the most recent edit.

use crate::error::{FsError, FsResult};
use crate::fs::write_atomic;
use anyhow::{anyhow, Result};
use similar::TextDiff;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const BACKUP_EXTENSION: &str = "bak";

#[derive(Debug)]
pub struct Backup {
	pub path: PathBuf,
	pub file: PathBuf,
	pub created_at: SystemTime,
}

/// One backup file per edited path, held in a private directory that lives
/// only as long as the process.
pub struct BackupStore {
	dir: PathBuf,
	entries: HashMap<PathBuf, Backup>,
}

impl BackupStore {
	/// Opens the store in `dir`, which is created owner-only. The shared
	/// parent is created if needed but must not be a symlink.
	pub fn open(dir: PathBuf) -> Result<Self> {
		if let Some(parent) = dir.parent() {
			std::fs::create_dir_all(parent).map_err(|err| anyhow!("backup directory {}: {}", parent.display(), err))?;
			let meta = std::fs::symlink_metadata(parent).map_err(|err| anyhow!("backup directory {}: {}", parent.display(), err))?;
			if meta.file_type().is_symlink() {
				return Err(anyhow!("backup directory {} must not be a symlink", parent.display()));
			}
		}
		create_private_dir(&dir).map_err(|err| anyhow!("backup directory {}: {}", dir.display(), err))?;
		let entries = std::fs::read_dir(&dir).map_err(|err| anyhow!("backup directory {}: {}", dir.display(), err))?;
		for entry in entries {
			let path = entry?.path();
			if path.extension().and_then(|ext| ext.to_str()) == Some(BACKUP_EXTENSION) {
				let _ = std::fs::remove_file(&path);
			}
		}
		Ok(Self {
			dir,
			entries: HashMap::new()
		})
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn get(&self, path: &Path) -> Option<&Backup> {
		self.entries.get(path)
	}

	/// Writes `content` to a new owner-only backup file without touching the
	/// live entries.
	async fn stage(&self, content: &[u8]) -> io::Result<PathBuf> {
		let file = self.dir.join(format!("{}.{}", uuid::Uuid::new_v4().simple(), BACKUP_EXTENSION));
		if let Err(err) = write_private(&file, content).await {
			let _ = fs::remove_file(&file).await;
			return Err(err);
		}
		Ok(file)
	}

	/// Makes a staged file the backup for `path`, dropping the one it replaces.
	async fn install(&mut self, path: &Path, file: PathBuf) {
		let backup = Backup {
			path: path.to_path_buf(),
			file,
			created_at: SystemTime::now()
		};
		debug!(path = %backup.path.display(), "backup saved");
		if let Some(previous) = self.entries.insert(path.to_path_buf(), backup) {
			let _ = fs::remove_file(&previous.file).await;
		}
	}

	async fn discard(&mut self, path: &Path) {
		if let Some(backup) = self.entries.remove(path) {
			let _ = fs::remove_file(&backup.file).await;
		}
	}
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
	use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
	match std::fs::DirBuilder::new().mode(0o700).create(dir) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
			let meta = std::fs::symlink_metadata(dir)?;
			if !meta.is_dir() {
				return Err(io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"));
			}
			std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
		}
		Err(err) => Err(err),
	}
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
	std::fs::create_dir_all(dir)
}

async fn write_private(file: &Path, content: &[u8]) -> io::Result<()> {
	let mut options = fs::OpenOptions::new();
	options.write(true).create_new(true);
	#[cfg(unix)]
	options.mode(0o600);
	let mut handle = options.open(file).await?;
	handle.write_all(content).await?;
	handle.sync_all().await
}

impl Drop for BackupStore {
	fn drop(&mut self) {
		for backup in self.entries.values() {
			let _ = std::fs::remove_file(&backup.file);
		}
		let _ = std::fs::remove_dir(&self.dir);
	}
}

#[derive(Debug)]
pub struct EditOutcome {
	/// 1-based line the edit landed on; only set by `insert`.
	pub line: Option<usize>,
	pub diff: String,
}

pub struct EditManager {
	store: BackupStore,
}

impl EditManager {
	pub fn new(store: BackupStore) -> Self {
		Self {
			store
		}
	}

	#[cfg(test)]
	pub fn store(&self) -> &BackupStore {
		&self.store
	}

	/// Replaces the single occurrence of `old_str`. Zero or several
	/// occurrences leave the file untouched.
	pub async fn str_replace(&mut self, path: &Path, old_str: &str, new_str: &str) -> FsResult<EditOutcome> {
		let display = path.display().to_string();
		if old_str.is_empty() {
			return Err(FsError::invalid_arguments("str_replace", "old_str must not be empty"));
		}
		let (bytes, content) = read_text(path, &display).await?;
		match content.matches(old_str).count() {
			0 => return Err(FsError::NoMatch(display)),
			1 => {}
			count => return Err(FsError::AmbiguousMatch {
				path: display,
				count
			}),
		}
		let updated = content.replacen(old_str, new_str, 1);
		self.commit(path, &display, &bytes, &updated).await?;
		Ok(EditOutcome {
			line: None,
			diff: make_diff(&content, &updated, &display)
		})
	}

	/// Inserts `text` as a new line at `line_number`, clamped to one past the
	/// last line.
	pub async fn insert(&mut self, path: &Path, line_number: i64, text: &str) -> FsResult<EditOutcome> {
		if line_number < 1 {
			return Err(FsError::InvalidLine(line_number));
		}
		let display = path.display().to_string();
		let (bytes, content) = read_text(path, &display).await?;
		let target = usize::try_from(line_number).unwrap_or(usize::MAX);
		let (updated, line) = insert_line(&content, target, text);
		self.commit(path, &display, &bytes, &updated).await?;
		Ok(EditOutcome {
			line: Some(line),
			diff: make_diff(&content, &updated, &display)
		})
	}

	pub async fn undo_edit(&mut self, path: &Path) -> FsResult<()> {
		let display = path.display().to_string();
		let Some((file, saved_at)) = self.store.get(path).map(|backup| (backup.file.clone(), backup.created_at)) else {
			return Err(FsError::NoBackup(display));
		};
		let content = match fs::read(&file).await {
			Ok(content) => content,
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				self.store.discard(path).await;
				return Err(FsError::NoBackup(display));
			}
			Err(err) => return Err(FsError::io("read backup of", display, err)),
		};
		write_atomic(path, &content).await.map_err(|err| FsError::io("restore", display.clone(), err))?;
		self.store.discard(path).await;
		debug!(path = %path.display(), saved_at = ?saved_at, "backup restored");
		Ok(())
	}

	async fn commit(&mut self, path: &Path, display: &str, previous: &[u8], updated: &str) -> FsResult<()> {
		let staged = self.store
			.stage(previous)
			.await
			.map_err(|err| FsError::io("back up", display, err))?;
		if let Err(err) = write_atomic(path, updated.as_bytes()).await {
			let _ = fs::remove_file(&staged).await;
			return Err(FsError::io("write", display, err));
		}
		self.store.install(path, staged).await;
		Ok(())
	}
}

async fn read_text(path: &Path, display: &str) -> FsResult<(Vec<u8>, String)> {
	let meta = fs::metadata(path).await.map_err(|err| FsError::io("read", display, err))?;
	if meta.is_dir() {
		return Err(FsError::NotAFile(display.to_string()));
	}
	let bytes = fs::read(path).await.map_err(|err| FsError::io("read", display, err))?;
	let content = std::str::from_utf8(&bytes)
		.map_err(|_| FsError::Io {
			action: "edit",
			path: display.to_string(),
			source: io::Error::new(io::ErrorKind::InvalidData, "file is not valid UTF-8 text")
		})?
		.to_string();
	Ok((bytes, content))
}

/// Returns the new content and the 1-based line `text` ended up on. The
/// file's line ending and trailing newline are kept.
fn insert_line(content: &str, line_number: usize, text: &str) -> (String, usize) {
	let newline = if content.contains("\r\n") {
		"\r\n"
	}
	else {
		"\n"
	};
	let trailing = content.ends_with(newline);
	let body = if trailing {
		&content[..content.len() - newline.len()]
	}
	else {
		content
	};
	let mut lines: Vec<&str> = if content.is_empty() {
		Vec::new()
	}
	else {
		body.split(newline).collect()
	};
	let index = line_number.clamp(1, lines.len() + 1) - 1;
	lines.insert(index, text);
	let mut out = lines.join(newline);
	if trailing {
		out.push_str(newline);
	}
	(out, index + 1)
}

fn make_diff(existing: &str, updated: &str, path: &str) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(path, path)
		.to_string()
}
