use crate::error::{FsError, FsResult};
use crate::sandbox::PathSandbox;
use filetime::{set_file_times, FileTime};
use futures::future::join_all;
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// File and directory operations confined to the sandbox. Each method takes
/// the caller's raw path strings and resolves them before touching disk.
pub struct FileManager {
	sandbox: PathSandbox,
}

pub struct FileRead {
	pub path: String,
	pub result: FsResult<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
	File,
	Directory,
}

impl EntryKind {
	pub fn label(self) -> &'static str {
		match self {
			EntryKind::File => "[FILE]",
			EntryKind::Directory => "[DIR]",
		}
	}
}

#[derive(Debug)]
pub struct DirEntry {
	pub name: String,
	pub kind: EntryKind,
}

#[derive(Debug)]
pub struct FileInfo {
	pub size: u64,
	pub created: Option<SystemTime>,
	pub modified: Option<SystemTime>,
	pub accessed: Option<SystemTime>,
	pub is_directory: bool,
	pub is_file: bool,
	pub is_symlink: bool,
	pub mode: u32,
}

impl FileInfo {
	/// Last three octal digits, e.g. `644`.
	pub fn permissions_octal(&self) -> String {
		format!("{:03o}", self.mode & 0o777)
	}

	pub fn permissions_symbolic(&self) -> String {
		let mut out = String::with_capacity(9);
		for shift in [6u32, 3, 0] {
			let bits = (self.mode >> shift) & 0o7;
			out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
			out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
			out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
		}
		out
	}
}

impl FileManager {
	pub fn new(sandbox: PathSandbox) -> Self {
		Self {
			sandbox
		}
	}

	pub fn sandbox(&self) -> &PathSandbox {
		&self.sandbox
	}

	pub async fn read_file(&self, raw: &str) -> FsResult<String> {
		let resolved = self.sandbox.resolve(raw)?;
		let meta = fs::metadata(&resolved.path).await.map_err(|err| FsError::io("read", raw, err))?;
		if meta.is_dir() {
			return Err(FsError::NotAFile(raw.to_string()));
		}
		let bytes = fs::read(&resolved.path).await.map_err(|err| FsError::io("read", raw, err))?;
		Ok(String::from_utf8_lossy(&bytes).into_owned())
	}

	/// Reads every path concurrently. A failing path yields an error entry and
	/// never cancels the others; results keep request order.
	pub async fn read_multiple_files(&self, paths: &[String]) -> Vec<FileRead> {
		let reads = paths.iter().map(
			|path| async move {
				FileRead {
					path: path.clone(),
					result: self.read_file(path).await
				}
			}
		);
		join_all(reads).await
	}

	pub async fn write_file(&self, raw: &str, content: &str) -> FsResult<()> {
		let resolved = self.sandbox.resolve_parent(raw)?;
		if let Ok(meta) = fs::metadata(&resolved.path).await {
			if meta.is_dir() {
				return Err(FsError::NotAFile(raw.to_string()));
			}
		}
		if let Some(parent) = resolved.path.parent() {
			fs::create_dir_all(parent).await.map_err(|err| FsError::io("create parent of", raw, err))?;
		}
		write_atomic(&resolved.path, content.as_bytes()).await.map_err(|err| FsError::io("write", raw, err))
	}

	pub async fn create_directory(&self, raw: &str) -> FsResult<()> {
		let resolved = self.sandbox.resolve_parent(raw)?;
		match fs::metadata(&resolved.path).await {
			Ok(meta) if meta.is_dir() => return Ok(()),
			Ok(_) => return Err(FsError::AlreadyExists(raw.to_string())),
			Err(_) => {}
		}
		fs::create_dir_all(&resolved.path).await.map_err(|err| FsError::io("create directory", raw, err))
	}

	pub async fn list_directory(&self, raw: &str) -> FsResult<Vec<DirEntry>> {
		let resolved = self.sandbox.resolve(raw)?;
		let meta = fs::metadata(&resolved.path).await.map_err(|err| FsError::io("list", raw, err))?;
		if !meta.is_dir() {
			return Err(FsError::NotADirectory(raw.to_string()));
		}
		let mut reader = fs::read_dir(&resolved.path).await.map_err(|err| FsError::io("list", raw, err))?;
		let mut entries = Vec::new();
		while let Some(entry) = reader.next_entry().await.map_err(|err| FsError::io("list", raw, err))? {
			let file_type = entry.file_type().await.map_err(|err| FsError::io("list", raw, err))?;
			let is_dir = if file_type.is_symlink() {
				// Only look through links that stay inside the sandbox.
				let path = entry.path();
				self.sandbox.contains(&path) && fs::metadata(&path).await.map(|meta| meta.is_dir()).unwrap_or(false)
			}
			else {
				file_type.is_dir()
			};
			entries.push(DirEntry {
				name: entry.file_name().to_string_lossy().to_string(),
				kind: if is_dir {
					EntryKind::Directory
				}
				else {
					EntryKind::File
				}
			});
		}
		entries.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(entries)
	}

	pub async fn move_file(&self, source: &str, destination: &str) -> FsResult<()> {
		let from = self.sandbox.resolve(source)?;
		let to = self.sandbox.resolve_parent(destination)?;
		if from.is_root() {
			return Err(FsError::RootProtected {
				action: "move",
				path: source.to_string()
			});
		}
		if fs::symlink_metadata(&from.path).await.is_err() {
			return Err(FsError::NotFound(source.to_string()));
		}
		if fs::symlink_metadata(&to.path).await.is_ok() {
			return Err(FsError::AlreadyExists(destination.to_string()));
		}
		if let Some(parent) = to.path.parent() {
			fs::create_dir_all(parent).await.map_err(|err| FsError::io("create parent of", destination, err))?;
		}
		move_path(&from.path, &to.path).await.map_err(|err| FsError::io("move", source, err))
	}

	/// Recursive name search under `raw_root`. The walk itself runs on the
	/// blocking pool.
	pub async fn search_files(&self, raw_root: &str, pattern: &str, exclude: &[String]) -> FsResult<Vec<PathBuf>> {
		let resolved = self.sandbox.resolve(raw_root)?;
		let meta = fs::metadata(&resolved.path).await.map_err(|err| FsError::io("search", raw_root, err))?;
		if !meta.is_dir() {
			return Err(FsError::NotADirectory(raw_root.to_string()));
		}
		let matcher = NameMatcher::new(pattern)?;
		let exclude_set = build_exclude_set(exclude)?;
		let sandbox = self.sandbox.clone();
		let root = resolved.path;
		tokio::task::spawn_blocking(move || walk_matches(root, matcher, exclude_set, sandbox))
			.await
			.map_err(|err| FsError::io("search", raw_root, io::Error::new(io::ErrorKind::Other, err)))
	}

	pub async fn get_file_info(&self, raw: &str) -> FsResult<FileInfo> {
		let resolved = self.sandbox.resolve(raw)?;
		let meta = fs::metadata(&resolved.path).await.map_err(|err| FsError::io("stat", raw, err))?;
		// The resolved path is never a link; ask about the name as given.
		let is_symlink = fs::symlink_metadata(self.sandbox.absolute(raw))
			.await
			.map(|meta| meta.file_type().is_symlink())
			.unwrap_or(false);
		Ok(FileInfo {
			size: meta.len(),
			created: meta.created().ok(),
			modified: meta.modified().ok(),
			accessed: meta.accessed().ok(),
			is_directory: meta.is_dir(),
			is_file: meta.is_file(),
			is_symlink,
			mode: permission_bits(&meta)
		})
	}

	pub fn list_allowed_directories(&self) -> Vec<String> {
		self.sandbox
			.roots()
			.iter()
			.map(|root| root.display.clone())
			.collect()
	}
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so a
/// reader sees either the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	let name = path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_default();
	let temp = parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
	let previous = fs::metadata(path).await.ok();
	let result = async {
		let mut file = fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&temp)
			.await?;
		file.write_all(bytes).await?;
		file.sync_all().await?;
		drop(file);
		if let Some(meta) = previous {
			fs::set_permissions(&temp, meta.permissions()).await?;
		}
		fs::rename(&temp, path).await
	}.await;
	if result.is_err() {
		let _ = fs::remove_file(&temp).await;
	}
	result
}

async fn move_path(from: &Path, to: &Path) -> io::Result<()> {
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err);
			}
		}
	}
	let meta = fs::symlink_metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_entry(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

/// Copies one non-directory entry. Links are recreated rather than followed
/// so the copy never pulls in content from outside the source tree.
async fn copy_entry(from: &Path, to: &Path) -> io::Result<()> {
	let meta = fs::symlink_metadata(from).await?;
	if meta.file_type().is_symlink() {
		let target = fs::read_link(from).await?;
		return recreate_link(&target, to).await;
	}
	fs::copy(from, to).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

#[cfg(unix)]
async fn recreate_link(target: &Path, link: &Path) -> io::Result<()> {
	fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn recreate_link(_target: &Path, link: &Path) -> io::Result<()> {
	debug!(path = %link.display(), "skipping symlink during cross-device move");
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::symlink_metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_entry(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

fn is_cross_device(err: &io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
	use std::os::unix::fs::PermissionsExt;
	meta.permissions().mode()
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
	if meta.permissions().readonly() {
		0o444
	}
	else {
		0o666
	}
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

/// Walks `root` and collects entries whose name matches. Every visited entry
/// is re-validated, so a link leading out of the sandbox is pruned rather
/// than descended.
fn walk_matches(root: PathBuf, matcher: NameMatcher, exclude_set: Option<GlobSet>, sandbox: PathSandbox) -> Vec<PathBuf> {
	let filter_root = root.clone();
	let mut builder = WalkBuilder::new(&root);
	builder.standard_filters(false);
	builder.follow_links(true);
	builder.filter_entry(
		move |entry| {
			if let Some(excludes) = &exclude_set {
				if excludes.is_match(relative_display(&filter_root, entry.path())) {
					return false;
				}
			}
			sandbox.contains(entry.path())
		}
	);
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = match entry {
			Ok(entry) => entry,
			Err(err) => {
				debug!(error = %err, "skipping unreadable entry");
				continue;
			}
		};
		let path = entry.path();
		if path == root {
			continue;
		}
		let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
			continue;
		};
		if matcher.is_match(&name) {
			matches.push(path.to_path_buf());
		}
	}
	matches.sort();
	matches
}

enum NameMatcher {
	Substring(String),
	Glob(GlobMatcher),
}

impl NameMatcher {
	/// Glob when the pattern carries glob syntax, otherwise a substring test.
	/// Both ignore case.
	fn new(pattern: &str) -> FsResult<Self> {
		if pattern.contains(&['*', '?', '[', '{'][..]) {
			let glob = GlobBuilder::new(pattern)
				.case_insensitive(true)
				.literal_separator(true)
				.build()
				.map_err(|err| FsError::InvalidPattern {
					pattern: pattern.to_string(),
					message: err.to_string()
				})?;
			return Ok(NameMatcher::Glob(glob.compile_matcher()));
		}
		Ok(NameMatcher::Substring(pattern.to_lowercase()))
	}

	fn is_match(&self, name: &str) -> bool {
		match self {
			NameMatcher::Substring(needle) => name.to_lowercase().contains(needle.as_str()),
			NameMatcher::Glob(glob) => glob.is_match(name),
		}
	}
}

/// Exclusions apply to paths relative to the search root. A pattern without a
/// separator also matches at any depth.
fn build_exclude_set(patterns: &[String]) -> FsResult<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let invalid = |pattern: &str, err: globset::Error| FsError::InvalidPattern {
		pattern: pattern.to_string(),
		message: err.to_string()
	};
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let mut variants = vec![pattern.clone()];
		if !pattern.contains('/') {
			variants.push(format!("**/{}", pattern));
		}
		for variant in variants {
			let glob = GlobBuilder::new(&variant)
				.literal_separator(true)
				.build()
				.map_err(|err| invalid(pattern, err))?;
			builder.add(glob);
		}
	}
	let set = builder.build().map_err(|err| invalid(&patterns.join(","), err))?;
	Ok(Some(set))
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fixture {
		_base: tempfile::TempDir,
		root: PathBuf,
		outside: PathBuf,
		files: FileManager,
	}

	fn fixture() -> Fixture {
		let base = tempfile::tempdir().expect("tempdir");
		let base_path = base.path().canonicalize().expect("canonical base");
		let root = base_path.join("root");
		let outside = base_path.join("outside");
		std::fs::create_dir_all(&root).expect("root dir");
		std::fs::create_dir_all(&outside).expect("outside dir");
		let sandbox = PathSandbox::new(&[root.to_string_lossy().to_string()], root.clone()).expect("sandbox");
		Fixture {
			_base: base,
			root,
			outside,
			files: FileManager::new(sandbox)
		}
	}

	#[tokio::test]
	async fn write_then_read_round_trips() {
		let fx = fixture();
		let content = "first line\nsecond line\n\u{1F980} unicode\n";
		fx.files.write_file("notes.txt", content).await.expect("write");
		assert_eq!(fx.files.read_file("notes.txt").await.expect("read"), content);
	}

	#[tokio::test]
	async fn write_creates_missing_parents_and_leaves_no_temp_files() {
		let fx = fixture();
		fx.files.write_file("a/b/c.txt", "deep").await.expect("write");
		fx.files.write_file("a/b/c.txt", "deeper").await.expect("overwrite");
		assert_eq!(std::fs::read_to_string(fx.root.join("a/b/c.txt")).expect("read"), "deeper");
		let leftovers: Vec<_> = std::fs::read_dir(fx.root.join("a/b"))
			.expect("read dir")
			.filter_map(|entry| entry.ok())
			.filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
			.collect();
		assert!(leftovers.is_empty());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn overwrite_keeps_permissions() {
		use std::os::unix::fs::PermissionsExt;
		let fx = fixture();
		let path = fx.root.join("script.sh");
		std::fs::write(&path, "#!/bin/sh\n").expect("seed");
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o750)).expect("chmod");
		fx.files.write_file("script.sh", "#!/bin/sh\necho hi\n").await.expect("write");
		let mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
		assert_eq!(mode, 0o750);
	}

	#[tokio::test]
	async fn directories_are_not_files() {
		let fx = fixture();
		std::fs::create_dir_all(fx.root.join("dir")).expect("dir");
		assert_eq!(fx.files.read_file("dir").await.expect_err("dir").code(), "NOT_A_FILE");
		assert_eq!(fx.files.write_file("dir", "x").await.expect_err("dir").code(), "NOT_A_FILE");
		assert_eq!(fx.files.read_file("missing.txt").await.expect_err("missing").code(), "NOT_FOUND");
	}

	#[tokio::test]
	async fn read_multiple_files_reports_each_path() {
		let fx = fixture();
		std::fs::write(fx.root.join("one.txt"), "alpha").expect("one");
		let paths = vec![
			"one.txt".to_string(),
			"missing.txt".to_string(),
			"../outside/x.txt".to_string()
		];
		let results = fx.files.read_multiple_files(&paths).await;
		assert_eq!(results.len(), 3);
		assert_eq!(results[0].path, "one.txt");
		assert_eq!(results[0].result.as_deref().expect("one"), "alpha");
		assert_eq!(results[1].result.as_ref().expect_err("missing").code(), "NOT_FOUND");
		assert_eq!(results[2].result.as_ref().expect_err("outside").code(), "PATH_OUTSIDE_SANDBOX");
	}

	#[tokio::test]
	async fn create_directory_is_idempotent() {
		let fx = fixture();
		fx.files.create_directory("x/y").await.expect("first");
		fx.files.create_directory("x/y").await.expect("second");
		assert!(fx.root.join("x/y").is_dir());
		std::fs::write(fx.root.join("taken"), "file").expect("file");
		assert_eq!(fx.files.create_directory("taken").await.expect_err("file").code(), "ALREADY_EXISTS");
	}

	#[tokio::test]
	async fn list_directory_tags_and_sorts_entries() {
		let fx = fixture();
		std::fs::create_dir_all(fx.root.join("beta")).expect("dir");
		std::fs::write(fx.root.join("alpha.txt"), "a").expect("file");
		let entries = fx.files.list_directory(".").await.expect("list");
		let listed: Vec<(&str, EntryKind)> = entries.iter().map(|entry| (entry.name.as_str(), entry.kind)).collect();
		assert_eq!(listed, vec![("alpha.txt", EntryKind::File), ("beta", EntryKind::Directory)]);
		assert_eq!(fx.files.list_directory("alpha.txt").await.expect_err("file").code(), "NOT_A_DIRECTORY");
	}

	#[tokio::test]
	async fn move_file_checks_source_and_destination() {
		let fx = fixture();
		std::fs::write(fx.root.join("from.txt"), "data").expect("from");
		std::fs::write(fx.root.join("taken.txt"), "other").expect("taken");
		assert_eq!(fx.files.move_file("from.txt", "taken.txt").await.expect_err("exists").code(), "ALREADY_EXISTS");
		assert_eq!(fx.files.move_file("nope.txt", "to.txt").await.expect_err("missing").code(), "NOT_FOUND");
		assert_eq!(fx.files.move_file("from.txt", "../outside/to.txt").await.expect_err("outside").code(), "PATH_OUTSIDE_SANDBOX");
		assert_eq!(fx.files.move_file(".", "elsewhere").await.expect_err("root").code(), "ROOT_PROTECTED");
		fx.files.move_file("from.txt", "sub/to.txt").await.expect("move");
		assert!(!fx.root.join("from.txt").exists());
		assert_eq!(std::fs::read_to_string(fx.root.join("sub/to.txt")).expect("read"), "data");
		assert!(!fx.outside.join("to.txt").exists());
	}

	#[tokio::test]
	async fn search_matches_substring_glob_and_respects_excludes() {
		let fx = fixture();
		std::fs::create_dir_all(fx.root.join("src/deep")).expect("dirs");
		std::fs::create_dir_all(fx.root.join("node_modules/pkg")).expect("dirs");
		std::fs::write(fx.root.join("src/Main.rs"), "").expect("file");
		std::fs::write(fx.root.join("src/deep/main_test.rs"), "").expect("file");
		std::fs::write(fx.root.join("node_modules/pkg/main.js"), "").expect("file");
		let found = fx.files.search_files(".", "MAIN", &[]).await.expect("search");
		assert_eq!(found.len(), 3);
		let found = fx.files.search_files(".", "*.rs", &["node_modules".to_string()]).await.expect("search");
		assert_eq!(found, vec![fx.root.join("src/Main.rs"), fx.root.join("src/deep/main_test.rs")]);
		let found = fx.files.search_files(".", "main", &["node_modules".to_string()]).await.expect("search");
		assert!(found.iter().all(|path| !path.starts_with(fx.root.join("node_modules"))));
		assert_eq!(fx.files.search_files(".", "[", &[]).await.expect_err("bad glob").code(), "INVALID_PATTERN");
	}

	#[tokio::test]
	async fn get_file_info_reports_type_and_permissions() {
		let fx = fixture();
		std::fs::write(fx.root.join("info.txt"), "12345").expect("file");
		let info = fx.files.get_file_info("info.txt").await.expect("info");
		assert_eq!(info.size, 5);
		assert!(info.is_file);
		assert!(!info.is_directory);
		assert!(info.modified.is_some());
		assert_eq!(info.permissions_octal().len(), 3);
		assert_eq!(info.permissions_symbolic().len(), 9);
	}

	#[test]
	fn symbolic_permissions_follow_mode_bits() {
		let info = FileInfo {
			size: 0,
			created: None,
			modified: None,
			accessed: None,
			is_directory: false,
			is_file: true,
			is_symlink: false,
			mode: 0o100754
		};
		assert_eq!(info.permissions_octal(), "754");
		assert_eq!(info.permissions_symbolic(), "rwxr-xr--");
	}

	#[cfg(unix)]
	mod symlinks {
		use super::*;
		use std::os::unix::fs::symlink;

		#[tokio::test]
		async fn search_does_not_walk_into_escaping_links() {
			let fx = fixture();
			std::fs::write(fx.outside.join("secret.txt"), "secret").expect("secret");
			std::fs::write(fx.root.join("local-secret.txt"), "mine").expect("local");
			symlink(&fx.outside, fx.root.join("escape")).expect("symlink");
			let found = fx.files.search_files(".", "secret", &[]).await.expect("search");
			assert_eq!(found, vec![fx.root.join("local-secret.txt")]);
		}

		#[tokio::test]
		async fn search_follows_links_that_stay_inside() {
			let fx = fixture();
			std::fs::create_dir_all(fx.root.join("real")).expect("dir");
			std::fs::write(fx.root.join("real/target.txt"), "").expect("file");
			symlink(fx.root.join("real"), fx.root.join("alias")).expect("symlink");
			let found = fx.files.search_files(".", "target", &[]).await.expect("search");
			assert!(found.contains(&fx.root.join("real/target.txt")));
			assert!(found.contains(&fx.root.join("alias/target.txt")));
		}

		#[tokio::test]
		async fn writes_through_escaping_links_are_refused() {
			let fx = fixture();
			symlink(fx.outside.join("planted.txt"), fx.root.join("trap.txt")).expect("symlink");
			let err = fx.files.write_file("trap.txt", "payload").await.expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
			assert!(!fx.outside.join("planted.txt").exists());
			symlink(&fx.outside, fx.root.join("dir-link")).expect("symlink");
			let err = fx.files.create_directory("dir-link/new").await.expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
			assert!(!fx.outside.join("new").exists());
		}

		#[tokio::test]
		async fn file_info_reports_links_by_the_given_name() {
			let fx = fixture();
			std::fs::write(fx.root.join("target.txt"), "abc").expect("file");
			symlink(fx.root.join("target.txt"), fx.root.join("alias.txt")).expect("symlink");
			let info = fx.files.get_file_info("alias.txt").await.expect("info");
			assert!(info.is_symlink);
			assert!(info.is_file);
			assert_eq!(info.size, 3);
			assert!(!fx.files.get_file_info("target.txt").await.expect("info").is_symlink);
		}

		#[tokio::test]
		async fn list_directory_does_not_probe_escaping_links() {
			let fx = fixture();
			symlink(&fx.outside, fx.root.join("escape")).expect("symlink");
			let entries = fx.files.list_directory(".").await.expect("list");
			assert_eq!(entries.len(), 1);
			assert_eq!(entries[0].kind, EntryKind::File);
		}
	}
}
