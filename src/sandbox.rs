//! Path validation against the configured allowed directories.
//!
//! Every path a tool receives goes through [`PathSandbox::resolve`] or
//! [`PathSandbox::resolve_parent`] before any filesystem call. Resolution is
//! lexical first (`.`/`..` collapsed without touching disk), then every symlink
//! on the way is dereferenced, including the final component and links whose
//! target does not exist yet. Only the fully resolved form is compared with the
//! roots, and callers operate on that resolved form.

use crate::error::{FsError, FsResult};
use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Clone, Debug)]
pub struct AllowedRoot {
	/// Directory as the administrator configured it.
	pub display: String,
	/// Canonical form used for containment checks.
	pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ResolvedPath {
	pub path: PathBuf,
	pub root: PathBuf,
}

impl ResolvedPath {
	pub fn is_root(&self) -> bool {
		self.path == self.root
	}
}

#[derive(Clone, Debug)]
pub struct PathSandbox {
	roots: Vec<AllowedRoot>,
	cwd: PathBuf,
}

impl PathSandbox {
	pub fn new(roots: &[String], cwd: PathBuf) -> Result<Self> {
		let mut allowed: Vec<AllowedRoot> = Vec::new();
		for raw in roots {
			let trimmed = raw.trim();
			if trimmed.is_empty() {
				continue;
			}
			let candidate = Path::new(trimmed);
			let absolute = if candidate.is_absolute() {
				candidate.to_path_buf()
			}
			else {
				cwd.join(candidate)
			};
			let path = std::fs::canonicalize(normalize_path(&absolute))
				.map_err(|err| anyhow!("allowed directory {}: {}", trimmed, err))?;
			if !path.is_dir() {
				return Err(anyhow!("allowed directory {} is not a directory", trimmed));
			}
			if allowed.iter().any(|root| root.path == path) {
				continue;
			}
			allowed.push(AllowedRoot {
				display: trimmed.to_string(),
				path
			});
		}
		if allowed.is_empty() {
			return Err(anyhow!("at least one allowed directory is required"));
		}
		Ok(Self {
			roots: allowed,
			cwd
		})
	}

	pub fn roots(&self) -> &[AllowedRoot] {
		&self.roots
	}

	/// Resolves `raw` completely and checks it lands inside an allowed root.
	pub fn resolve(&self, raw: &str) -> FsResult<ResolvedPath> {
		let normalized = self.absolute(raw);
		let real = resolve_real(&normalized).map_err(|err| self.unresolvable(raw, &normalized, err))?;
		self.check(raw, real)
	}

	/// Resolution for operations that create `raw`: only the parent has to
	/// exist in resolved form. A leaf that is already a symlink is followed so
	/// an escaping link is still refused.
	pub fn resolve_parent(&self, raw: &str) -> FsResult<ResolvedPath> {
		let normalized = self.absolute(raw);
		let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) else {
			return self.resolve(raw);
		};
		let leaf_is_link = std::fs::symlink_metadata(&normalized)
			.map(|meta| meta.file_type().is_symlink())
			.unwrap_or(false);
		if leaf_is_link {
			let real = resolve_real(&normalized).map_err(|err| self.unresolvable(raw, &normalized, err))?;
			return self.check(raw, real);
		}
		let parent_real = resolve_real(parent).map_err(|err| self.unresolvable(raw, &normalized, err))?;
		self.check(raw, parent_real.join(name))
	}

	/// True when `path` resolves inside one of the roots. Used to vet entries
	/// discovered during a directory walk.
	pub fn contains(&self, path: &Path) -> bool {
		match resolve_real(&normalize_path(path)) {
			Ok(real) => self.root_for(&real).is_some(),
			Err(_) => false,
		}
	}

	/// `raw` made absolute against the working directory and lexically
	/// normalized. Nothing on disk is consulted.
	pub fn absolute(&self, raw: &str) -> PathBuf {
		let candidate = Path::new(raw);
		let absolute = if candidate.is_absolute() {
			candidate.to_path_buf()
		}
		else {
			self.cwd.join(candidate)
		};
		normalize_path(&absolute)
	}

	fn check(&self, raw: &str, real: PathBuf) -> FsResult<ResolvedPath> {
		match self.root_for(&real) {
			Some(root) => Ok(ResolvedPath {
				root: root.path.clone(),
				path: real
			}),
			None => {
				warn!(path = %raw, "path outside allowed directories");
				Err(FsError::PathOutsideSandbox(raw.to_string()))
			}
		}
	}

	/// Maps a resolution failure. Unless the deepest ancestor that still
	/// resolves lies inside a root, the failure is reported as a denial so the
	/// OS error cannot describe anything outside the sandbox.
	fn unresolvable(&self, raw: &str, normalized: &Path, err: io::Error) -> FsError {
		let inside = deepest_real_ancestor(normalized)
			.map(|real| self.root_for(&real).is_some())
			.unwrap_or(false);
		if !inside {
			warn!(path = %raw, "unresolvable path outside allowed directories");
			return FsError::PathOutsideSandbox(raw.to_string());
		}
		FsError::io("resolve", raw, err)
	}

	fn root_for(&self, real: &Path) -> Option<&AllowedRoot> {
		// Path::starts_with compares whole components, so /data-evil never
		// matches /data.
		self.roots
			.iter()
			.filter(|root| real.starts_with(&root.path))
			.max_by_key(|root| root.path.components().count())
	}
}

/// Dereferences every symlink in `path`. Missing trailing segments are kept
/// literally on top of the deepest ancestor that exists.
fn resolve_real(path: &Path) -> io::Result<PathBuf> {
	resolve_with_hops(path, 0)
}

fn resolve_with_hops(path: &Path, hops: usize) -> io::Result<PathBuf> {
	if hops > MAX_SYMLINK_HOPS {
		return Err(io::Error::new(io::ErrorKind::Other, "too many levels of symbolic links"));
	}
	let mut existing = path.to_path_buf();
	let mut tail: Vec<OsString> = Vec::new();
	loop {
		match std::fs::canonicalize(&existing) {
			Ok(mut real) => {
				for part in tail.iter().rev() {
					real.push(part);
				}
				return Ok(real);
			}
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				let is_link = std::fs::symlink_metadata(&existing)
					.map(|meta| meta.file_type().is_symlink())
					.unwrap_or(false);
				if is_link {
					// Dangling link: chase the target so a create through it is
					// validated where it would really land.
					let target = std::fs::read_link(&existing)?;
					let base = match existing.parent() {
						Some(parent) => std::fs::canonicalize(parent)?,
						None => PathBuf::from("/"),
					};
					let mut next = normalize_path(&base.join(target));
					for part in tail.iter().rev() {
						next.push(part);
					}
					return resolve_with_hops(&next, hops + 1);
				}
				let Some(name) = existing.file_name().map(|name| name.to_os_string()) else {
					return Err(err);
				};
				tail.push(name);
				if !existing.pop() {
					return Err(err);
				}
			}
			Err(err) => return Err(err),
		}
	}
}

/// Canonical form of the deepest ancestor of `path` that canonicalizes, with
/// the remaining components appended literally.
fn deepest_real_ancestor(path: &Path) -> Option<PathBuf> {
	let mut ancestor = path.to_path_buf();
	let mut tail: Vec<OsString> = Vec::new();
	loop {
		if let Ok(mut real) = std::fs::canonicalize(&ancestor) {
			for part in tail.iter().rev() {
				real.push(part);
			}
			return Some(real);
		}
		tail.push(ancestor.file_name()?.to_os_string());
		if !ancestor.pop() {
			return None;
		}
	}
}

pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fixture {
		_base: tempfile::TempDir,
		root: PathBuf,
		outside: PathBuf,
		sandbox: PathSandbox,
	}

	fn fixture() -> Fixture {
		let base = tempfile::tempdir().expect("tempdir");
		let base_path = base.path().canonicalize().expect("canonical base");
		let root = base_path.join("allowed");
		let outside = base_path.join("outside");
		std::fs::create_dir_all(&root).expect("root dir");
		std::fs::create_dir_all(&outside).expect("outside dir");
		std::fs::write(outside.join("secret.txt"), "secret").expect("secret");
		let sandbox = PathSandbox::new(&[root.to_string_lossy().to_string()], root.clone()).expect("sandbox");
		Fixture {
			_base: base,
			root,
			outside,
			sandbox
		}
	}

	fn as_str(path: &Path) -> String {
		path.to_string_lossy().to_string()
	}

	#[test]
	fn normalize_collapses_dots_and_separators() {
		assert_eq!(normalize_path(Path::new("/a/./b//c/../d")), PathBuf::from("/a/b/d"));
		assert_eq!(normalize_path(Path::new("/../../etc")), PathBuf::from("/etc"));
		assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
	}

	#[test]
	fn relative_paths_resolve_against_working_directory() {
		let fx = fixture();
		let resolved = fx.sandbox.resolve("notes/today.txt").expect("resolve");
		assert_eq!(resolved.path, fx.root.join("notes/today.txt"));
		assert_eq!(resolved.root, fx.root);
	}

	#[test]
	fn root_itself_is_allowed() {
		let fx = fixture();
		let resolved = fx.sandbox.resolve(&as_str(&fx.root)).expect("resolve");
		assert!(resolved.is_root());
	}

	#[test]
	fn traversal_out_of_root_is_denied() {
		let fx = fixture();
		let err = fx.sandbox.resolve("../outside/secret.txt").expect_err("denied");
		assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		let err = fx.sandbox.resolve(&as_str(&fx.outside.join("secret.txt"))).expect_err("denied");
		assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
	}

	#[test]
	fn sibling_with_shared_prefix_is_denied() {
		let fx = fixture();
		let evil = fx.root.with_file_name("allowed-evil");
		std::fs::create_dir_all(&evil).expect("evil dir");
		let err = fx.sandbox.resolve(&as_str(&evil.join("x.txt"))).expect_err("denied");
		assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
	}

	#[test]
	fn denial_message_does_not_reveal_target() {
		let fx = fixture();
		let err = fx.sandbox.resolve("../outside/secret.txt").expect_err("denied");
		let message = err.to_string();
		assert!(message.contains("../outside/secret.txt"));
		assert!(!message.contains(&as_str(&fx.outside)));
	}

	#[test]
	fn missing_segments_resolve_under_existing_ancestor() {
		let fx = fixture();
		let resolved = fx.sandbox.resolve("a/b/c.txt").expect("resolve");
		assert_eq!(resolved.path, fx.root.join("a/b/c.txt"));
	}

	#[test]
	fn deepest_matching_root_wins() {
		let fx = fixture();
		let nested = fx.root.join("nested");
		std::fs::create_dir_all(&nested).expect("nested");
		let sandbox = PathSandbox::new(
			&[as_str(&fx.root), as_str(&nested)],
			fx.root.clone()
		).expect("sandbox");
		let resolved = sandbox.resolve("nested/file.txt").expect("resolve");
		assert_eq!(resolved.root, nested);
	}

	#[test]
	fn empty_or_invalid_roots_are_rejected() {
		let base = tempfile::tempdir().expect("tempdir");
		assert!(PathSandbox::new(&[], base.path().to_path_buf()).is_err());
		let file = base.path().join("file.txt");
		std::fs::write(&file, "x").expect("file");
		assert!(PathSandbox::new(&[as_str(&file)], base.path().to_path_buf()).is_err());
		assert!(PathSandbox::new(&[as_str(&base.path().join("missing"))], base.path().to_path_buf()).is_err());
	}

	#[test]
	fn file_used_as_directory_outside_is_denied() {
		let fx = fixture();
		let through_file = as_str(&fx.outside.join("secret.txt").join("x"));
		let err = fx.sandbox.resolve(&through_file).expect_err("denied");
		assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		assert_eq!(err.code(), fx.sandbox.resolve(&as_str(&fx.outside.join("nope/x"))).expect_err("denied").code());
		let err = fx.sandbox.resolve_parent(&format!("{}/y", through_file)).expect_err("denied");
		assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		assert!(!err.to_string().contains("Not a directory"));
	}

	#[test]
	fn file_used_as_directory_inside_keeps_io_error() {
		let fx = fixture();
		std::fs::write(fx.root.join("plain.txt"), "x").expect("file");
		let err = fx.sandbox.resolve("plain.txt/x").expect_err("not a directory");
		assert_eq!(err.code(), "IO_ERROR");
	}

	#[cfg(unix)]
	mod symlinks {
		use super::*;
		use std::os::unix::fs::symlink;

		#[test]
		fn link_to_outside_file_is_denied() {
			let fx = fixture();
			symlink(fx.outside.join("secret.txt"), fx.root.join("link.txt")).expect("symlink");
			let err = fx.sandbox.resolve("link.txt").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		}

		#[test]
		fn link_to_outside_directory_is_denied_for_children() {
			let fx = fixture();
			symlink(&fx.outside, fx.root.join("escape")).expect("symlink");
			let err = fx.sandbox.resolve("escape/secret.txt").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
			let err = fx.sandbox.resolve("escape/new.txt").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		}

		#[test]
		fn dangling_link_pointing_outside_is_denied() {
			let fx = fixture();
			symlink(fx.outside.join("not-yet.txt"), fx.root.join("dangling")).expect("symlink");
			let err = fx.sandbox.resolve("dangling").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
			let err = fx.sandbox.resolve_parent("dangling").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		}

		#[test]
		fn dangling_link_inside_resolves_to_target() {
			let fx = fixture();
			symlink("future.txt", fx.root.join("pending")).expect("symlink");
			let resolved = fx.sandbox.resolve("pending").expect("resolve");
			assert_eq!(resolved.path, fx.root.join("future.txt"));
		}

		#[test]
		fn link_inside_sandbox_is_followed() {
			let fx = fixture();
			std::fs::create_dir_all(fx.root.join("real")).expect("real dir");
			symlink(fx.root.join("real"), fx.root.join("alias")).expect("symlink");
			let resolved = fx.sandbox.resolve("alias/x.txt").expect("resolve");
			assert_eq!(resolved.path, fx.root.join("real/x.txt"));
		}

		#[test]
		fn resolve_parent_accepts_new_leaf_and_rejects_escaping_leaf() {
			let fx = fixture();
			let resolved = fx.sandbox.resolve_parent("fresh.txt").expect("resolve");
			assert_eq!(resolved.path, fx.root.join("fresh.txt"));
			symlink(fx.outside.join("secret.txt"), fx.root.join("leaf")).expect("symlink");
			let err = fx.sandbox.resolve_parent("leaf").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		}

		#[test]
		fn path_through_link_to_outside_file_is_denied() {
			let fx = fixture();
			symlink(fx.outside.join("secret.txt"), fx.root.join("file-link")).expect("symlink");
			let err = fx.sandbox.resolve("file-link/x").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
			let err = fx.sandbox.resolve_parent("file-link/x").expect_err("denied");
			assert_eq!(err.code(), "PATH_OUTSIDE_SANDBOX");
		}

		#[test]
		fn link_loops_fail_without_hanging() {
			let fx = fixture();
			symlink(fx.root.join("b"), fx.root.join("a")).expect("symlink a");
			symlink(fx.root.join("a"), fx.root.join("b")).expect("symlink b");
			assert!(fx.sandbox.resolve("a").is_err());
		}

		#[test]
		fn contains_checks_resolved_location() {
			let fx = fixture();
			symlink(&fx.outside, fx.root.join("escape")).expect("symlink");
			assert!(fx.sandbox.contains(&fx.root.join("real-file")));
			assert!(!fx.sandbox.contains(&fx.root.join("escape")));
		}
	}
}
