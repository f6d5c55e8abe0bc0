use std::io;
use thiserror::Error;

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Failure reasons surfaced to the client for a single tool call.
///
/// Paths carried in messages are always the caller-supplied strings, never a
/// resolved target, so a denial cannot disclose where a link points.
#[derive(Debug, Error)]
pub enum FsError {
	#[error("access denied - path outside allowed directories: {0}")]
	PathOutsideSandbox(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("not a file: {0}")]
	NotAFile(String),
	#[error("not a directory: {0}")]
	NotADirectory(String),
	#[error("already exists: {0}")]
	AlreadyExists(String),
	#[error("cannot {action} an allowed directory: {path}")]
	RootProtected {
		action: &'static str,
		path: String,
	},
	#[error("{action} {path}: {source}")]
	Io {
		action: &'static str,
		path: String,
		#[source]
		source: io::Error,
	},
	#[error("no match found for replacement text in {0}")]
	NoMatch(String),
	#[error("found {count} matches for replacement text in {path}; provide more context to make the match unique")]
	AmbiguousMatch {
		path: String,
		count: usize,
	},
	#[error("invalid line number {0}: line numbers start at 1")]
	InvalidLine(i64),
	#[error("no edit to undo for {0}")]
	NoBackup(String),
	#[error("invalid arguments for {tool}: {message}")]
	InvalidArguments {
		tool: String,
		message: String,
	},
	#[error("unknown tool: {0}")]
	UnknownTool(String),
	#[error("invalid pattern {pattern}: {message}")]
	InvalidPattern {
		pattern: String,
		message: String,
	},
}

impl FsError {
	/// Wraps an OS error, promoting `NotFound` to its own variant.
	pub fn io(action: &'static str, path: impl Into<String>, source: io::Error) -> Self {
		let path = path.into();
		if source.kind() == io::ErrorKind::NotFound {
			return FsError::NotFound(path);
		}
		FsError::Io {
			action,
			path,
			source
		}
	}

	pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
		FsError::InvalidArguments {
			tool: tool.into(),
			message: message.into()
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			FsError::PathOutsideSandbox(_) => "PATH_OUTSIDE_SANDBOX",
			FsError::NotFound(_) => "NOT_FOUND",
			FsError::NotAFile(_) => "NOT_A_FILE",
			FsError::NotADirectory(_) => "NOT_A_DIRECTORY",
			FsError::AlreadyExists(_) => "ALREADY_EXISTS",
			FsError::RootProtected { .. } => "ROOT_PROTECTED",
			FsError::Io { .. } => "IO_ERROR",
			FsError::NoMatch(_) => "NO_MATCH",
			FsError::AmbiguousMatch { .. } => "AMBIGUOUS_MATCH",
			FsError::InvalidLine(_) => "INVALID_LINE",
			FsError::NoBackup(_) => "NO_BACKUP",
			FsError::InvalidArguments { .. } => "INVALID_ARGUMENTS",
			FsError::UnknownTool(_) => "UNKNOWN_TOOL",
			FsError::InvalidPattern { .. } => "INVALID_PATTERN",
		}
	}
}
