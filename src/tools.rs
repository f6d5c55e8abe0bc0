use crate::error::{FsError, FsResult};
use serde::Deserialize;
use serde_json::{json, Value};

pub const TOOL_NAMES: &[&str] = &[
	"read_file",
	"read_multiple_files",
	"write_file",
	"create_directory",
	"list_directory",
	"move_file",
	"search_files",
	"get_file_info",
	"list_allowed_directories",
	"str_replace",
	"insert",
	"undo_edit",
];

/// A tool invocation with its arguments checked for shape and type. Parsing
/// happens before any path is looked at.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
	ReadFile {
		path: String,
	},
	ReadMultipleFiles {
		paths: Vec<String>,
	},
	WriteFile {
		path: String,
		content: String,
	},
	CreateDirectory {
		path: String,
	},
	ListDirectory {
		path: String,
	},
	MoveFile {
		source: String,
		destination: String,
	},
	SearchFiles {
		path: String,
		pattern: String,
		#[serde(default, rename = "excludePatterns", alias = "exclude_patterns")]
		exclude_patterns: Vec<String>,
	},
	GetFileInfo {
		path: String,
	},
	ListAllowedDirectories {},
	StrReplace {
		path: String,
		old_str: String,
		new_str: String,
	},
	Insert {
		path: String,
		#[serde(alias = "insert_line")]
		line_number: i64,
		#[serde(alias = "new_str")]
		text: String,
	},
	UndoEdit {
		path: String,
	},
}

impl ToolCall {
	pub fn parse(name: &str, arguments: Value) -> FsResult<Self> {
		if !TOOL_NAMES.contains(&name) {
			return Err(FsError::UnknownTool(name.to_string()));
		}
		let arguments = if arguments.is_null() {
			json!({})
		}
		else {
			arguments
		};
		let call: ToolCall = serde_json::from_value(json!({
			"name": name,
			"arguments": arguments
		})).map_err(|err| FsError::invalid_arguments(name, err.to_string()))?;
		call.validate()?;
		Ok(call)
	}

	pub fn name(&self) -> &'static str {
		match self {
			ToolCall::ReadFile { .. } => "read_file",
			ToolCall::ReadMultipleFiles { .. } => "read_multiple_files",
			ToolCall::WriteFile { .. } => "write_file",
			ToolCall::CreateDirectory { .. } => "create_directory",
			ToolCall::ListDirectory { .. } => "list_directory",
			ToolCall::MoveFile { .. } => "move_file",
			ToolCall::SearchFiles { .. } => "search_files",
			ToolCall::GetFileInfo { .. } => "get_file_info",
			ToolCall::ListAllowedDirectories {} => "list_allowed_directories",
			ToolCall::StrReplace { .. } => "str_replace",
			ToolCall::Insert { .. } => "insert",
			ToolCall::UndoEdit { .. } => "undo_edit",
		}
	}

	fn validate(&self) -> FsResult<()> {
		let name = self.name();
		match self {
			ToolCall::ReadFile { path } |
			ToolCall::WriteFile { path, .. } |
			ToolCall::CreateDirectory { path } |
			ToolCall::ListDirectory { path } |
			ToolCall::SearchFiles { path, .. } |
			ToolCall::GetFileInfo { path } |
			ToolCall::StrReplace { path, .. } |
			ToolCall::Insert { path, .. } |
			ToolCall::UndoEdit { path } => require(name, "path", path),
			ToolCall::ReadMultipleFiles { paths } => {
				if paths.is_empty() {
					return Err(FsError::invalid_arguments(name, "paths must not be empty"));
				}
				paths.iter().try_for_each(|path| require(name, "paths entry", path))
			}
			ToolCall::MoveFile { source, destination } => {
				require(name, "source", source)?;
				require(name, "destination", destination)
			}
			ToolCall::ListAllowedDirectories {} => Ok(()),
		}
	}
}

fn require(tool: &str, label: &str, value: &str) -> FsResult<()> {
	if value.trim().is_empty() {
		return Err(FsError::invalid_arguments(tool, format!("{} must not be empty", label)));
	}
	Ok(())
}

fn path_schema(description: &str) -> Value {
	json!({
		"type": "object",
		"properties": {
			"path": { "type": "string", "description": description }
		},
		"required": ["path"]
	})
}

pub fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "read_file",
		"description": "Read the complete contents of a file. Only works within allowed directories.",
		"annotations": { "scopes": ["read:file"], "group": "filesystem" },
		"inputSchema": path_schema("Path of the file to read.")
	}),
	json!({
		"name": "read_multiple_files",
		"description": "Read several files at once. A failure on one path is reported inline and does not stop the others.",
		"annotations": { "scopes": ["read:file"], "group": "filesystem" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "paths": { "type": "array", "items": { "type": "string" }, "minItems": 1, "description": "Paths of the files to read." }
                },
                "required": ["paths"]
            }
	}),
	json!({
		"name": "write_file",
		"description": "Create a new file or overwrite an existing one with the given content.",
		"annotations": { "scopes": ["write:file"], "group": "filesystem" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path of the file to write." },
                    "content": { "type": "string", "description": "Full content of the file." }
                },
                "required": ["path", "content"]
            }
	}),
	json!({
		"name": "create_directory",
		"description": "Create a directory, including missing parents. Succeeds if it already exists.",
		"annotations": { "scopes": ["write:file"], "group": "filesystem" },
		"inputSchema": path_schema("Path of the directory to create.")
	}),
	json!({
		"name": "list_directory",
		"description": "List the entries of a directory, each tagged [FILE] or [DIR].",
		"annotations": { "scopes": ["read:file"], "group": "filesystem" },
		"inputSchema": path_schema("Path of the directory to list.")
	}),
	json!({
		"name": "move_file",
		"description": "Move or rename a file or directory. Fails if the destination exists.",
		"annotations": { "scopes": ["write:file"], "group": "filesystem" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "source": { "type": "string", "description": "Existing path to move." },
                    "destination": { "type": "string", "description": "New path. Must not exist yet." }
                },
                "required": ["source", "destination"]
            }
	}),
	json!({
		"name": "search_files",
		"description": "Recursively search for files and directories whose name matches a pattern. Plain text matches as a case-insensitive substring; patterns with *, ?, [ or { are case-insensitive globs.",
		"annotations": { "scopes": ["read:file"], "group": "filesystem" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory to start searching from." },
                    "pattern": { "type": "string", "description": "Substring or glob to match against entry names." },
                    "excludePatterns": { "type": "array", "items": { "type": "string" }, "description": "Globs, relative to path, to skip." }
                },
                "required": ["path", "pattern"]
            }
	}),
	json!({
		"name": "get_file_info",
		"description": "Show size, timestamps, type and permissions of a file or directory.",
		"annotations": { "scopes": ["read:file"], "group": "filesystem" },
		"inputSchema": path_schema("Path to inspect.")
	}),
	json!({
		"name": "list_allowed_directories",
		"description": "List the directories this server is allowed to access.",
		"annotations": { "scopes": [], "group": "filesystem" },
		"inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
	}),
	json!({
		"name": "str_replace",
		"description": "Replace one exact occurrence of old_str with new_str. Fails when old_str is missing or appears more than once.",
		"annotations": { "scopes": ["write:file"], "group": "editor" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to edit." },
                    "old_str": { "type": "string", "description": "Text to replace. Must occur exactly once." },
                    "new_str": { "type": "string", "description": "Replacement text." }
                },
                "required": ["path", "old_str", "new_str"]
            }
	}),
	json!({
		"name": "insert",
		"description": "Insert text as a new line at a 1-based line number. Numbers past the end append to the file.",
		"annotations": { "scopes": ["write:file"], "group": "editor" },
		"inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to edit." },
                    "line_number": { "type": "integer", "minimum": 1, "description": "Line the text will occupy after insertion." },
                    "text": { "type": "string", "description": "Text to insert." }
                },
                "required": ["path", "line_number", "text"]
            }
	}),
	json!({
		"name": "undo_edit",
		"description": "Revert the most recent str_replace or insert on a file. Only one step is kept.",
		"annotations": { "scopes": ["write:file"], "group": "editor" },
		"inputSchema": path_schema("File whose last edit should be undone.")
	}),
	]
}
