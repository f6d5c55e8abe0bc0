use crate::edit::{BackupStore, EditManager};
use crate::error::{FsError, FsResult};
use crate::fs::{FileInfo, FileManager, FileRead};
use crate::protocol::{Request, Response};
use crate::sandbox::PathSandbox;
use crate::tools::{tool_definitions, ToolCall};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, SecondsFormat};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVER_NAME: &str = "secure-filesystem-server";
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const BACKUP_DIR_NAME: &str = "mcp-filesystem-backups";

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct Config {
	pub allowed_roots: Vec<String>,
	/// Parent of the per-session backup directory.
	pub backup_dir: PathBuf,
	pub cwd: PathBuf,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

pub fn load_config() -> Result<Config> {
	let cwd = std::env::current_dir()?;
	config_from(std::env::args().skip(1), |key| std::env::var(key).ok(), cwd)
}

fn config_from<I, E>(args: I, env: E, cwd: PathBuf) -> Result<Config>
where
	I: IntoIterator<Item = String>,
	E: Fn(&str) -> Option<String>, {
	let mut allowed_roots: Vec<String> = Vec::new();
	let mut backup_dir: Option<PathBuf> = None;
	let mut otel_enabled: Option<bool> = None;
	let mut otel_endpoint: Option<String> = None;
	let mut otel_service_name: Option<String> = None;
	let mut config_path: Option<String> = None;
	let mut print_schema = false;
	let mut args = args.into_iter();
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--allow-root" => {
				let value = args.next().ok_or_else(|| anyhow!("--allow-root requires a value"))?;
				if !value.trim().is_empty() {
					allowed_roots.push(value);
				}
			}
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				config_path = Some(value);
			}
			"--backup-dir" => {
				let value = args.next().ok_or_else(|| anyhow!("--backup-dir requires a value"))?;
				backup_dir = Some(PathBuf::from(value));
			}
			"--print-config-schema" => {
				print_schema = true;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = Some(parse_bool(&value, "--otel-enabled")?);
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = Some(value);
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = Some(value);
			}
			flag if flag.starts_with("--") => return Err(anyhow!("unknown argument: {}", arg)),
			_ => allowed_roots.push(arg),
		}
	}
	if config_path.is_none() {
		config_path = env("MCP_CONFIG").filter(|value| !value.trim().is_empty());
	}
	if let Some(env_roots) = env("MCP_ALLOWED_ROOTS") {
		for value in env_roots.split(',') {
			let trimmed = value.trim();
			if !trimmed.is_empty() {
				allowed_roots.push(trimmed.to_string());
			}
		}
	}
	if backup_dir.is_none() {
		backup_dir = env("MCP_BACKUP_DIR")
			.filter(|value| !value.trim().is_empty())
			.map(PathBuf::from);
	}
	if otel_enabled.is_none() {
		if let Some(env_enabled) = env("MCP_OTEL_ENABLED").filter(|value| !value.trim().is_empty()) {
			otel_enabled = Some(parse_bool(&env_enabled, "MCP_OTEL_ENABLED")?);
		}
	}
	if otel_endpoint.is_none() {
		otel_endpoint = env("MCP_OTEL_ENDPOINT").filter(|value| !value.trim().is_empty());
	}
	if otel_service_name.is_none() {
		otel_service_name = env("MCP_OTEL_SERVICE_NAME").filter(|value| !value.trim().is_empty());
	}
	if print_schema {
		let schema = config_schema();
		let payload = serde_json::to_string_pretty(&schema)?;
		println!("{}", payload);
		std::process::exit(0);
	}
	let mut config = Config {
		allowed_roots,
		backup_dir: backup_dir.unwrap_or_else(|| std::env::temp_dir().join(BACKUP_DIR_NAME)),
		cwd,
		otel_enabled: otel_enabled.unwrap_or(false),
		otel_endpoint: otel_endpoint.unwrap_or_else(|| String::from("http://127.0.0.1:4317")),
		otel_service_name: otel_service_name.unwrap_or_else(|| String::from("secure-fs-server")),
		session_id: uuid::Uuid::new_v4().to_string(),
	};
	if let Some(path) = config_path {
		let value = load_config_value(&path)?;
		apply_config_file(&mut config, &value)?;
	}
	if config.allowed_roots.is_empty() {
		return Err(anyhow!("no allowed directories configured; usage: secure-fs-server <allowed-directory> [additional-directories...]"));
	}
	if config.backup_dir.is_relative() {
		config.backup_dir = config.cwd.join(&config.backup_dir);
	}
	Ok(config)
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	let filter = EnvFilter::try_from_env("MCP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

/// Per-process state: the sandboxed file manager and the edit history.
pub struct Server {
	files: FileManager,
	edits: EditManager,
	session_id: String,
}

impl Server {
	pub fn new(config: &Config) -> Result<Self> {
		let sandbox = PathSandbox::new(&config.allowed_roots, config.cwd.clone())?;
		let backup_dir = config.backup_dir.join(&config.session_id);
		if sandbox.contains(&config.backup_dir) || sandbox.contains(&backup_dir) {
			return Err(anyhow!("backup directory {} must not be inside an allowed directory", config.backup_dir.display()));
		}
		let store = BackupStore::open(backup_dir)?;
		info!(
			roots = ?sandbox.roots().iter().map(|root| root.display.as_str()).collect::<Vec<_>>(),
			backup_dir = %store.dir().display(),
			"secure filesystem server ready"
		);
		Ok(Self {
			files: FileManager::new(sandbox),
			edits: EditManager::new(store),
			session_id: config.session_id.clone()
		})
	}

	async fn handle_request(&mut self, req: Request) -> Option<Response> {
		let method = req.method.clone();
		let tool_name = extract_tool_name(&method, &req.params);
		let span = info_span!(
			"mcp.request",
			"mcp.session_id" = %self.session_id,
			"mcp.method" = %method,
			"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
			"mcp.is_error" = tracing::field::Empty,
			"mcp.error_code" = tracing::field::Empty,
			"mcp.response_bytes" = tracing::field::Empty,
		);
		let _guard = span.enter();
		let outcome = self.route(&req).await;
		let Some(id) = req.id else {
			debug!(method = %method, "notification handled");
			return None;
		};
		let resp = match outcome {
			Ok(value) => {
				record_result(&span, &value);
				Response::ok(id, value)
			}
			Err(err) => {
				if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
					Response::err(id, protocol.code, protocol.message.clone())
				}
				else {
					Response::err(id, -32000, err.to_string())
				}
			}
		};
		Some(resp)
	}

	async fn route(&mut self, req: &Request) -> Result<Value> {
		match req.method.as_str() {
			"initialize" => {
				let protocol_version = req.params
					.get("protocolVersion")
					.and_then(Value::as_str)
					.unwrap_or(DEFAULT_PROTOCOL_VERSION);
				Ok(json!({
					"protocolVersion": protocol_version,
					"serverInfo": {
						"name": SERVER_NAME,
						"version": env!("CARGO_PKG_VERSION")
					},
					"capabilities": {
						"tools": {
							"list": true,
							"call": true
						}
					}
				}))
			}
			"ping" => Ok(json!({})),
			"tools/list" | "list_tools" => Ok(json!({
				"tools": tool_definitions(),
			})),
			"tools/call" | "call_tool" => {
				let name = req.params
					.get("name")
					.and_then(Value::as_str)
					.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
				let arguments = req.params
					.get("arguments")
					.cloned()
					.unwrap_or(Value::Null);
				if !arguments.is_null() && !arguments.is_object() {
					return Err(ProtocolError::new(-32602, "arguments must be an object").into());
				}
				let result = match ToolCall::parse(name, arguments) {
					Ok(call) => self.execute_tool(call).await,
					Err(err) => Err(err),
				};
				Ok(match result {
					Ok(text) => tool_success(text),
					Err(err) => tool_error(&err),
				})
			}
			_ => Err(ProtocolError::new(-32601, "method not found").into()),
		}
	}

	async fn execute_tool(&mut self, call: ToolCall) -> FsResult<String> {
		match call {
			ToolCall::ReadFile { path } => self.files.read_file(&path).await,
			ToolCall::ReadMultipleFiles { paths } => {
				let results = self.files.read_multiple_files(&paths).await;
				Ok(render_file_reads(&results))
			}
			ToolCall::WriteFile { path, content } => {
				self.files.write_file(&path, &content).await?;
				Ok(format!("Successfully wrote to {}", path))
			}
			ToolCall::CreateDirectory { path } => {
				self.files.create_directory(&path).await?;
				Ok(format!("Successfully created directory {}", path))
			}
			ToolCall::ListDirectory { path } => {
				let entries = self.files.list_directory(&path).await?;
				Ok(
					entries
						.iter()
						.map(|entry| format!("{} {}", entry.kind.label(), entry.name))
						.collect::<Vec<_>>()
						.join("\n")
				)
			}
			ToolCall::MoveFile { source, destination } => {
				self.files.move_file(&source, &destination).await?;
				Ok(format!("Successfully moved {} to {}", source, destination))
			}
			ToolCall::SearchFiles { path, pattern, exclude_patterns } => {
				let matches = self.files.search_files(&path, &pattern, &exclude_patterns).await?;
				if matches.is_empty() {
					return Ok(String::from("No matches found"));
				}
				let lines = matches
					.iter()
					.map(|found| found.display().to_string())
					.collect::<Vec<_>>();
				Ok(format!("{} matches found:\n{}", lines.len(), lines.join("\n")))
			}
			ToolCall::GetFileInfo { path } => {
				let info = self.files.get_file_info(&path).await?;
				Ok(render_file_info(&info))
			}
			ToolCall::ListAllowedDirectories {} => Ok(format!("Allowed directories:\n{}", self.files.list_allowed_directories().join("\n"))),
			ToolCall::StrReplace { path, old_str, new_str } => {
				let resolved = self.files.sandbox().resolve(&path)?;
				let outcome = self.edits.str_replace(&resolved.path, &old_str, &new_str).await?;
				Ok(format!("Successfully replaced text in {}\n\n{}", path, outcome.diff))
			}
			ToolCall::Insert { path, line_number, text } => {
				let resolved = self.files.sandbox().resolve(&path)?;
				let outcome = self.edits.insert(&resolved.path, line_number, &text).await?;
				let line = outcome.line.unwrap_or(1);
				Ok(format!("Successfully inserted text at line {} in {}\n\n{}", line, path, outcome.diff))
			}
			ToolCall::UndoEdit { path } => {
				let resolved = self.files.sandbox().resolve(&path)?;
				self.edits.undo_edit(&resolved.path).await?;
				Ok(format!("Successfully undid last edit to {}", path))
			}
		}
	}
}

pub async fn run(config: Config) -> Result<()> {
	let mut server = Server::new(&config)?;
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	let shutdown = shutdown_signal();
	tokio::pin!(shutdown);
	loop {
		let line = tokio::select! {
			line = reader.next_line() => line?,
			_ = &mut shutdown => {
				info!("shutdown signal received");
				break;
			}
		};
		let Some(line) = line else {
			break;
		};
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if let Some(resp) = server.handle_request(req).await {
			write_response(&mut writer, resp).await?;
		}
	}
	Ok(())
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
			}
			Err(_) => {
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

fn tool_success(text: String) -> Value {
	json!({
		"isError": false,
		"content": [
            {
                "type": "text",
                "text": text
            }
        ]
	})
}

fn tool_error(err: &FsError) -> Value {
	json!({
		"isError": true,
		"structuredContent": {
            "code": err.code()
        },
		"content": [
            {
                "type": "text",
                "text": format!("Error: {}", err)
            }
        ]
	})
}

fn render_file_reads(results: &[FileRead]) -> String {
	results
		.iter()
		.map(
			|read| match &read.result {
				Ok(content) => format!("{}:\n{}\n", read.path, content),
				Err(err) => format!("{}: Error - {}", read.path, err),
			}
		)
		.collect::<Vec<_>>()
		.join("\n---\n")
}

fn render_file_info(info: &FileInfo) -> String {
	[
		format!("size: {}", info.size),
		format!("created: {}", format_time(info.created)),
		format!("modified: {}", format_time(info.modified)),
		format!("accessed: {}", format_time(info.accessed)),
		format!("isDirectory: {}", info.is_directory),
		format!("isFile: {}", info.is_file),
		format!("isSymlink: {}", info.is_symlink),
		format!("permissions: {} ({})", info.permissions_octal(), info.permissions_symbolic()),
	].join("\n")
}

fn format_time(time: Option<SystemTime>) -> String {
	match time {
		Some(time) => DateTime::<Local>::from(time).to_rfc3339_opts(SecondsFormat::Secs, false),
		None => String::from("unknown"),
	}
}

fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "secure-fs-server configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"allowedDirectories": {
				"type": "array",
				"items": { "type": "string" },
				"description": "Directories the server may access. Added to those given on the command line."
			},
			"backupDir": {
				"type": "string",
				"description": "Where undo backups are kept. Must be outside every allowed directory."
			},
			"otel": {
				"type": "object",
				"additionalProperties": false,
				"properties": {
					"enabled": { "type": "boolean", "description": "Export traces over OTLP." },
					"endpoint": { "type": "string", "description": "OTLP endpoint." },
					"serviceName": { "type": "string", "description": "OTEL service.name." }
				}
			}
		}
	})
}

fn load_config_value(path: &str) -> Result<Value> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path, err))?;
	let value: Value = serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path, err))?;
	Ok(value)
}

fn apply_config_file(config: &mut Config, value: &Value) -> Result<()> {
	let obj = value.as_object().ok_or_else(|| anyhow!("config must be an object"))?;
	for (key, value) in obj {
		match key.as_str() {
			"allowedDirectories" => {
				let dirs = value.as_array().ok_or_else(|| anyhow!("allowedDirectories must be an array"))?;
				for dir in dirs {
					let dir = dir.as_str().ok_or_else(|| anyhow!("allowedDirectories entries must be strings"))?;
					if !dir.trim().is_empty() {
						config.allowed_roots.push(dir.to_string());
					}
				}
			}
			"backupDir" => {
				if !value.is_null() {
					config.backup_dir = PathBuf::from(value.as_str().ok_or_else(|| anyhow!("backupDir must be a string"))?);
				}
			}
			"otel" => {
				let otel = value.as_object().ok_or_else(|| anyhow!("otel must be an object"))?;
				for (key, value) in otel {
					match key.as_str() {
						"enabled" => {
							config.otel_enabled = value.as_bool().ok_or_else(|| anyhow!("otel.enabled must be a boolean"))?;
						}
						"endpoint" => {
							config.otel_endpoint = value.as_str().ok_or_else(|| anyhow!("otel.endpoint must be a string"))?.to_string();
						}
						"serviceName" => {
							config.otel_service_name = value.as_str().ok_or_else(|| anyhow!("otel.serviceName must be a string"))?.to_string();
						}
						_ => return Err(anyhow!("unknown config key: otel.{}", key)),
					}
				}
			}
			_ => return Err(anyhow!("unknown config key: {}", key)),
		}
	}
	Ok(())
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" && method != "call_tool" {
		return None;
	}
	params
		.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.as_bytes().len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
