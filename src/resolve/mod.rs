//! Input resolution for query execution.
//!
//! Turns the heterogeneous inputs of a `query` invocation (directories,
//! files, path strings, URLs and server objects) into an ordered list of
//! [`SqlSource`]s. Downloaded and generated text is written to temporary
//! artifacts owned by a [`TempArtifactManager`].
//!
//! Resolution is fail-fast: the first input that cannot be resolved aborts
//! the whole list, since no valid source set exists to execute.

mod batches;
mod download;
mod paths;
mod scripting;
mod temp;

pub use batches::{split_batches, Batch};
pub use download::{download_with_retry, Downloader, FetchAuth, HttpDownloader};
pub use paths::{expand, has_script_extension, list_scripts, local_path};
pub use scripting::{ScriptGenerator, ServerScriptGenerator};
pub use temp::TempArtifactManager;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::debug;
use url::Url;

use crate::db::ScriptableObject;
use crate::error::{FleetError, Result};

const DOWNLOAD_PREFIX: &str = "sqlfleet-download-";
const OBJECT_PREFIX: &str = "sqlfleet-object-";

/// One input to resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// Every script file directly inside the directory.
    Directory(PathBuf),
    /// A single file.
    File(PathBuf),
    /// A path string, possibly with wildcards or a `file://` URL.
    Path(String),
    /// A script to download.
    Url(Url),
    /// A server object to script.
    Object(ScriptableObject),
}

impl QueryInput {
    /// Classifies a command-line argument.
    ///
    /// `http(s)` URLs are downloads, existing directories and files are taken
    /// as such, and everything else is a path string resolved later.
    pub fn classify(arg: &str) -> Result<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(FleetError::unsupported_input("Empty input path"));
        }

        if let Ok(url) = Url::parse(arg) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(Self::Url(url));
            }
        }

        let path = Path::new(arg);
        if !paths::has_wildcards(arg) {
            if path.is_dir() {
                return Ok(Self::Directory(path.to_path_buf()));
            }
            if path.is_file() {
                return Ok(Self::File(path.to_path_buf()));
            }
        }
        Ok(Self::Path(arg.to_string()))
    }
}

impl fmt::Display for QueryInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(p) | Self::File(p) => write!(f, "{}", p.display()),
            Self::Path(s) => f.write_str(s),
            Self::Url(u) => write!(f, "{u}"),
            Self::Object(o) => write!(f, "{o}"),
        }
    }
}

/// Where a source's text came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOrigin {
    /// Query text given directly.
    Literal,
    /// A script file on disk.
    File(PathBuf),
    /// A script downloaded from a URL.
    Downloaded(Url),
    /// A script generated from a server object.
    Generated(ScriptableObject),
}

/// A unit of executable SQL text with its provenance.
///
/// File-backed text is read on first use and cached.
#[derive(Debug)]
pub struct SqlSource {
    origin: SourceOrigin,
    path: Option<PathBuf>,
    is_temporary: bool,
    text: OnceLock<String>,
}

impl SqlSource {
    /// A literal query.
    pub fn literal(text: impl Into<String>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(text.into());
        Self {
            origin: SourceOrigin::Literal,
            path: None,
            is_temporary: false,
            text: cell,
        }
    }

    /// A script file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            origin: SourceOrigin::File(path.clone()),
            path: Some(path),
            is_temporary: false,
            text: OnceLock::new(),
        }
    }

    fn temporary(origin: SourceOrigin, path: PathBuf) -> Self {
        Self {
            origin,
            path: Some(path),
            is_temporary: true,
            text: OnceLock::new(),
        }
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True if the backing file is a temporary artifact.
    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    /// A short description for reports.
    pub fn label(&self) -> String {
        match &self.origin {
            SourceOrigin::Literal => "query".to_string(),
            SourceOrigin::File(path) => path.display().to_string(),
            SourceOrigin::Downloaded(url) => url.to_string(),
            SourceOrigin::Generated(object) => object.to_string(),
        }
    }

    /// Returns the SQL text, reading the backing file on first call.
    pub fn text(&self) -> Result<&str> {
        if let Some(text) = self.text.get() {
            return Ok(text);
        }

        let path = self
            .path
            .as_ref()
            .ok_or_else(|| FleetError::internal("Source has neither text nor a backing file"))?;
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                FleetError::not_found(format!("File {} does not exist", path.display()))
            }
            _ => FleetError::internal(format!("Failed to read {}: {e}", path.display())),
        })?;
        let content = decode_script(&bytes).ok_or_else(|| {
            FleetError::invalid_argument(format!(
                "{} is not valid UTF-8 or BOM-marked UTF-16",
                path.display()
            ))
        })?;

        Ok(self.text.get_or_init(|| content))
    }
}

/// Decodes script bytes. A BOM selects UTF-16 LE/BE; otherwise UTF-8 with an optional BOM.
fn decode_script(bytes: &[u8]) -> Option<String> {
    let utf16 = |body: &[u8], unit: fn([u8; 2]) -> u16| -> Option<String> {
        if body.len() % 2 != 0 {
            return None;
        }
        let units: Vec<u16> = body.chunks_exact(2).map(|c| unit([c[0], c[1]])).collect();
        String::from_utf16(&units).ok()
    };

    match bytes {
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8(rest.to_vec()).ok(),
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        _ => String::from_utf8(bytes.to_vec()).ok(),
    }
}

/// Resolves inputs into SQL sources.
pub struct InputResolver {
    extensions: Vec<String>,
    downloader: Arc<dyn Downloader>,
    script_generator: Option<Arc<dyn ScriptGenerator>>,
    temp: Arc<TempArtifactManager>,
}

impl InputResolver {
    /// Creates a resolver.
    ///
    /// `extensions` are the script extensions picked up from directories.
    pub fn new(
        extensions: Vec<String>,
        downloader: Arc<dyn Downloader>,
        temp: Arc<TempArtifactManager>,
    ) -> Self {
        Self {
            extensions,
            downloader,
            script_generator: None,
            temp,
        }
    }

    /// Sets the generator used for object inputs.
    pub fn with_script_generator(mut self, generator: Arc<dyn ScriptGenerator>) -> Self {
        self.script_generator = Some(generator);
        self
    }

    /// The artifact manager that owns downloaded and generated files.
    pub fn temp(&self) -> &TempArtifactManager {
        &self.temp
    }

    /// Resolves inputs in order.
    pub async fn resolve(&self, inputs: &[QueryInput]) -> Result<Vec<SqlSource>> {
        let mut sources = Vec::new();
        for input in inputs {
            let resolved = self.resolve_one(input).await?;
            debug!(input = %input, sources = resolved.len(), "Resolved input");
            sources.extend(resolved);
        }
        Ok(sources)
    }

    async fn resolve_one(&self, input: &QueryInput) -> Result<Vec<SqlSource>> {
        match input {
            QueryInput::Directory(dir) => Ok(list_scripts(dir, &self.extensions)?
                .into_iter()
                .map(SqlSource::file)
                .collect()),
            QueryInput::File(path) => {
                if !path.is_file() {
                    return Err(FleetError::not_found(format!(
                        "File {} does not exist",
                        path.display()
                    )));
                }
                Ok(vec![SqlSource::file(path)])
            }
            QueryInput::Path(reference) => {
                Ok(expand(reference)?.into_iter().map(SqlSource::file).collect())
            }
            QueryInput::Url(url) => {
                let text = download_with_retry(self.downloader.as_ref(), url).await?;
                let path = self.temp.write_artifact(DOWNLOAD_PREFIX, &text)?;
                Ok(vec![SqlSource::temporary(
                    SourceOrigin::Downloaded(url.clone()),
                    path,
                )])
            }
            QueryInput::Object(object) => {
                let generator = self.script_generator.as_ref().ok_or_else(|| {
                    FleetError::generation(format!(
                        "Cannot script {object}: no instance to script from (use --script-from)"
                    ))
                })?;
                let text = generator.generate_script(object).await?;
                let path = self.temp.write_artifact(OBJECT_PREFIX, &text)?;
                Ok(vec![SqlSource::temporary(
                    SourceOrigin::Generated(object.clone()),
                    path,
                )])
            }
        }
    }
}
