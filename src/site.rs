use serde::Deserialize;
use slug::slugify;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{ExportError, Result};

/// A page of the site as the generator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Source path relative to the site root, always `/`-separated.
    pub relative_path: String,
    pub key: String,
    /// Served URL path, e.g. `/guide/` or `/guide/setup.html`.
    pub path: String,
    pub title: String,
}

impl Page {
    /// Builds a page from its relative source path and markdown source.
    pub fn from_source(relative_path: &str, source: &str) -> Self {
        let front = FrontMatter::parse(source);
        let path = front
            .permalink
            .clone()
            .unwrap_or_else(|| served_path(relative_path));
        let title = front
            .title
            .clone()
            .or_else(|| first_heading(front.body))
            .unwrap_or_else(|| relative_path.to_string());

        Self {
            relative_path: relative_path.to_string(),
            key: page_key(relative_path),
            path,
            title,
        }
    }
}

/// Export settings read from the site's configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SiteConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "exportPdfOrder")]
    pub export_pdf_order: Option<Vec<String>>,
}

impl SiteConfig {
    /// Reads a `.toml`, `.json` or `.js` settings file. A `.js` file is
    /// evaluated with `node`, which must be on the `PATH`.
    pub async fn load(path: &Path) -> Result<Self> {
        let config_error = |reason: String| ExportError::Config {
            path: path.to_path_buf(),
            reason,
        };

        let content = if is_script(path) {
            evaluate_js(path).await.map_err(config_error)?
        } else {
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| config_error(e.to_string()))?
        };

        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(content).map_err(|e| e.to_string()),
            Some("json" | "js" | "cjs") => serde_json::from_str(content).map_err(|e| e.to_string()),
            _ => Err("unsupported config format, expected .toml, .json or .js".to_string()),
        };

        parsed.map_err(|reason| ExportError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Locates the configuration under `<source>/.vuepress`.
    async fn discover(source_dir: &Path) -> Result<Self> {
        let config_dir = source_dir.join(".vuepress");

        for name in ["config.toml", "config.json"] {
            let candidate = config_dir.join(name);
            if candidate.is_file() {
                debug!("Using site config {}", candidate.display());
                return Self::load(&candidate).await;
            }
        }

        let script = config_dir.join("config.js");
        if script.is_file() {
            return match evaluate_js(&script).await {
                Ok(json) => {
                    debug!("Using site config {}", script.display());
                    Self::parse(&script, &json)
                }
                Err(reason) => {
                    warn!(
                        "{} could not be evaluated ({}), export settings fall back to defaults",
                        script.display(),
                        reason
                    );
                    Ok(Self::default())
                }
            };
        }

        for name in ["config.yml", "config.yaml"] {
            if config_dir.join(name).is_file() {
                warn!(
                    "{} cannot be read, export settings fall back to defaults (use --site-config)",
                    config_dir.join(name).display()
                );
                break;
            }
        }

        Ok(Self::default())
    }
}

/// Prints the module's exports (or its ES `default` export) as JSON.
const NODE_EXPORT_SCRIPT: &str =
    "const c = require(process.argv[1]); process.stdout.write(JSON.stringify((c && c.default) || c));";

fn is_script(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("js" | "cjs"))
}

/// Runs `node` on a config module and returns what it exports as JSON text.
async fn evaluate_js(path: &Path) -> std::result::Result<String, String> {
    let absolute = tokio::fs::canonicalize(path).await.map_err(|e| e.to_string())?;

    let output = Command::new("node")
        .arg("-e")
        .arg(NODE_EXPORT_SCRIPT)
        .arg(&absolute)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run node: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .find(|line| line.contains("Error"))
            .or_else(|| stderr.lines().next())
            .unwrap_or_default()
            .trim()
            .to_string();
        return Err(format!("node exited with {}: {}", output.status, detail));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("node printed invalid UTF-8: {}", e))
}

#[derive(Debug, Clone)]
pub struct Site {
    pub source_dir: PathBuf,
    pub config: SiteConfig,
    /// Pages in natural (sorted relative path) order.
    pub pages: Vec<Page>,
}

impl Site {
    pub async fn load(source_dir: &Path, config_override: Option<&Path>) -> Result<Self> {
        if !source_dir.is_dir() {
            return Err(ExportError::SourceDirMissing(source_dir.to_path_buf()));
        }

        let config = match config_override {
            Some(path) => SiteConfig::load(path).await?,
            None => SiteConfig::discover(source_dir).await?,
        };

        let pages = discover_pages(source_dir)?;
        debug!("Discovered {} pages in {}", pages.len(), source_dir.display());

        Ok(Self {
            source_dir: source_dir.to_path_buf(),
            config,
            pages,
        })
    }

    /// Stem of the merged output file.
    pub fn output_name(&self) -> String {
        let title = self
            .config
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_OUTPUT_NAME);
        title.replace(['/', '\\'], "-")
    }
}

pub const DEFAULT_OUTPUT_NAME: &str = "site";

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.') || name == "node_modules")
            .unwrap_or(false)
}

fn discover_pages(source_dir: &Path) -> Result<Vec<Page>> {
    let mut pages = Vec::new();

    let walker = WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = format!("Failed to scan {}", source_dir.display());
            ExportError::io(context, e.into())
        })?;

        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let relative = match path.strip_prefix(source_dir) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };

        let source = fs::read_to_string(path)
            .map_err(|e| ExportError::io(format!("Failed to read {}", path.display()), e))?;
        pages.push(Page::from_source(&relative, &source));
    }

    pages.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(pages)
}

/// `README.md`/`index.md` are served as their directory, anything else as `.html`.
pub fn served_path(relative_path: &str) -> String {
    let stem = relative_path.strip_suffix(".md").unwrap_or(relative_path);
    let (dir, name) = match stem.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, stem),
    };

    if name.eq_ignore_ascii_case("readme") || name.eq_ignore_ascii_case("index") {
        match dir {
            Some(dir) => format!("/{}/", dir),
            None => "/".to_string(),
        }
    } else {
        format!("/{}.html", stem)
    }
}

pub fn page_key(relative_path: &str) -> String {
    let stem = relative_path.strip_suffix(".md").unwrap_or(relative_path);
    let key = slugify(stem);
    if key.is_empty() {
        "page".to_string()
    } else {
        key
    }
}

#[derive(Debug, Default)]
struct FrontMatter<'a> {
    title: Option<String>,
    permalink: Option<String>,
    body: &'a str,
}

impl<'a> FrontMatter<'a> {
    /// Reads the flat `key: value` pairs of a leading `---` block.
    fn parse(source: &'a str) -> Self {
        let mut front = FrontMatter {
            body: source,
            ..Default::default()
        };

        let Some(rest) = source
            .strip_prefix("---\n")
            .or_else(|| source.strip_prefix("---\r\n"))
        else {
            return front;
        };

        let mut offset = source.len() - rest.len();
        for line in rest.split_inclusive('\n') {
            offset += line.len();
            let line = line.trim_end();
            if line == "---" {
                front.body = &source[offset..];
                return front;
            }

            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                if value.is_empty() {
                    continue;
                }
                match key.trim() {
                    "title" => front.title = Some(value.to_string()),
                    "permalink" => front.permalink = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        // Unterminated block, treat the whole file as content.
        FrontMatter {
            body: source,
            ..Default::default()
        }
    }
}

fn first_heading(body: &str) -> Option<String> {
    let mut in_fence = false;
    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let heading = heading.trim().trim_end_matches('#').trim_end();
            if !heading.is_empty() {
                return Some(heading.to_string());
            }
        }
    }
    None
}
