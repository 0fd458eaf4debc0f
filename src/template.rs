//! Status page template.
//!
//! The page is read from the first readable candidate path at startup and on
//! every reload. A copy of the stock page is compiled into the binary and
//! used whenever no file is found or the file fails to render.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tera::{Context, Tera};

use crate::error::RenderError;

pub const TEMPLATE_NAME: &str = "status.html";

/// Searched in order.
pub const DEFAULT_CANDIDATES: [&str; 3] = [
    "templates/status.html",
    "/templates/status.html",
    "./templates/status.html",
];

const BUILTIN: &str = include_str!("../templates/status.html");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    File(PathBuf),
    Builtin,
}

impl TemplateSource {
    pub fn label(&self) -> String {
        match self {
            TemplateSource::File(path) => path.display().to_string(),
            TemplateSource::Builtin => "builtin".to_string(),
        }
    }
}

struct Loaded {
    tera: Tera,
    source: TemplateSource,
}

pub struct TemplateStore {
    candidates: Vec<PathBuf>,
    loaded: RwLock<Loaded>,
    builtin: Tera,
}

fn compile(content: &str) -> Result<Tera, RenderError> {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![".html"]);
    tera.add_raw_template(TEMPLATE_NAME, content)?;
    Ok(tera)
}

impl TemplateStore {
    /// Loads the first candidate that exists. Missing files are not an
    /// error; a file that exists but does not parse is.
    pub fn load(candidates: Vec<PathBuf>) -> Result<Self, RenderError> {
        let builtin = compile(BUILTIN)?;
        let loaded = Self::read(&candidates)?;
        tracing::info!(source = %loaded.source.label(), "status page template loaded");
        Ok(Self {
            candidates,
            loaded: RwLock::new(loaded),
            builtin,
        })
    }

    /// Store using only the compiled-in page.
    pub fn builtin() -> Result<Self, RenderError> {
        Self::load(Vec::new())
    }

    fn read(candidates: &[PathBuf]) -> Result<Loaded, RenderError> {
        for path in candidates {
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "template not found");
                continue;
            }
            let content = fs::read_to_string(path).map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;
            return Ok(Loaded {
                tera: compile(&content)?,
                source: TemplateSource::File(path.clone()),
            });
        }
        Ok(Loaded {
            tera: compile(BUILTIN)?,
            source: TemplateSource::Builtin,
        })
    }

    /// Re-reads the template from disk. The current template stays in place
    /// if the new one cannot be loaded.
    pub fn reload(&self) -> Result<TemplateSource, RenderError> {
        let loaded = Self::read(&self.candidates)?;
        let source = loaded.source.clone();
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        tracing::info!(source = %source.label(), "status page template reloaded");
        Ok(source)
    }

    pub fn source(&self) -> TemplateSource {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .source
            .clone()
    }

    pub fn render(&self, context: &Context) -> Result<String, RenderError> {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
        Ok(loaded.tera.render(TEMPLATE_NAME, context)?)
    }

    /// Renders with the loaded template, falling back to the built-in page
    /// carrying the error. Always produces a page.
    pub fn render_or_fallback(&self, context: &Context) -> String {
        let error = match self.render(context) {
            Ok(html) => return html,
            Err(e) => e,
        };
        tracing::warn!(error = %error, "status page render failed, using built-in page");

        let mut context = context.clone();
        context.insert("render_error", &error.to_string());
        self.builtin
            .render(TEMPLATE_NAME, &context)
            .unwrap_or_else(|e| minimal_page(&format!("{error}; {e}")))
    }
}

fn minimal_page(error: &str) -> String {
    let escaped = tera::escape_html(error);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Hue Adapter Status</title></head>\n<body>\n<h1>Hue Adapter Status</h1>\n<p>Error rendering status page: {escaped}</p>\n</body>\n</html>"
    )
}

pub fn default_candidates() -> Vec<PathBuf> {
    DEFAULT_CANDIDATES.iter().map(PathBuf::from).collect()
}

/// Candidate list with `configured` searched first.
pub fn candidates_with(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = configured.map(Path::to_path_buf).into_iter().collect();
    candidates.extend(default_candidates());
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        let mut context = Context::new();
        for key in [
            "wifi_class",
            "ethernet_class",
            "data_class",
            "builtin_class",
            "wifi_ip",
            "ethernet_ip",
            "hue_bridge_ip",
            "downstream_status",
            "active_uplink",
            "supervisor_state",
            "eth_init_status",
            "eth_init_class",
            "eth_link_status",
            "eth_link_class",
            "eth_spi_config",
            "eth_error_message",
            "eth_error_class",
        ] {
            context.insert(key, "x");
        }
        context.insert("log_entries", &Vec::<serde_json::Value>::new());
        context.insert("render_error", &Option::<String>::None);
        context
    }

    #[test]
    fn missing_files_fall_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::load(vec![dir.path().join("nope.html")]).unwrap();
        assert_eq!(store.source(), TemplateSource::Builtin);
        assert!(store.render(&context()).unwrap().contains("Hue Adapter"));
    }

    #[test]
    fn first_existing_candidate_wins_and_reload_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.html");
        fs::write(&path, "<p>{{ wifi_ip }}</p>").unwrap();

        let store = TemplateStore::load(vec![dir.path().join("missing.html"), path.clone()]).unwrap();
        assert_eq!(store.source(), TemplateSource::File(path.clone()));
        assert_eq!(store.render(&context()).unwrap(), "<p>x</p>");

        fs::write(&path, "<b>{{ ethernet_ip }}</b>").unwrap();
        assert_eq!(store.reload().unwrap(), TemplateSource::File(path));
        assert_eq!(store.render(&context()).unwrap(), "<b>x</b>");
    }

    #[test]
    fn broken_reload_keeps_previous_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.html");
        fs::write(&path, "<p>{{ wifi_ip }}</p>").unwrap();
        let store = TemplateStore::load(vec![path.clone()]).unwrap();

        fs::write(&path, "<p>{% if %}</p>").unwrap();
        assert!(matches!(store.reload(), Err(RenderError::Template(_))));
        assert_eq!(store.render(&context()).unwrap(), "<p>x</p>");
    }

    #[test]
    fn render_failure_uses_builtin_page_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.html");
        fs::write(&path, "{{ undefined_value }}").unwrap();
        let store = TemplateStore::load(vec![path]).unwrap();

        let html = store.render_or_fallback(&context());
        assert!(html.contains("Page template failed"));
    }

    #[test]
    fn values_are_escaped() {
        let store = TemplateStore::builtin().unwrap();
        let mut context = context();
        context.insert("eth_error_message", "<script>");
        let html = store.render(&context).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
