//! Prompt Loader
//!
//! Loads prompt templates from an override directory or falls back to the
//! embedded defaults, then renders them with Handlebars.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;
use crate::config::Config;

/// Values available to every template
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub main_branch: String,
    pub branch_prefix: String,
    /// Current decomposition depth (subplanner only)
    pub depth: u32,
    pub max_depth: u32,
    pub scope_threshold: usize,
    pub max_fix_tasks: usize,
}

impl PromptContext {
    pub fn from_config(config: &Config) -> Self {
        debug!("PromptContext::from_config: called");
        Self {
            main_branch: config.git.main_branch.clone(),
            branch_prefix: config.git.branch_prefix.clone(),
            depth: 0,
            max_depth: config.subplanner.max_depth,
            scope_threshold: config.subplanner.scope_threshold,
            max_fix_tasks: config.reconciler.max_fix_tasks,
        }
    }

    pub fn at_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }
}

/// Loads and renders prompt templates
pub struct PromptLoader {
    /// Handlebars template engine
    hbs: Handlebars<'static>,
    /// Directory of `{name}.md` overrides
    override_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader that prefers templates found in `override_dir`
    pub fn new(override_dir: Option<&Path>) -> Self {
        debug!(?override_dir, "PromptLoader::new: called");
        let override_dir = override_dir.filter(|dir| dir.is_dir()).map(Path::to_path_buf);
        if override_dir.is_none() {
            debug!("PromptLoader::new: no override directory, using embedded prompts");
        }

        let mut hbs = Handlebars::new();
        // Prompts are markdown, not HTML
        hbs.register_escape_fn(handlebars::no_escape);

        Self { hbs, override_dir }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        debug!("PromptLoader::embedded_only: called");
        Self::new(None)
    }

    /// Load a template by name
    ///
    /// Checks `{override_dir}/{name}.md` first, then the embedded fallback.
    fn load_template(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load_template: called");
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(format!("{}.md", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read prompt {}: {}", path.display(), e));
            }
        }

        embedded::get_embedded(name)
            .map(str::to_string)
            .ok_or_else(|| eyre!("Prompt template not found: {}", name))
    }

    /// Render a template with the given context
    pub fn render(&self, template_name: &str, context: &PromptContext) -> Result<String> {
        debug!(%template_name, depth = context.depth, "PromptLoader::render: called");
        let template = self.load_template(template_name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// Render every known prompt once, so broken overrides fail at startup
    pub fn check_all(&self, context: &PromptContext) -> Result<()> {
        debug!("PromptLoader::check_all: called");
        for name in embedded::NAMES {
            self.render(name, context)?;
        }
        Ok(())
    }
}
