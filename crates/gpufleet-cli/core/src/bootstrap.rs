//! First-boot content handed to every node as `user-data`.
//!
//! A template holds placeholder lines such as `{{SETUP_SH}}`. Each one is
//! replaced by the lines of a file, every line prefixed with whatever
//! preceded the placeholder, so content nested in YAML keeps its indentation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const SETUP_PLACEHOLDER: &str = "{{SETUP_SH}}";
pub const SHELL_RC_PLACEHOLDER: &str = "{{ZSHRC}}";

/// Files that make up the bootstrap content. Without a template no
/// `user-data` is sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub template: Option<PathBuf>,
    pub setup_script: Option<PathBuf>,
    pub shell_rc: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Read the configured files and render them. `Ok(None)` when no
    /// template is configured.
    pub fn render(&self) -> Result<Option<String>> {
        let Some(template_path) = &self.template else {
            return Ok(None);
        };
        let template = read(template_path, "bootstrap template")?;
        let setup = match &self.setup_script {
            Some(path) => read(path, "setup script")?,
            None => String::new(),
        };
        let shell_rc = match &self.shell_rc {
            Some(path) => read(path, "shell rc")?,
            None => String::new(),
        };
        Ok(Some(render(
            &template,
            &[(SETUP_PLACEHOLDER, setup.as_str()), (SHELL_RC_PLACEHOLDER, shell_rc.as_str())],
        )))
    }
}

fn read(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| FleetError::Config(format!("failed to read {what} {}: {e}", path.display())))
}

/// Replace every line containing a placeholder with the indented content.
pub fn render(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut lines: Vec<String> = template.split('\n').map(str::to_string).collect();
    for (placeholder, content) in replacements {
        if placeholder.is_empty() {
            continue;
        }
        lines = replace_placeholder(lines, placeholder, content);
    }
    lines.join("\n")
}

fn replace_placeholder(lines: Vec<String>, placeholder: &str, content: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        match line.find(placeholder) {
            Some(at) => {
                let indent = &line[..at];
                out.extend(content.split('\n').map(|c| format!("{indent}{c}")));
            }
            None => out.push(line),
        }
    }
    out
}
