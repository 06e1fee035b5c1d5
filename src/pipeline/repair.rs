//! Post-hoc URL repair.
//!
//! The persona asks the model to cite a project's live URL whenever it
//! mentions the project, and models regularly forget. Once the answer is
//! complete, every project from the retrieval URL table that is mentioned but
//! whose URL is absent gets listed under a trailing heading.

use crate::retrieval::{ProjectUrlTable, strip_document_extension};

/// Heading of the appended link list.
pub const PROJECT_LINKS_HEADING: &str = "**Project Links:**";

/// Outcome of [`repair`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    /// The answer with missing links appended.
    pub text: String,
    /// What was appended; empty when nothing was missing.
    pub suffix: String,
}

impl Repair {
    pub fn is_noop(&self) -> bool {
        self.suffix.is_empty()
    }
}

/// Lowercased spellings under which a project counts as mentioned.
fn name_variants(project: &str) -> Vec<String> {
    let lower = project.to_lowercase();
    let mut variants = vec![
        lower.replace('_', ""),
        lower.replace('-', ""),
        strip_document_extension(&lower).to_string(),
        lower,
    ];
    variants.retain(|v| !v.trim().is_empty());
    variants.dedup();
    variants
}

/// Whether `project` is mentioned in `text_lower` (already lowercased).
fn is_mentioned(project: &str, text_lower: &str) -> bool {
    name_variants(project)
        .iter()
        .any(|v| text_lower.contains(v.as_str()))
}

/// Append links for mentioned projects whose URL is missing, in table order.
pub fn repair(final_text: &str, urls: &ProjectUrlTable) -> Repair {
    let text_lower = final_text.to_lowercase();

    let missing: Vec<String> = urls
        .iter()
        .filter(|&(project, url)| is_mentioned(project, &text_lower) && !final_text.contains(url))
        .map(|(project, url)| format!("- {project}: {url}"))
        .collect();

    if missing.is_empty() {
        return Repair {
            text: final_text.to_string(),
            suffix: String::new(),
        };
    }

    let suffix = format!("\n\n{PROJECT_LINKS_HEADING}\n{}", missing.join("\n"));
    Repair {
        text: format!("{final_text}{suffix}"),
        suffix,
    }
}
