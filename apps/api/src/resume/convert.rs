//! Markdown-to-document conversion through pandoc.
//!
//! PDF output tries a Unicode-capable engine first; hosts without the
//! configured font or without xelatex fall back to pdflatex with the
//! built-in helvet family.

use std::env;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::AppError;

const MARGIN: &str = "geometry:margin=0.75in";
const FONT_SIZE: &str = "fontsize=11pt";
const MAIN_FONT: &str = "mainfont=DejaVu Sans";
const HELVET_FALLBACK: &str =
    "header-includes=\\usepackage{helvet}\\renewcommand{\\familydefault}{\\sfdefault}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Docx,
}

impl Format {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "pdf" => Ok(Format::Pdf),
            "docx" => Ok(Format::Docx),
            other => Err(AppError::Validation(format!("unknown format '{other}'"))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Docx => "docx",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Pdf => "application/pdf",
            Format::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("document processor is not installed")]
    NotInstalled,

    #[error("{message}")]
    Failed { message: String, stderr: String },

    #[error("io error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConvertError> for AppError {
    fn from(e: ConvertError) -> Self {
        match e {
            ConvertError::NotInstalled => {
                AppError::Unavailable("document processor is not installed".into())
            }
            ConvertError::Failed { message, stderr } => {
                warn!("Conversion failed: {stderr}");
                AppError::processing(message, "Contact the site owner.")
            }
            ConvertError::Io(e) => AppError::Internal(e.into()),
        }
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

pub fn pandoc_available() -> bool {
    binary_on_path("pandoc")
}

pub fn preferred_pdf_engine() -> Option<&'static str> {
    if binary_on_path("xelatex") {
        Some("xelatex")
    } else if binary_on_path("pdflatex") {
        Some("pdflatex")
    } else {
        None
    }
}

/// Maps raw pandoc/LaTeX stderr to a message safe to show a caller.
pub fn classify_pandoc_error(stderr: &str) -> String {
    let lower = stderr.to_lowercase();
    if lower.contains(".sty") && (lower.contains("not found") || lower.contains("cannot find")) {
        "A required LaTeX package is missing on the server.".to_string()
    } else if lower.contains("pdflatex not found")
        || lower.contains("xelatex not found")
        || lower.contains("no such file or directory")
    {
        "No PDF engine is installed on the server.".to_string()
    } else if lower.contains("font") {
        "A required font is missing on the server.".to_string()
    } else {
        "Document conversion failed.".to_string()
    }
}

/// True when the stderr indicates the Unicode engine itself (or its font
/// machinery) is the problem, so pdflatex is worth trying.
fn should_fall_back(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("xelatex") || lower.contains("xetex") || lower.contains("fontspec")
        || lower.contains("mainfont")
        || (lower.contains("font") && lower.contains("not found"))
}

async fn run_pandoc(
    input: &Path,
    output: &Path,
    extra_args: &[&str],
) -> Result<(), ConvertError> {
    let mut command = Command::new("pandoc");
    command
        .arg(input)
        .arg("--standalone")
        .args(["-V", MARGIN, "-V", FONT_SIZE]);
    for arg in extra_args {
        command.arg(arg);
    }
    command.arg("-o").arg(output);

    let out = command.output().await?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    Err(ConvertError::Failed {
        message: classify_pandoc_error(&stderr),
        stderr,
    })
}

/// Converts Markdown to the requested format and returns the output bytes.
/// Temp files live in a per-call directory removed on every exit path.
pub async fn markdown_to_document(markdown: &str, format: Format) -> Result<Vec<u8>, ConvertError> {
    if !pandoc_available() {
        return Err(ConvertError::NotInstalled);
    }

    let dir = tempfile::tempdir()?;
    let input = dir.path().join("resume.md");
    let output = dir.path().join(format!("resume.{}", format.extension()));
    tokio::fs::write(&input, markdown).await?;

    match format {
        Format::Docx => run_pandoc(&input, &output, &[]).await?,
        Format::Pdf => {
            let first = run_pandoc(
                &input,
                &output,
                &["--pdf-engine=xelatex", "-V", MAIN_FONT],
            )
            .await;
            match first {
                Ok(()) => {}
                Err(ConvertError::Failed { stderr, message }) if should_fall_back(&stderr) => {
                    debug!("xelatex failed ({message}), retrying with pdflatex");
                    run_pandoc(
                        &input,
                        &output,
                        &["--pdf-engine=pdflatex", "-V", HELVET_FALLBACK],
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    let bytes = tokio::fs::read(&output).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_pandoc_error() {
        assert_eq!(
            classify_pandoc_error("! LaTeX Error: File `enumitem.sty' not found."),
            "A required LaTeX package is missing on the server."
        );
        assert_eq!(
            classify_pandoc_error("pdflatex not found. Please select a different --pdf-engine"),
            "No PDF engine is installed on the server."
        );
        assert_eq!(
            classify_pandoc_error("fontspec error: The font \"DejaVu Sans\" cannot be found."),
            "A required font is missing on the server."
        );
        assert_eq!(
            classify_pandoc_error("something unexpected"),
            "Document conversion failed."
        );
    }

    #[test]
    fn test_fallback_trigger() {
        assert!(should_fall_back("xelatex: command failed"));
        assert!(should_fall_back("Package fontspec Error"));
        assert!(should_fall_back("font \"DejaVu Sans\" not found"));
        assert!(!should_fall_back("! Undefined control sequence"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("pdf").unwrap(), Format::Pdf);
        assert_eq!(Format::parse("docx").unwrap(), Format::Docx);
        assert!(Format::parse("html").is_err());
        assert_eq!(Format::Pdf.extension(), "pdf");
    }
}
