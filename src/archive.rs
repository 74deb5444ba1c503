//! On-disk archive of processed content, one directory per job.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const HTML_FILE: &str = "content.html";
pub const TEXT_FILE: &str = "content.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivePaths {
    pub html_path: Option<PathBuf>,
    pub text_path: PathBuf,
}

/// Write `ARCHIVE_ROOT/{job_id}/content.html` (when HTML is available) and
/// `ARCHIVE_ROOT/{job_id}/content.txt`, overwriting earlier copies.
pub fn archive_content(
    archive_root: &Path,
    job_id: &str,
    html: Option<&str>,
    text: &str,
) -> Result<ArchivePaths> {
    let dir = archive_root.join(job_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create archive dir {}", dir.display()))?;

    let html_path = match html {
        Some(html) => {
            let path = dir.join(HTML_FILE);
            fs::write(&path, html)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    let text_path = dir.join(TEXT_FILE);
    fs::write(&text_path, text)
        .with_context(|| format!("Failed to write {}", text_path.display()))?;

    Ok(ArchivePaths {
        html_path,
        text_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_html_and_text() {
        let tmp = TempDir::new().unwrap();
        let paths = archive_content(tmp.path(), "job-1", Some("<p>hi</p>"), "hi").unwrap();

        assert_eq!(paths.text_path, tmp.path().join("job-1").join(TEXT_FILE));
        assert_eq!(fs::read_to_string(&paths.text_path).unwrap(), "hi");
        let html_path = paths.html_path.unwrap();
        assert_eq!(fs::read_to_string(html_path).unwrap(), "<p>hi</p>");
    }

    #[test]
    fn text_only_skips_html_file() {
        let tmp = TempDir::new().unwrap();
        let paths = archive_content(tmp.path(), "job-2", None, "plain").unwrap();
        assert!(paths.html_path.is_none());
        assert!(!tmp.path().join("job-2").join(HTML_FILE).exists());
    }
}
