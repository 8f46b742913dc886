//! Archive format detection and the extraction command line for each format.

use std::path::Path;

/// Supported archive families, keyed by file-name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
    Tar,
}

const SUFFIXES: [(&str, ArchiveFormat); 9] = [
    (".zip", ArchiveFormat::Zip),
    (".7z", ArchiveFormat::SevenZ),
    (".tar", ArchiveFormat::Tar),
    (".tar.gz", ArchiveFormat::Tar),
    (".tgz", ArchiveFormat::Tar),
    (".tar.bz2", ArchiveFormat::Tar),
    (".tbz2", ArchiveFormat::Tar),
    (".tar.xz", ArchiveFormat::Tar),
    (".txz", ArchiveFormat::Tar),
];

impl ArchiveFormat {
    /// Detect the format from the file name, case-insensitively.
    pub fn detect(target: &str) -> Option<Self> {
        let lower = target.to_ascii_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| lower.ends_with(suffix))
            .map(|(_, format)| *format)
    }

    /// Is this file name one we know how to extract?
    pub fn is_archive(target: &str) -> bool {
        Self::detect(target).is_some()
    }

    /// Command tokens extracting `source` into `out_dir`, overwriting existing files.
    ///
    /// `tar` detects compression on its own, so every tar flavor shares one line.
    pub fn command(self, source: &Path, out_dir: &Path) -> Vec<String> {
        let source = source.display().to_string();
        let out = out_dir.display().to_string();
        match self {
            ArchiveFormat::Zip => vec![
                "unzip".to_string(),
                "-o".to_string(),
                source,
                "-d".to_string(),
                out,
            ],
            ArchiveFormat::SevenZ => vec![
                "7z".to_string(),
                "x".to_string(),
                "-y".to_string(),
                format!("-o{out}"),
                source,
            ],
            ArchiveFormat::Tar => vec![
                "tar".to_string(),
                "-xf".to_string(),
                source,
                "-C".to_string(),
                out,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_suffix() {
        assert_eq!(ArchiveFormat::detect("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("A.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("b.7z"), Some(ArchiveFormat::SevenZ));
        assert_eq!(
            ArchiveFormat::detect("dir/evidence.tar.gz"),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(ArchiveFormat::detect("x.txz"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect("notes.txt"), None);
        assert_eq!(ArchiveFormat::detect("archive.gz"), None);
    }

    #[test]
    fn builds_extraction_lines() {
        let src = Path::new("/c/a.7z");
        let out = Path::new("/w/extracted");
        assert_eq!(
            ArchiveFormat::SevenZ.command(src, out),
            vec!["7z", "x", "-y", "-o/w/extracted", "/c/a.7z"]
        );
        assert_eq!(
            ArchiveFormat::Tar.command(Path::new("/c/e.tgz"), out),
            vec!["tar", "-xf", "/c/e.tgz", "-C", "/w/extracted"]
        );
        assert_eq!(ArchiveFormat::Zip.command(src, out)[0], "unzip");
    }
}
