use std::path::{Path, PathBuf};

use regex::Regex;

/// File naming scheme shared by the stamper (writes `<prefix><serial>.pdf`)
/// and the merger (reads the serial back out of the name).
#[derive(Debug, Clone)]
pub struct SerialFileNames {
    prefix: String,
    pattern: Regex,
}

impl SerialFileNames {
    pub fn new(prefix: impl Into<String>) -> Result<Self, regex::Error> {
        let prefix = prefix.into();
        let pattern = Regex::new(&format!(r"{}(\d+)\.pdf", regex::escape(&prefix)))?;
        Ok(Self { prefix, pattern })
    }

    /// Remote and local file name for a serial number.
    pub fn file_name(&self, serial_number: &str) -> String {
        let safe: String = serial_number
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}.pdf", self.prefix, safe)
    }

    pub fn path_in(&self, dir: &Path, serial_number: &str) -> PathBuf {
        dir.join(self.file_name(serial_number))
    }

    /// Serial parsed from a file name; names that do not match order as 0.
    pub fn serial_of(&self, path: &Path) -> u64 {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.pattern.captures(name))
            .and_then(|captures| captures.get(1))
            .and_then(|digits| digits.as_str().parse().ok())
            .unwrap_or(0)
    }
}
