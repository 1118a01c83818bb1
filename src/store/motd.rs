//! Message-of-the-day loader.

use std::fs;
use std::io;
use std::path::Path;

/// Load the MOTD text. `Ok(None)` when the file does not exist; blank files
/// count as no MOTD.
pub fn load_motd(path: &Path) -> io::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    let text = text.trim_end().to_string();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}
