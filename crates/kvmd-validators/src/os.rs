use crate::{raise, Result};

/// A single path component suitable for on-disk names: printable, no
/// slashes or NULs, no leading dot (keeps sidecar markers and hidden files
/// out of reach), not a reserved name.
pub fn valid_printable_filename(arg: &str, name: &str) -> Result<String> {
    let arg = arg.trim();
    if arg.is_empty()
        || arg == "."
        || arg == ".."
        || arg == "lost+found"
        || arg.starts_with('.')
        || arg.len() > 255
        || arg.chars().any(|ch| ch == '/' || ch == '\0' || ch.is_control())
    {
        return raise(arg, name);
    }
    Ok(arg.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames() {
        assert!(valid_printable_filename("ubuntu-22.04.iso", "image").is_ok());
        assert!(valid_printable_filename("dir name with spaces", "image").is_ok());
        for bad in ["", ".", "..", ".hidden", "lost+found", "a/b", "nul\0byte", "tab\tname"] {
            assert!(valid_printable_filename(bad, "image").is_err(), "{bad:?}");
        }
    }
}
