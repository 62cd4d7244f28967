use crate::{basic, os, raise, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtxPowerAction {
    On,
    Off,
    OffHard,
    ResetHard,
}

pub fn valid_atx_power_action(arg: &str) -> Result<AtxPowerAction> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" => Ok(AtxPowerAction::On),
        "off" => Ok(AtxPowerAction::Off),
        "off_hard" => Ok(AtxPowerAction::OffHard),
        "reset_hard" => Ok(AtxPowerAction::ResetHard),
        _ => raise(arg, "ATX power action"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtxButton {
    Power,
    PowerLong,
    Reset,
}

pub fn valid_atx_button(arg: &str) -> Result<AtxButton> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "power" => Ok(AtxButton::Power),
        "power_long" => Ok(AtxButton::PowerLong),
        "reset" => Ok(AtxButton::Reset),
        _ => raise(arg, "ATX button"),
    }
}

/// MSD image name: slash-separated printable components, empty components
/// collapsed, each component validated as a filename.
pub fn valid_msd_image_name(arg: &str) -> Result<String> {
    let name = "MSD image name";
    let stripped = basic::valid_stripped_string_not_empty(arg, name)?;
    let parts: Vec<&str> = stripped.split('/').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return raise(arg, name);
    }
    let mut validated = Vec::with_capacity(parts.len());
    for part in parts {
        validated.push(os::valid_printable_filename(part, name)?);
    }
    Ok(validated.join("/"))
}

pub fn valid_info_fields(arg: &str, variants: &[&str]) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    for field in arg.split(',').map(str::trim).filter(|field| !field.is_empty()) {
        fields.push(basic::valid_string_in_list(field, "info field", variants)?);
    }
    fields.sort();
    fields.dedup();
    Ok(fields)
}

pub fn valid_log_seek(arg: &str) -> Result<u64> {
    Ok(basic::valid_int(arg, Some(0), None, "log seek")? as u64)
}

pub fn valid_url(arg: &str) -> Result<url::Url> {
    let arg = arg.trim();
    match url::Url::parse(arg) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(parsed),
        _ => raise(arg, "HTTP(S) URL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names() {
        assert_eq!(valid_msd_image_name("ubuntu.iso").unwrap(), "ubuntu.iso");
        assert_eq!(valid_msd_image_name("//isos//ubuntu.iso").unwrap(), "isos/ubuntu.iso");
        assert_eq!(valid_msd_image_name(" foo/bar.img ").unwrap(), "foo/bar.img");
        for bad in ["", "/", ".hidden", "a/.b", "lost+found/x"] {
            assert!(valid_msd_image_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn power_actions() {
        assert_eq!(valid_atx_power_action("off_hard"), Ok(AtxPowerAction::OffHard));
        assert!(valid_atx_power_action("explode").is_err());
    }

    #[test]
    fn info_fields_filter() {
        let fields = valid_info_fields("system, auth,system", &["system", "auth", "kvm"]).unwrap();
        assert_eq!(fields, vec!["auth".to_owned(), "system".to_owned()]);
        assert!(valid_info_fields("nope", &["system"]).is_err());
    }

    #[test]
    fn urls() {
        assert!(valid_url("https://example.com/x.iso").is_ok());
        assert!(valid_url("ftp://example.com/x.iso").is_err());
        assert!(valid_url("not a url").is_err());
    }
}
