use crate::{basic, raise, Result};

/// Port names are free-form but printable, with runs of whitespace
/// collapsed and a 255-char cap. Empty is allowed (resets to default).
pub fn valid_switch_port_name(arg: &str) -> Result<String> {
    let mut out = String::new();
    let mut last_space = false;
    for ch in arg.trim().chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else if !ch.is_control() {
            out.push(ch);
            last_space = false;
        }
        if out.len() >= 255 {
            break;
        }
    }
    Ok(out.trim().to_owned())
}

/// UUID (any case, normalized to lower) or the literal "default" when
/// allowed.
pub fn valid_switch_edid_id(arg: &str, allow_default: bool) -> Result<String> {
    let arg = arg.trim().to_ascii_lowercase();
    if allow_default && arg == "default" {
        return Ok(arg);
    }
    match uuid::Uuid::try_parse(&arg) {
        // Only the canonical hyphenated form round-trips.
        Ok(parsed) if parsed.hyphenated().to_string() == arg => Ok(arg),
        _ => raise(&arg, "switch EDID ID"),
    }
}

/// 256 or 512 hex chars (128/256-byte EDID), whitespace ignored,
/// normalized to upper case.
pub fn valid_switch_edid_data(arg: &str) -> Result<String> {
    let compact: String = arg.chars().filter(|ch| !ch.is_whitespace()).collect();
    if (compact.len() == 256 || compact.len() == 512)
        && compact.chars().all(|ch| ch.is_ascii_hexdigit())
    {
        Ok(compact.to_ascii_uppercase())
    } else {
        raise(arg, "switch EDID data")
    }
}

/// `RRGGBB:BB:MMMM` hex, or "default".
pub fn valid_switch_color(arg: &str) -> Result<Option<(u8, u8, u8, u8, u16)>> {
    let arg = arg.trim();
    if arg.eq_ignore_ascii_case("default") {
        return Ok(None);
    }
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() == 3 && parts[0].len() == 6 && parts[1].len() == 2 && parts[2].len() == 4 {
        let hex = |chunk: &str| u16::from_str_radix(chunk, 16);
        if let (Ok(red), Ok(green), Ok(blue), Ok(brightness), Ok(blink_ms)) = (
            hex(&parts[0][0..2]),
            hex(&parts[0][2..4]),
            hex(&parts[0][4..6]),
            hex(parts[1]),
            hex(parts[2]),
        ) {
            return Ok(Some((red as u8, green as u8, blue as u8, brightness as u8, blink_ms)));
        }
    }
    raise(arg, "switch color")
}

/// Click delay seconds in [0, 10].
pub fn valid_switch_atx_click_delay(arg: &str) -> Result<f64> {
    basic::valid_float(arg, Some(0.0), Some(10.0), "ATX delay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_names_collapse_whitespace() {
        assert_eq!(valid_switch_port_name("  my\t\tserver  1 ").unwrap(), "my server 1");
        assert_eq!(valid_switch_port_name("").unwrap(), "");
    }

    #[test]
    fn edid_ids() {
        assert_eq!(
            valid_switch_edid_id("3F2504E0-4F89-41D3-9A0C-0305E82C3301", true).unwrap(),
            "3f2504e0-4f89-41d3-9a0c-0305e82c3301"
        );
        assert!(valid_switch_edid_id("default", true).is_ok());
        assert!(valid_switch_edid_id("default", false).is_err());
        assert!(valid_switch_edid_id("1234", true).is_err());
    }

    #[test]
    fn edid_data() {
        let edid_128 = "00".repeat(128);
        assert_eq!(valid_switch_edid_data(&edid_128).unwrap().len(), 256);
        let spaced = format!("{} {}", &edid_128[..10], &edid_128[10..]);
        assert!(valid_switch_edid_data(&spaced).is_ok());
        assert!(valid_switch_edid_data("f00d").is_err());
    }

    #[test]
    fn colors() {
        assert_eq!(
            valid_switch_color("FFAA00:80:00FA").unwrap(),
            Some((0xFF, 0xAA, 0x00, 0x80, 0x00FA))
        );
        assert_eq!(valid_switch_color("default").unwrap(), None);
        assert!(valid_switch_color("FFAA00:80").is_err());
    }

    #[test]
    fn delays() {
        assert!(valid_switch_atx_click_delay("0.5").is_ok());
        assert!(valid_switch_atx_click_delay("10.5").is_err());
    }
}
