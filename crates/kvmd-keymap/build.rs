// Turns keymap.csv into a static table. Columns: web name, evdev code,
// USB usage (hex, ^-prefixed for modifier bitmask entries), MCU code,
// plain/shifted codepoints (hex, empty when the key does not print).

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=keymap.csv");

    let csv = fs::read_to_string("keymap.csv").expect("keymap.csv is missing");
    let mut rows = Vec::new();
    for (lineno, line) in csv.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 6, "keymap.csv:{}: expected 6 fields", lineno + 1);

        let web = fields[0];
        let evdev: u16 = fields[1]
            .parse()
            .unwrap_or_else(|_| panic!("keymap.csv:{}: bad evdev code", lineno + 1));
        let (usb_hex, modifier) = match fields[2].strip_prefix('^') {
            Some(rest) => (rest, true),
            None => (fields[2], false),
        };
        let usb = u8::from_str_radix(usb_hex, 16)
            .unwrap_or_else(|_| panic!("keymap.csv:{}: bad usb code", lineno + 1));
        let mcu: u8 = fields[3]
            .parse()
            .unwrap_or_else(|_| panic!("keymap.csv:{}: bad mcu code", lineno + 1));
        let plain = parse_cp(fields[4], lineno);
        let shifted = parse_cp(fields[5], lineno);

        if modifier {
            assert!(usb.count_ones() == 1, "keymap.csv:{}: modifier mask must be one bit", lineno + 1);
        }
        rows.push((web.to_owned(), evdev, usb, modifier, mcu, plain, shifted));
    }

    let mut out = String::new();
    writeln!(out, "pub static KEYS: [Key; {}] = [", rows.len()).unwrap();
    for (web, evdev, usb, modifier, mcu, plain, shifted) in &rows {
        writeln!(
            out,
            "    Key {{ web: {web:?}, evdev: {evdev}, usb: 0x{usb:02X}, modifier: {modifier}, \
             mcu: {mcu}, plain: {}, shifted: {} }},",
            fmt_char(*plain),
            fmt_char(*shifted),
        )
        .unwrap();
    }
    writeln!(out, "];").unwrap();

    let mut by_web: Vec<usize> = (0..rows.len()).collect();
    by_web.sort_by(|&a, &b| rows[a].0.cmp(&rows[b].0));
    writeln!(out, "static BY_WEB: [u16; {}] = {:?};", by_web.len(), to_u16(&by_web)).unwrap();

    let mut by_evdev: Vec<usize> = (0..rows.len()).collect();
    by_evdev.sort_by_key(|&i| rows[i].1);
    writeln!(out, "static BY_EVDEV: [u16; {}] = {:?};", by_evdev.len(), to_u16(&by_evdev)).unwrap();

    let dest = Path::new(&env::var("OUT_DIR").unwrap()).join("keymap_table.rs");
    fs::write(dest, out).unwrap();
}

fn parse_cp(field: &str, lineno: usize) -> Option<char> {
    if field.is_empty() {
        return None;
    }
    let cp = u32::from_str_radix(field, 16)
        .unwrap_or_else(|_| panic!("keymap.csv:{}: bad codepoint", lineno + 1));
    Some(char::from_u32(cp).unwrap_or_else(|| panic!("keymap.csv:{}: invalid char", lineno + 1)))
}

fn fmt_char(ch: Option<char>) -> String {
    match ch {
        Some(ch) => format!("Some({ch:?})"),
        None => "None".to_owned(),
    }
}

fn to_u16(indexes: &[usize]) -> Vec<u16> {
    indexes.iter().map(|&i| i as u16).collect()
}
