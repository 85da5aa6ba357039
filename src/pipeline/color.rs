use image::Rgba;
use thiserror::Error;

pub const OPAQUE_WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

const NAMED_COLORS: &[(&str, [u8; 4])] = &[
    ("white", [255, 255, 255, 255]),
    ("black", [0, 0, 0, 255]),
    ("red", [255, 0, 0, 255]),
    ("green", [0, 255, 0, 255]),
    ("blue", [0, 0, 255, 255]),
    ("yellow", [255, 255, 0, 255]),
    ("purple", [128, 0, 128, 255]),
    ("brown", [150, 75, 0, 255]),
    ("orange", [255, 165, 0, 255]),
    ("pink", [255, 192, 203, 255]),
    ("cyan", [0, 255, 255, 255]),
    ("magenta", [255, 0, 255, 255]),
    ("lime", [191, 255, 0, 255]),
    ("teal", [0, 128, 128, 255]),
    ("navy", [0, 0, 128, 255]),
    ("gray", [128, 128, 128, 255]),
    ("lightgray", [211, 211, 211, 255]),
    ("darkgray", [64, 64, 64, 255]),
    ("gold", [255, 215, 0, 255]),
    ("silver", [192, 192, 192, 255]),
    ("beige", [245, 245, 220, 255]),
    ("maroon", [128, 0, 0, 255]),
    ("olive", [128, 128, 0, 255]),
    ("turquoise", [64, 224, 208, 255]),
    ("indigo", [75, 0, 130, 255]),
    ("violet", [238, 130, 238, 255]),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColorError {
    #[error("invalid hex color '{input}': expected '#' followed by 6 hex digits")]
    InvalidColor { input: String },
}

/// Resolves a color name or `#rrggbb` string to an opaque RGBA value.
///
/// Names are looked up case-insensitively in a fixed table; names missing
/// from the table resolve to opaque white. Only malformed hex is an error.
pub fn resolve_color(input: &str) -> Result<Rgba<u8>, ColorError> {
    let trimmed = input.trim();
    if let Some(hex) = trimmed.strip_prefix('#') {
        return parse_hex_rgb(hex).ok_or_else(|| ColorError::InvalidColor {
            input: input.to_string(),
        });
    }
    Ok(lookup_named_color(trimmed).unwrap_or(OPAQUE_WHITE))
}

pub fn lookup_named_color(name: &str) -> Option<Rgba<u8>> {
    let normalized = name.trim().to_ascii_lowercase();
    NAMED_COLORS
        .iter()
        .find(|(key, _)| *key == normalized)
        .map(|(_, rgba)| Rgba(*rgba))
}

pub fn named_colors() -> impl Iterator<Item = &'static str> {
    NAMED_COLORS.iter().map(|(name, _)| *name)
}

fn parse_hex_rgb(hex: &str) -> Option<Rgba<u8>> {
    if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |start: usize| u8::from_str_radix(&hex[start..start + 2], 16).ok();
    Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_named_color_deterministically() {
        for name in named_colors() {
            let first = resolve_color(name).expect("named color should resolve");
            let second = resolve_color(name.to_ascii_uppercase().as_str())
                .expect("uppercase named color should resolve");
            assert_eq!(first, second, "{name} should be case-insensitive");
            assert_eq!(first.0[3], 255);
        }
        assert_eq!(named_colors().count(), 26);
    }

    #[test]
    fn resolves_known_table_values() {
        assert_eq!(resolve_color("blue"), Ok(Rgba([0, 0, 255, 255])));
        assert_eq!(resolve_color("Gold"), Ok(Rgba([255, 215, 0, 255])));
        assert_eq!(resolve_color("lightgray"), Ok(Rgba([211, 211, 211, 255])));
    }

    #[test]
    fn unknown_names_default_to_opaque_white() {
        assert_eq!(resolve_color("chartreuse-ish"), Ok(OPAQUE_WHITE));
        assert_eq!(resolve_color(""), Ok(OPAQUE_WHITE));
    }

    #[test]
    fn parses_hex_in_either_case() {
        assert_eq!(resolve_color("#1a2B3c"), Ok(Rgba([0x1a, 0x2b, 0x3c, 255])));
        assert_eq!(resolve_color("#FFFFFF"), Ok(OPAQUE_WHITE));
    }

    #[test]
    fn rejects_malformed_hex() {
        for bad in ["#12345", "#1234567", "#gg0000", "#", "#12 456"] {
            assert_eq!(
                resolve_color(bad),
                Err(ColorError::InvalidColor {
                    input: bad.to_string()
                }),
                "{bad} should be rejected"
            );
        }
    }
}
