/*!
 # Resolved background colors

 Colors arrive from the document as CSS strings (`rgb(0, 128, 0)`,
 `rgba(0, 0, 0, 0)`, `transparent`). [`ColorValue`] keeps them in a
 canonical spelling so two renderings of the same color compare equal.
*/

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

/// A normalized CSS color as reported by style resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColorValue(String);

impl ColorValue {
    /// Normalizes a CSS color string.
    ///
    /// `rgb()`/`rgba()` forms are rewritten as `rgb(r, g, b)` or
    /// `rgba(r, g, b, a)`; an alpha of 1 collapses to `rgb()`. Anything else
    /// is kept trimmed and lowercased.
    pub fn parse(css: &str) -> Self {
        let raw = css.trim().to_ascii_lowercase();
        if (raw.starts_with("rgb(") || raw.starts_with("rgba(")) && raw.ends_with(')') {
            let numbers: Vec<f64> = NUMBER
                .find_iter(&raw)
                .filter_map(|m| m.as_str().parse().ok())
                .collect();
            let channel = |v: f64| v.round().clamp(0.0, 255.0) as u8;
            match *numbers.as_slice() {
                [r, g, b] => {
                    return Self(format!("rgb({}, {}, {})", channel(r), channel(g), channel(b)))
                }
                [r, g, b, a] if a >= 1.0 => {
                    return Self(format!("rgb({}, {}, {})", channel(r), channel(g), channel(b)))
                }
                [r, g, b, a] => {
                    return Self(format!(
                        "rgba({}, {}, {}, {})",
                        channel(r),
                        channel(g),
                        channel(b),
                        a.max(0.0)
                    ))
                }
                _ => {}
            }
        }
        Self(raw)
    }

    /// Opaque black, the fallback when no ancestor carries a background
    pub fn black() -> Self {
        Self("rgb(0, 0, 0)".to_string())
    }

    /// Fully transparent, the initial background of every element
    pub fn transparent() -> Self {
        Self("rgba(0, 0, 0, 0)".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the color is absent or has zero alpha
    pub fn is_transparent(&self) -> bool {
        match self.0.as_str() {
            "" | "transparent" => true,
            s if s.starts_with("rgba(") => {
                let numbers: Vec<&str> = NUMBER.find_iter(s).map(|m| m.as_str()).collect();
                numbers.len() >= 4 && numbers[3].parse::<f64>().map(|a| a == 0.0).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// First three numeric components as red, green and blue.
    ///
    /// Returns `None` when fewer than three numbers are embedded or one of
    /// them does not fit a color channel.
    pub fn rgb(&self) -> Option<[u8; 3]> {
        rgb_components(&self.0)
    }
}

/// Extracts the first three numeric tokens of any color text as channels
pub(crate) fn rgb_components(text: &str) -> Option<[u8; 3]> {
    let mut numbers = NUMBER.find_iter(text).map(|m| m.as_str().parse::<f64>());
    let mut channel = || -> Option<u8> {
        let value = numbers.next()?.ok()?;
        (0.0..=255.0).contains(&value).then(|| value.round() as u8)
    };
    Some([channel()?, channel()?, channel()?])
}

impl fmt::Display for ColorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColorValue {
    fn from(css: &str) -> Self {
        Self::parse(css)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spacing_variants_compare_equal() {
        assert_eq!(ColorValue::parse("rgb(0,128,0)"), ColorValue::parse(" RGB(0, 128, 0) "));
        assert_eq!(ColorValue::parse("rgba(0, 128, 0, 1)").as_str(), "rgb(0, 128, 0)");
        assert_eq!(ColorValue::parse("rgba(10,20,30,0.5)").as_str(), "rgba(10, 20, 30, 0.5)");
    }

    #[test]
    fn test_transparency() {
        assert!(ColorValue::parse("transparent").is_transparent());
        assert!(ColorValue::parse("").is_transparent());
        assert!(ColorValue::parse("rgba(0, 0, 0, 0)").is_transparent());
        assert!(ColorValue::transparent().is_transparent());
        assert!(!ColorValue::parse("rgba(0, 0, 0, 0.2)").is_transparent());
        assert!(!ColorValue::black().is_transparent());
    }

    #[test]
    fn test_rgb_components() {
        assert_eq!(ColorValue::parse("rgb(255, 0, 12)").rgb(), Some([255, 0, 12]));
        assert_eq!(ColorValue::parse("rgba(1, 2, 3, 0.4)").rgb(), Some([1, 2, 3]));
        assert_eq!(ColorValue::parse("red").rgb(), None);
        assert_eq!(rgb_components("rgb(1, 2)"), None);
        assert_eq!(rgb_components("rgb(300, 2, 3)"), None);
    }
}
