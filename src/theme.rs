use ratatui::style::Color;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThemeMode {
    Light,
    Dark,
}

impl ThemeMode {
    pub fn from_dark_flag(dark: bool) -> Self {
        if dark { ThemeMode::Dark } else { ThemeMode::Light }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ThemeMode::Light => "light",
            ThemeMode::Dark => "dark",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Palette {
    pub primary: Color,
    pub primary_dark: Color,
    pub secondary: Color,
    pub error: Color,
    pub warning: Color,
    pub info: Color,
    pub background: Color,
    pub paper: Color,
    pub text: Color,
    pub text_secondary: Color,
    pub bullish: Color,
    pub bearish: Color,
}

const fn hex(rgb: u32) -> Color {
    Color::Rgb((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
}

const LIGHT: Palette = Palette {
    primary: hex(0x2ECC71),
    primary_dark: hex(0x27AE60),
    secondary: hex(0x3498DB),
    error: hex(0xE74C3C),
    warning: hex(0xF1C40F),
    info: hex(0x9B59B6),
    background: hex(0xFFFFFF),
    paper: hex(0xF5F7FA),
    text: hex(0x1C1C1C),
    text_secondary: hex(0x666666),
    bullish: hex(0x00C853),
    bearish: hex(0xD50000),
};

const DARK: Palette = Palette {
    primary: hex(0x00B894),
    primary_dark: hex(0x009B7F),
    secondary: hex(0x0984E3),
    error: hex(0xE17055),
    warning: hex(0xF1C40F),
    info: hex(0x9B59B6),
    background: hex(0x121212),
    paper: hex(0x1E1E1E),
    text: hex(0xFFFFFF),
    text_secondary: hex(0xAAAAAA),
    bullish: hex(0x00E676),
    bearish: hex(0xFF1744),
};

impl Palette {
    pub fn for_mode(mode: ThemeMode) -> Palette {
        match mode {
            ThemeMode::Light => LIGHT,
            ThemeMode::Dark => DARK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_palette_by_mode() {
        let light = Palette::for_mode(ThemeMode::Light);
        let dark = Palette::for_mode(ThemeMode::Dark);
        assert_eq!(light.primary, Color::Rgb(0x2E, 0xCC, 0x71));
        assert_eq!(dark.background, Color::Rgb(0x12, 0x12, 0x12));
        assert_ne!(light, dark);
    }

    #[test]
    fn dark_flag_maps_to_mode() {
        assert_eq!(ThemeMode::from_dark_flag(true), ThemeMode::Dark);
        assert_eq!(ThemeMode::from_dark_flag(false).label(), "light");
    }
}
