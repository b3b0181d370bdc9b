//! Custom theme for cliclack prompts

use cliclack::ThemeState;
use console::Style;

/// envforge's theme: blue while active, green on submit
#[derive(Debug, Clone, Default)]
pub struct ForgeTheme;

impl cliclack::Theme for ForgeTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => Style::new().blue(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Style::new().blue().dim(),
        }
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => Style::new().blue(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Style::new().green(),
        }
    }
}

/// Install the theme globally
pub fn init_theme() {
    cliclack::set_theme(ForgeTheme);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliclack::Theme;

    #[test]
    fn theme_colors() {
        let theme = ForgeTheme;
        let _ = theme.bar_color(&ThemeState::Active);
        let _ = theme.state_symbol_color(&ThemeState::Submit);
    }
}
