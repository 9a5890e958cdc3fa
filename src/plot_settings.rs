//! Shared styling for the interpretation charts

use std::path::PathBuf;

use plotters::style::{
    RGBColor,
    colors::colormaps::{ColorMap, DerivedColorMap},
};

/// Figure sizes are in pixels, font sizes in points
#[derive(Debug, Clone)]
pub struct PlotSettings {
    pub w_small: u32,
    pub h_small: u32,
    pub w_mid: u32,
    pub h_mid: u32,
    pub w_large: u32,
    pub h_large: u32,

    pub lbl_sz: u32,
    pub tk_sz: u32,
    pub title_sz: u32,
    pub leg_sz: u32,

    pub lbl_col: RGBColor,
    pub tk_col: RGBColor,
    pub title_col: RGBColor,
    pub title: String,

    /// Colors for distinct series, cycled
    pub cat_palette: Vec<RGBColor>,
    /// Low, centre and high colors for signed values
    pub div_palette: (RGBColor, RGBColor, RGBColor),
    /// Low and high colors for magnitudes
    pub seq_palette: (RGBColor, RGBColor),

    /// Directory charts are saved to
    pub savepath: PathBuf,
    /// File extension including the dot, `.png` or `.svg`
    pub format: String,
}

impl Default for PlotSettings {
    fn default() -> Self {
        let black = RGBColor(0, 0, 0);
        Self {
            w_small: 480,
            h_small: 300,
            w_mid: 960,
            h_mid: 480,
            w_large: 1440,
            h_large: 960,
            lbl_sz: 24,
            tk_sz: 16,
            title_sz: 26,
            leg_sz: 16,
            lbl_col: black,
            tk_col: black,
            title_col: black,
            title: String::new(),
            cat_palette: vec![
                RGBColor(31, 119, 180),
                RGBColor(255, 127, 14),
                RGBColor(44, 160, 44),
                RGBColor(214, 39, 40),
                RGBColor(148, 103, 189),
                RGBColor(140, 86, 75),
            ],
            div_palette: (
                RGBColor(59, 76, 192),
                RGBColor(221, 221, 221),
                RGBColor(180, 4, 38),
            ),
            seq_palette: (RGBColor(255, 245, 235), RGBColor(127, 39, 4)),
            savepath: PathBuf::from("."),
            format: ".png".to_string(),
        }
    }
}

impl PlotSettings {
    /// `savepath/<savename><format>`
    pub fn save_path(&self, savename: &str) -> PathBuf {
        self.savepath.join(format!("{}{}", savename, self.format))
    }

    pub fn is_svg(&self) -> bool {
        self.format.eq_ignore_ascii_case(".svg")
    }

    pub fn categorical(&self, idx: usize) -> RGBColor {
        if self.cat_palette.is_empty() {
            return self.lbl_col;
        }
        self.cat_palette[idx % self.cat_palette.len()]
    }

    /// Maps `t` in `[-1, 1]` onto the diverging palette, 0 is the centre color
    pub fn diverging(&self, t: f32) -> RGBColor {
        let (low, mid, high) = self.div_palette;
        let t = if t.is_nan() { 0.0 } else { t.clamp(-1.0, 1.0) };
        DerivedColorMap::new(&[low, mid, high]).get_color_normalized(t, -1.0, 1.0)
    }

    /// Maps `t` in `[0, 1]` onto the sequential palette
    pub fn sequential(&self, t: f32) -> RGBColor {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        DerivedColorMap::new(&[self.seq_palette.0, self.seq_palette.1]).get_color(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_path() {
        let settings = PlotSettings {
            savepath: PathBuf::from("plots"),
            format: ".svg".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.save_path("importance"),
            PathBuf::from("plots/importance.svg")
        );
        assert!(settings.is_svg());
        assert!(!PlotSettings::default().is_svg());
    }

    #[test]
    fn test_palette_interpolation() {
        let settings = PlotSettings {
            div_palette: (
                RGBColor(0, 0, 0),
                RGBColor(100, 100, 100),
                RGBColor(200, 0, 100),
            ),
            seq_palette: (RGBColor(0, 100, 200), RGBColor(100, 200, 0)),
            ..Default::default()
        };
        assert_eq!(settings.sequential(0.5), RGBColor(50, 150, 100));
        assert_eq!(settings.diverging(-0.5), RGBColor(50, 50, 50));
        assert_eq!(settings.diverging(0.5), RGBColor(150, 50, 100));
    }

    #[test]
    fn test_palettes() {
        let settings = PlotSettings::default();
        assert_eq!(settings.diverging(0.0), settings.div_palette.1);
        assert_eq!(settings.diverging(-1.0), settings.div_palette.0);
        // out of range values saturate
        assert_eq!(settings.diverging(3.0), settings.div_palette.2);
        assert_eq!(settings.sequential(f32::NAN), settings.seq_palette.0);
        assert_eq!(settings.sequential(1.0), settings.seq_palette.1);
        assert_eq!(settings.categorical(6), settings.categorical(0));
    }
}
