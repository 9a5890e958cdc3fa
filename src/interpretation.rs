//! Charts of model interpretation results: feature importance, embedding weights and
//! partial dependence.
//!
//! Every plot renders to `settings.save_path(savename)` when a save name is given, as SVG
//! when the configured format is `.svg` and as a bitmap otherwise. Without a save name the
//! chart is drawn into an in-memory bitmap and discarded.

use std::error::Error;

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    coord::{
        Shift,
        ranged1d::{IntoSegmentedCoord, SegmentValue},
    },
    drawing::{DrawingArea, IntoDrawingArea},
    element::{PathElement, Rectangle, Text},
    prelude::{BitMapBackend, DrawingBackend, LineSeries, SVGBackend},
    style::{
        Color, IntoFont, RGBColor, TextStyle, WHITE,
        text_anchor::{HPos, Pos, VPos},
    },
};
use rand::Rng;

use crate::{
    nn::Module,
    partial_dependence::{
        FeatureFrame, FeatureImportance, Interact, Isolate, cluster_curves, pdp_interact,
        pdp_isolate,
    },
    plot_settings::PlotSettings,
};

/// Options for [`plot_1d_partial_dependence`]
#[derive(Debug, Clone)]
pub struct PdpOptions {
    /// Number of rows to draw from the frame before computing, all rows when `None`
    pub sample_size: Option<usize>,
    /// Sampling weights, one per frame row
    pub weights: Option<Vec<f32>>,
    /// ICE curves are replaced by this many k-means centres, raw curves when `None` or 0
    pub n_clusters: Option<usize>,
    pub n_points: usize,
    /// Index of the model output to explain
    pub output: usize,
}

impl Default for PdpOptions {
    fn default() -> Self {
        Self {
            sample_size: None,
            weights: None,
            n_clusters: Some(10),
            n_points: 20,
            output: 0,
        }
    }
}

/// Options for [`plot_2d_partial_dependence`]
#[derive(Debug, Clone)]
pub struct InteractOptions {
    pub sample_size: Option<usize>,
    pub weights: Option<Vec<f32>>,
    pub n_points: (usize, usize),
    pub output: usize,
}

impl Default for InteractOptions {
    fn default() -> Self {
        Self {
            sample_size: None,
            weights: None,
            n_points: (20, 20),
            output: 0,
        }
    }
}

/// A chart which can be drawn onto any plotters backend
trait Chart {
    fn kind(&self) -> &'static str;

    fn size(&self, settings: &PlotSettings) -> (u32, u32);

    fn draw<DB: DrawingBackend>(
        &self,
        root: &DrawingArea<DB, Shift>,
        settings: &PlotSettings,
    ) -> Result<(), Box<dyn Error>>
    where
        DB::ErrorType: 'static;
}

fn render<C: Chart>(
    chart: &C,
    savename: Option<&str>,
    settings: &PlotSettings,
) -> Result<(), Box<dyn Error>> {
    let size = chart.size(settings);
    match savename {
        Some(name) => {
            let path = settings.save_path(name);
            if settings.is_svg() {
                let root = SVGBackend::new(&path, size).into_drawing_area();
                chart.draw(&root, settings)?;
                root.present()?;
            } else {
                let root = BitMapBackend::new(&path, size).into_drawing_area();
                chart.draw(&root, settings)?;
                root.present()?;
            }
            log::info!("{} plot has been saved to '{}'.", chart.kind(), path.display());
        }
        None => {
            let mut buffer = vec![0u8; size.0 as usize * size.1 as usize * 3];
            let root = BitMapBackend::with_buffer(&mut buffer, size).into_drawing_area();
            chart.draw(&root, settings)?;
            root.present()?;
            log::debug!("{} plot rendered without saving", chart.kind());
        }
    }
    Ok(())
}

fn font<'a>(size: u32, color: &RGBColor) -> TextStyle<'a> {
    ("sans-serif", size as f64).into_font().color(color)
}

fn caption<DB: DrawingBackend>(builder: &mut ChartBuilder<'_, '_, DB>, settings: &PlotSettings) {
    if !settings.title.is_empty() {
        builder.caption(
            &settings.title,
            font(settings.title_sz, &settings.title_col),
        );
    }
}

/// Bounds of the finite values, padded by 5% and never empty
fn value_range(values: impl IntoIterator<Item = f32>) -> (f32, f32) {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < f32::EPSILON {
        return (lo - 0.5, hi + 0.5);
    }
    let pad = 0.05 * (hi - lo);
    (lo - pad, hi + pad)
}

/// Boundaries of the cells centred on each grid value
fn cell_edges(grid: &[f32]) -> Vec<f32> {
    match grid {
        [] => vec![],
        [g] => vec![g - 0.5, g + 0.5],
        _ => {
            let mut edges = Vec::with_capacity(grid.len() + 1);
            edges.push(grid[0] - (grid[1] - grid[0]) / 2.0);
            edges.extend(grid.windows(2).map(|w| (w[0] + w[1]) / 2.0));
            let n = grid.len();
            edges.push(grid[n - 1] + (grid[n - 1] - grid[n - 2]) / 2.0);
            edges
        }
    }
}

struct ImportanceChart<'a> {
    rows: &'a [FeatureImportance],
}

impl Chart for ImportanceChart<'_> {
    fn kind(&self) -> &'static str {
        "Importance"
    }

    fn size(&self, settings: &PlotSettings) -> (u32, u32) {
        // grows with the number of features
        let h = (self.rows.len() as u32 * settings.lbl_sz * 3 / 2).max(settings.h_small);
        (settings.w_large, h)
    }

    fn draw<DB: DrawingBackend>(
        &self,
        root: &DrawingArea<DB, Shift>,
        settings: &PlotSettings,
    ) -> Result<(), Box<dyn Error>>
    where
        DB::ErrorType: 'static,
    {
        root.fill(&WHITE)?;
        let n = self.rows.len() as i32;
        let (x_min, x_max) = value_range(self.rows.iter().flat_map(|r| {
            let unc = r.uncertainty.unwrap_or(0.0);
            [0.0, r.importance - unc, r.importance + unc]
        }));

        let mut builder = ChartBuilder::on(root);
        caption(&mut builder, settings);
        let mut chart = builder
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(160)
            .build_cartesian_2d(x_min..x_max, (0..n.max(1)).into_segmented())?;

        // most important feature on top
        let name_of = |v: &SegmentValue<i32>| match v {
            SegmentValue::CenterOf(i) if *i >= 0 && *i < n => {
                self.rows[(n - 1 - i) as usize].feature.clone()
            }
            _ => String::new(),
        };
        chart
            .configure_mesh()
            .disable_y_mesh()
            .y_labels(self.rows.len().max(1))
            .y_label_formatter(&name_of)
            .x_desc("Importance via feature permutation")
            .y_desc("Feature")
            .axis_desc_style(font(settings.lbl_sz, &settings.lbl_col))
            .label_style(font(settings.tk_sz, &settings.tk_col))
            .draw()?;

        let bar_color = settings.categorical(0);
        chart.draw_series(self.rows.iter().enumerate().map(|(i, row)| {
            let y = n - 1 - i as i32;
            Rectangle::new(
                [
                    (0.0, SegmentValue::Exact(y)),
                    (row.importance, SegmentValue::Exact(y + 1)),
                ],
                bar_color.filled(),
            )
        }))?;
        chart.draw_series(self.rows.iter().enumerate().filter_map(|(i, row)| {
            let unc = row.uncertainty?;
            let y = n - 1 - i as i32;
            Some(PathElement::new(
                vec![
                    (row.importance - unc, SegmentValue::CenterOf(y)),
                    (row.importance + unc, SegmentValue::CenterOf(y)),
                ],
                settings.lbl_col.stroke_width(3),
            ))
        }))?;
        Ok(())
    }
}

/// Horizontal bar chart of feature importances, with error bars where uncertainties are known
pub fn plot_importance(
    rows: &[FeatureImportance],
    savename: Option<&str>,
    settings: &PlotSettings,
) -> Result<(), Box<dyn Error>> {
    render(&ImportanceChart { rows }, savename, settings)
}

struct EmbeddingChart<'a> {
    weights: &'a [Vec<f32>],
    feat: &'a str,
}

impl Chart for EmbeddingChart<'_> {
    fn kind(&self) -> &'static str {
        "Embedding"
    }

    fn size(&self, settings: &PlotSettings) -> (u32, u32) {
        (settings.w_small, settings.h_small)
    }

    fn draw<DB: DrawingBackend>(
        &self,
        root: &DrawingArea<DB, Shift>,
        settings: &PlotSettings,
    ) -> Result<(), Box<dyn Error>>
    where
        DB::ErrorType: 'static,
    {
        root.fill(&WHITE)?;
        let n_rows = self.weights.len();
        let n_cols = self.weights.iter().map(|r| r.len()).max().unwrap_or(0);
        let max_abs = self
            .weights
            .iter()
            .flatten()
            .filter(|w| w.is_finite())
            .fold(0.0f32, |m, w| m.max(w.abs()));

        let mut builder = ChartBuilder::on(root);
        caption(&mut builder, settings);
        let mut chart = builder
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(0f32..n_cols.max(1) as f32, 0f32..n_rows.max(1) as f32)?;
        chart
            .configure_mesh()
            .disable_mesh()
            .x_labels(n_cols.max(1))
            .y_labels(n_rows.max(1))
            .x_desc("Embedding")
            .y_desc(self.feat)
            .axis_desc_style(font(settings.lbl_sz, &settings.lbl_col))
            .label_style(font(settings.tk_sz, &settings.tk_col))
            .draw()?;

        let cells = self.weights.iter().enumerate().flat_map(|(i, row)| {
            row.iter().enumerate().map(move |(j, &w)| (i, j, w))
        });
        chart.draw_series(cells.clone().map(|(i, j, w)| {
            let t = if max_abs > 0.0 { w / max_abs } else { 0.0 };
            Rectangle::new(
                [(j as f32, i as f32), (j as f32 + 1.0, i as f32 + 1.0)],
                settings.diverging(t).filled(),
            )
        }))?;
        let annotation = font(settings.leg_sz, &settings.lbl_col)
            .pos(Pos::new(HPos::Center, VPos::Center));
        chart.draw_series(cells.map(|(i, j, w)| {
            Text::new(
                format!("{:.2}", w),
                (j as f32 + 0.5, i as f32 + 0.5),
                annotation.clone(),
            )
        }))?;
        Ok(())
    }
}

/// Annotated heatmap of an embedding weight matrix, one row per category of `feat`
pub fn plot_embedding(
    weights: &[Vec<f32>],
    feat: &str,
    savename: Option<&str>,
    settings: &PlotSettings,
) -> Result<(), Box<dyn Error>> {
    render(&EmbeddingChart { weights, feat }, savename, settings)
}

struct PartialDependenceChart {
    iso: Isolate,
    /// ICE curves or their cluster centres
    lines: Vec<Vec<f32>>,
}

impl Chart for PartialDependenceChart {
    fn kind(&self) -> &'static str {
        "Partial dependence"
    }

    fn size(&self, settings: &PlotSettings) -> (u32, u32) {
        (settings.w_mid, settings.h_mid)
    }

    fn draw<DB: DrawingBackend>(
        &self,
        root: &DrawingArea<DB, Shift>,
        settings: &PlotSettings,
    ) -> Result<(), Box<dyn Error>>
    where
        DB::ErrorType: 'static,
    {
        root.fill(&WHITE)?;
        let grid = &self.iso.grid;
        let (x_min, x_max) = value_range(grid.iter().copied());
        let (y_min, y_max) = value_range(
            self.lines
                .iter()
                .flatten()
                .chain(self.iso.pdp.iter())
                .copied(),
        );

        let mut builder = ChartBuilder::on(root);
        caption(&mut builder, settings);
        let mut chart = builder
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(70)
            .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
        chart
            .configure_mesh()
            .x_desc(self.iso.feature.as_str())
            .y_desc("Partial dependence")
            .axis_desc_style(font(settings.lbl_sz, &settings.lbl_col))
            .label_style(font(settings.tk_sz, &settings.tk_col))
            .draw()?;

        let line_color = settings.categorical(1).mix(0.4);
        for line in &self.lines {
            chart.draw_series(LineSeries::new(
                grid.iter().copied().zip(line.iter().copied()),
                &line_color,
            ))?;
        }
        let pd_color = settings.categorical(0);
        chart
            .draw_series(LineSeries::new(
                grid.iter().copied().zip(self.iso.pdp.iter().copied()),
                pd_color.stroke_width(3),
            ))?
            .label("average")
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], pd_color.stroke_width(3))
            });
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .label_font(font(settings.leg_sz, &settings.lbl_col))
            .background_style(&WHITE.mix(0.8))
            .border_style(&settings.lbl_col)
            .draw()?;
        Ok(())
    }
}

fn sample_frame<R: Rng + ?Sized>(
    frame: &FeatureFrame,
    sample_size: Option<usize>,
    weights: Option<&[f32]>,
    rng: &mut R,
) -> Result<FeatureFrame, Box<dyn Error>> {
    match sample_size {
        Some(n) => Ok(frame.sample(n, weights, rng)?),
        None => Ok(frame.clone()),
    }
}

/// Partial dependence of a model output on `feat`, drawn over the ICE curves
/// (or their k-means centres) of the sampled rows
pub fn plot_1d_partial_dependence<R: Rng + ?Sized>(
    model: &dyn Module,
    frame: &FeatureFrame,
    feat: &str,
    opts: &PdpOptions,
    rng: &mut R,
    savename: Option<&str>,
    settings: &PlotSettings,
) -> Result<(), Box<dyn Error>> {
    let frame = sample_frame(frame, opts.sample_size, opts.weights.as_deref(), rng)?;
    let iso = pdp_isolate(model, &frame, feat, opts.n_points, opts.output)?;
    let lines = match opts.n_clusters {
        Some(k) if k > 0 => cluster_curves(&iso.ice, k, rng),
        _ => iso.ice.clone(),
    };
    render(&PartialDependenceChart { iso, lines }, savename, settings)
}

struct InteractionChart {
    interact: Interact,
}

impl Chart for InteractionChart {
    fn kind(&self) -> &'static str {
        "Partial dependence interaction"
    }

    fn size(&self, settings: &PlotSettings) -> (u32, u32) {
        (settings.h_large, settings.h_large)
    }

    fn draw<DB: DrawingBackend>(
        &self,
        root: &DrawingArea<DB, Shift>,
        settings: &PlotSettings,
    ) -> Result<(), Box<dyn Error>>
    where
        DB::ErrorType: 'static,
    {
        root.fill(&WHITE)?;
        let (gx, gy) = &self.interact.grid;
        let (ex, ey) = (cell_edges(gx), cell_edges(gy));
        let x_range = match (ex.first(), ex.last()) {
            (Some(&lo), Some(&hi)) => lo..hi,
            _ => 0.0..1.0,
        };
        let y_range = match (ey.first(), ey.last()) {
            (Some(&lo), Some(&hi)) => lo..hi,
            _ => 0.0..1.0,
        };
        let (lo, hi) = self.interact.pdp.iter().flatten().copied().filter(|v| v.is_finite()).fold(
            (f32::INFINITY, f32::NEG_INFINITY),
            |(lo, hi), v| (lo.min(v), hi.max(v)),
        );
        let scale = |v: f32| if hi > lo { (v - lo) / (hi - lo) } else { 0.5 };

        let mut builder = ChartBuilder::on(root);
        caption(&mut builder, settings);
        let mut chart = builder
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(70)
            .build_cartesian_2d(x_range, y_range)?;
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc(self.interact.features.0.as_str())
            .y_desc(self.interact.features.1.as_str())
            .axis_desc_style(font(settings.lbl_sz, &settings.lbl_col))
            .label_style(font(settings.tk_sz, &settings.tk_col))
            .draw()?;

        chart.draw_series(self.interact.pdp.iter().enumerate().flat_map(|(i, row)| {
            let (ex, ey) = (&ex, &ey);
            row.iter().enumerate().map(move |(j, &v)| {
                Rectangle::new(
                    [(ex[i], ey[j]), (ex[i + 1], ey[j + 1])],
                    settings.sequential(scale(v)).filled(),
                )
            })
        }))?;
        Ok(())
    }
}

/// Heatmap of the joint partial dependence of a model output on two features
pub fn plot_2d_partial_dependence<R: Rng + ?Sized>(
    model: &dyn Module,
    frame: &FeatureFrame,
    feats: (&str, &str),
    opts: &InteractOptions,
    rng: &mut R,
    savename: Option<&str>,
    settings: &PlotSettings,
) -> Result<(), Box<dyn Error>> {
    let frame = sample_frame(frame, opts.sample_size, opts.weights.as_deref(), rng)?;
    let interact = pdp_interact(model, &frame, feats, opts.n_points, opts.output)?;
    render(&InteractionChart { interact }, savename, settings)
}
