// 📈 Subject mean bar chart (PNG)
//
// Callers check for an empty relation first and report "no data"; rendering
// an empty chart is not an error here, just an empty plot.
//
// Text is drawn with DejaVu Sans compiled into the binary, so labels never
// depend on the fonts installed on the host. CHART_FONT can point at another
// TrueType file.

use crate::db::ScoreRecord;
use crate::stats::{self, SubjectMean};
use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbImage};
use plotters::prelude::*;
use plotters::style::{register_font, FontStyle};
use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const CHART_WIDTH: u32 = 800;
pub const CHART_HEIGHT: u32 = 400;

const BAR_COLOR: RGBColor = RGBColor(0x3b, 0x82, 0xf6);

const FONT_FAMILY: &str = "sans-serif";

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

static CHART_FONT: OnceLock<bool> = OnceLock::new();

/// Register the chart font once per process.
///
/// `preferred` is tried first; the bundled font is used when it is unset or
/// unusable. Returns whether a font is registered. Only the first call does
/// any work.
pub fn init_chart_font(preferred: Option<&Path>) -> bool {
    *CHART_FONT.get_or_init(|| {
        if let Some(path) = preferred {
            match std::fs::read(path) {
                Ok(bytes) => {
                    // plotters keeps registered fonts for the life of the process
                    let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
                    if register_font(FONT_FAMILY, FontStyle::Normal, bytes).is_ok() {
                        debug!(path = %path.display(), "registered chart font");
                        return true;
                    }
                    warn!(path = %path.display(), "unusable chart font, falling back to bundled font");
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read chart font, falling back to bundled font");
                }
            }
        }

        register_font(FONT_FAMILY, FontStyle::Normal, BUNDLED_FONT).is_ok()
    })
}

/// Upper bound of the y-axis: at least 100, with headroom above the top bar
pub fn y_axis_upper(means: &[SubjectMean]) -> f64 {
    let top = means.iter().map(|m| m.mean).fold(f64::MIN, f64::max);
    (top + 5.0).max(100.0)
}

/// Render per-subject mean scores as a bar chart, highest mean first
pub fn render_subject_mean_chart(relation: &[ScoreRecord]) -> Result<Vec<u8>> {
    let means = stats::subject_means(relation);
    render_means(&means)
}

pub fn render_means(means: &[SubjectMean]) -> Result<Vec<u8>> {
    if !init_chart_font(None) {
        bail!("No usable font for chart labels");
    }

    let mut pixels = vec![0u8; (CHART_WIDTH * CHART_HEIGHT * 3) as usize];
    let upper = y_axis_upper(means);
    let labels: Vec<&str> = means.iter().map(|m| m.subject.as_str()).collect();
    let bar_count = means.len().max(1);

    {
        let root = BitMapBackend::with_buffer(&mut pixels, (CHART_WIDTH, CHART_HEIGHT))
            .into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(12)
            .caption("Mean Score per Subject", (FONT_FAMILY, 20))
            .x_label_area_size(60)
            .y_label_area_size(50)
            .build_cartesian_2d((0..bar_count).into_segmented(), 0f64..upper)?;

        let x_label = |value: &SegmentValue<usize>| match value {
            SegmentValue::CenterOf(idx) | SegmentValue::Exact(idx) => {
                labels.get(*idx).map(|s| s.to_string()).unwrap_or_default()
            }
            SegmentValue::Last => String::new(),
        };

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_desc("Subject")
            .y_desc("Mean score")
            .x_labels(bar_count)
            .x_label_formatter(&x_label)
            .label_style((FONT_FAMILY, 12))
            .draw()?;

        chart.draw_series(
            Histogram::vertical(&chart)
                .style(BAR_COLOR.filled())
                .margin(8)
                .data(means.iter().enumerate().map(|(idx, m)| (idx, m.mean))),
        )?;

        root.present()?;
    }

    let buffer = RgbImage::from_raw(CHART_WIDTH, CHART_HEIGHT, pixels)
        .context("Chart buffer does not match canvas size")?;

    let mut png = Cursor::new(Vec::new());
    buffer
        .write_to(&mut png, ImageFormat::Png)
        .context("Failed to encode chart as PNG")?;

    Ok(png.into_inner())
}
